// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Compliance gate: travel rule and KYC volume limits.
//!
//! Evaluation never mutates a profile. Volume is counted only when a payment
//! completes, through [`ComplianceGate::record_settled_volume`], so abandoned
//! invoices never consume a merchant's limit.

use crate::base::MerchantId;
use crate::config::TierTable;
use crate::error::SettlementError;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Verified trust level of a merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KycTier {
    Unverified,
    Basic,
    Verified,
    Enhanced,
}

impl fmt::Display for KycTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unverified => "unverified",
            Self::Basic => "basic",
            Self::Verified => "verified",
            Self::Enhanced => "enhanced",
        };
        f.write_str(name)
    }
}

impl FromStr for KycTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unverified" => Ok(Self::Unverified),
            "basic" => Ok(Self::Basic),
            "verified" => Ok(Self::Verified),
            "enhanced" => Ok(Self::Enhanced),
            other => Err(format!("unknown kyc tier: {other}")),
        }
    }
}

/// Per-period volume limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub daily: Option<Decimal>,
    pub monthly: Option<Decimal>,
}

impl TierLimits {
    pub fn capped(daily: Decimal, monthly: Decimal) -> Self {
        Self {
            daily: Some(daily),
            monthly: Some(monthly),
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }
}

/// Payer identity captured for high-value payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayerIdentity {
    pub full_name: String,
    pub wallet_address: String,
    /// ISO 3166-1 alpha-2.
    pub country_code: String,
    pub id_document: Option<String>,
}

impl PayerIdentity {
    pub fn validate(&self) -> Result<(), SettlementError> {
        if self.full_name.trim().is_empty() {
            return Err(SettlementError::InvalidPayerIdentity(
                "full name is required".into(),
            ));
        }
        if self.wallet_address.trim().is_empty() {
            return Err(SettlementError::InvalidPayerIdentity(
                "wallet address is required".into(),
            ));
        }
        let code = self.country_code.as_bytes();
        if code.len() != 2 || !code.iter().all(u8::is_ascii_uppercase) {
            return Err(SettlementError::InvalidPayerIdentity(format!(
                "country code must be two uppercase letters, got {:?}",
                self.country_code
            )));
        }
        Ok(())
    }
}

/// A merchant's tier and settled volume in the current day and month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceProfile {
    pub merchant_id: MerchantId,
    pub tier: KycTier,
    pub daily_volume: Decimal,
    pub monthly_volume: Decimal,
    /// UTC day the daily counter belongs to.
    pub day: NaiveDate,
}

impl ComplianceProfile {
    fn new(merchant_id: MerchantId, tier: KycTier, now: DateTime<Utc>) -> Self {
        Self {
            merchant_id,
            tier,
            daily_volume: Decimal::ZERO,
            monthly_volume: Decimal::ZERO,
            day: now.date_naive(),
        }
    }

    /// Volumes as seen at `now`, with expired periods reading as zero.
    fn volumes_at(&self, now: DateTime<Utc>) -> (Decimal, Decimal) {
        let today = now.date_naive();
        let daily = if today == self.day {
            self.daily_volume
        } else {
            Decimal::ZERO
        };
        let monthly = if today.year() == self.day.year() && today.month() == self.day.month() {
            self.monthly_volume
        } else {
            Decimal::ZERO
        };
        (daily, monthly)
    }

    fn add_volume(&mut self, amount: Decimal, now: DateTime<Utc>) {
        let (daily, monthly) = self.volumes_at(now);
        self.daily_volume = daily + amount;
        self.monthly_volume = monthly + amount;
        self.day = now.date_naive();
    }

    /// Remaining allowance at `now`; `None` when the tier is unlimited.
    pub fn remaining_limit(&self, limits: &TierLimits, now: DateTime<Utc>) -> Option<Decimal> {
        let (daily, monthly) = self.volumes_at(now);
        let daily_left = limits.daily.map(|limit| limit - daily);
        let monthly_left = limits.monthly.map(|limit| limit - monthly);
        match (daily_left, monthly_left) {
            (Some(d), Some(m)) => Some(d.min(m).max(Decimal::ZERO)),
            (Some(left), None) | (None, Some(left)) => Some(left.max(Decimal::ZERO)),
            (None, None) => None,
        }
    }
}

/// Outcome of a successful gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub usd_equivalent: Decimal,
    /// Payer identity was required (and was supplied).
    pub travel_rule_required: bool,
    pub remaining_limit: Option<Decimal>,
}

/// Admission checks run before a payment is persisted.
pub struct ComplianceGate {
    profiles: DashMap<MerchantId, ComplianceProfile>,
    tiers: TierTable,
    travel_rule_threshold_usd: Decimal,
}

impl ComplianceGate {
    pub fn new(tiers: TierTable, travel_rule_threshold_usd: Decimal) -> Self {
        Self {
            profiles: DashMap::new(),
            tiers,
            travel_rule_threshold_usd,
        }
    }

    /// Registers a merchant, keeping existing counters if already known.
    pub fn register(&self, merchant_id: MerchantId, tier: KycTier, now: DateTime<Utc>) {
        self.profiles
            .entry(merchant_id)
            .or_insert_with(|| ComplianceProfile::new(merchant_id, tier, now));
    }

    pub fn set_tier(&self, merchant_id: MerchantId, tier: KycTier) -> Result<(), SettlementError> {
        let mut profile = self
            .profiles
            .get_mut(&merchant_id)
            .ok_or(SettlementError::MerchantNotFound)?;
        info!(merchant = %merchant_id, from = %profile.tier, to = %tier, "kyc tier changed");
        profile.tier = tier;
        Ok(())
    }

    pub fn profile(&self, merchant_id: &MerchantId) -> Option<ComplianceProfile> {
        self.profiles.get(merchant_id).map(|p| p.clone())
    }

    /// Checks a prospective payment against the travel rule and KYC limits.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::InvalidPayerIdentity`] - payer data supplied but malformed.
    /// - [`SettlementError::TravelRuleDataRequired`] - above threshold without payer data.
    /// - [`SettlementError::KycLimitExceeded`] - amount exceeds remaining allowance.
    /// - [`SettlementError::MerchantNotFound`] - merchant never registered.
    pub fn evaluate(
        &self,
        merchant_id: &MerchantId,
        fiat_amount: Decimal,
        usd_equivalent: Decimal,
        payer: Option<&PayerIdentity>,
        now: DateTime<Utc>,
    ) -> Result<GateResult, SettlementError> {
        if let Some(payer) = payer {
            payer.validate()?;
        }

        let travel_rule_required = usd_equivalent > self.travel_rule_threshold_usd;
        if travel_rule_required && payer.is_none() {
            return Err(SettlementError::TravelRuleDataRequired);
        }

        let profile = self
            .profiles
            .get(merchant_id)
            .ok_or(SettlementError::MerchantNotFound)?;
        let remaining_limit = profile.remaining_limit(self.tiers.limits(profile.tier), now);
        if let Some(remaining) = remaining_limit {
            if fiat_amount > remaining {
                debug!(merchant = %merchant_id, %fiat_amount, %remaining, "kyc limit exceeded");
                return Err(SettlementError::KycLimitExceeded { remaining });
            }
        }

        Ok(GateResult {
            usd_equivalent,
            travel_rule_required,
            remaining_limit,
        })
    }

    /// Counts a completed payment's fiat amount against the merchant's limits.
    pub fn record_settled_volume(
        &self,
        merchant_id: &MerchantId,
        fiat_amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        let mut profile = self
            .profiles
            .get_mut(merchant_id)
            .ok_or(SettlementError::MerchantNotFound)?;
        profile.add_volume(fiat_amount, now);
        debug!(
            merchant = %merchant_id,
            daily = %profile.daily_volume,
            monthly = %profile.monthly_volume,
            "settled volume recorded"
        );
        Ok(())
    }
}
