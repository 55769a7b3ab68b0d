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

//! Settlement configuration.
//!
//! Loaded from TOML. Every key is optional and falls back to the value in
//! [`SettlementConfig::default`]. Decimal values are written as strings.
//!
//! ```toml
//! payment_fee_percent = "1.5"
//! required_confirmations = 20
//!
//! [tiers.basic]
//! daily = "10000000"
//! monthly = "100000000"
//! ```

use crate::compliance::{KycTier, TierLimits};
use crate::money::Currency;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Longest invoice lifetime accepted from configuration.
pub const MAX_PAYMENT_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Daily and monthly limits per KYC tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierTable {
    pub unverified: TierLimits,
    pub basic: TierLimits,
    pub verified: TierLimits,
    pub enhanced: TierLimits,
}

impl TierTable {
    pub fn limits(&self, tier: KycTier) -> &TierLimits {
        match tier {
            KycTier::Unverified => &self.unverified,
            KycTier::Basic => &self.basic,
            KycTier::Verified => &self.verified,
            KycTier::Enhanced => &self.enhanced,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            unverified: TierLimits::capped(Decimal::ZERO, Decimal::ZERO),
            basic: TierLimits::capped(dec!(50000000), dec!(500000000)),
            verified: TierLimits::capped(dec!(500000000), dec!(5000000000)),
            enhanced: TierLimits::unlimited(),
        }
    }
}

/// Settlement tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Merchant fiat currency; ledger balances are held in it.
    pub settlement_currency: Currency,
    /// On-chain token payers settle in.
    pub token_currency: Currency,
    /// Percentage fee charged on each invoice.
    pub payment_fee_percent: Decimal,
    /// Invoice lifetime in seconds.
    pub payment_ttl_secs: u64,
    /// Confirmation depth at which a payment completes.
    pub required_confirmations: u32,
    /// Largest accepted |observed - expected| token difference.
    pub amount_tolerance: Decimal,
    /// USD value above which payer identity is mandatory.
    pub travel_rule_threshold_usd: Decimal,
    /// Smallest payout a merchant may request.
    pub minimum_payout: Decimal,
    /// Percentage fee charged on each payout.
    pub payout_fee_percent: Decimal,
    /// Upper bound on waiting for a merchant or record lock.
    pub lock_timeout_ms: u64,
    pub tiers: TierTable,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            settlement_currency: Currency::fiat("VND"),
            token_currency: Currency::token("USDT", 9),
            payment_fee_percent: dec!(1),
            payment_ttl_secs: 900,
            required_confirmations: 12,
            amount_tolerance: dec!(0.000001),
            travel_rule_threshold_usd: dec!(1000),
            minimum_payout: dec!(100000),
            payout_fee_percent: Decimal::ZERO,
            lock_timeout_ms: 2000,
            tiers: TierTable::default(),
        }
    }
}

impl SettlementConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_PAYMENT_TTL_SECS).contains(&self.payment_ttl_secs) {
            return Err(ConfigError::Invalid("payment_ttl_secs must be between 1 and 2592000"));
        }
        Ok(())
    }

    /// Invoice lifetime, or `None` if `payment_ttl_secs` does not fit a
    /// [`chrono::Duration`].
    pub fn payment_ttl(&self) -> Option<chrono::Duration> {
        i64::try_from(self.payment_ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }
}
