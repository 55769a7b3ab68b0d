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

//! Settlement engine.
//!
//! The [`SettlementEngine`] wires the shared [`Ledger`] and
//! [`ComplianceGate`] into the two state machine drivers:
//!
//! - [`PaymentSettlement`]: invoices and watcher events (money in).
//! - [`PayoutDesk`]: withdrawal requests and admin actions (money out).
//!
//! # Thread Safety
//!
//! Every component is `Send + Sync`; share the engine behind an [`Arc`] and
//! call it from as many threads as needed.

use crate::base::MerchantId;
use crate::compliance::{ComplianceGate, KycTier};
use crate::config::SettlementConfig;
use crate::exchange::ExchangeRateSource;
use crate::ledger::Ledger;
use crate::payout_desk::PayoutDesk;
use crate::settlement::PaymentSettlement;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

pub struct SettlementEngine {
    config: SettlementConfig,
    ledger: Arc<Ledger>,
    compliance: Arc<ComplianceGate>,
    payments: PaymentSettlement,
    payouts: PayoutDesk,
}

impl SettlementEngine {
    pub fn new(config: SettlementConfig, rates: Arc<dyn ExchangeRateSource>) -> Self {
        let ledger = Arc::new(Ledger::new(config.lock_timeout()));
        let compliance = Arc::new(ComplianceGate::new(
            config.tiers.clone(),
            config.travel_rule_threshold_usd,
        ));
        let payments = PaymentSettlement::new(
            config.clone(),
            Arc::clone(&ledger),
            Arc::clone(&compliance),
            rates,
        );
        let payouts = PayoutDesk::new(config.clone(), Arc::clone(&ledger));
        SettlementEngine {
            config,
            ledger,
            compliance,
            payments,
            payouts,
        }
    }

    /// Opens a zero balance and a compliance profile for the merchant.
    ///
    /// Calling it again keeps the balance and updates the tier.
    pub fn register_merchant(&self, merchant_id: MerchantId, tier: KycTier, now: DateTime<Utc>) {
        self.ledger.open_account(merchant_id, now);
        if self.compliance.set_tier(merchant_id, tier).is_err() {
            self.compliance.register(merchant_id, tier, now);
        }
        info!(merchant = %merchant_id, %tier, "merchant registered");
    }

    pub fn payments(&self) -> &PaymentSettlement {
        &self.payments
    }

    pub fn payouts(&self) -> &PayoutDesk {
        &self.payouts
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn compliance(&self) -> &ComplianceGate {
        &self.compliance
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }
}
