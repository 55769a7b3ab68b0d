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

//! Payout desk.
//!
//! Owns payout records and couples each transition to its ledger effect:
//!
//! | Transition              | Ledger   |
//! |-------------------------|----------|
//! | request                 | reserve  |
//! | requested -> rejected   | release  |
//! | approved/processing -> failed | release |
//! | processing -> completed | settle   |
//!
//! The ledger call runs while the payout lock is held and before the new
//! record is stored. If it fails the payout is unchanged. Lock order is
//! payout, then balance.

use crate::base::{ActorId, MerchantId, PayoutId};
use crate::config::SettlementConfig;
use crate::error::SettlementError;
use crate::exchange;
use crate::ledger::Ledger;
use crate::payout::{BankDetails, Payout, PayoutStatus, PayoutTransition};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A merchant's withdrawal request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutRequest {
    pub merchant_id: MerchantId,
    pub amount: Decimal,
    pub bank: BankDetails,
    pub requested_by: ActorId,
}

pub struct PayoutDesk {
    config: SettlementConfig,
    ledger: Arc<Ledger>,
    payouts: DashMap<PayoutId, Arc<Mutex<Payout>>>,
}

impl PayoutDesk {
    pub fn new(config: SettlementConfig, ledger: Arc<Ledger>) -> Self {
        Self {
            config,
            ledger,
            payouts: DashMap::new(),
        }
    }

    /// Validates the request and reserves the gross amount.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::InvalidAmount`] - amount not positive.
    /// - [`SettlementError::BelowMinimum`] - amount under the configured floor.
    /// - [`SettlementError::InvalidBankDetails`] - bank details malformed.
    /// - [`SettlementError::InsufficientFunds`] - available balance too low.
    /// - [`SettlementError::MerchantNotFound`] - no balance row.
    pub fn request_payout(
        &self,
        request: PayoutRequest,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        self.open_payout(request, None, 0, now)
    }

    fn open_payout(
        &self,
        request: PayoutRequest,
        retry_of: Option<PayoutId>,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        if request.amount <= Decimal::ZERO {
            return Err(SettlementError::InvalidAmount);
        }
        if request.amount < self.config.minimum_payout {
            return Err(SettlementError::BelowMinimum {
                minimum: self.config.minimum_payout,
            });
        }
        request.bank.validate()?;
        let fee = exchange::compute_fee(
            request.amount,
            self.config.payout_fee_percent,
            &self.config.settlement_currency,
        )?;

        self.ledger
            .reserve(&request.merchant_id, request.amount, now)
            .inspect_err(|e| {
                warn!(merchant = %request.merchant_id, amount = %request.amount, error = %e, "payout reservation refused");
            })?;

        let payout = Payout {
            id: PayoutId::new(),
            merchant_id: request.merchant_id,
            amount: request.amount,
            fee: fee.fee,
            net_amount: fee.net,
            bank: request.bank,
            status: PayoutStatus::Requested,
            requested_by: request.requested_by,
            requested_at: now,
            approved_by: None,
            approved_at: None,
            processed_by: None,
            processed_at: None,
            completed_at: None,
            rejected_by: None,
            rejected_at: None,
            failed_at: None,
            bank_reference: None,
            rejection_reason: None,
            failure_reason: None,
            retry_count,
            retry_of,
            resubmitted_as: None,
            updated_at: now,
        };
        self.payouts
            .insert(payout.id, Arc::new(Mutex::new(payout.clone())));

        info!(
            payout = %payout.id,
            merchant = %payout.merchant_id,
            amount = %payout.amount,
            retry_of = ?payout.retry_of,
            "payout requested"
        );
        Ok(payout)
    }

    pub fn approve(
        &self,
        payout_id: &PayoutId,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        self.transition(payout_id, now, |p| p.approve(actor, now))
    }

    pub fn start_processing(
        &self,
        payout_id: &PayoutId,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        self.transition(payout_id, now, |p| p.start_processing(actor, now))
    }

    /// Marks the bank transfer done and settles the reserved amount.
    pub fn complete(
        &self,
        payout_id: &PayoutId,
        actor: &ActorId,
        bank_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        self.transition(payout_id, now, |p| p.complete(actor, bank_reference, now))
    }

    /// Rejects a requested payout and releases its reservation.
    pub fn reject(
        &self,
        payout_id: &PayoutId,
        actor: &ActorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        self.transition(payout_id, now, |p| p.reject(actor, reason, now))
    }

    /// Records a failed bank transfer and releases its reservation.
    pub fn fail(
        &self,
        payout_id: &PayoutId,
        actor: &ActorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        self.transition(payout_id, now, |p| p.fail(actor, reason, now))
    }

    /// Opens a new payout for the same amount and bank as a failed one.
    ///
    /// A failed payout is resubmitted at most once; later calls return the
    /// retry already opened for it.
    ///
    /// # Errors
    ///
    /// [`SettlementError::InvalidPayoutStatus`] unless the payout failed.
    pub fn resubmit(
        &self,
        payout_id: &PayoutId,
        requested_by: &ActorId,
        now: DateTime<Utc>,
    ) -> Result<Payout, SettlementError> {
        // Owned handle so the map shard is free while the retry is inserted.
        let slot = self
            .payouts
            .get(payout_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SettlementError::PayoutNotFound)?;
        let mut failed = self.lock(&slot)?;
        if failed.status != PayoutStatus::Failed {
            return Err(SettlementError::InvalidPayoutStatus(failed.status));
        }
        if let Some(retry_id) = failed.resubmitted_as {
            debug!(payout = %payout_id, retry = %retry_id, "payout already resubmitted");
            return self.get_payout(&retry_id);
        }

        let request = PayoutRequest {
            merchant_id: failed.merchant_id,
            amount: failed.amount,
            bank: failed.bank.clone(),
            requested_by: requested_by.clone(),
        };
        let retry = self.open_payout(request, Some(failed.id), failed.retry_count, now)?;
        failed.resubmitted_as = Some(retry.id);
        failed.updated_at = now;
        Ok(retry)
    }

    fn lock<'a>(&self, slot: &'a Mutex<Payout>) -> Result<MutexGuard<'a, Payout>, SettlementError> {
        slot.try_lock_for(self.config.lock_timeout())
            .ok_or(SettlementError::Timeout)
    }

    fn transition<F>(
        &self,
        payout_id: &PayoutId,
        now: DateTime<Utc>,
        action: F,
    ) -> Result<Payout, SettlementError>
    where
        F: FnOnce(&mut Payout) -> Result<PayoutTransition, SettlementError>,
    {
        let slot = self
            .payouts
            .get(payout_id)
            .ok_or(SettlementError::PayoutNotFound)?;
        let mut stored = self.lock(slot.value())?;

        let mut next = stored.clone();
        match action(&mut next)? {
            PayoutTransition::Unchanged(status) => {
                debug!(payout = %payout_id, %status, "payout action already applied");
            }
            PayoutTransition::Applied { from, to } => {
                match to {
                    PayoutStatus::Completed => {
                        self.ledger.settle(&next.merchant_id, next.amount, now)?;
                    }
                    PayoutStatus::Rejected | PayoutStatus::Failed => {
                        self.ledger.release(&next.merchant_id, next.amount, now)?;
                    }
                    _ => {}
                }
                *stored = next;
                info!(payout = %payout_id, %from, %to, "payout transition");
            }
        }
        Ok(stored.clone())
    }

    pub fn get_payout(&self, payout_id: &PayoutId) -> Result<Payout, SettlementError> {
        let slot = self
            .payouts
            .get(payout_id)
            .ok_or(SettlementError::PayoutNotFound)?;
        let payout = self.lock(slot.value())?;
        Ok(payout.clone())
    }

    /// All payouts for a merchant, oldest first.
    pub fn payouts_for(&self, merchant_id: &MerchantId) -> Vec<Payout> {
        let mut payouts: Vec<Payout> = self
            .payouts
            .iter()
            .map(|slot| slot.value().lock().clone())
            .filter(|p| p.merchant_id == *merchant_id)
            .collect();
        payouts.sort_by_key(|p| p.requested_at);
        payouts
    }

    pub fn len(&self) -> usize {
        self.payouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payouts.is_empty()
    }
}
