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

//! Merchant balance ledger.
//!
//! The [`Ledger`] is the only writer of merchant balances. It exposes four
//! atomic operations:
//!
//! - **Credit**: a completed payment's net amount becomes available.
//! - **Reserve**: a payout request carves funds out of available into pending.
//! - **Release**: a rejected or failed payout returns pending funds to available.
//! - **Settle**: a completed payout removes funds from pending for good.
//!
//! # Thread Safety
//!
//! Balances live in a [`DashMap`]; each row has its own lock, so operations on
//! one merchant are serialized while different merchants proceed in parallel.
//! A lock that cannot be acquired within the configured timeout surfaces as
//! [`SettlementError::Timeout`].

use crate::balance::{BalanceSnapshot, LedgerOp, MerchantBalance};
use crate::base::MerchantId;
use crate::error::SettlementError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::time::Duration;
use tracing::debug;

/// Per-merchant balance ledger.
///
/// # Invariants
///
/// - `available >= 0` and `pending >= 0` for every merchant.
/// - `total_received - total_paid_out == available + pending`.
pub struct Ledger {
    balances: DashMap<MerchantId, MerchantBalance>,
    lock_timeout: Duration,
}

impl Ledger {
    pub fn new(lock_timeout: Duration) -> Self {
        Ledger {
            balances: DashMap::new(),
            lock_timeout,
        }
    }

    /// Creates a zero balance row for the merchant if none exists.
    pub fn open_account(&self, merchant_id: MerchantId, now: DateTime<Utc>) {
        self.balances
            .entry(merchant_id)
            .or_insert_with(|| MerchantBalance::new(merchant_id, now));
    }

    pub fn credit(
        &self,
        merchant_id: &MerchantId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, SettlementError> {
        self.apply(merchant_id, LedgerOp::Credit(amount), now)
    }

    /// # Errors
    ///
    /// [`SettlementError::InsufficientFunds`] when `amount > available`.
    pub fn reserve(
        &self,
        merchant_id: &MerchantId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, SettlementError> {
        self.apply(merchant_id, LedgerOp::Reserve(amount), now)
    }

    pub fn release(
        &self,
        merchant_id: &MerchantId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, SettlementError> {
        self.apply(merchant_id, LedgerOp::Release(amount), now)
    }

    pub fn settle(
        &self,
        merchant_id: &MerchantId,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, SettlementError> {
        self.apply(merchant_id, LedgerOp::Settle(amount), now)
    }

    fn apply(
        &self,
        merchant_id: &MerchantId,
        op: LedgerOp,
        now: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, SettlementError> {
        // Shared map reference; the row lock inside serializes writers.
        let balance = self
            .balances
            .get(merchant_id)
            .ok_or(SettlementError::MerchantNotFound)?;
        let snapshot = balance.apply(op, now, self.lock_timeout)?;
        debug!(
            merchant = %merchant_id,
            op = op.name(),
            amount = %op.amount(),
            available = %snapshot.available,
            pending = %snapshot.pending,
            "ledger updated"
        );
        Ok(snapshot)
    }

    pub fn balance(&self, merchant_id: &MerchantId) -> Option<BalanceSnapshot> {
        self.balances.get(merchant_id).map(|b| b.snapshot())
    }

    /// Returns an iterator over all balance rows.
    pub fn balances(
        &self,
    ) -> impl Iterator<Item = dashmap::mapref::multiple::RefMulti<'_, MerchantId, MerchantBalance>>
    {
        self.balances.iter()
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Runs `f` while the merchant's balance row is locked.
    #[cfg(test)]
    pub(crate) fn while_row_locked<R>(&self, merchant_id: &MerchantId, f: impl FnOnce() -> R) -> R {
        let balance = self
            .balances
            .get(merchant_id)
            .expect("merchant has a balance row");
        balance.while_locked(f)
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
