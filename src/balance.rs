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

//! Merchant balance row.
//!
//! ```text
//!                credit                reserve               settle
//!  (payment) ──────────► available ──────────► pending ──────────► paid out
//!                            ▲                    │
//!                            └──────release───────┘
//! ```
//!
//! Held at all times:
//! - `available >= 0`, `pending >= 0`
//! - `total_received - total_paid_out == available + pending`
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use merchant_settlement_rs::{MerchantBalance, MerchantId};
//! use rust_decimal_macros::dec;
//!
//! let balance = MerchantBalance::new(MerchantId::new(), Utc::now());
//! assert_eq!(balance.available(), dec!(0));
//! ```

use crate::base::MerchantId;
use crate::error::SettlementError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::time::Duration;
use tracing::error;

/// A single balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    /// `available += amount; total_received += amount`
    Credit(Decimal),
    /// `available -= amount; pending += amount`, fails if not enough available
    Reserve(Decimal),
    /// `pending -= amount; available += amount`
    Release(Decimal),
    /// `pending -= amount; total_paid_out += amount`
    Settle(Decimal),
}

impl LedgerOp {
    pub fn amount(&self) -> Decimal {
        match self {
            Self::Credit(amount)
            | Self::Reserve(amount)
            | Self::Release(amount)
            | Self::Settle(amount) => *amount,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Credit(_) => "credit",
            Self::Reserve(_) => "reserve",
            Self::Release(_) => "release",
            Self::Settle(_) => "settle",
        }
    }
}

/// Point-in-time copy of a balance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BalanceSnapshot {
    pub merchant_id: MerchantId,
    pub available: Decimal,
    pub pending: Decimal,
    pub total_received: Decimal,
    pub total_paid_out: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct BalanceData {
    merchant_id: MerchantId,
    available: Decimal,
    pending: Decimal,
    total_received: Decimal,
    total_paid_out: Decimal,
    updated_at: DateTime<Utc>,
}

impl BalanceData {
    fn new(merchant_id: MerchantId, now: DateTime<Utc>) -> Self {
        Self {
            merchant_id,
            available: Decimal::ZERO,
            pending: Decimal::ZERO,
            total_received: Decimal::ZERO,
            total_paid_out: Decimal::ZERO,
            updated_at: now,
        }
    }

    fn check_invariants(&self) -> Result<(), SettlementError> {
        if self.available < Decimal::ZERO {
            return Err(SettlementError::LedgerInvariantViolation(format!(
                "available would go negative: {}",
                self.available
            )));
        }
        if self.pending < Decimal::ZERO {
            return Err(SettlementError::LedgerInvariantViolation(format!(
                "pending would go negative: {}",
                self.pending
            )));
        }
        if self.total_received - self.total_paid_out != self.available + self.pending {
            return Err(SettlementError::LedgerInvariantViolation(format!(
                "funds not conserved: received {} - paid out {} != available {} + pending {}",
                self.total_received, self.total_paid_out, self.available, self.pending
            )));
        }
        Ok(())
    }

    /// Computes the row after `op` without touching `self`.
    fn after(&self, op: LedgerOp) -> Result<Self, SettlementError> {
        let amount = op.amount();
        if amount <= Decimal::ZERO {
            return Err(SettlementError::InvalidAmount);
        }

        let mut next = *self;
        match op {
            LedgerOp::Credit(_) => {
                next.available += amount;
                next.total_received += amount;
            }
            LedgerOp::Reserve(_) => {
                if self.available < amount {
                    return Err(SettlementError::InsufficientFunds);
                }
                next.available -= amount;
                next.pending += amount;
            }
            LedgerOp::Release(_) => {
                next.pending -= amount;
                next.available += amount;
            }
            LedgerOp::Settle(_) => {
                next.pending -= amount;
                next.total_paid_out += amount;
            }
        }
        next.check_invariants()?;
        Ok(next)
    }

    fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            merchant_id: self.merchant_id,
            available: self.available,
            pending: self.pending,
            total_received: self.total_received,
            total_paid_out: self.total_paid_out,
            updated_at: self.updated_at,
        }
    }
}

/// One merchant's balance, serialized behind its own lock.
#[derive(Debug)]
pub struct MerchantBalance {
    inner: Mutex<BalanceData>,
}

impl MerchantBalance {
    const DECIMAL_PRECISION: u32 = 2;

    pub fn new(merchant_id: MerchantId, now: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(BalanceData::new(merchant_id, now)),
        }
    }

    pub fn available(&self) -> Decimal {
        self.inner.lock().available
    }

    pub fn pending(&self) -> Decimal {
        self.inner.lock().pending
    }

    pub fn snapshot(&self) -> BalanceSnapshot {
        self.inner.lock().snapshot()
    }

    /// Runs `f` while this row's lock is held by the caller.
    #[cfg(test)]
    pub(crate) fn while_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.inner.lock();
        f()
    }

    fn lock_within(&self, timeout: Duration) -> Result<MutexGuard<'_, BalanceData>, SettlementError> {
        self.inner
            .try_lock_for(timeout)
            .ok_or(SettlementError::Timeout)
    }

    /// Applies `op` atomically. On any error the row is left untouched.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::InvalidAmount`] - amount is zero or negative.
    /// - [`SettlementError::InsufficientFunds`] - reserve exceeds available.
    /// - [`SettlementError::LedgerInvariantViolation`] - release/settle exceeds pending.
    /// - [`SettlementError::Timeout`] - lock not acquired within `timeout`.
    pub fn apply(
        &self,
        op: LedgerOp,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<BalanceSnapshot, SettlementError> {
        let mut data = self.lock_within(timeout)?;
        let mut next = data.after(op).inspect_err(|e| {
            if matches!(e, SettlementError::LedgerInvariantViolation(_)) {
                error!(merchant = %data.merchant_id, op = op.name(), amount = %op.amount(), error = %e, "ledger invariant violation rejected");
            }
        })?;
        next.updated_at = now;
        *data = next;
        Ok(data.snapshot())
    }
}

impl Serialize for MerchantBalance {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let precision = MerchantBalance::DECIMAL_PRECISION;
        let mut state = serializer.serialize_struct("MerchantBalance", 5)?;
        state.serialize_field("merchant", &data.merchant_id)?;
        state.serialize_field("available", &data.available.round_dp(precision))?;
        state.serialize_field("pending", &data.pending.round_dp(precision))?;
        state.serialize_field("total_received", &data.total_received.round_dp(precision))?;
        state.serialize_field("total_paid_out", &data.total_paid_out.round_dp(precision))?;
        state.end()
    }
}
