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

//! Outbound payout records and their state machine.
//!
//! ```text
//!  Requested ──approve──► Approved ──start──► Processing ──complete──► Completed
//!      │                     │                    │
//!      └──reject──► Rejected └───────fail─────────┴──► Failed
//! ```
//!
//! The graph is acyclic: a failed payout is never re-queued. Resubmitting
//! creates a new record linked through `retry_of`.

use crate::base::{ActorId, MerchantId, PayoutId};
use crate::error::SettlementError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Requested,
    Approved,
    Processing,
    Completed,
    Rejected,
    Failed,
}

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Destination bank account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub bank_name: String,
    pub account_number: String,
    pub account_holder: String,
    pub branch: Option<String>,
}

impl BankDetails {
    pub fn validate(&self) -> Result<(), SettlementError> {
        if self.bank_name.trim().is_empty() {
            return Err(SettlementError::InvalidBankDetails(
                "bank name is required".into(),
            ));
        }
        if self.account_holder.trim().is_empty() {
            return Err(SettlementError::InvalidBankDetails(
                "account holder is required".into(),
            ));
        }
        let number = self.account_number.as_str();
        if !(6..=20).contains(&number.len()) || !number.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SettlementError::InvalidBankDetails(
                "account number must be 6 to 20 digits".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a payout action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutTransition {
    Applied {
        from: PayoutStatus,
        to: PayoutStatus,
    },
    /// The action had already been applied.
    Unchanged(PayoutStatus),
}

/// An outbound withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: PayoutId,
    pub merchant_id: MerchantId,
    /// Gross amount reserved from the merchant balance.
    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub bank: BankDetails,
    pub status: PayoutStatus,
    pub requested_by: ActorId,
    pub requested_at: DateTime<Utc>,
    pub approved_by: Option<ActorId>,
    pub approved_at: Option<DateTime<Utc>>,
    pub processed_by: Option<ActorId>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<ActorId>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub bank_reference: Option<String>,
    pub rejection_reason: Option<String>,
    pub failure_reason: Option<String>,
    pub retry_count: u32,
    pub retry_of: Option<PayoutId>,
    /// Set on a failed payout once it has been resubmitted.
    pub resubmitted_as: Option<PayoutId>,
    pub updated_at: DateTime<Utc>,
}

fn require_text(value: &str, missing: SettlementError) -> Result<String, SettlementError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(missing);
    }
    Ok(trimmed.to_string())
}

impl Payout {
    /// `Requested -> Approved`.
    ///
    /// # Errors
    ///
    /// [`SettlementError::CannotApprove`] from any other status, including
    /// an already approved payout.
    pub fn approve(
        &mut self,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> Result<PayoutTransition, SettlementError> {
        if self.status != PayoutStatus::Requested {
            return Err(SettlementError::CannotApprove(self.status));
        }
        self.approved_by = Some(actor.clone());
        self.approved_at = Some(now);
        Ok(self.move_to(PayoutStatus::Approved, now))
    }

    /// `Approved -> Processing`.
    pub fn start_processing(
        &mut self,
        actor: &ActorId,
        now: DateTime<Utc>,
    ) -> Result<PayoutTransition, SettlementError> {
        if self.status != PayoutStatus::Approved {
            return Err(SettlementError::InvalidPayoutStatus(self.status));
        }
        self.processed_by = Some(actor.clone());
        self.processed_at = Some(now);
        Ok(self.move_to(PayoutStatus::Processing, now))
    }

    /// `Processing -> Completed`; from `Approved` processing starts implicitly.
    /// Completing a completed payout is a no-op.
    pub fn complete(
        &mut self,
        actor: &ActorId,
        bank_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutTransition, SettlementError> {
        match self.status {
            PayoutStatus::Completed => Ok(PayoutTransition::Unchanged(self.status)),
            PayoutStatus::Approved | PayoutStatus::Processing => {
                let bank_reference =
                    require_text(bank_reference, SettlementError::MissingBankReference)?;
                if self.status == PayoutStatus::Approved {
                    self.processed_by = Some(actor.clone());
                    self.processed_at = Some(now);
                }
                self.bank_reference = Some(bank_reference);
                self.completed_at = Some(now);
                Ok(self.move_to(PayoutStatus::Completed, now))
            }
            other => Err(SettlementError::InvalidPayoutStatus(other)),
        }
    }

    /// `Requested -> Rejected`. Rejecting a rejected payout is a no-op.
    pub fn reject(
        &mut self,
        actor: &ActorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutTransition, SettlementError> {
        match self.status {
            PayoutStatus::Rejected => Ok(PayoutTransition::Unchanged(self.status)),
            PayoutStatus::Requested => {
                let reason = require_text(reason, SettlementError::MissingReason)?;
                self.rejected_by = Some(actor.clone());
                self.rejected_at = Some(now);
                self.rejection_reason = Some(reason);
                Ok(self.move_to(PayoutStatus::Rejected, now))
            }
            other => Err(SettlementError::InvalidPayoutStatus(other)),
        }
    }

    /// `Approved | Processing -> Failed`. Failing a failed payout is a no-op.
    pub fn fail(
        &mut self,
        actor: &ActorId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PayoutTransition, SettlementError> {
        match self.status {
            PayoutStatus::Failed => Ok(PayoutTransition::Unchanged(self.status)),
            PayoutStatus::Approved | PayoutStatus::Processing => {
                let reason = require_text(reason, SettlementError::MissingReason)?;
                if self.processed_by.is_none() {
                    self.processed_by = Some(actor.clone());
                }
                self.failed_at = Some(now);
                self.failure_reason = Some(reason);
                self.retry_count += 1;
                Ok(self.move_to(PayoutStatus::Failed, now))
            }
            other => Err(SettlementError::InvalidPayoutStatus(other)),
        }
    }

    fn move_to(&mut self, to: PayoutStatus, now: DateTime<Utc>) -> PayoutTransition {
        let from = self.status;
        self.status = to;
        self.updated_at = now;
        PayoutTransition::Applied { from, to }
    }
}
