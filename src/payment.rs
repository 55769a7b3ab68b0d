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

//! Inbound payment records and their state machine.
//!
//! ```text
//!  Created ──observed──► Pending ──included──► Confirming ──depth reached──► Completed
//!     │                    │  │                    │
//!     └──────expired───────┘  └───────failed───────┘
//! ```
//!
//! Watcher events may arrive duplicated or out of order. A payment only moves
//! forward: an event whose target state is not ahead of the current state is a
//! no-op, and a terminal payment ignores every event.

use crate::base::{MerchantId, PaymentId, PaymentReference};
use crate::compliance::PayerIdentity;
use crate::error::SettlementError;
use crate::money::{Currency, Money};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Created,
    Pending,
    Confirming,
    Completed,
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Failed)
    }

    /// Only payments with no included transaction may expire.
    pub fn can_expire(&self) -> bool {
        matches!(self, Self::Created | Self::Pending)
    }

    /// Position along the happy path; `None` for expired and failed.
    fn progress(&self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Pending => Some(1),
            Self::Confirming => Some(2),
            Self::Completed => Some(3),
            Self::Expired | Self::Failed => None,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Confirming => "confirming",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observation reported by the blockchain watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub payment_reference: PaymentReference,
    pub tx_hash: Option<String>,
    pub sender_address: String,
    pub observed_amount: Decimal,
    pub confirmation_depth: u32,
    pub finalized: bool,
    /// Set when the chain reports the transaction invalid or reverted.
    pub error: Option<String>,
}

/// Result of applying an event or expiry check to a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTransition {
    Applied {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    Unchanged(PaymentStatus),
}

impl PaymentTransition {
    pub fn completed(&self) -> bool {
        matches!(
            self,
            Self::Applied {
                to: PaymentStatus::Completed,
                ..
            }
        )
    }
}

/// Thresholds the state machine needs from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub required_confirmations: u32,
    pub amount_tolerance: Decimal,
}

/// An inbound payment.
///
/// Rate, fee and token amount are frozen at creation; later rate changes
/// never touch an existing payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub reference: PaymentReference,
    pub merchant_id: MerchantId,
    pub invoice_amount: Decimal,
    pub currency: Currency,
    pub token_amount: Decimal,
    pub token_currency: Currency,
    pub chain: String,
    pub exchange_rate: Decimal,
    pub rate_as_of: DateTime<Utc>,
    pub usd_equivalent: Decimal,
    pub destination_wallet: String,
    pub fee_percent: Decimal,
    pub fee_amount: Decimal,
    pub net_amount: Decimal,
    pub payer: Option<PayerIdentity>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub tx_hash: Option<String>,
    pub sender_address: Option<String>,
    pub confirmation_depth: u32,
    pub failure_reason: Option<String>,
}

impl Payment {
    /// Invoiced amount in the settlement currency.
    pub fn invoice_money(&self) -> Money {
        Money::new(self.invoice_amount, self.currency.clone())
    }

    /// Amount the payer must send on chain.
    pub fn token_money(&self) -> Money {
        Money::new(self.token_amount, self.token_currency.clone())
    }

    /// Amount credited to the merchant on completion.
    pub fn net_money(&self) -> Money {
        Money::new(self.net_amount, self.currency.clone())
    }

    /// Shared predicate for lazy expiry and the periodic sweep.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status.can_expire() && now > self.expires_at
    }

    /// Moves an overdue payment to `Expired`; otherwise leaves it unchanged.
    pub fn expire(&mut self, now: DateTime<Utc>) -> PaymentTransition {
        if !self.is_expired_at(now) {
            return PaymentTransition::Unchanged(self.status);
        }
        self.move_to(PaymentStatus::Expired, now)
    }

    /// Applies a watcher observation.
    ///
    /// # Errors
    ///
    /// [`SettlementError::AmountMismatch`] when a `Created` payment observes a
    /// transaction for the wrong amount; the payment stays `Created`.
    pub fn apply_event(
        &mut self,
        event: &ChainEvent,
        policy: &ConfirmationPolicy,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransition, SettlementError> {
        if self.status.is_terminal() {
            return Ok(PaymentTransition::Unchanged(self.status));
        }
        if self.is_expired_at(now) {
            return Ok(self.expire(now));
        }

        if let Some(error) = &event.error {
            return Ok(match self.status {
                PaymentStatus::Pending | PaymentStatus::Confirming => {
                    self.fail(format!("chain reported error: {error}"), now)
                }
                // nothing was observed yet; a later valid transaction may still arrive
                _ => PaymentTransition::Unchanged(self.status),
            });
        }

        if (event.observed_amount - self.token_amount).abs() > policy.amount_tolerance {
            if self.status == PaymentStatus::Created {
                return Err(SettlementError::AmountMismatch {
                    expected: self.token_amount,
                    observed: event.observed_amount,
                });
            }
            return Ok(self.fail(
                format!(
                    "amount mismatch: expected {}, observed {}",
                    self.token_amount, event.observed_amount
                ),
                now,
            ));
        }

        if self.status != PaymentStatus::Created {
            if let Some(reason) = self.mismatch_with_observed(event) {
                return Ok(self.fail(reason, now));
            }
        }

        let target = self.target_status(event, policy);
        if target.progress() <= self.status.progress() {
            return Ok(PaymentTransition::Unchanged(self.status));
        }

        if self.status == PaymentStatus::Created {
            self.sender_address = Some(event.sender_address.clone());
            self.tx_hash = event.tx_hash.clone();
            self.paid_at = Some(now);
        }
        if self.tx_hash.is_none() {
            self.tx_hash = event.tx_hash.clone();
        }
        self.confirmation_depth = event.confirmation_depth;
        if target == PaymentStatus::Completed {
            self.confirmed_at = Some(now);
        }
        Ok(self.move_to(target, now))
    }

    fn target_status(&self, event: &ChainEvent, policy: &ConfirmationPolicy) -> PaymentStatus {
        if event.finalized || event.confirmation_depth >= policy.required_confirmations {
            PaymentStatus::Completed
        } else if event.confirmation_depth > 0 {
            PaymentStatus::Confirming
        } else {
            PaymentStatus::Pending
        }
    }

    fn mismatch_with_observed(&self, event: &ChainEvent) -> Option<String> {
        if let Some(sender) = &self.sender_address {
            if *sender != event.sender_address {
                return Some(format!(
                    "sender address mismatch: expected {}, observed {}",
                    sender, event.sender_address
                ));
            }
        }
        if let (Some(known), Some(seen)) = (&self.tx_hash, &event.tx_hash) {
            if known != seen {
                return Some(format!(
                    "transaction hash mismatch: expected {known}, observed {seen}"
                ));
            }
        }
        None
    }

    fn fail(&mut self, reason: String, now: DateTime<Utc>) -> PaymentTransition {
        self.failure_reason = Some(reason);
        self.move_to(PaymentStatus::Failed, now)
    }

    fn move_to(&mut self, to: PaymentStatus, now: DateTime<Utc>) -> PaymentTransition {
        let from = self.status;
        self.status = to;
        self.updated_at = now;
        PaymentTransition::Applied { from, to }
    }
}
