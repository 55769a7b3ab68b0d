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

//! Error types for settlement processing.

use crate::payout::PayoutStatus;
use rust_decimal::Decimal;
use thiserror::Error;

/// Coarse classification of a [`SettlementError`].
///
/// Callers branch on the kind rather than on individual variants to decide
/// whether to surface, retry or alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or out-of-range input. Never retried.
    Validation,
    /// Transition attempted from the wrong source state.
    StateConflict,
    /// Business-rule rejection (funds, KYC limits, travel rule).
    BusinessRule,
    /// Timeout or unavailable collaborator. Retry with backoff.
    Transient,
    /// Ledger invariant would have been broken. Fatal.
    InvariantViolation,
}

/// Settlement processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    /// Amount is zero or negative
    #[error("invalid amount (must be positive)")]
    InvalidAmount,

    /// Exchange rate is zero or negative
    #[error("invalid exchange rate (must be positive)")]
    InvalidRate,

    /// Fee percentage outside 0..100
    #[error("invalid fee percentage")]
    InvalidFeePercent,

    /// Invoice request is incomplete
    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),

    /// Bank details failed validation
    #[error("invalid bank details: {0}")]
    InvalidBankDetails(String),

    /// Payer identity supplied but malformed
    #[error("invalid payer identity: {0}")]
    InvalidPayerIdentity(String),

    /// Payout amount under the configured floor
    #[error("payout amount below minimum of {minimum}")]
    BelowMinimum { minimum: Decimal },

    /// Observed on-chain amount differs from the invoice beyond tolerance
    #[error("observed amount {observed} does not match expected {expected}")]
    AmountMismatch { expected: Decimal, observed: Decimal },

    /// Payment reference already used by another invoice
    #[error("duplicate payment reference")]
    DuplicateReference,

    /// Completion requires the external bank reference
    #[error("missing bank reference")]
    MissingBankReference,

    /// Rejection and failure require a reason
    #[error("missing reason")]
    MissingReason,

    /// Referenced payment does not exist
    #[error("payment not found")]
    PaymentNotFound,

    /// Referenced payout does not exist
    #[error("payout not found")]
    PayoutNotFound,

    /// Merchant has no balance row or compliance profile
    #[error("merchant not found")]
    MerchantNotFound,

    /// Payout approval attempted on a payout that is not `requested`
    #[error("cannot approve payout in status {0}")]
    CannotApprove(PayoutStatus),

    /// Payout transition attempted from the wrong state
    #[error("invalid payout status: {0}")]
    InvalidPayoutStatus(PayoutStatus),

    /// Reservation would exceed the available balance
    #[error("insufficient available funds")]
    InsufficientFunds,

    /// Merchant KYC tier does not allow this volume
    #[error("kyc limit exceeded (remaining {remaining})")]
    KycLimitExceeded { remaining: Decimal },

    /// High-value payment without payer identity
    #[error("travel rule payer data required")]
    TravelRuleDataRequired,

    /// Lock or collaborator did not answer in time
    #[error("operation timed out")]
    Timeout,

    /// Exchange rate source could not quote the pair
    #[error("exchange rate unavailable for {0}")]
    RateUnavailable(String),

    /// Mutation would drive a balance negative
    #[error("ledger invariant violation: {0}")]
    LedgerInvariantViolation(String),
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAmount
            | Self::InvalidRate
            | Self::InvalidFeePercent
            | Self::InvalidInvoice(_)
            | Self::InvalidBankDetails(_)
            | Self::InvalidPayerIdentity(_)
            | Self::BelowMinimum { .. }
            | Self::AmountMismatch { .. }
            | Self::DuplicateReference
            | Self::MissingBankReference
            | Self::MissingReason
            | Self::PaymentNotFound
            | Self::PayoutNotFound
            | Self::MerchantNotFound => ErrorKind::Validation,
            Self::CannotApprove(_) | Self::InvalidPayoutStatus(_) => ErrorKind::StateConflict,
            Self::InsufficientFunds
            | Self::KycLimitExceeded { .. }
            | Self::TravelRuleDataRequired => ErrorKind::BusinessRule,
            Self::Timeout | Self::RateUnavailable(_) => ErrorKind::Transient,
            Self::LedgerInvariantViolation(_) => ErrorKind::InvariantViolation,
        }
    }

    /// Only transient failures may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            SettlementError::InvalidAmount.to_string(),
            "invalid amount (must be positive)"
        );
        assert_eq!(
            SettlementError::InvalidRate.to_string(),
            "invalid exchange rate (must be positive)"
        );
        assert_eq!(
            SettlementError::BelowMinimum {
                minimum: dec!(100000)
            }
            .to_string(),
            "payout amount below minimum of 100000"
        );
        assert_eq!(
            SettlementError::AmountMismatch {
                expected: dec!(100),
                observed: dec!(99.5)
            }
            .to_string(),
            "observed amount 99.5 does not match expected 100"
        );
        assert_eq!(
            SettlementError::InsufficientFunds.to_string(),
            "insufficient available funds"
        );
        assert_eq!(
            SettlementError::CannotApprove(PayoutStatus::Rejected).to_string(),
            "cannot approve payout in status rejected"
        );
        assert_eq!(
            SettlementError::TravelRuleDataRequired.to_string(),
            "travel rule payer data required"
        );
        assert_eq!(SettlementError::Timeout.to_string(), "operation timed out");
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(SettlementError::InvalidAmount.kind(), ErrorKind::Validation);
        assert_eq!(
            SettlementError::InvalidPayoutStatus(PayoutStatus::Completed).kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(
            SettlementError::KycLimitExceeded { remaining: dec!(0) }.kind(),
            ErrorKind::BusinessRule
        );
        assert_eq!(SettlementError::Timeout.kind(), ErrorKind::Transient);
        assert_eq!(
            SettlementError::LedgerInvariantViolation("pending".into()).kind(),
            ErrorKind::InvariantViolation
        );
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(SettlementError::Timeout.is_retryable());
        assert!(SettlementError::RateUnavailable("USDT/VND".into()).is_retryable());
        assert!(!SettlementError::InsufficientFunds.is_retryable());
        assert!(!SettlementError::LedgerInvariantViolation("x".into()).is_retryable());
    }

    #[test]
    fn errors_are_cloneable() {
        let error = SettlementError::InsufficientFunds;
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
