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

//! # Merchant Settlement
//!
//! Settlement core for a crypto-payment merchant gateway: payers send tokens
//! on-chain, merchants are credited in fiat and withdraw to their bank.
//!
//! ## Core Components
//!
//! - [`SettlementEngine`]: wires the components below together
//! - [`PaymentSettlement`]: invoice creation and the payment state machine
//! - [`PayoutDesk`]: withdrawal requests and the payout state machine
//! - [`Ledger`]: per-merchant balances (credit, reserve, release, settle)
//! - [`ComplianceGate`]: KYC tier limits and the travel rule
//! - [`exchange`]: fiat/token conversion and fee splitting
//! - [`SettlementError`]: error taxonomy shared by every operation
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use chrono::Utc;
//! use merchant_settlement_rs::exchange::{CurrencyPair, StaticRateSource};
//! use merchant_settlement_rs::{
//!     ChainEvent, KycTier, MerchantId, NewInvoice, PaymentStatus, SettlementConfig,
//!     SettlementEngine,
//! };
//! use rust_decimal_macros::dec;
//!
//! let rates = StaticRateSource::new()
//!     .with_rate(CurrencyPair::new("USDT", "VND"), dec!(23000))
//!     .with_rate(CurrencyPair::new("USD", "VND"), dec!(23000));
//! let engine = SettlementEngine::new(SettlementConfig::default(), Arc::new(rates));
//!
//! let merchant = MerchantId::new();
//! engine.register_merchant(merchant, KycTier::Verified, Utc::now());
//!
//! // Invoice 2,300,000 VND: 100 USDT, 1% fee
//! let payment = engine
//!     .payments()
//!     .create_invoice(
//!         NewInvoice {
//!             merchant_id: merchant,
//!             amount: dec!(2300000),
//!             reference: None,
//!             chain: "tron".into(),
//!             destination_wallet: "TXYZ".into(),
//!             payer: None,
//!         },
//!         Utc::now(),
//!     )
//!     .unwrap();
//! assert_eq!(payment.token_amount, dec!(100));
//!
//! // Watcher reports a finalized transfer
//! let event = ChainEvent {
//!     payment_reference: payment.reference.clone(),
//!     tx_hash: Some("0xabc".into()),
//!     sender_address: "TPayer".into(),
//!     observed_amount: dec!(100),
//!     confirmation_depth: 20,
//!     finalized: true,
//!     error: None,
//! };
//! engine.payments().handle_event(&event, Utc::now()).unwrap();
//!
//! let done = engine.payments().get_payment(&payment.id).unwrap();
//! assert_eq!(done.status, PaymentStatus::Completed);
//! assert_eq!(engine.ledger().balance(&merchant).unwrap().available, dec!(2277000));
//! ```
//!
//! ## Thread Safety
//!
//! Payments, payouts and balances are each stored in a `DashMap` with a lock
//! per record. Operations on different merchants run in parallel; operations
//! touching a record and its merchant's balance lock the record first.

pub mod balance;
mod base;
pub mod compliance;
pub mod config;
mod engine;
pub mod error;
pub mod exchange;
pub mod ledger;
pub mod money;
pub mod payment;
pub mod payout;
pub mod payout_desk;
pub mod settlement;

pub use balance::{BalanceSnapshot, LedgerOp, MerchantBalance};
pub use base::{ActorId, MerchantId, PaymentId, PaymentReference, PayoutId};
pub use compliance::{ComplianceGate, KycTier, PayerIdentity, TierLimits};
pub use config::{ConfigError, SettlementConfig, TierTable};
pub use engine::SettlementEngine;
pub use error::{ErrorKind, SettlementError};
pub use exchange::{ExchangeRateSource, FeeBreakdown};
pub use ledger::Ledger;
pub use money::{Currency, Money};
pub use payment::{ChainEvent, ConfirmationPolicy, Payment, PaymentStatus, PaymentTransition};
pub use payout::{BankDetails, Payout, PayoutStatus, PayoutTransition};
pub use payout_desk::{PayoutDesk, PayoutRequest};
pub use settlement::{EventLoopStats, NewInvoice, PaymentSettlement};
