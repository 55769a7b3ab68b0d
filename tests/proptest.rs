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

//! Property-based tests for the settlement core.
//!
//! These tests verify invariants that should hold for any amount, rate or
//! sequence of operations.

use chrono::Utc;
use merchant_settlement_rs::exchange::{self, CurrencyPair, StaticRateSource};
use merchant_settlement_rs::{
    ChainEvent, Currency, KycTier, Ledger, LedgerOp, MerchantId, NewInvoice, PaymentStatus,
    SettlementConfig, SettlementEngine,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Fiat amount with two decimal places, 0.01 to 10,000,000,000.
fn arb_amount() -> impl Strategy<Value = Decimal> {
    (1i64..=1_000_000_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Fee percentage 0.00 to 100.00.
fn arb_fee_percent() -> impl Strategy<Value = Decimal> {
    (0i64..=10_000i64).prop_map(|bp| Decimal::new(bp, 2))
}

/// Exchange rate 0.0001 to 1,000,000.
fn arb_rate() -> impl Strategy<Value = Decimal> {
    (1i64..=10_000_000_000i64).prop_map(|r| Decimal::new(r, 4))
}

fn arb_op() -> impl Strategy<Value = LedgerOp> {
    let small = (1i64..=100_000i64).prop_map(|c| Decimal::new(c, 2));
    prop_oneof![
        small.clone().prop_map(LedgerOp::Credit),
        small.clone().prop_map(LedgerOp::Reserve),
        small.clone().prop_map(LedgerOp::Release),
        small.prop_map(LedgerOp::Settle),
    ]
}

// =============================================================================
// Exchange & Fee Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// Fee and net always add back to the gross amount.
    #[test]
    fn fee_plus_net_equals_amount(amount in arb_amount(), percent in arb_fee_percent()) {
        let vnd = Currency::fiat("VND");
        let split = exchange::compute_fee(amount, percent, &vnd).unwrap();

        prop_assert_eq!(split.fee + split.net, amount);
        prop_assert!(split.fee >= Decimal::ZERO);
        prop_assert!(split.net >= Decimal::ZERO);
        prop_assert!(split.fee.scale() <= vnd.scale);
    }

    /// Converting back with the same rate recovers the fiat amount.
    #[test]
    fn convert_round_trips_within_precision(amount in arb_amount(), rate in arb_rate()) {
        let token = exchange::convert(amount, rate).unwrap();
        prop_assert!(token > Decimal::ZERO);
        prop_assert!((token * rate - amount).abs() < dec!(0.000001));
    }

    /// Non-positive rates are always refused.
    #[test]
    fn non_positive_rate_is_refused(amount in arb_amount(), rate in -1_000i64..=0i64) {
        prop_assert!(exchange::convert(amount, Decimal::from(rate)).is_err());
    }
}

// =============================================================================
// Ledger Invariant Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Any sequence of operations keeps balances non-negative and conserved.
    #[test]
    fn ledger_invariants_hold(ops in prop::collection::vec(arb_op(), 1..60)) {
        let ledger = Ledger::default();
        let merchant = MerchantId::new();
        ledger.open_account(merchant, Utc::now());

        for op in ops {
            let before = ledger.balance(&merchant).unwrap();
            let result = match op {
                LedgerOp::Credit(a) => ledger.credit(&merchant, a, Utc::now()),
                LedgerOp::Reserve(a) => ledger.reserve(&merchant, a, Utc::now()),
                LedgerOp::Release(a) => ledger.release(&merchant, a, Utc::now()),
                LedgerOp::Settle(a) => ledger.settle(&merchant, a, Utc::now()),
            };
            let after = ledger.balance(&merchant).unwrap();

            prop_assert!(after.available >= Decimal::ZERO);
            prop_assert!(after.pending >= Decimal::ZERO);
            prop_assert_eq!(
                after.total_received - after.total_paid_out,
                after.available + after.pending
            );
            if result.is_err() {
                prop_assert_eq!(before.available, after.available);
                prop_assert_eq!(before.pending, after.pending);
            }
        }
    }

    /// Reserving then releasing the same amount is a no-op on balances.
    #[test]
    fn reserve_release_round_trip(credit in arb_amount(), share in 1u32..=100u32) {
        let ledger = Ledger::default();
        let merchant = MerchantId::new();
        ledger.open_account(merchant, Utc::now());
        ledger.credit(&merchant, credit, Utc::now()).unwrap();
        let before = ledger.balance(&merchant).unwrap();

        let amount = (credit * Decimal::from(share) / dec!(100)).round_dp(2);
        prop_assume!(amount > Decimal::ZERO);
        ledger.reserve(&merchant, amount, Utc::now()).unwrap();
        ledger.release(&merchant, amount, Utc::now()).unwrap();

        let after = ledger.balance(&merchant).unwrap();
        prop_assert_eq!(after.available, before.available);
        prop_assert_eq!(after.pending, before.pending);
    }
}

// =============================================================================
// Payment Event Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// However watcher events are duplicated or reordered, the merchant is
    /// credited the net amount exactly when the payment completes.
    #[test]
    fn credited_once_iff_completed(
        events in prop::collection::vec((0u32..20, any::<bool>()), 1..25),
    ) {
        let rates = StaticRateSource::new()
            .with_rate(CurrencyPair::new("USDT", "VND"), dec!(23000))
            .with_rate(CurrencyPair::new("USD", "VND"), dec!(23000));
        let engine = SettlementEngine::new(SettlementConfig::default(), Arc::new(rates));
        let merchant = MerchantId::new();
        let now = Utc::now();
        engine.register_merchant(merchant, KycTier::Enhanced, now);

        let payment = engine.payments().create_invoice(
            NewInvoice {
                merchant_id: merchant,
                amount: dec!(2300000),
                reference: None,
                chain: "tron".into(),
                destination_wallet: "THot".into(),
                payer: None,
            },
            now,
        ).unwrap();

        let mut last = PaymentStatus::Created;
        for (depth, finalized) in events {
            let event = ChainEvent {
                payment_reference: payment.reference.clone(),
                tx_hash: Some("0x1".into()),
                sender_address: "TPayer".into(),
                observed_amount: payment.token_amount,
                confirmation_depth: depth,
                finalized,
                error: None,
            };
            engine.payments().handle_event(&event, now).unwrap();
            let status = engine.payments().get_payment_at(&payment.id, now).unwrap().status;
            // once terminal, always terminal
            if last.is_terminal() {
                prop_assert_eq!(status, last);
            }
            last = status;
        }

        let available = engine.ledger().balance(&merchant).unwrap().available;
        if last == PaymentStatus::Completed {
            prop_assert_eq!(available, payment.net_amount);
        } else {
            prop_assert_eq!(available, Decimal::ZERO);
        }
    }
}
