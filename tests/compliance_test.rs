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

//! Compliance gate integration tests.

use chrono::{DateTime, TimeZone, Utc};
use merchant_settlement_rs::config::TierTable;
use merchant_settlement_rs::exchange::{CurrencyPair, StaticRateSource};
use merchant_settlement_rs::{
    ChainEvent, ComplianceGate, KycTier, MerchantId, NewInvoice, PayerIdentity,
    SettlementConfig, SettlementEngine, SettlementError,
};
use rayon::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 9, 30, 0).unwrap()
}

fn gate_with(tier: KycTier, now: DateTime<Utc>) -> (ComplianceGate, MerchantId) {
    let gate = ComplianceGate::new(TierTable::default(), dec!(1000));
    let merchant = MerchantId::new();
    gate.register(merchant, tier, now);
    (gate, merchant)
}

fn payer(country: &str) -> PayerIdentity {
    PayerIdentity {
        full_name: "Tran Thi B".into(),
        wallet_address: "TPayerWallet".into(),
        country_code: country.into(),
        id_document: Some("B1234567".into()),
    }
}

// === Travel Rule ===

#[test]
fn travel_rule_applies_strictly_above_threshold() {
    let now = at(2025, 3, 10);
    let (gate, merchant) = gate_with(KycTier::Enhanced, now);

    let at_threshold = gate
        .evaluate(&merchant, dec!(25000000), dec!(1000), None, now)
        .unwrap();
    assert!(!at_threshold.travel_rule_required);

    assert_eq!(
        gate.evaluate(&merchant, dec!(25000250), dec!(1000.01), None, now),
        Err(SettlementError::TravelRuleDataRequired)
    );

    let with_payer = gate
        .evaluate(&merchant, dec!(25000250), dec!(1000.01), Some(&payer("VN")), now)
        .unwrap();
    assert!(with_payer.travel_rule_required);
}

#[test]
fn malformed_payer_is_rejected_below_threshold() {
    let now = at(2025, 3, 10);
    let (gate, merchant) = gate_with(KycTier::Enhanced, now);
    assert!(matches!(
        gate.evaluate(&merchant, dec!(1000), dec!(0.04), Some(&payer("vn")), now),
        Err(SettlementError::InvalidPayerIdentity(_))
    ));
}

// === Tier Limits ===

#[test]
fn daily_limit_is_inclusive() {
    let now = at(2025, 3, 10);
    let (gate, merchant) = gate_with(KycTier::Basic, now);

    let result = gate
        .evaluate(&merchant, dec!(50000000), dec!(2000), Some(&payer("VN")), now)
        .unwrap();
    assert_eq!(result.remaining_limit, Some(dec!(50000000)));

    gate.record_settled_volume(&merchant, dec!(50000000), now)
        .unwrap();
    assert_eq!(
        gate.evaluate(&merchant, dec!(1), dec!(0.00004), None, now),
        Err(SettlementError::KycLimitExceeded {
            remaining: Decimal::ZERO
        })
    );
}

#[test]
fn monthly_limit_binds_across_days_and_resets_next_month() {
    let (gate, merchant) = gate_with(KycTier::Basic, at(2025, 3, 1));
    for day in 1..=10 {
        gate.record_settled_volume(&merchant, dec!(50000000), at(2025, 3, day))
            .unwrap();
    }

    // fresh day, but the month is spent
    assert_eq!(
        gate.evaluate(&merchant, dec!(1), dec!(0.00004), None, at(2025, 3, 11)),
        Err(SettlementError::KycLimitExceeded {
            remaining: Decimal::ZERO
        })
    );

    let april = gate
        .evaluate(&merchant, dec!(1), dec!(0.00004), None, at(2025, 4, 1))
        .unwrap();
    assert_eq!(april.remaining_limit, Some(dec!(50000000)));
}

#[test]
fn tier_upgrade_keeps_counters() {
    let now = at(2025, 3, 10);
    let (gate, merchant) = gate_with(KycTier::Basic, now);
    gate.record_settled_volume(&merchant, dec!(50000000), now)
        .unwrap();

    gate.set_tier(merchant, KycTier::Verified).unwrap();
    let result = gate
        .evaluate(&merchant, dec!(1000000), dec!(40), None, now)
        .unwrap();
    assert_eq!(result.remaining_limit, Some(dec!(450000000)));
    assert_eq!(gate.profile(&merchant).unwrap().daily_volume, dec!(50000000));
}

#[test]
fn unregistered_merchant_is_not_found() {
    let gate = ComplianceGate::new(TierTable::default(), dec!(1000));
    let now = at(2025, 3, 10);
    assert_eq!(
        gate.evaluate(&MerchantId::new(), dec!(1), dec!(0), None, now),
        Err(SettlementError::MerchantNotFound)
    );
    assert_eq!(
        gate.set_tier(MerchantId::new(), KycTier::Basic),
        Err(SettlementError::MerchantNotFound)
    );
}

// === Concurrency ===

#[test]
fn concurrent_volume_records_sum_exactly() {
    let now = at(2025, 3, 10);
    let (gate, merchant) = gate_with(KycTier::Enhanced, now);

    (0..500).into_par_iter().for_each(|_| {
        gate.record_settled_volume(&merchant, dec!(1234.56), now)
            .unwrap();
    });

    let profile = gate.profile(&merchant).unwrap();
    assert_eq!(profile.daily_volume, dec!(617280));
    assert_eq!(profile.monthly_volume, dec!(617280));
}

// === Through the Engine ===

#[test]
fn only_completed_payments_count_toward_limits() {
    let rates = StaticRateSource::new()
        .with_rate(CurrencyPair::new("USDT", "VND"), dec!(23000))
        .with_rate(CurrencyPair::new("USD", "VND"), dec!(23000));
    let engine = SettlementEngine::new(SettlementConfig::default(), Arc::new(rates));
    let merchant = MerchantId::new();
    let now = Utc::now();
    engine.register_merchant(merchant, KycTier::Basic, now);

    let payment = engine
        .payments()
        .create_invoice(
            NewInvoice {
                merchant_id: merchant,
                amount: dec!(2300000),
                reference: None,
                chain: "tron".into(),
                destination_wallet: "THotWallet".into(),
                payer: None,
            },
            now,
        )
        .unwrap();
    assert_eq!(
        engine.compliance().profile(&merchant).unwrap().daily_volume,
        Decimal::ZERO
    );

    let event = ChainEvent {
        payment_reference: payment.reference.clone(),
        tx_hash: Some("0xfeed".into()),
        sender_address: "TPayer".into(),
        observed_amount: payment.token_amount,
        confirmation_depth: 12,
        finalized: true,
        error: None,
    };
    engine.payments().handle_event(&event, now).unwrap();
    engine.payments().handle_event(&event, now).unwrap();

    assert_eq!(
        engine.compliance().profile(&merchant).unwrap().daily_volume,
        dec!(2300000)
    );
}
