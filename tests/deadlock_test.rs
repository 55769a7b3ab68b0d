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

//! Deadlock detection tests using parking_lot's built-in deadlock detector.
//!
//! These tests drive the real settlement types from many threads at once and
//! verify the lock graph never cycles: payment and payout records are always
//! locked before the merchant balance they touch.
//!
//! Requires parking_lot's `deadlock_detection` feature (enabled for tests).

use chrono::{Duration as ChronoDuration, Utc};
use merchant_settlement_rs::exchange::{CurrencyPair, StaticRateSource};
use merchant_settlement_rs::{
    ActorId, BankDetails, ChainEvent, KycTier, MerchantId, NewInvoice, Payment, PayoutRequest,
    SettlementConfig, SettlementEngine,
};
use parking_lot::deadlock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

// === Detector ===

struct Detector {
    running: Arc<AtomicBool>,
    found: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Detector {
    fn start() -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let found = Arc::new(AtomicBool::new(false));
        let (r, f) = (running.clone(), found.clone());

        let handle = thread::spawn(move || {
            while r.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
                let deadlocks = deadlock::check_deadlock();
                if deadlocks.is_empty() {
                    continue;
                }
                eprintln!("\n=== DEADLOCK DETECTED ===");
                for (i, threads) in deadlocks.iter().enumerate() {
                    eprintln!("\nDeadlock #{}", i + 1);
                    for t in threads {
                        eprintln!("Thread ID: {:?}", t.thread_id());
                        eprintln!("Backtrace:\n{:#?}", t.backtrace());
                    }
                }
                f.store(true, Ordering::SeqCst);
            }
        });

        Detector {
            running,
            found,
            handle: Some(handle),
        }
    }

    fn finish(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
        assert!(
            !self.found.load(Ordering::SeqCst),
            "deadlock detected, see stderr"
        );
    }
}

// === Fixtures ===

fn engine() -> Arc<SettlementEngine> {
    let rates = StaticRateSource::new()
        .with_rate(CurrencyPair::new("USDT", "VND"), dec!(23000))
        .with_rate(CurrencyPair::new("USD", "VND"), dec!(23000));
    Arc::new(SettlementEngine::new(
        SettlementConfig::default(),
        Arc::new(rates),
    ))
}

fn invoice(engine: &SettlementEngine, merchant: MerchantId, amount: Decimal) -> Payment {
    engine
        .payments()
        .create_invoice(
            NewInvoice {
                merchant_id: merchant,
                amount,
                reference: None,
                chain: "tron".into(),
                destination_wallet: "THot".into(),
                payer: None,
            },
            Utc::now(),
        )
        .unwrap()
}

fn confirmation(payment: &Payment) -> ChainEvent {
    ChainEvent {
        payment_reference: payment.reference.clone(),
        tx_hash: Some(format!("0x{}", payment.id)),
        sender_address: "TPayer".into(),
        observed_amount: payment.token_amount,
        confirmation_depth: 12,
        finalized: false,
        error: None,
    }
}

fn payout_request(merchant: MerchantId) -> PayoutRequest {
    PayoutRequest {
        merchant_id: merchant,
        amount: dec!(100000),
        bank: BankDetails {
            bank_name: "VPBank".into(),
            account_number: "1122334455".into(),
            account_holder: "Tra Da".into(),
            branch: None,
        },
        requested_by: ActorId::from("owner"),
    }
}

// === Tests ===

#[test]
fn confirmations_and_payouts_on_one_merchant() {
    let detector = Detector::start();
    let engine = engine();
    let merchant = MerchantId::new();
    engine.register_merchant(merchant, KycTier::Enhanced, Utc::now());

    let payments: Vec<Payment> = (0..200)
        .map(|_| invoice(&engine, merchant, dec!(230000)))
        .collect();
    let payments = Arc::new(payments);
    let payouts_done = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for worker in 0..4 {
        let engine = Arc::clone(&engine);
        let payments = Arc::clone(&payments);
        handles.push(thread::spawn(move || {
            for p in payments.iter().skip(worker).step_by(2) {
                engine
                    .payments()
                    .handle_event(&confirmation(p), Utc::now())
                    .unwrap();
            }
        }));
    }
    for _ in 0..4 {
        let engine = Arc::clone(&engine);
        let payouts_done = Arc::clone(&payouts_done);
        handles.push(thread::spawn(move || {
            let admin = ActorId::from("ops");
            for _ in 0..50 {
                let Ok(payout) = engine
                    .payouts()
                    .request_payout(payout_request(merchant), Utc::now())
                else {
                    continue;
                };
                engine.payouts().approve(&payout.id, &admin, Utc::now()).unwrap();
                engine
                    .payouts()
                    .complete(&payout.id, &admin, "FT", Utc::now())
                    .unwrap();
                payouts_done.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    detector.finish();

    let balance = engine.ledger().balance(&merchant).unwrap();
    // 200 x 227,700 net credited
    assert_eq!(balance.total_received, dec!(45540000));
    let paid = Decimal::from(payouts_done.load(Ordering::SeqCst)) * dec!(100000);
    assert_eq!(balance.total_paid_out, paid);
    assert_eq!(balance.available + balance.pending, balance.total_received - paid);
}

#[test]
fn sweep_races_event_ingestion_and_invoicing() {
    let detector = Detector::start();
    let engine = engine();
    let merchants: Vec<MerchantId> = (0..8).map(|_| MerchantId::new()).collect();
    for m in &merchants {
        engine.register_merchant(*m, KycTier::Enhanced, Utc::now());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let sweeper = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                // far enough ahead that every open invoice is overdue
                engine
                    .payments()
                    .sweep_expired(Utc::now() + ChronoDuration::hours(1));
                thread::yield_now();
            }
        })
    };

    let workers: Vec<_> = merchants
        .iter()
        .map(|m| {
            let engine = Arc::clone(&engine);
            let m = *m;
            thread::spawn(move || {
                for _ in 0..50 {
                    let p = invoice(&engine, m, dec!(23000));
                    // races the sweeper; either outcome is valid
                    engine
                        .payments()
                        .handle_event(&confirmation(&p), Utc::now())
                        .unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    sweeper.join().unwrap();
    detector.finish();

    for m in &merchants {
        let b = engine.ledger().balance(m).unwrap();
        assert_eq!(b.total_received, b.available + b.pending);
        assert!(b.available <= dec!(50) * dec!(22770));
    }
}

#[test]
fn cross_merchant_payout_actions() {
    let detector = Detector::start();
    let engine = engine();
    let merchants: Vec<MerchantId> = (0..6).map(|_| MerchantId::new()).collect();
    for m in &merchants {
        engine.register_merchant(*m, KycTier::Enhanced, Utc::now());
        engine.ledger().credit(m, dec!(10000000), Utc::now()).unwrap();
    }

    let mut payouts = Vec::new();
    for m in &merchants {
        for _ in 0..10 {
            let payout = engine
                .payouts()
                .request_payout(payout_request(*m), Utc::now())
                .unwrap();
            payouts.push(payout.id);
        }
    }
    let payouts = Arc::new(payouts);

    let handles: Vec<_> = (0..6)
        .map(|worker| {
            let engine = Arc::clone(&engine);
            let payouts = Arc::clone(&payouts);
            thread::spawn(move || {
                let admin = ActorId(format!("admin-{worker}"));
                // every worker walks every payout, starting at a different offset
                let n = payouts.len();
                for i in 0..n {
                    let id = payouts[(i + worker * 7) % n];
                    if worker % 2 == 0 {
                        let _ = engine.payouts().reject(&id, &admin, "ops sweep", Utc::now());
                        let _ = engine.payouts().approve(&id, &admin, Utc::now());
                    } else {
                        let _ = engine.payouts().approve(&id, &admin, Utc::now());
                        let _ = engine.payouts().fail(&id, &admin, "bank offline", Utc::now());
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    detector.finish();

    // every payout ended rejected or failed, so every reservation was released
    for m in &merchants {
        let b = engine.ledger().balance(m).unwrap();
        assert_eq!(b.pending, dec!(0));
        assert_eq!(b.available, dec!(10000000));
    }
}
