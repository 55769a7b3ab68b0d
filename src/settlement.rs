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

//! Payment settlement.
//!
//! [`PaymentSettlement`] creates invoices and drives each [`Payment`] through
//! its state machine as watcher events arrive.
//!
//! # Invoice creation
//!
//! Exchange and fee are computed first, then the compliance gate runs; only a
//! request that passes both is persisted. The rate, token amount and fee are
//! frozen on the record.
//!
//! # Event ingestion
//!
//! Events are applied under the payment's own lock, to a copy of the record.
//! When the copy reaches `Completed`, the merchant is credited before the copy
//! replaces the stored record, so a failed credit leaves the payment untouched
//! and a replayed confirmation finds it already terminal. Lock order is always
//! payment, then balance.

use crate::base::{MerchantId, PaymentId, PaymentReference};
use crate::compliance::{ComplianceGate, PayerIdentity};
use crate::config::SettlementConfig;
use crate::error::SettlementError;
use crate::exchange::{self, CurrencyPair, ExchangeRateSource};
use crate::ledger::Ledger;
use crate::payment::{ChainEvent, ConfirmationPolicy, Payment, PaymentStatus, PaymentTransition};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const USD: &str = "USD";

/// A merchant's request to invoice a payer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub merchant_id: MerchantId,
    /// Amount in the settlement (fiat) currency.
    pub amount: Decimal,
    /// Memo to use; generated when absent.
    pub reference: Option<PaymentReference>,
    pub chain: String,
    pub destination_wallet: String,
    pub payer: Option<PayerIdentity>,
}

/// Counters returned by [`PaymentSettlement::run_events`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventLoopStats {
    pub applied: usize,
    pub unchanged: usize,
    pub rejected: usize,
}

/// Inbound payment state machine driver.
pub struct PaymentSettlement {
    config: SettlementConfig,
    ledger: Arc<Ledger>,
    compliance: Arc<ComplianceGate>,
    rates: Arc<dyn ExchangeRateSource>,
    payments: DashMap<PaymentId, Mutex<Payment>>,
    /// Reference index; doubles as the uniqueness check.
    references: DashMap<PaymentReference, PaymentId>,
}

impl PaymentSettlement {
    pub fn new(
        config: SettlementConfig,
        ledger: Arc<Ledger>,
        compliance: Arc<ComplianceGate>,
        rates: Arc<dyn ExchangeRateSource>,
    ) -> Self {
        Self {
            config,
            ledger,
            compliance,
            rates,
            payments: DashMap::new(),
            references: DashMap::new(),
        }
    }

    fn policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            required_confirmations: self.config.required_confirmations,
            amount_tolerance: self.config.amount_tolerance,
        }
    }

    fn usd_equivalent(&self, amount: Decimal) -> Result<Decimal, SettlementError> {
        let fiat = &self.config.settlement_currency.code;
        if fiat == USD {
            return Ok(amount);
        }
        let quote = self.rates.get_rate(&CurrencyPair::new(USD, fiat))?;
        exchange::convert(amount, quote.rate)
    }

    /// Creates an invoice in `Created` status.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::InvalidAmount`] / [`SettlementError::InvalidRate`] - bad amount or quote.
    /// - [`SettlementError::InvalidInvoice`] - blank chain or destination wallet.
    /// - [`SettlementError::TravelRuleDataRequired`] - high value without payer data.
    /// - [`SettlementError::KycLimitExceeded`] - merchant tier allowance exhausted.
    /// - [`SettlementError::DuplicateReference`] - reference already in use.
    /// - [`SettlementError::RateUnavailable`] - rate source could not quote.
    pub fn create_invoice(
        &self,
        invoice: NewInvoice,
        now: DateTime<Utc>,
    ) -> Result<Payment, SettlementError> {
        if invoice.amount <= Decimal::ZERO {
            return Err(SettlementError::InvalidAmount);
        }
        if invoice.destination_wallet.trim().is_empty() {
            return Err(SettlementError::InvalidInvoice(
                "destination wallet is required".into(),
            ));
        }
        if invoice.chain.trim().is_empty() {
            return Err(SettlementError::InvalidInvoice("chain is required".into()));
        }
        if let Some(reference) = &invoice.reference {
            if reference.as_str().trim().is_empty() {
                return Err(SettlementError::InvalidInvoice(
                    "payment reference must not be blank".into(),
                ));
            }
        }

        let fiat = self.config.settlement_currency.clone();
        let token = self.config.token_currency.clone();
        let quote = self
            .rates
            .get_rate(&CurrencyPair::new(&token.code, &fiat.code))?;
        let token_amount = exchange::convert(invoice.amount, quote.rate)?;
        let fee = exchange::compute_fee(invoice.amount, self.config.payment_fee_percent, &fiat)?;
        debug_assert_eq!(fee.fee + fee.net, invoice.amount);

        let usd_equivalent = self.usd_equivalent(invoice.amount)?;
        self.compliance.evaluate(
            &invoice.merchant_id,
            invoice.amount,
            usd_equivalent,
            invoice.payer.as_ref(),
            now,
        )?;
        if self.ledger.balance(&invoice.merchant_id).is_none() {
            return Err(SettlementError::MerchantNotFound);
        }

        let expires_at = self
            .config
            .payment_ttl()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| SettlementError::InvalidInvoice("payment ttl out of range".into()))?;

        let reference = invoice.reference.unwrap_or_else(PaymentReference::generate);
        let payment = Payment {
            id: PaymentId::new(),
            reference: reference.clone(),
            merchant_id: invoice.merchant_id,
            invoice_amount: invoice.amount,
            currency: fiat,
            token_amount,
            token_currency: token,
            chain: invoice.chain,
            exchange_rate: quote.rate,
            rate_as_of: quote.as_of,
            usd_equivalent,
            destination_wallet: invoice.destination_wallet,
            fee_percent: fee.fee_percent,
            fee_amount: fee.fee,
            net_amount: fee.net,
            payer: invoice.payer,
            status: PaymentStatus::Created,
            created_at: now,
            updated_at: now,
            paid_at: None,
            confirmed_at: None,
            expires_at,
            tx_hash: None,
            sender_address: None,
            confirmation_depth: 0,
            failure_reason: None,
        };

        // Atomic check-and-insert on the reference.
        match self.references.entry(reference) {
            Entry::Occupied(_) => return Err(SettlementError::DuplicateReference),
            Entry::Vacant(entry) => {
                self.payments
                    .insert(payment.id, Mutex::new(payment.clone()));
                entry.insert(payment.id);
            }
        }

        info!(
            payment = %payment.id,
            merchant = %payment.merchant_id,
            reference = %payment.reference,
            amount = %payment.invoice_money(),
            token_amount = %payment.token_money(),
            rate = %payment.exchange_rate,
            "invoice created"
        );
        Ok(payment)
    }

    fn lock<'a>(
        &self,
        slot: &'a Mutex<Payment>,
    ) -> Result<MutexGuard<'a, Payment>, SettlementError> {
        slot.try_lock_for(self.config.lock_timeout())
            .ok_or(SettlementError::Timeout)
    }

    /// Applies one watcher observation.
    ///
    /// Safe under duplicate and out-of-order delivery: the ledger is credited
    /// exactly once, on the transition into `Completed`.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::PaymentNotFound`] - no payment carries the reference.
    /// - [`SettlementError::AmountMismatch`] - first observation for the wrong amount.
    /// - [`SettlementError::Timeout`] - payment or balance lock not acquired in time.
    pub fn handle_event(
        &self,
        event: &ChainEvent,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransition, SettlementError> {
        let id = self
            .references
            .get(&event.payment_reference)
            .map(|entry| *entry.value())
            .ok_or(SettlementError::PaymentNotFound)?;
        let slot = self
            .payments
            .get(&id)
            .ok_or(SettlementError::PaymentNotFound)?;
        let mut stored = self.lock(slot.value())?;

        let mut next = stored.clone();
        let transition = next.apply_event(event, &self.policy(), now).inspect_err(|e| {
            warn!(payment = %id, reference = %event.payment_reference, error = %e, "watcher event rejected");
        })?;

        match transition {
            PaymentTransition::Unchanged(status) if status.is_terminal() => {
                if status == PaymentStatus::Completed && event.error.is_none() {
                    debug!(payment = %id, "duplicate confirmation ignored");
                } else {
                    warn!(payment = %id, %status, "late event for terminal payment dropped");
                }
            }
            PaymentTransition::Unchanged(status) => {
                debug!(payment = %id, %status, depth = event.confirmation_depth, "stale or duplicate event ignored");
            }
            PaymentTransition::Applied { from, to } => {
                if transition.completed() {
                    self.ledger.credit(&next.merchant_id, next.net_amount, now)?;
                }
                *stored = next;
                info!(payment = %id, %from, %to, "payment transition");
                if transition.completed() {
                    self.record_volume(&stored, now);
                }
            }
        }
        Ok(transition)
    }

    fn record_volume(&self, payment: &Payment, now: DateTime<Utc>) {
        if let Err(e) =
            self.compliance
                .record_settled_volume(&payment.merchant_id, payment.invoice_amount, now)
        {
            error!(payment = %payment.id, error = %e, "failed to record settled volume");
        }
    }

    /// Returns a channel for watcher workers to publish events on.
    ///
    /// Pair with [`PaymentSettlement::run_events`] on the consuming side.
    pub fn event_channel() -> (Sender<ChainEvent>, Receiver<ChainEvent>) {
        channel::unbounded()
    }

    /// Drains `events` until every sender is dropped.
    ///
    /// Errors are logged and counted; one bad event never stops the loop.
    pub fn run_events(&self, events: Receiver<ChainEvent>) -> EventLoopStats {
        let mut stats = EventLoopStats::default();
        for event in events.iter() {
            match self.handle_event(&event, Utc::now()) {
                Ok(PaymentTransition::Applied { .. }) => stats.applied += 1,
                Ok(PaymentTransition::Unchanged(_)) => stats.unchanged += 1,
                Err(e) => {
                    if !matches!(e, SettlementError::AmountMismatch { .. }) {
                        warn!(reference = %event.payment_reference, error = %e, "event not applied");
                    }
                    stats.rejected += 1;
                }
            }
        }
        stats
    }

    /// Expires every overdue payment. Returns the ids that changed.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<PaymentId> {
        let mut expired = Vec::new();
        for slot in self.payments.iter() {
            let Ok(mut payment) = self.lock(slot.value()) else {
                warn!(payment = %slot.key(), "payment busy, skipping expiry this sweep");
                continue;
            };
            if let PaymentTransition::Applied { from, to } = payment.expire(now) {
                info!(payment = %payment.id, %from, %to, "payment transition");
                expired.push(payment.id);
            }
        }
        expired
    }

    /// Returns the payment as of `now`, expiring it first if overdue.
    pub fn get_payment_at(
        &self,
        id: &PaymentId,
        now: DateTime<Utc>,
    ) -> Result<Payment, SettlementError> {
        let slot = self
            .payments
            .get(id)
            .ok_or(SettlementError::PaymentNotFound)?;
        let mut payment = self.lock(slot.value())?;
        if let PaymentTransition::Applied { from, to } = payment.expire(now) {
            info!(payment = %id, %from, %to, "payment transition");
        }
        Ok(payment.clone())
    }

    pub fn get_payment(&self, id: &PaymentId) -> Result<Payment, SettlementError> {
        self.get_payment_at(id, Utc::now())
    }

    pub fn find_by_reference(
        &self,
        reference: &PaymentReference,
    ) -> Result<Payment, SettlementError> {
        let id = self
            .references
            .get(reference)
            .map(|entry| *entry.value())
            .ok_or(SettlementError::PaymentNotFound)?;
        self.get_payment(&id)
    }

    pub fn len(&self) -> usize {
        self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty()
    }
}
