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

use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use merchant_settlement_rs::exchange::{CurrencyPair, StaticRateSource};
use merchant_settlement_rs::{
    ActorId, BankDetails, ChainEvent, KycTier, MerchantId, NewInvoice, PaymentReference,
    PayoutId, PayoutRequest, SettlementConfig, SettlementEngine, SettlementError,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Merchant settlement replay - apply an operation log and print balances
///
/// Reads invoice, watcher and payout operations from a CSV file, applies them
/// in order and writes every merchant's balance to stdout.
#[derive(Parser, Debug)]
#[command(name = "merchant-settlement-rs")]
#[command(about = "Replays a settlement operation log and prints merchant balances", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: type,merchant,reference,amount,depth,finalized,actor,detail
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// TOML settlement configuration; defaults apply when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Token price in the settlement currency (USDT/VND)
    #[arg(long, default_value = "25000")]
    rate: Decimal,

    /// USD price in the settlement currency; defaults to --rate
    #[arg(long)]
    usd_rate: Option<Decimal>,

    /// KYC tier given to merchants on first sight
    #[arg(long, default_value = "verified")]
    tier: KycTier,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match SettlementConfig::from_toml_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config '{}': {}", path.display(), e);
                process::exit(1);
            }
        },
        None => SettlementConfig::default(),
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let replay = Replay::new(config, args.rate, args.usd_rate.unwrap_or(args.rate), args.tier);
    let replay = match process_operations(BufReader::new(file), replay) {
        Ok(replay) => replay,
        Err(e) => {
            eprintln!("Error processing operations: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = write_balances(&replay, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

/// Raw CSV record matching the input format.
///
/// Column use per row type:
///
/// | type     | merchant | reference | amount | depth | finalized | actor  | detail         |
/// |----------|----------|-----------|--------|-------|-----------|--------|----------------|
/// | invoice  | label    | memo      | fiat   |       |           |        |                |
/// | observe  |          | memo      | token  | depth | bool      | sender | tx hash        |
/// | payout   | label    | payout    | fiat   |       |           | actor  | account number |
/// | approve, process | | payout    |        |       |           | actor  |                |
/// | complete |          | payout    |        |       |           | actor  | bank reference |
/// | reject, fail |      | payout    |        |       |           | actor  | reason         |
/// | sweep    |          |           | secs   |       |           |        |                |
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    op: String,
    #[serde(default)]
    merchant: String,
    #[serde(default)]
    reference: String,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    depth: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    finalized: Option<bool>,
    #[serde(default)]
    actor: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Error)]
enum ReplayError {
    #[error("malformed row: {0}")]
    Malformed(&'static str),
    #[error("unknown payout label {0}")]
    UnknownPayout(String),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

/// Replay state: the engine plus the label maps the log refers to.
struct Replay {
    engine: SettlementEngine,
    tier: KycTier,
    clock: DateTime<Utc>,
    merchants: BTreeMap<String, MerchantId>,
    payouts: HashMap<String, PayoutId>,
}

impl Replay {
    fn new(config: SettlementConfig, rate: Decimal, usd_rate: Decimal, tier: KycTier) -> Self {
        let rates = StaticRateSource::new()
            .with_rate(
                CurrencyPair::new(&config.token_currency.code, &config.settlement_currency.code),
                rate,
            )
            .with_rate(CurrencyPair::new("USD", &config.settlement_currency.code), usd_rate);
        Replay {
            engine: SettlementEngine::new(config, Arc::new(rates)),
            tier,
            clock: Utc::now(),
            merchants: BTreeMap::new(),
            payouts: HashMap::new(),
        }
    }

    fn merchant(&mut self, label: &str) -> Result<MerchantId, ReplayError> {
        if label.is_empty() {
            return Err(ReplayError::Malformed("merchant is required"));
        }
        if let Some(id) = self.merchants.get(label) {
            return Ok(*id);
        }
        let id = MerchantId::new();
        self.engine.register_merchant(id, self.tier, self.clock);
        self.merchants.insert(label.to_string(), id);
        Ok(id)
    }

    fn payout(&self, label: &str) -> Result<PayoutId, ReplayError> {
        self.payouts
            .get(label)
            .copied()
            .ok_or_else(|| ReplayError::UnknownPayout(label.to_string()))
    }

    fn apply(&mut self, record: CsvRecord) -> Result<(), ReplayError> {
        let now = self.clock;
        let actor = ActorId::from(record.actor.as_str());
        match record.op.to_lowercase().as_str() {
            "invoice" => {
                let merchant_id = self.merchant(&record.merchant)?;
                let amount = record.amount.ok_or(ReplayError::Malformed("amount is required"))?;
                let reference = (!record.reference.is_empty())
                    .then(|| PaymentReference::from(record.reference.as_str()));
                self.engine.payments().create_invoice(
                    NewInvoice {
                        merchant_id,
                        amount,
                        reference,
                        chain: "tron".into(),
                        destination_wallet: "replay-hot-wallet".into(),
                        payer: None,
                    },
                    now,
                )?;
            }
            "observe" => {
                let event = ChainEvent {
                    payment_reference: PaymentReference::from(record.reference.as_str()),
                    tx_hash: (!record.detail.is_empty()).then_some(record.detail),
                    sender_address: record.actor,
                    observed_amount: record
                        .amount
                        .ok_or(ReplayError::Malformed("amount is required"))?,
                    confirmation_depth: record.depth.unwrap_or(0),
                    finalized: record.finalized.unwrap_or(false),
                    error: None,
                };
                self.engine.payments().handle_event(&event, now)?;
            }
            "payout" => {
                let merchant_id = self.merchant(&record.merchant)?;
                if record.reference.is_empty() {
                    return Err(ReplayError::Malformed("payout label is required"));
                }
                let amount = record.amount.ok_or(ReplayError::Malformed("amount is required"))?;
                let payout = self.engine.payouts().request_payout(
                    PayoutRequest {
                        merchant_id,
                        amount,
                        bank: BankDetails {
                            bank_name: "replay".into(),
                            account_number: record.detail,
                            account_holder: record.merchant,
                            branch: None,
                        },
                        requested_by: actor,
                    },
                    now,
                )?;
                self.payouts.insert(record.reference, payout.id);
            }
            "approve" => {
                let id = self.payout(&record.reference)?;
                self.engine.payouts().approve(&id, &actor, now)?;
            }
            "process" => {
                let id = self.payout(&record.reference)?;
                self.engine.payouts().start_processing(&id, &actor, now)?;
            }
            "complete" => {
                let id = self.payout(&record.reference)?;
                self.engine
                    .payouts()
                    .complete(&id, &actor, &record.detail, now)?;
            }
            "reject" => {
                let id = self.payout(&record.reference)?;
                self.engine.payouts().reject(&id, &actor, &record.detail, now)?;
            }
            "fail" => {
                let id = self.payout(&record.reference)?;
                self.engine.payouts().fail(&id, &actor, &record.detail, now)?;
            }
            "sweep" => {
                let secs = record.amount.unwrap_or(Decimal::ZERO);
                let secs = i64::try_from(secs.trunc())
                    .map_err(|_| ReplayError::Malformed("sweep seconds out of range"))?;
                self.clock = Duration::try_seconds(secs)
                    .and_then(|step| self.clock.checked_add_signed(step))
                    .ok_or(ReplayError::Malformed("sweep seconds out of range"))?;
                let expired = self.engine.payments().sweep_expired(self.clock);
                debug!(count = expired.len(), "sweep finished");
            }
            _ => return Err(ReplayError::Malformed("unknown operation type")),
        }
        Ok(())
    }
}

/// Applies every operation from a CSV reader, in file order.
///
/// Malformed rows and rejected operations are logged and skipped.
///
/// # Errors
///
/// Returns a CSV error only if the reader itself fails.
fn process_operations<R: Read>(reader: R, mut replay: Replay) -> Result<Replay, csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        match result {
            Ok(record) => {
                let op = record.op.clone();
                if let Err(e) = replay.apply(record) {
                    warn!(row = line + 1, op = %op, error = %e, "skipping operation");
                }
            }
            Err(e) => {
                if e.is_io_error() {
                    return Err(e);
                }
                warn!(row = line + 1, error = %e, "skipping malformed row");
            }
        }
    }

    Ok(replay)
}

#[derive(Debug, Serialize)]
struct BalanceRow<'a> {
    merchant: &'a str,
    available: Decimal,
    pending: Decimal,
    total_received: Decimal,
    total_paid_out: Decimal,
}

/// Writes one CSV row per merchant, ordered by label.
///
/// Columns: `merchant, available, pending, total_received, total_paid_out`
fn write_balances<W: Write>(replay: &Replay, writer: W) -> Result<(), csv::Error> {
    let precision = replay.engine.config().settlement_currency.scale;
    let mut wtr = Writer::from_writer(writer);
    for (label, id) in &replay.merchants {
        let Some(balance) = replay.engine.ledger().balance(id) else {
            continue;
        };
        wtr.serialize(BalanceRow {
            merchant: label,
            available: balance.available.round_dp(precision),
            pending: balance.pending.round_dp(precision),
            total_received: balance.total_received.round_dp(precision),
            total_paid_out: balance.total_paid_out.round_dp(precision),
        })?;
    }
    wtr.flush()?;
    Ok(())
}
