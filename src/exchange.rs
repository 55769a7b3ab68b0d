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

//! Exchange and fee calculation.
//!
//! Rates are quoted as the price of one unit of the base currency in the
//! quote currency: the `USDT/VND` rate `23000` means one USDT costs 23,000 VND.
//!
//! # Example
//!
//! ```
//! use merchant_settlement_rs::{Currency, exchange};
//! use rust_decimal_macros::dec;
//!
//! let token = exchange::convert(dec!(2300000), dec!(23000)).unwrap();
//! assert_eq!(token, dec!(100));
//!
//! let fee = exchange::compute_fee(dec!(2300000), dec!(1), &Currency::fiat("VND")).unwrap();
//! assert_eq!(fee.fee, dec!(23000));
//! assert_eq!(fee.net, dec!(2277000));
//! ```

use crate::error::SettlementError;
use crate::money::Currency;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

const ONE_HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Converts a fiat amount into tokens at `rate` fiat units per token.
///
/// The quotient keeps full precision; callers truncate for display only.
///
/// # Errors
///
/// - [`SettlementError::InvalidAmount`] - `fiat_amount <= 0`.
/// - [`SettlementError::InvalidRate`] - `rate <= 0`.
pub fn convert(fiat_amount: Decimal, rate: Decimal) -> Result<Decimal, SettlementError> {
    if fiat_amount <= Decimal::ZERO {
        return Err(SettlementError::InvalidAmount);
    }
    if rate <= Decimal::ZERO {
        return Err(SettlementError::InvalidRate);
    }
    fiat_amount
        .checked_div(rate)
        .ok_or(SettlementError::InvalidAmount)
}

/// Fee split of a gross amount. `fee + net == gross` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub fee_percent: Decimal,
    pub fee: Decimal,
    pub net: Decimal,
}

/// Computes the percentage fee on `amount`.
///
/// The fee is rounded half-up to the currency's minor unit and the net is
/// derived as `amount - fee`, so no rounding leaks between the two.
///
/// # Errors
///
/// - [`SettlementError::InvalidAmount`] - `amount <= 0`.
/// - [`SettlementError::InvalidFeePercent`] - percentage outside `0..=100`.
pub fn compute_fee(
    amount: Decimal,
    fee_percent: Decimal,
    currency: &Currency,
) -> Result<FeeBreakdown, SettlementError> {
    if amount <= Decimal::ZERO {
        return Err(SettlementError::InvalidAmount);
    }
    if fee_percent < Decimal::ZERO || fee_percent > ONE_HUNDRED {
        return Err(SettlementError::InvalidFeePercent);
    }
    let raw = amount
        .checked_mul(fee_percent)
        .ok_or(SettlementError::InvalidAmount)?
        / ONE_HUNDRED;
    let fee = currency.round_half_up(raw);
    Ok(FeeBreakdown {
        fee_percent,
        fee,
        net: amount - fee,
    })
}

/// Ordered currency pair, `base/quote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

/// A rate observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateQuote {
    pub pair: CurrencyPair,
    pub rate: Decimal,
    pub as_of: DateTime<Utc>,
}

/// Supplier of exchange rates.
///
/// Implementations report an unreachable upstream as
/// [`SettlementError::RateUnavailable`], which callers may retry.
pub trait ExchangeRateSource: Send + Sync {
    fn get_rate(&self, pair: &CurrencyPair) -> Result<RateQuote, SettlementError>;
}

/// Rate source backed by a fixed table that can be updated at runtime.
#[derive(Debug, Default)]
pub struct StaticRateSource {
    rates: RwLock<HashMap<CurrencyPair, RateQuote>>,
}

impl StaticRateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(self, pair: CurrencyPair, rate: Decimal) -> Self {
        self.set_rate(pair, rate);
        self
    }

    pub fn set_rate(&self, pair: CurrencyPair, rate: Decimal) {
        let quote = RateQuote {
            pair: pair.clone(),
            rate,
            as_of: Utc::now(),
        };
        self.rates.write().insert(pair, quote);
    }
}

impl ExchangeRateSource for StaticRateSource {
    fn get_rate(&self, pair: &CurrencyPair) -> Result<RateQuote, SettlementError> {
        self.rates
            .read()
            .get(pair)
            .cloned()
            .ok_or_else(|| SettlementError::RateUnavailable(pair.to_string()))
    }
}
