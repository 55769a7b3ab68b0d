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

//! Fixed-point currency amounts.
//!
//! Every amount in the crate is a [`Decimal`]; floating point never touches
//! money. Values keep full precision through intermediate arithmetic and are
//! rounded to the currency's minor unit only where a final figure is fixed
//! (fees) or truncated for display.
//!
//! # Example
//!
//! ```
//! use merchant_settlement_rs::{Currency, Money};
//! use rust_decimal_macros::dec;
//!
//! let usdt = Currency::token("USDT", 6);
//! let amount = Money::new(dec!(33.3333333333), usdt);
//! assert_eq!(amount.truncated_for_display(), dec!(33.333333));
//! ```

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest scale a token amount may carry.
pub const MAX_TOKEN_SCALE: u32 = 9;

/// Scale of every fiat currency.
pub const FIAT_SCALE: u32 = 2;

/// A currency code with the number of decimal places of its minor unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub scale: u32,
}

impl Currency {
    pub fn fiat(code: &str) -> Self {
        Self {
            code: code.to_uppercase(),
            scale: FIAT_SCALE,
        }
    }

    /// Token currency; scale is capped at [`MAX_TOKEN_SCALE`].
    pub fn token(code: &str, scale: u32) -> Self {
        Self {
            code: code.to_uppercase(),
            scale: scale.min(MAX_TOKEN_SCALE),
        }
    }

    /// Rounds half away from zero to this currency's minor unit.
    pub fn round_half_up(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.scale, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Drops digits beyond the minor unit without rounding.
    pub fn truncate(&self, amount: Decimal) -> Decimal {
        amount.round_dp_with_strategy(self.scale, RoundingStrategy::ToZero)
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

/// An exact amount in a given currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn truncated_for_display(&self) -> Decimal {
        self.currency.truncate(self.amount)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.truncated_for_display(), self.currency)
    }
}
