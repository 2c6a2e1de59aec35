//! Non-negative, currency-tagged fixed-point amounts.
//!
//! All arithmetic is integer-exact minor units (no floating point touches
//! value). Mixing amounts from different currencies is a programming error,
//! not a recoverable condition — it surfaces as [`AmountError::CurrencyMismatch`].

use crate::currency::Currency;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("cannot combine amounts of different currencies: {0} vs {1}")]
    CurrencyMismatch(Currency, Currency),
    #[error("amount arithmetic overflowed")]
    Overflow,
    #[error("amount underflowed below zero")]
    Underflow,
    #[error("malformed decimal amount string: {0}")]
    InvalidDecimal(String),
}

/// A non-negative amount of `currency`, stored as an integer count of minor
/// units (e.g. satoshis for BTC, wei for ETH).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount {
    currency: Currency,
    minor_units: u128,
}

impl Amount {
    pub fn zero(currency: Currency) -> Self {
        Amount {
            currency,
            minor_units: 0,
        }
    }

    pub fn from_minor_units(currency: Currency, minor_units: u128) -> Self {
        Amount {
            currency,
            minor_units,
        }
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn minor_units(&self) -> u128 {
        self.minor_units
    }

    pub fn is_zero(&self) -> bool {
        self.minor_units == 0
    }

    fn check_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(self.currency, other.currency));
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.check_currency(other)?;
        let minor_units = self
            .minor_units
            .checked_add(other.minor_units)
            .ok_or(AmountError::Overflow)?;
        Ok(Amount {
            currency: self.currency,
            minor_units,
        })
    }

    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.check_currency(other)?;
        let minor_units = self
            .minor_units
            .checked_sub(other.minor_units)
            .ok_or(AmountError::Underflow)?;
        Ok(Amount {
            currency: self.currency,
            minor_units,
        })
    }

    /// `self * basis_points / 10000`, exact integer division with the
    /// remainder left to the caller (used by payout splitting, where the
    /// remainder is explicitly assigned to the last output — §4.5).
    pub fn checked_mul_basis_points(&self, basis_points: u16) -> Result<Amount, AmountError> {
        let product = self
            .minor_units
            .checked_mul(basis_points as u128)
            .ok_or(AmountError::Overflow)?;
        Ok(Amount {
            currency: self.currency,
            minor_units: product / 10_000,
        })
    }

    /// Render as a decimal string with the currency's native precision.
    /// Internal boundaries never serialize amounts as JSON numbers (§6).
    pub fn to_decimal_string(&self) -> String {
        let decimals = self.currency.decimals();
        let divisor = 10u128.pow(decimals);
        let whole = self.minor_units / divisor;
        if decimals == 0 {
            return whole.to_string();
        }
        let frac = self.minor_units % divisor;
        format!("{}.{:0width$}", whole, frac, width = decimals as usize)
    }

    /// Parse a decimal string into minor units for the given currency.
    pub fn from_decimal_string(currency: Currency, s: &str) -> Result<Amount, AmountError> {
        let s = s.trim();
        let decimals = currency.decimals() as usize;
        let (whole_part, frac_part) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::InvalidDecimal(s.to_string()));
        }
        if !whole_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
            || frac_part.len() > decimals
        {
            return Err(AmountError::InvalidDecimal(s.to_string()));
        }
        let whole: u128 = if whole_part.is_empty() {
            0
        } else {
            whole_part
                .parse()
                .map_err(|_| AmountError::InvalidDecimal(s.to_string()))?
        };
        let mut frac_padded = frac_part.to_string();
        while frac_padded.len() < decimals {
            frac_padded.push('0');
        }
        let frac: u128 = if frac_padded.is_empty() {
            0
        } else {
            frac_padded
                .parse()
                .map_err(|_| AmountError::InvalidDecimal(s.to_string()))?
        };
        let divisor = 10u128.pow(decimals as u32);
        let minor_units = whole
            .checked_mul(divisor)
            .and_then(|v| v.checked_add(frac))
            .ok_or(AmountError::Overflow)?;
        Ok(Amount {
            currency,
            minor_units,
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.to_decimal_string(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_round_trip_is_exact() {
        let a = Amount::from_decimal_string(Currency::Btc, "0.5").unwrap();
        assert_eq!(a.minor_units(), 50_000_000);
        assert_eq!(a.to_decimal_string(), "0.50000000");
    }

    #[test]
    fn cross_currency_add_is_rejected() {
        let btc = Amount::from_minor_units(Currency::Btc, 1);
        let eth = Amount::from_minor_units(Currency::Eth, 1);
        assert_eq!(
            btc.checked_add(&eth),
            Err(AmountError::CurrencyMismatch(Currency::Btc, Currency::Eth))
        );
    }

    #[test]
    fn basis_point_split_matches_spec_example() {
        // S2: input 1.0 ETH, fee 0.015 ETH => net 0.985 ETH, split 70/30,
        // remainder to the last output.
        let net = Amount::from_decimal_string(Currency::Eth, "0.985").unwrap();
        let first = net.checked_mul_basis_points(7000).unwrap();
        assert_eq!(first.to_decimal_string(), "0.68950000000000000");
        let second = net.checked_sub(&first).unwrap();
        assert_eq!(second.to_decimal_string(), "0.29550000000000000");
    }

    #[test]
    fn underflow_is_rejected() {
        let a = Amount::from_minor_units(Currency::Btc, 1);
        let b = Amount::from_minor_units(Currency::Btc, 2);
        assert_eq!(a.checked_sub(&b), Err(AmountError::Underflow));
    }
}
