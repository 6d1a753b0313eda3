//! Fixed-point monetary amounts
//!
//! All money in the system is a non-negative fixed-point decimal with six
//! fractional digits (the native precision of the settlement token).
//! Arithmetic is integer-exact on the scaled value; decimal strings are
//! only a boundary format.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of fractional digits carried by every amount
pub const AMOUNT_DECIMALS: u8 = 6;

/// Scale factor between whole units and the internal representation
pub const AMOUNT_SCALE: u64 = 10u64.pow(AMOUNT_DECIMALS as u32);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount is empty")]
    Empty,

    #[error("amount '{0}' is not a valid decimal")]
    Invalid(String),

    #[error("amount '{0}' is negative")]
    Negative(String),

    #[error("amount '{0}' has more than {AMOUNT_DECIMALS} fractional digits")]
    TooManyDecimals(String),

    #[error("amount '{0}' overflows the monetary range")]
    Overflow(String),

    #[error("amount must be positive")]
    NotPositive,
}

/// A monetary amount in micro-units (10^-6 of a token)
///
/// Partition balances, prices, budgets, penalties and bonds are all
/// `Amount`s. The type is deliberately unsigned: negative values are
/// rejected at the boundary and never representable internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build from a raw scaled value (micro-units)
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Build from whole token units
    pub fn from_units(units: u64) -> Option<Self> {
        units.checked_mul(AMOUNT_SCALE).map(Self)
    }

    /// Raw scaled value in micro-units
    pub const fn micros(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Self(self.0.saturating_sub(other.0))
    }

    pub fn min(self, other: Amount) -> Amount {
        Self(self.0.min(other.0))
    }

    /// Multiply by a ratio in `[0, 1]`, truncating toward zero on the
    /// scaled representation.
    ///
    /// This is the single place a floating ratio touches a monetary value
    /// (proportional bond forfeiture); everything else is integer-exact.
    pub fn mul_ratio_trunc(self, ratio: f64) -> Amount {
        if ratio <= 0.0 {
            return Amount::ZERO;
        }
        if ratio >= 1.0 {
            return self;
        }
        Self((self.0 as f64 * ratio) as u64)
    }

    /// Parse a decimal string with up to six fractional digits
    ///
    /// Leading/trailing whitespace is trimmed. Empty, negative and
    /// unparseable values are rejected.
    pub fn parse(input: &str) -> Result<Amount, AmountError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AmountError::Empty);
        }
        if trimmed.starts_with('-') {
            return Err(AmountError::Negative(trimmed.to_string()));
        }

        let (int_part, frac_part) = match trimmed.split_once('.') {
            Some((i, f)) => (i, f),
            None => (trimmed, ""),
        };

        // ".5" is accepted, "5." is accepted, "." is not
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(AmountError::Invalid(trimmed.to_string()));
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(AmountError::Invalid(trimmed.to_string()));
        }
        if frac_part.len() > AMOUNT_DECIMALS as usize {
            return Err(AmountError::TooManyDecimals(trimmed.to_string()));
        }

        let units: u64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| AmountError::Overflow(trimmed.to_string()))?
        };

        let mut micros: u64 = 0;
        if !frac_part.is_empty() {
            let parsed: u64 = frac_part
                .parse()
                .map_err(|_| AmountError::Invalid(trimmed.to_string()))?;
            micros = parsed * 10u64.pow(AMOUNT_DECIMALS as u32 - frac_part.len() as u32);
        }

        units
            .checked_mul(AMOUNT_SCALE)
            .and_then(|scaled| scaled.checked_add(micros))
            .map(Self)
            .ok_or_else(|| AmountError::Overflow(trimmed.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / AMOUNT_SCALE, self.0 % AMOUNT_SCALE)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Amount::parse(&raw).map_err(de::Error::custom)
    }
}
