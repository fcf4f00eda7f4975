//! Exact fixed-point money arithmetic
//!
//! Balances, stakes and commissions never touch binary floating point.
//! `Amount` stores minor units (hundredths) in an `i64`; `Rate` stores
//! basis points (1/10000). Rounding is half away from zero, two decimals.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
    str::FromStr,
};

/// Minor units per whole unit (two decimal places)
pub const SCALE: i64 = 100;

/// Basis points per whole (rate of 1.0)
pub const RATE_SCALE: i64 = 10_000;

/// Exact decimal amount with two fractional digits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Build from minor units (cents)
    pub const fn from_minor(minor: i64) -> Self {
        Amount(minor)
    }

    /// Build from a whole number of units
    pub const fn from_units(units: i64) -> Self {
        Amount(units * SCALE)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Multiply by an integer count (e.g. stake * participants)
    pub fn times(self, count: usize) -> Amount {
        Amount(self.0 * count as i64)
    }

    /// `round(self * rate, 2)`
    pub fn apply_rate(self, rate: Rate) -> Amount {
        let product = self.0 as i128 * rate.bps() as i128;
        Amount(div_round_half_away(product, RATE_SCALE as i128) as i64)
    }

    /// `round(self / parts, 2)`; returns zero for zero parts
    pub fn split_rounded(self, parts: usize) -> Amount {
        if parts == 0 {
            return Amount::ZERO;
        }
        Amount(div_round_half_away(self.0 as i128, parts as i128) as i64)
    }

    /// Truncating division, used when rounding up would overdraw a pool
    pub fn split_floor(self, parts: usize) -> Amount {
        if parts == 0 {
            return Amount::ZERO;
        }
        Amount(self.0.div_euclid(parts as i64))
    }
}

fn div_round_half_away(numerator: i128, denominator: i128) -> i128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder.abs() * 2 >= denominator.abs() {
        if (numerator < 0) != (denominator < 0) {
            quotient - 1
        } else {
            quotient + 1
        }
    } else {
        quotient
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount(self.0 - rhs.0)
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        self.0 -= rhs.0;
    }
}

impl Neg for Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / SCALE as u64, abs % SCALE as u64)
    }
}

/// Parse failure for `Amount` and `Rate`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid decimal '{input}': {reason}")]
pub struct ParseDecimalError {
    pub input: String,
    pub reason: &'static str,
}

/// Parse a decimal string into an integer scaled by `10^digits`.
/// Rejects inputs with more fractional digits than the scale holds.
fn parse_scaled(input: &str, digits: u32) -> Result<i64, ParseDecimalError> {
    let err = |reason| ParseDecimalError {
        input: input.to_string(),
        reason,
    };
    let trimmed = input.trim();
    let (negative, body) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    if body.is_empty() {
        return Err(err("empty"));
    }

    let (whole, frac) = match body.split_once('.') {
        Some((w, f)) => (w, f),
        None => (body, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(err("no digits"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(err("non-digit character"));
    }
    if frac.len() > digits as usize {
        return Err(err("too many fractional digits"));
    }

    let scale = 10i64.pow(digits);
    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| err("out of range"))?
    };
    let mut frac_value: i64 = if frac.is_empty() {
        0
    } else {
        frac.parse().map_err(|_| err("out of range"))?
    };
    frac_value *= 10i64.pow(digits - frac.len() as u32);

    let value = whole_value
        .checked_mul(scale)
        .and_then(|v| v.checked_add(frac_value))
        .ok_or_else(|| err("out of range"))?;
    Ok(if negative { -value } else { value })
}

impl FromStr for Amount {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_scaled(s, 2).map(Amount)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Commission rate in basis points; `Rate::from_bps(300)` is 3%
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(u32);

impl Rate {
    pub const ZERO: Rate = Rate(0);

    pub const fn from_bps(bps: u32) -> Self {
        Rate(bps)
    }

    pub const fn bps(self) -> u32 {
        self.0
    }

    pub fn checked_add(self, other: Rate) -> Option<Rate> {
        self.0.checked_add(other.0).map(Rate)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:04}", self.0 / RATE_SCALE as u32, self.0 % RATE_SCALE as u32)
    }
}

impl FromStr for Rate {
    type Err = ParseDecimalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let scaled = parse_scaled(s, 4)?;
        if scaled < 0 {
            return Err(ParseDecimalError {
                input: s.to_string(),
                reason: "rate cannot be negative",
            });
        }
        u32::try_from(scaled).map(Rate).map_err(|_| ParseDecimalError {
            input: s.to_string(),
            reason: "out of range",
        })
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_parse_and_display() {
        assert_eq!("10".parse::<Amount>().unwrap(), Amount::from_units(10));
        assert_eq!("0.8".parse::<Amount>().unwrap(), Amount::from_minor(80));
        assert_eq!("-1.25".parse::<Amount>().unwrap(), Amount::from_minor(-125));
        assert_eq!(Amount::from_minor(3800).to_string(), "38.00");
        assert_eq!(Amount::from_minor(-5).to_string(), "-0.05");
        assert!("1.234".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!("".parse::<Amount>().is_err());
    }

    #[test]
    fn test_rate_parse() {
        assert_eq!("0.03".parse::<Rate>().unwrap(), Rate::from_bps(300));
        assert_eq!("0.025".parse::<Rate>().unwrap(), Rate::from_bps(250));
        assert_eq!(Rate::from_bps(1000).to_string(), "0.1000");
        assert!("-0.01".parse::<Rate>().is_err());
    }

    #[test]
    fn test_apply_rate_rounds_half_away_from_zero() {
        let pool = Amount::from_units(40);
        assert_eq!(pool.apply_rate(Rate::from_bps(300)), Amount::from_minor(120));
        assert_eq!(pool.apply_rate(Rate::from_bps(200)), Amount::from_minor(80));

        // 0.50 * 1% = 0.005 -> 0.01
        assert_eq!(Amount::from_minor(50).apply_rate(Rate::from_bps(100)), Amount::from_minor(1));
        // 0.49 * 1% = 0.0049 -> 0.00
        assert_eq!(Amount::from_minor(49).apply_rate(Rate::from_bps(100)), Amount::ZERO);
    }

    #[test]
    fn test_split() {
        let pool = Amount::from_units(10);
        assert_eq!(pool.split_rounded(3), Amount::from_minor(333));
        assert_eq!(pool.split_rounded(6), Amount::from_minor(167));
        assert_eq!(pool.split_floor(6), Amount::from_minor(166));
        assert_eq!(pool.split_rounded(0), Amount::ZERO);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&Amount::from_minor(1234)).unwrap();
        assert_eq!(json, "\"12.34\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Amount::from_minor(1234));
    }
}
