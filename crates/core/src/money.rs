use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// A money amount, always held at two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Money(Decimal::new(cents, 2))
    }

    pub fn to_cents(self) -> i64 {
        (self.0 * Decimal::from(100)).round().to_i64().unwrap_or(0)
    }

    pub fn from_decimal(decimal: Decimal) -> Self {
        Money(decimal.round_dp(2))
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Build an amount from the digit groups a receipt regex captured.
    ///
    /// `fraction` may be empty (whole amount) or a single digit, which is
    /// read as tenths (`"5"` → `.50`). Anything longer is cut to two digits.
    pub fn from_parts(whole: &str, fraction: &str) -> Option<Self> {
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        if !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let fraction = match fraction.len() {
            0 => "00".to_string(),
            1 => format!("{fraction}0"),
            _ => fraction[..2].to_string(),
        };
        Decimal::from_str(&format!("{whole}.{fraction}")).ok().map(Money::from_decimal)
    }

    /// Lenient parse for hand-typed values: `"$1,234.5"`, `" 12 "`, `"7,25"`.
    /// Returns `None` for anything that is not a plain non-negative number.
    pub fn parse_loose(input: &str) -> Option<Self> {
        let cleaned: String = input
            .trim()
            .trim_start_matches('$')
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if cleaned.is_empty() {
            return None;
        }
        // A lone comma followed by 1–2 digits is a decimal separator, otherwise a
        // thousands separator.
        let normalized = match cleaned.rfind(',') {
            Some(pos) if !cleaned.contains('.') && cleaned.len() - pos - 1 <= 2 => {
                let (int, frac) = cleaned.split_at(pos);
                format!("{}.{}", int.replace(',', ""), &frac[1..])
            }
            _ => cleaned.replace(',', ""),
        };
        let dec = Decimal::from_str(&normalized).ok()?;
        if dec.is_sign_negative() {
            return None;
        }
        Some(Money::from_decimal(dec))
    }

    /// Exclusive on both ends: `lower < self < upper`.
    pub fn is_between(self, lower: Money, upper: Money) -> bool {
        self > lower && self < upper
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money(self.0 - rhs.0)
    }
}
