//! Fixed-point money arithmetic.
//!
//! Monetary amounts are i64 minor units with two implied decimal places;
//! tax rates are basis points (1 bps = 0.01%). Binary floating point never
//! touches a financial value, so totals cannot drift across thousands of
//! daily transactions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub};
use std::str::FromStr;
use thiserror::Error;

/// Minor units per whole currency unit (two decimal places).
const MINOR_PER_UNIT: i64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid money amount {input:?}: {reason}")]
pub struct MoneyParseError {
    pub input: String,
    pub reason: &'static str,
}

/// An exact monetary amount in minor units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Money(minor)
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Multiply by an item quantity. `None` on overflow.
    pub fn times(self, qty: i64) -> Option<Money> {
        let scaled = (self.0 as i128).checked_mul(qty as i128)?;
        i64::try_from(scaled).ok().map(Money)
    }

    /// Overflow-checked addition. `None` on overflow.
    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    /// Overflow-checked subtraction. `None` on overflow.
    pub fn checked_sub(self, rhs: Money) -> Option<Money> {
        self.0.checked_sub(rhs.0).map(Money)
    }

    /// Apply a basis-point rate, rounding half away from zero.
    pub fn apply_rate(self, rate: TaxRate) -> Money {
        let scaled = self.0 as i128 * rate.bps() as i128;
        let (quot, rem) = (scaled / 10_000, scaled % 10_000);
        let rounded = if rem.abs() * 2 >= 10_000 {
            quot + scaled.signum()
        } else {
            quot
        };
        Money(rounded as i64)
    }
}

impl FromStr for Money {
    type Err = MoneyParseError;

    /// Parse a decimal string ("10000", "99.9", "-3.50") into minor units.
    /// More than two fraction digits is rejected rather than silently
    /// rounded; the caller sent a value this representation cannot hold.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fail = |reason| MoneyParseError {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        if body.is_empty() {
            return Err(fail("empty amount"));
        }

        let (whole, frac) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };
        if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail("non-numeric whole part"));
        }
        if frac.len() > 2 {
            return Err(fail("more than two fraction digits"));
        }
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(fail("non-numeric fraction part"));
        }

        let whole: i64 = whole.parse().map_err(|_| fail("whole part overflows"))?;
        let mut frac_minor: i64 = if frac.is_empty() {
            0
        } else {
            frac.parse().map_err(|_| fail("bad fraction part"))?
        };
        if frac.len() == 1 {
            frac_minor *= 10;
        }

        let minor = whole
            .checked_mul(MINOR_PER_UNIT)
            .and_then(|v| v.checked_add(frac_minor))
            .ok_or_else(|| fail("amount overflows"))?;

        Ok(Money(if negative { -minor } else { minor }))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{sign}{}.{:02}",
            abs / MINOR_PER_UNIT as u64,
            abs % MINOR_PER_UNIT as u64
        )
    }
}

// Operators saturate rather than wrap; callers that must distinguish
// overflow use `checked_add`/`checked_sub`/`times`.
impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(self.0.saturating_neg())
    }
}

/// A tax or discount rate in basis points. 1100 bps = 11% (default PPN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxRate(u32);

impl TaxRate {
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    pub const fn bps(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaxRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_whole_and_fractional() {
        assert_eq!(
            "10000".parse::<Money>().unwrap(),
            Money::from_minor(1_000_000)
        );
        assert_eq!("100.5".parse::<Money>().unwrap(), Money::from_minor(10_050));
        assert_eq!("0.05".parse::<Money>().unwrap(), Money::from_minor(5));
        assert_eq!("-3.50".parse::<Money>().unwrap(), Money::from_minor(-350));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Money>().is_err());
        assert!("1.005".parse::<Money>().is_err());
        assert!("12a".parse::<Money>().is_err());
        assert!(".5".parse::<Money>().is_err());
        assert!("1.2.3".parse::<Money>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for raw in ["10000.00", "0.05", "-3.50", "22200.00"] {
            let parsed: Money = raw.parse().unwrap();
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn test_eleven_percent_of_twenty_thousand() {
        let subtotal: Money = "20000".parse().unwrap();
        let tax = subtotal.apply_rate(TaxRate::from_bps(1100));
        assert_eq!(tax, "2200".parse().unwrap());
        assert_eq!((subtotal + tax).to_string(), "22200.00");
    }

    #[test]
    fn test_apply_rate_rounds_half_up() {
        // 11% of 0.05 = 0.0055 -> rounds to 0.01
        let tiny = Money::from_minor(5);
        assert_eq!(
            tiny.apply_rate(TaxRate::from_bps(1100)),
            Money::from_minor(1)
        );
        // 10% of 0.05 = 0.005 -> tie rounds away from zero
        assert_eq!(
            tiny.apply_rate(TaxRate::from_bps(1000)),
            Money::from_minor(1)
        );
        // 9% of 0.05 = 0.0045 -> rounds down
        assert_eq!(tiny.apply_rate(TaxRate::from_bps(900)), Money::ZERO);
    }

    #[test]
    fn test_operators_saturate_instead_of_wrapping() {
        let max = Money::from_minor(i64::MAX);
        let min = Money::from_minor(i64::MIN);
        assert_eq!(max + Money::from_minor(1), max);
        assert_eq!(min - Money::from_minor(1), min);
        assert_eq!(-min, max);
        assert!(max.checked_add(Money::from_minor(1)).is_none());
        assert!(min.checked_sub(Money::from_minor(1)).is_none());
        assert_eq!(
            Money::from_minor(2).checked_add(Money::from_minor(3)),
            Some(Money::from_minor(5))
        );
    }

    #[test]
    fn test_times_guards_overflow() {
        assert_eq!(
            Money::from_minor(250).times(4),
            Some(Money::from_minor(1000))
        );
        assert!(Money::from_minor(i64::MAX).times(2).is_none());
    }
}
