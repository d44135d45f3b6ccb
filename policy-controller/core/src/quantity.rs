//! Arithmetic over Kubernetes resource quantities.
//!
//! Quantities are held as a signed count of nano-units so that every
//! representable suffix (`n` through `E`, `Ki` through `Ei`) round-trips
//! exactly. Fractions finer than a nano-unit are rounded up, matching the API
//! server's treatment of quota values.

use hierarchy_controller_k8s_api as k8s;
use std::{fmt, ops, str::FromStr};

const NANOS_PER_UNIT: i128 = 1_000_000_000;

/// The largest power of ten that fits in an `i128`.
const MAX_POW10: u32 = 38;

#[derive(Copy, Clone, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quantity(i128);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("quantity is empty")]
    Empty,

    #[error("invalid quantity {0:?}")]
    Invalid(String),

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

enum Multiplier {
    Decimal(i32),
    Binary(u32),
}

// === impl Quantity ===

impl Quantity {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self::from_units(1);

    pub const fn from_units(units: i64) -> Self {
        Self(units as i128 * NANOS_PER_UNIT)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis as i128 * 1_000_000)
    }

    pub const fn from_nanos(nanos: i128) -> Self {
        Self(nanos)
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Quantity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        let invalid = || ParseError::Invalid(s.to_string());
        let overflow = || ParseError::Overflow(s.to_string());

        let (negative, rest) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, suffix) = rest.split_at(num_len);

        let (int, frac) = number.split_once('.').unwrap_or((number, ""));
        if (int.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(invalid());
        }

        let digits = format!("{int}{frac}");
        let digits = digits.trim_start_matches('0');
        if digits.len() > MAX_POW10 as usize {
            return Err(overflow());
        }
        let mantissa = if digits.is_empty() {
            0
        } else {
            digits.parse::<i128>().map_err(|_| invalid())?
        };

        let (base, exp) = match parse_suffix(suffix).ok_or_else(invalid)? {
            Multiplier::Decimal(exp) => (1i128, exp),
            Multiplier::Binary(power) => (1024i128.pow(power), 0),
        };

        // nanos = mantissa * base * 10^(9 + exp - scale)
        let scale = frac.len() as i64;
        let pow = 9 + i64::from(exp) - scale;
        let magnitude = mantissa.checked_mul(base).ok_or_else(overflow)?;
        let nanos = if pow >= 0 {
            let pow = u32::try_from(pow).map_err(|_| overflow())?;
            if pow > MAX_POW10 && magnitude != 0 {
                return Err(overflow());
            }
            magnitude
                .checked_mul(10i128.checked_pow(pow.min(MAX_POW10)).ok_or_else(overflow)?)
                .ok_or_else(overflow)?
        } else {
            match u32::try_from(-pow) {
                Ok(pow) if pow <= MAX_POW10 => div_ceil(magnitude, 10i128.pow(pow)),
                // Smaller than a nano-unit.
                _ => i128::from(magnitude != 0),
            }
        };

        Ok(Self(if negative { -nanos } else { nanos }))
    }
}

fn parse_suffix(suffix: &str) -> Option<Multiplier> {
    let m = match suffix {
        "" => Multiplier::Decimal(0),
        "n" => Multiplier::Decimal(-9),
        "u" => Multiplier::Decimal(-6),
        "m" => Multiplier::Decimal(-3),
        "k" => Multiplier::Decimal(3),
        "M" => Multiplier::Decimal(6),
        "G" => Multiplier::Decimal(9),
        "T" => Multiplier::Decimal(12),
        "P" => Multiplier::Decimal(15),
        "E" => Multiplier::Decimal(18),
        "Ki" => Multiplier::Binary(1),
        "Mi" => Multiplier::Binary(2),
        "Gi" => Multiplier::Binary(3),
        "Ti" => Multiplier::Binary(4),
        "Pi" => Multiplier::Binary(5),
        "Ei" => Multiplier::Binary(6),
        s => {
            let exp = s.strip_prefix(['e', 'E'])?;
            let digits = exp.strip_prefix(['-', '+']).unwrap_or(exp);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            Multiplier::Decimal(exp.parse().ok()?)
        }
    };
    Some(m)
}

fn div_ceil(n: i128, d: i128) -> i128 {
    let q = n / d;
    if n % d == 0 {
        q
    } else {
        q + 1
    }
}

/// Formats whole quantities as plain integers and fractional quantities with
/// the coarsest of the `m`, `u` or `n` suffixes that represents them exactly.
impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0;
        if n % NANOS_PER_UNIT == 0 {
            write!(f, "{}", n / NANOS_PER_UNIT)
        } else if n % 1_000_000 == 0 {
            write!(f, "{}m", n / 1_000_000)
        } else if n % 1_000 == 0 {
            write!(f, "{}u", n / 1_000)
        } else {
            write!(f, "{n}n")
        }
    }
}

impl ops::Add for Quantity {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl ops::AddAssign for Quantity {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl ops::Sub for Quantity {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl ops::SubAssign for Quantity {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for Quantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |a, b| a + b)
    }
}

impl TryFrom<&k8s::Quantity> for Quantity {
    type Error = ParseError;

    fn try_from(q: &k8s::Quantity) -> Result<Self, Self::Error> {
        q.0.parse()
    }
}

impl From<Quantity> for k8s::Quantity {
    fn from(q: Quantity) -> Self {
        k8s::Quantity(q.to_string())
    }
}
