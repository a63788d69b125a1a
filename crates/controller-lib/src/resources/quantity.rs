//! Resource quantity parsing and normalization
//!
//! Quantities are stored in a normalized base unit (milli-CPU for CPU,
//! bytes for memory) so that different notations of the same amount
//! compare equal: `"100m"` == `"0.1"`, `"128Mi"` == `"134217728"`.

use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Resource class a quantity belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl ResourceKind {
    /// Decimal exponent between the written unit and the base unit
    fn base_exponent(self) -> i32 {
        match self {
            // cores -> millicores
            ResourceKind::Cpu => 3,
            ResourceKind::Memory => 0,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => write!(f, "cpu"),
            ResourceKind::Memory => write!(f, "memory"),
        }
    }
}

/// Errors produced when a quantity string cannot be normalized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("empty {kind} quantity")]
    Empty { kind: ResourceKind },

    #[error("invalid {kind} quantity {input:?}: {reason}")]
    Invalid {
        kind: ResourceKind,
        input: String,
        reason: &'static str,
    },

    #[error("negative {kind} quantity {input:?}")]
    Negative { kind: ResourceKind, input: String },

    #[error("{kind} quantity {input:?} is out of range")]
    Overflow { kind: ResourceKind, input: String },
}

/// A resource amount in its normalized base unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Quantity {
    kind: ResourceKind,
    base: u64,
}

/// Binary suffixes, largest first so formatting picks the widest unit
const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

impl Quantity {
    /// CPU quantity from millicores
    pub fn millicores(value: u64) -> Self {
        Self {
            kind: ResourceKind::Cpu,
            base: value,
        }
    }

    /// Memory quantity from bytes
    pub fn bytes(value: u64) -> Self {
        Self {
            kind: ResourceKind::Memory,
            base: value,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Value in the base unit (millicores or bytes)
    pub fn base_value(&self) -> u64 {
        self.base
    }

    /// Absolute distance between two quantities in base units
    pub fn abs_diff(&self, other: &Quantity) -> u64 {
        self.base.abs_diff(other.base)
    }

    /// Parse a Kubernetes-style quantity string.
    ///
    /// Fractions that do not land on a whole base unit round up, matching
    /// how the API server canonicalizes quantities (`0.0001` CPU is `1m`).
    pub fn parse(kind: ResourceKind, input: &str) -> Result<Self, QuantityError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(QuantityError::Empty { kind });
        }

        let invalid = |reason: &'static str| QuantityError::Invalid {
            kind,
            input: input.to_string(),
            reason,
        };
        let overflow = || QuantityError::Overflow {
            kind,
            input: input.to_string(),
        };

        let unsigned = match trimmed.as_bytes()[0] {
            b'-' => {
                return Err(QuantityError::Negative {
                    kind,
                    input: input.to_string(),
                })
            }
            b'+' => &trimmed[1..],
            _ => trimmed,
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("missing digits"));
        }
        if fraction.contains('.') {
            return Err(invalid("more than one decimal point"));
        }

        let (suffix_exp10, suffix_exp2) =
            parse_suffix(suffix).ok_or_else(|| invalid("unknown suffix"))?;

        // Trailing fraction zeros carry no value
        let fraction = fraction.trim_end_matches('0');

        // mantissa * 10^exp10 * 2^exp2
        let mut mantissa: u128 = 0;
        for digit in whole.bytes().chain(fraction.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(u128::from(digit - b'0')))
                .ok_or_else(overflow)?;
        }
        if mantissa == 0 {
            return Ok(Self { kind, base: 0 });
        }
        let fraction_digits = i64::try_from(fraction.len()).map_err(|_| overflow())?;
        let exp10 = i64::from(suffix_exp10) + i64::from(kind.base_exponent()) - fraction_digits;
        let pow10 = |exp: u64| u32::try_from(exp).ok().and_then(|e| 10u128.checked_pow(e));

        let scaled = mantissa
            .checked_shl(suffix_exp2)
            .filter(|v| v >> suffix_exp2 == mantissa)
            .ok_or_else(overflow)?;

        let base = if exp10 >= 0 {
            pow10(exp10.unsigned_abs())
                .and_then(|p| scaled.checked_mul(p))
                .ok_or_else(overflow)?
        } else {
            match pow10(exp10.unsigned_abs()) {
                Some(divisor) => scaled.div_ceil(divisor),
                // Divisor beyond u128: anything non-zero rounds up to one unit
                None => u128::from(scaled != 0),
            }
        };

        let base = u64::try_from(base).map_err(|_| overflow())?;
        Ok(Self { kind, base })
    }
}

/// Returns (decimal exponent, binary exponent) for a suffix
fn parse_suffix(suffix: &str) -> Option<(i32, u32)> {
    let decimal = match suffix {
        "" => Some(0),
        "m" => Some(-3),
        "k" => Some(3),
        "M" => Some(6),
        "G" => Some(9),
        "T" => Some(12),
        "P" => Some(15),
        "E" => Some(18),
        _ => None,
    };
    if let Some(exp) = decimal {
        return Some((exp, 0));
    }

    if let Some(&(_, shift)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Some((0, shift));
    }

    // Scientific notation: 1e3, 5E-1
    let exponent = suffix.strip_prefix('e').or_else(|| suffix.strip_prefix('E'))?;
    let exponent: i32 = exponent.parse().ok()?;
    Some((exponent, 0))
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Cpu => {
                if self.base % 1000 == 0 {
                    write!(f, "{}", self.base / 1000)
                } else {
                    write!(f, "{}m", self.base)
                }
            }
            ResourceKind::Memory => {
                if self.base != 0 {
                    for (suffix, shift) in BINARY_SUFFIXES {
                        let unit = 1u64 << shift;
                        if self.base % unit == 0 {
                            return write!(f, "{}{}", self.base / unit, suffix);
                        }
                    }
                }
                write!(f, "{}", self.base)
            }
        }
    }
}

impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
