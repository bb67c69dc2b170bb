//! Money Module
//!
//! Exact fixed-point amounts for every balance computation in the crate.
//!
//! ## Design Principles
//! 1. Arbitrary precision: values are `BigInt` scaled integers, never floats
//! 2. Binary operations normalize both operands to [`INTERNAL_SCALE`] first
//! 3. Down-scaling (storage/display) always truncates toward zero, so the
//!    system can never credit more than it actually received
//! 4. Percentages are integer basis points
//!
//! ## Usage
//! ```rust
//! use settlement_core::money::MoneyAmount;
//!
//! // 10 USDT observed on chain as 10_000_000 units with 6 decimals
//! let received = MoneyAmount::from_units(10_000_000u64, 6);
//! let fee = received.mul_bps(50); // 0.5%
//! assert_eq!(fee.format(2), "0.05");
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use num_bigint::{BigInt, Sign};
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use rust_decimal::Decimal;
use thiserror::Error;

/// All arithmetic happens at this many decimal places.
pub const INTERNAL_SCALE: u32 = 18;

/// Decimal places written to NUMERIC columns.
pub const STORAGE_SCALE: u32 = 8;

/// Basis points in 100%.
pub const BPS_DENOMINATOR: u32 = 10_000;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Amount too large for target representation")]
    Overflow,

    #[error("Amount must not be negative")]
    Negative,
}

impl MoneyError {
    pub fn code(&self) -> &'static str {
        match self {
            MoneyError::PrecisionOverflow { .. } => "PRECISION_OVERFLOW",
            MoneyError::InvalidFormat(_) => "INVALID_FORMAT",
            MoneyError::Overflow => "OVERFLOW",
            MoneyError::Negative => "NEGATIVE_AMOUNT",
        }
    }
}

// ============================================================================
// MoneyAmount
// ============================================================================

/// Scale-aware fixed-point amount.
///
/// Equality and ordering compare the normalized value, so `1.5 @ scale 1`
/// equals `1.500000 @ scale 6`.
#[derive(Clone)]
pub struct MoneyAmount {
    scaled_value: BigInt,
    scale: u32,
}

/// Result of comparing a received amount against an expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToleranceCheck {
    pub matches: bool,
    /// `actual - expected` at internal scale
    pub signed_difference: MoneyAmount,
}

fn pow10(exp: u32) -> BigInt {
    BigInt::from(10u8).pow(exp)
}

/// Rescale a scaled integer. Down-scaling truncates toward zero.
fn rescale(value: &BigInt, from: u32, to: u32) -> BigInt {
    match from.cmp(&to) {
        Ordering::Equal => value.clone(),
        Ordering::Less => value * pow10(to - from),
        Ordering::Greater => value / pow10(from - to),
    }
}

impl MoneyAmount {
    pub fn zero() -> Self {
        Self {
            scaled_value: BigInt::zero(),
            scale: INTERNAL_SCALE,
        }
    }

    /// Build from native-chain integer units (e.g. 6-decimal token units).
    pub fn from_units(units: impl Into<BigInt>, scale: u32) -> Self {
        Self {
            scaled_value: units.into(),
            scale,
        }
    }

    /// Whole units, e.g. `from_whole(10)` is 10.00
    pub fn from_whole(whole: i64) -> Self {
        Self::from_units(BigInt::from(whole) * pow10(INTERNAL_SCALE), INTERNAL_SCALE)
    }

    pub fn scaled_value(&self) -> &BigInt {
        &self.scaled_value
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    /// Value at [`INTERNAL_SCALE`]. Native scales above it are truncated.
    fn normalized(&self) -> BigInt {
        rescale(&self.scaled_value, self.scale, INTERNAL_SCALE)
    }

    fn internal(value: BigInt) -> Self {
        Self {
            scaled_value: value,
            scale: INTERNAL_SCALE,
        }
    }

    /// Integer units at `scale`, truncating toward zero.
    pub fn to_units(&self, scale: u32) -> BigInt {
        rescale(&self.scaled_value, self.scale, scale)
    }

    /// Non-negative integer units for on-chain transfers.
    pub fn to_unsigned_units(&self, scale: u32) -> Result<num_bigint::BigUint, MoneyError> {
        self.to_units(scale)
            .to_biguint()
            .ok_or(MoneyError::Negative)
    }

    /// Copy of this amount truncated to `scale` decimal places.
    pub fn truncate_to(&self, scale: u32) -> Self {
        Self::from_units(self.to_units(scale), scale)
    }

    // ------------------------------------------------------------------------
    // Parse / format
    // ------------------------------------------------------------------------

    /// Parse a plain decimal string (`"12.5"`, `"-0.01"`, `"100"`).
    ///
    /// Rejects exponents, separators and more than [`INTERNAL_SCALE`] fractional
    /// digits instead of silently truncating client input.
    pub fn parse(input: &str) -> Result<Self, MoneyError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(MoneyError::InvalidFormat("empty string".into()));
        }

        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => {
                if w.is_empty() || f.is_empty() {
                    return Err(MoneyError::InvalidFormat(format!(
                        "incomplete decimal: {}",
                        input
                    )));
                }
                (w, f)
            }
            None => (digits, ""),
        };

        if !whole.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(MoneyError::InvalidFormat(format!(
                "invalid character in {}",
                input
            )));
        }

        if frac.len() > INTERNAL_SCALE as usize {
            return Err(MoneyError::PrecisionOverflow {
                provided: frac.len() as u32,
                max: INTERNAL_SCALE,
            });
        }

        let combined = format!("{}{}", whole, frac);
        let mut value = BigInt::from_str(&combined)
            .map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
        if negative {
            value = -value;
        }

        Ok(Self::from_units(value, frac.len() as u32))
    }

    /// Format with exactly `display_decimals` places, truncating extra digits.
    pub fn format(&self, display_decimals: u32) -> String {
        let display_decimals = display_decimals.min(INTERNAL_SCALE);
        let units = self.to_units(display_decimals);
        let negative = units.is_negative();
        let (whole, frac) = units.abs().div_rem(&pow10(display_decimals));
        let sign = if negative { "-" } else { "" };

        if display_decimals == 0 {
            format!("{}{}", sign, whole)
        } else {
            format!(
                "{}{}.{:0>width$}",
                sign,
                whole,
                frac.to_string(),
                width = display_decimals as usize
            )
        }
    }

    // ------------------------------------------------------------------------
    // Arithmetic (always at internal scale)
    // ------------------------------------------------------------------------

    pub fn add(&self, other: &MoneyAmount) -> MoneyAmount {
        Self::internal(self.normalized() + other.normalized())
    }

    pub fn sub(&self, other: &MoneyAmount) -> MoneyAmount {
        Self::internal(self.normalized() - other.normalized())
    }

    pub fn mul_int(&self, factor: i64) -> MoneyAmount {
        Self::internal(self.normalized() * BigInt::from(factor))
    }

    /// `self * bps / 10_000`, truncated toward zero.
    pub fn mul_bps(&self, bps: u32) -> MoneyAmount {
        Self::internal(self.normalized() * BigInt::from(bps) / BigInt::from(BPS_DENOMINATOR))
    }

    pub fn abs(&self) -> MoneyAmount {
        Self::internal(self.normalized().abs())
    }

    // sign tests see the same truncated value that arithmetic and equality use
    pub fn is_zero(&self) -> bool {
        self.normalized().is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.normalized().sign() == Sign::Plus
    }

    pub fn is_negative(&self) -> bool {
        self.normalized().sign() == Sign::Minus
    }

    pub fn sum<'a>(amounts: impl IntoIterator<Item = &'a MoneyAmount>) -> MoneyAmount {
        amounts
            .into_iter()
            .fold(MoneyAmount::zero(), |acc, a| acc.add(a))
    }

    /// Does `actual` fall within `tolerance_bps` of `expected`?
    ///
    /// `|actual - expected| * 10_000 <= expected * tolerance_bps`
    pub fn tolerance_check(
        expected: &MoneyAmount,
        actual: &MoneyAmount,
        tolerance_bps: u32,
    ) -> ToleranceCheck {
        let difference = actual.sub(expected);
        let lhs = difference.normalized().abs() * BigInt::from(BPS_DENOMINATOR);
        let rhs = expected.normalized().abs() * BigInt::from(tolerance_bps);
        ToleranceCheck {
            matches: lhs <= rhs,
            signed_difference: difference,
        }
    }

    // ------------------------------------------------------------------------
    // Storage boundary (NUMERIC via rust_decimal)
    // ------------------------------------------------------------------------

    /// Decimal at [`STORAGE_SCALE`], truncating.
    pub fn to_decimal(&self) -> Result<Decimal, MoneyError> {
        let units = self
            .to_units(STORAGE_SCALE)
            .to_i128()
            .ok_or(MoneyError::Overflow)?;
        Decimal::try_from_i128_with_scale(units, STORAGE_SCALE).map_err(|_| MoneyError::Overflow)
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Self::from_units(BigInt::from(value.mantissa()), value.scale())
    }
}

impl PartialEq for MoneyAmount {
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for MoneyAmount {}

impl PartialOrd for MoneyAmount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MoneyAmount {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized().cmp(&other.normalized())
    }
}

impl fmt::Debug for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MoneyAmount({})", self.format(self.scale.min(INTERNAL_SCALE)))
    }
}

impl fmt::Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(self.scale.min(INTERNAL_SCALE)))
    }
}

impl FromStr for MoneyAmount {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoneyAmount::parse(s)
    }
}

impl Default for MoneyAmount {
    fn default() -> Self {
        MoneyAmount::zero()
    }
}

impl serde::Serialize for MoneyAmount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for MoneyAmount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MoneyAmount::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> MoneyAmount {
        MoneyAmount::parse(s).unwrap()
    }

    #[test]
    fn test_add_then_subtract_recovers_exactly() {
        let cases = [
            ("0.000000000000000001", "123456789.987654321"),
            ("10", "0.1"),
            ("-5.5", "5.5"),
            ("99999999999999999999.5", "0.000000000000000007"),
        ];
        for (a, b) in cases {
            let a = m(a);
            let b = m(b);
            assert_eq!(a.add(&b).sub(&b), a, "round trip failed for {} + {}", a, b);
        }
    }

    #[test]
    fn test_mul_bps_is_exact() {
        assert_eq!(m("100.00").mul_bps(500), m("5.00"));
        assert_eq!(m("100.00").mul_bps(500).format(2), "5.00");
        // 1 bp of 0.0001 truncates below 18 places, never rounds up
        assert_eq!(m("0.000000000000000001").mul_bps(9_999), MoneyAmount::zero());
    }

    #[test]
    fn test_tolerance_check() {
        let expected = m("10.00");
        let near = MoneyAmount::tolerance_check(&expected, &m("9.99"), 200);
        assert!(near.matches);
        assert_eq!(near.signed_difference, m("-0.01"));

        let far = MoneyAmount::tolerance_check(&expected, &m("9.00"), 200);
        assert!(!far.matches);
        assert_eq!(far.signed_difference, m("-1"));

        // Exactly on the boundary matches
        assert!(MoneyAmount::tolerance_check(&expected, &m("10.20"), 200).matches);
        assert!(!MoneyAmount::tolerance_check(&expected, &m("10.21"), 200).matches);
    }

    #[test]
    fn test_mixed_scale_comparison() {
        let native = MoneyAmount::from_units(1_500_000u64, 6);
        assert_eq!(native, m("1.5"));
        assert!(native < m("1.500001"));
        assert_eq!(native.add(&m("0.5")), MoneyAmount::from_whole(2));
    }

    #[test]
    fn test_downscale_truncates() {
        let v = m("1.999999999");
        assert_eq!(v.to_units(2), BigInt::from(199));
        assert_eq!(v.format(2), "1.99");
        assert_eq!(m("-1.999").format(2), "-1.99");
        assert_eq!(v.truncate_to(STORAGE_SCALE), m("1.99999999"));
    }

    #[test]
    fn test_native_scale_above_internal_truncates() {
        // 20-decimal native asset: 1 unit at scale 20 is below internal precision
        let tiny = MoneyAmount::from_units(1u8, 20);
        assert!(tiny.add(&MoneyAmount::zero()).is_zero());
        assert!(tiny.is_zero());
        assert!(!tiny.is_positive());
        assert_eq!(tiny, MoneyAmount::zero());
        assert!(MoneyAmount::from_units(-1i8, 20).is_zero());
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        for bad in ["", "1,000", "1.2.3", ".5", "5.", "1e5", "+1", "0x10", "1. 5"] {
            assert!(MoneyAmount::parse(bad).is_err(), "should reject {:?}", bad);
        }
        assert!(matches!(
            MoneyAmount::parse("0.0000000000000000001"),
            Err(MoneyError::PrecisionOverflow {
                provided: 19,
                max: 18
            })
        ));
    }

    #[test]
    fn test_sign_helpers_and_sum() {
        let values = vec![m("1.5"), m("-0.5"), m("2")];
        let total = MoneyAmount::sum(&values);
        assert_eq!(total, m("3"));
        assert!(m("-0.5").is_negative());
        assert_eq!(m("-0.5").abs(), m("0.5"));
        assert!(MoneyAmount::zero().is_zero());
        assert!(!MoneyAmount::zero().is_positive());
        assert_eq!(m("1").min(m("2")), m("1"));
        assert_eq!(m("1").max(m("2")), m("2"));
        assert_eq!(m("2.5").mul_int(4), m("10"));
    }

    #[test]
    fn test_decimal_boundary() {
        let d = m("12.3456789999").to_decimal().unwrap();
        assert_eq!(d.to_string(), "12.34567899");
        assert_eq!(MoneyAmount::from_decimal(d), m("12.34567899"));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&m("1.25")).unwrap();
        assert_eq!(json, "\"1.25\"");
        let back: MoneyAmount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m("1.25"));
    }
}
