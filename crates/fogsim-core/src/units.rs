//! Byte quantities and the size-string grammar used in workload definitions.

use std::fmt;
use std::str::FromStr;

/// Size-string multipliers. Uppercase suffixes are decimal, the `*i` variants
/// are binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum SizeUnit {
    K,
    M,
    G,
    T,
    P,
    E,
    Ki,
    Mi,
    Gi,
    Ti,
    Pi,
    Ei,
}

impl SizeUnit {
    /// The number of bytes this unit stands for.
    pub const fn factor(self) -> u64 {
        match self {
            SizeUnit::K => 10_u64.pow(3),
            SizeUnit::M => 10_u64.pow(6),
            SizeUnit::G => 10_u64.pow(9),
            SizeUnit::T => 10_u64.pow(12),
            SizeUnit::P => 10_u64.pow(15),
            SizeUnit::E => 10_u64.pow(18),
            SizeUnit::Ki => 1 << 10,
            SizeUnit::Mi => 1 << 20,
            SizeUnit::Gi => 1 << 30,
            SizeUnit::Ti => 1 << 40,
            SizeUnit::Pi => 1 << 50,
            SizeUnit::Ei => 1 << 60,
        }
    }

    /// The suffix spelling of this unit.
    pub const fn suffix(self) -> &'static str {
        match self {
            SizeUnit::K => "K",
            SizeUnit::M => "M",
            SizeUnit::G => "G",
            SizeUnit::T => "T",
            SizeUnit::P => "P",
            SizeUnit::E => "E",
            SizeUnit::Ki => "Ki",
            SizeUnit::Mi => "Mi",
            SizeUnit::Gi => "Gi",
            SizeUnit::Ti => "Ti",
            SizeUnit::Pi => "Pi",
            SizeUnit::Ei => "Ei",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "K" => SizeUnit::K,
            "M" => SizeUnit::M,
            "G" => SizeUnit::G,
            "T" => SizeUnit::T,
            "P" => SizeUnit::P,
            "E" => SizeUnit::E,
            "Ki" => SizeUnit::Ki,
            "Mi" => SizeUnit::Mi,
            "Gi" => SizeUnit::Gi,
            "Ti" => SizeUnit::Ti,
            "Pi" => SizeUnit::Pi,
            "Ei" => SizeUnit::Ei,
            _ => return None,
        })
    }
}

/// A malformed size string.
#[derive(Debug, thiserror::Error)]
#[error("malformed size string `{0}`")]
pub struct SizeError(String);

/// Parses a size string of the form `<digits><suffix>` into bytes.
///
/// Unknown suffixes are tolerated and count as factor 1.
pub fn parse_size_string(size: &str) -> Result<u64, SizeError> {
    let split = size
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(size.len());
    let (digits, suffix) = size.split_at(split);
    if digits.is_empty() || !suffix.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(SizeError(size.to_string()));
    }
    let number: u64 = digits.parse().map_err(|_| SizeError(size.to_string()))?;
    let factor = SizeUnit::from_suffix(suffix).map_or(1, SizeUnit::factor);
    Ok(number * factor)
}

/// Formats a byte count in the given unit, e.g. `to_size_string(1_500_000,
/// SizeUnit::M, 1)` is `"1.5M"`.
pub fn to_size_string(bytes: u64, unit: SizeUnit, precision: usize) -> String {
    let value = bytes as f64 / unit.factor() as f64;
    format!("{value:.precision$}{}", unit.suffix())
}

/// A number of bytes.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialOrd,
    Ord,
    PartialEq,
    Eq,
    Hash,
    derive_more::Add,
    derive_more::Sub,
    derive_more::AddAssign,
    derive_more::SubAssign,
    derive_more::Sum,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Bytes(u64);

impl Bytes {
    #[allow(missing_docs)]
    pub const ZERO: Bytes = Self::new(0);

    #[allow(missing_docs)]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[allow(missing_docs)]
    pub const fn into_u64(self) -> u64 {
        self.0
    }

    #[allow(missing_docs)]
    pub const fn into_f64(self) -> f64 {
        self.0 as f64
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl FromStr for Bytes {
    type Err = SizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_size_string(s).map(Bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decimal_suffixes() {
        assert_eq!(parse_size_string("1K").unwrap(), 1_000);
        assert_eq!(parse_size_string("32M").unwrap(), 32_000_000);
        assert_eq!(parse_size_string("2G").unwrap(), 2_000_000_000);
    }

    #[test]
    fn parse_binary_suffixes() {
        assert_eq!(parse_size_string("1Ki").unwrap(), 1_024);
        assert_eq!(parse_size_string("4Mi").unwrap(), 4 * 1_048_576);
    }

    #[test]
    fn parse_bare_number() {
        assert_eq!(parse_size_string("1234").unwrap(), 1_234);
    }

    #[test]
    fn unknown_suffix_is_factor_one() {
        // lenient mode: unrecognized units do not scale
        assert_eq!(parse_size_string("17q").unwrap(), 17);
    }

    #[test]
    fn malformed_strings_fail() {
        assert!(parse_size_string("").is_err());
        assert!(parse_size_string("M").is_err());
        assert!(parse_size_string("1M2").is_err());
    }

    #[test]
    fn format_then_parse_round_trips() {
        for unit in [SizeUnit::K, SizeUnit::M, SizeUnit::G] {
            let bytes = 42 * unit.factor();
            let rendered = to_size_string(bytes, unit, 0);
            assert_eq!(parse_size_string(&rendered).unwrap(), bytes);
        }
    }

    #[test]
    fn bytes_from_str() {
        let bytes: Bytes = "100M".parse().unwrap();
        assert_eq!(bytes, Bytes::new(100_000_000));
    }
}
