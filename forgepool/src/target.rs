//! Difficulty and target arithmetic.
//!
//! Share targets are derived exactly from decimal difficulty strings using
//! integer arithmetic only; floats never reach a target comparison. The f64
//! mirror carried by [`Difficulty`] exists for display and for the vardiff
//! banding heuristics.

use ruint::aliases::{U256, U512};
use ruint::uint;
use thiserror::Error;

use crate::encoding;

/// The difficulty-1 target: a share of difficulty `d` must hash at or below
/// `DIFF1_TARGET / d`.
pub const DIFF1_TARGET: U256 =
    uint!(0x00000000FFFF0000000000000000000000000000000000000000000000000000_U256);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    #[error("difficulty must be a positive decimal: {0:?}")]
    BadDifficulty(String),

    #[error("invalid compact bits: {0:?}")]
    BadBits(String),
}

/// Expand nBits compact form into a full 256-bit target.
pub fn compact_bits_to_target(bits_hex: &str) -> Result<U256, TargetError> {
    let bits = encoding::normalize_hex(bits_hex)
        .map_err(|_| TargetError::BadBits(bits_hex.to_string()))?;
    let bits = format!("{bits:0>8}");
    if bits.len() != 8 {
        return Err(TargetError::BadBits(bits_hex.to_string()));
    }
    let exponent = u8::from_str_radix(&bits[..2], 16)
        .map_err(|_| TargetError::BadBits(bits_hex.to_string()))?;
    let mantissa = U256::from_str_radix(&bits[2..], 16)
        .map_err(|_| TargetError::BadBits(bits_hex.to_string()))?;

    if exponent <= 3 {
        Ok(mantissa >> (8 * (3 - exponent) as usize))
    } else {
        mantissa
            .checked_shl(8 * (exponent - 3) as usize)
            .ok_or_else(|| TargetError::BadBits(bits_hex.to_string()))
    }
}

/// Compute the exact target for a decimal difficulty string:
/// `DIFF1_TARGET * denominator / numerator`, clamped to `U256::MAX`.
pub fn target_from_difficulty(difficulty: &str) -> Result<U256, TargetError> {
    let (numerator, denominator) = parse_decimal_fraction(difficulty)?;
    let wide = widen(DIFF1_TARGET) * denominator / numerator;
    Ok(narrow_clamped(wide))
}

/// Parse a positive decimal string into an exact fraction
/// `numerator / denominator` with `denominator = 10^frac_digits`.
fn parse_decimal_fraction(input: &str) -> Result<(U512, U512), TargetError> {
    let s = input.trim();
    let bad = || TargetError::BadDifficulty(input.to_string());

    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    if s.contains('.') && (frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit())) {
        return Err(bad());
    }

    let mut digits = String::with_capacity(whole.len() + frac.len());
    digits.push_str(whole);
    digits.push_str(frac);
    let numerator = U512::from_str_radix(&digits, 10).map_err(|_| bad())?;
    if numerator == U512::ZERO {
        return Err(bad());
    }
    let denominator = U512::from(10u64)
        .checked_pow(U512::from(frac.len() as u64))
        .ok_or_else(bad)?;
    Ok((numerator, denominator))
}

/// Interpret a 32-byte hash as a little-endian 256-bit integer, the
/// convention share validation compares against targets.
pub fn hash_to_le_int(hash: &[u8; 32]) -> U256 {
    U256::from_le_bytes(*hash)
}

/// Approximate difficulty of a share hash, `DIFF1_TARGET / hash`, for
/// display and vardiff decisions.
pub fn share_difficulty(hash_int: U256) -> f64 {
    if hash_int == U256::ZERO {
        return 0.0;
    }
    u256_to_f64(DIFF1_TARGET) / u256_to_f64(hash_int)
}

fn u256_to_f64(value: U256) -> f64 {
    value
        .to_be_bytes::<32>()
        .iter()
        .fold(0.0, |acc, &b| acc * 256.0 + f64::from(b))
}

fn widen(value: U256) -> U512 {
    let mut bytes = [0u8; 64];
    bytes[32..].copy_from_slice(&value.to_be_bytes::<32>());
    U512::from_be_bytes(bytes)
}

fn narrow_clamped(value: U512) -> U256 {
    let bytes = value.to_be_bytes::<64>();
    if bytes[..32].iter().any(|&b| b != 0) {
        return U256::MAX;
    }
    let mut low = [0u8; 32];
    low.copy_from_slice(&bytes[32..]);
    U256::from_be_bytes(low)
}

/// A validated miner difficulty: the decimal text the miner supplied or
/// vardiff produced, its numeric mirror, and the exact share target.
#[derive(Debug, Clone, PartialEq)]
pub struct Difficulty {
    text: String,
    value: f64,
    target: U256,
}

impl Difficulty {
    pub fn parse(input: &str) -> Result<Self, TargetError> {
        let text = input.trim().to_string();
        let target = target_from_difficulty(&text)?;
        let value: f64 = text
            .parse()
            .map_err(|_| TargetError::BadDifficulty(text.clone()))?;
        if !value.is_finite() || value <= 0.0 {
            return Err(TargetError::BadDifficulty(text));
        }
        Ok(Self { text, value, target })
    }

    /// Integer difficulty, as produced by the vardiff retarget bands.
    /// Build from a miner-supplied float (`mining.suggest_difficulty`, the
    /// password `d=` hint). Whole numbers keep an integer rendering so the
    /// `mining.set_difficulty` payload stays an integer on the wire.
    pub fn from_f64(value: f64) -> Result<Self, TargetError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(TargetError::BadDifficulty(value.to_string()));
        }
        let text = if value.fract() == 0.0 && value < 1e15 {
            format!("{}", value as u64)
        } else {
            let mut s = format!("{value:.8}");
            while s.ends_with('0') {
                s.pop();
            }
            if s.ends_with('.') {
                s.pop();
            }
            s
        };
        Self::parse(&text)
    }

    pub fn from_int(value: u64) -> Self {
        let value = value.max(1);
        Self {
            text: value.to_string(),
            value: value as f64,
            target: DIFF1_TARGET / U256::from(value),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn target(&self) -> U256 {
        self.target
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn difficulty_one_is_diff1_target() {
        assert_eq!(target_from_difficulty("1").unwrap(), DIFF1_TARGET);
        assert_eq!(Difficulty::from_int(1).target(), DIFF1_TARGET);
    }

    #[test]
    fn targets_shrink_as_difficulty_grows() {
        let d1 = target_from_difficulty("1").unwrap();
        let d2 = target_from_difficulty("2").unwrap();
        let d16384 = target_from_difficulty("16384").unwrap();
        assert!(d1 > d2);
        assert!(d2 > d16384);
        assert_eq!(d2, DIFF1_TARGET / U256::from(2u64));
        assert_eq!(d16384, DIFF1_TARGET / U256::from(16384u64));
    }

    #[test]
    fn fractional_difficulty_raises_target() {
        let half = target_from_difficulty("0.5").unwrap();
        assert_eq!(half, DIFF1_TARGET * U256::from(2u64));
        let tenth = target_from_difficulty("0.1").unwrap();
        assert_eq!(tenth, DIFF1_TARGET * U256::from(10u64));
    }

    #[test]
    fn tiny_difficulty_clamps_to_max() {
        // denominator / numerator large enough to overflow 256 bits
        let t = target_from_difficulty("0.0000000000000000000000000000000001").unwrap();
        assert_eq!(t, U256::MAX);
    }

    #[test_case(""; "empty")]
    #[test_case("0"; "zero")]
    #[test_case("-1"; "negative")]
    #[test_case("1."; "trailing dot")]
    #[test_case(".5"; "leading dot")]
    #[test_case("1e3"; "exponent")]
    #[test_case("abc"; "letters")]
    fn rejects_bad_difficulty(input: &str) {
        assert!(target_from_difficulty(input).is_err());
        assert!(Difficulty::parse(input).is_err());
    }

    #[test]
    fn compact_bits_expand() {
        // 1d00ffff is the difficulty-1 network target.
        assert_eq!(compact_bits_to_target("1d00ffff").unwrap(), DIFF1_TARGET);
        // Low exponent shifts the mantissa down.
        assert_eq!(
            compact_bits_to_target("03001234").unwrap(),
            U256::from(0x1234u64)
        );
        assert_eq!(
            compact_bits_to_target("02001234").unwrap(),
            U256::from(0x12u64)
        );
    }

    #[test]
    fn hash_interpreted_little_endian() {
        let mut hash = [0u8; 32];
        hash[0] = 0x01;
        assert_eq!(hash_to_le_int(&hash), U256::from(1u64));
        let mut hash = [0u8; 32];
        hash[31] = 0x01;
        assert_eq!(hash_to_le_int(&hash), U256::from(1u64) << 248);
    }

    #[test]
    fn share_difficulty_tracks_hash_magnitude() {
        let at_diff1 = share_difficulty(DIFF1_TARGET);
        assert!((at_diff1 - 1.0).abs() < 1e-9);
        let harder = share_difficulty(DIFF1_TARGET / U256::from(1024u64));
        assert!((harder - 1024.0).abs() < 1e-6);
    }
}
