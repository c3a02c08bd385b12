//! Size parsing for tunables.
//!
//! Accepts decimal numbers with an optional binary suffix: `32k`, `10M`,
//! `2g`. Unlike `strtoul`, a negative number is rejected instead of wrapping.

use crate::error::codes;
use thiserror::Error;

/// Why a size string was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseSizeError {
    /// Not a number, or trailing garbage after it.
    #[error("invalid number")]
    Invalid,
    /// Negative, or too large for the target type.
    #[error("number out of range")]
    Range,
}

impl ParseSizeError {
    /// The `errno` this failure corresponds to.
    #[must_use]
    pub fn errno(self) -> i32 {
        match self {
            Self::Invalid => codes::EINVAL,
            Self::Range => codes::ERANGE,
        }
    }
}

const KILO: u64 = 1024;
const MEGA: u64 = KILO * 1024;
const GIGA: u64 = MEGA * 1024;
const TERA: u64 = GIGA * 1024;

/// Splits `input` into its digit run and the remaining suffix.
fn split_digits(input: &str) -> Result<(u64, &str), ParseSizeError> {
    let trimmed = input.trim_start_matches([' ', '\t']);
    if trimmed.starts_with('-') {
        return Err(ParseSizeError::Range);
    }
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let end = unsigned
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(unsigned.len());
    if end == 0 {
        return Err(ParseSizeError::Invalid);
    }
    let value = unsigned[..end]
        .parse::<u64>()
        .map_err(|_| ParseSizeError::Range)?;
    Ok((value, &unsigned[end..]))
}

/// Maps a suffix to its multiplier. A unit may be followed by `b`/`B`.
fn multiplier(suffix: &str, allow_tera: bool) -> Result<u64, ParseSizeError> {
    let mut chars = suffix.chars();
    let factor = match chars.next() {
        None => return Ok(1),
        Some('k' | 'K') => KILO,
        Some('m' | 'M') => MEGA,
        Some('g' | 'G') => GIGA,
        Some('t' | 'T') if allow_tera => TERA,
        Some(_) => return Err(ParseSizeError::Invalid),
    };
    let rest = chars.as_str();
    if rest.is_empty() || rest == "b" || rest == "B" {
        Ok(factor)
    } else {
        Err(ParseSizeError::Invalid)
    }
}

/// Parses a 32-bit size.
///
/// # Errors
///
/// [`ParseSizeError::Range`] for negative or overflowing values,
/// [`ParseSizeError::Invalid`] for anything that is not a number with an
/// optional `k`, `m` or `g` suffix.
pub fn db_strtoul(input: &str) -> Result<u32, ParseSizeError> {
    let (value, suffix) = split_digits(input)?;
    let scaled = value
        .checked_mul(multiplier(suffix, false)?)
        .ok_or(ParseSizeError::Range)?;
    u32::try_from(scaled).map_err(|_| ParseSizeError::Range)
}

/// Parses a 64-bit size; also accepts a `t` suffix.
///
/// # Errors
///
/// Same as [`db_strtoul`].
pub fn db_strtoull(input: &str) -> Result<u64, ParseSizeError> {
    let (value, suffix) = split_digits(input)?;
    value
        .checked_mul(multiplier(suffix, true)?)
        .ok_or(ParseSizeError::Range)
}

/// Parses a signed number with an optional `k`, `m` or `g` suffix.
///
/// Anything after the suffix character is ignored.
///
/// # Errors
///
/// [`ParseSizeError::Invalid`] when no number leads the string,
/// [`ParseSizeError::Range`] on overflow.
pub fn db_atol(input: &str) -> Result<i64, ParseSizeError> {
    let trimmed = input.trim_start();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return Err(ParseSizeError::Invalid);
    }
    let magnitude = digits[..end]
        .parse::<i64>()
        .map_err(|_| ParseSizeError::Range)?;
    let factor = match digits[end..].chars().next() {
        Some('g' | 'G') => GIGA as i64,
        Some('m' | 'M') => MEGA as i64,
        Some('k' | 'K') => KILO as i64,
        _ => 1,
    };
    let value = magnitude.checked_mul(factor).ok_or(ParseSizeError::Range)?;
    Ok(if negative { -value } else { value })
}
