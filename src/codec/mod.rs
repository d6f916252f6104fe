//! # Field Codec
//!
//! Narrow helpers for pulling typed fields out of flat JSON objects. Token
//! headers and claims, encryption envelopes and proposal requests all go
//! through here so that required-versus-optional semantics are uniform.
//!
//! Numbers are kept as their literal text (`serde_json` is built with
//! `arbitrary_precision`), so money never passes through binary floating
//! point.

use crate::error::{ProposalError, Result};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A parsed flat JSON object
pub type Object = Map<String, Value>;

/// Parse `input` as a JSON object
///
/// Any other top-level JSON value is a validation error.
pub fn parse_object(input: &str) -> Result<Object> {
    match serde_json::from_str::<Value>(input)? {
        Value::Object(map) => Ok(map),
        _ => Err(ProposalError::validation_error("expected a JSON object")),
    }
}

/// First of `keys` present in `object`, or the first key when none is
///
/// Lets a field carry accepted alias spellings while a missing field is
/// reported under its canonical name.
#[must_use]
pub fn resolve_key<'k>(object: &Object, keys: &[&'k str]) -> &'k str {
    keys.iter()
        .copied()
        .find(|key| object.contains_key(*key))
        .or_else(|| keys.first().copied())
        .unwrap_or_default()
}

/// Read a string field; absent or non-string values yield `None`
#[must_use]
pub fn read_string<'a>(object: &'a Object, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

/// Read a required string field
pub fn read_required_string<'a>(object: &'a Object, key: &str) -> Result<&'a str> {
    read_string(object, key)
        .ok_or_else(|| ProposalError::validation_error(format!("missing required field: {key}")))
}

/// Read an optional integer field
///
/// Integral decimals such as `1700000000.0` are accepted; fractional or
/// out-of-range numbers are an error rather than silently truncated.
pub fn read_optional_i64(object: &Object, key: &str) -> Result<Option<i64>> {
    let Some(value) = object.get(key) else {
        return Ok(None);
    };
    let Value::Number(number) = value else {
        return Ok(None);
    };
    if let Some(int) = number.as_i64() {
        return Ok(Some(int));
    }
    let decimal = parse_decimal(&number.to_string())
        .filter(|d| d.fract().is_zero())
        .ok_or_else(|| ProposalError::validation_error(format!("invalid integer for {key}")))?;
    i64::try_from(decimal)
        .map(Some)
        .map_err(|_| ProposalError::validation_error(format!("invalid integer for {key}")))
}

/// Read a required decimal field given either as a JSON number or a string
pub fn read_required_decimal(object: &Object, key: &str) -> Result<Decimal> {
    let raw = match object.get(key) {
        Some(Value::Number(number)) => number.to_string(),
        Some(Value::String(text)) => text.trim().to_string(),
        _ => {
            return Err(ProposalError::validation_error(format!(
                "missing required field: {key}"
            )))
        }
    };
    parse_decimal(&raw)
        .ok_or_else(|| ProposalError::validation_error(format!("invalid value for {key}")))
}

/// Read a required UUID field
pub fn read_required_uuid(object: &Object, key: &str) -> Result<Uuid> {
    let raw = read_required_string(object, key)?;
    Uuid::parse_str(raw.trim())
        .map_err(|_| ProposalError::validation_error(format!("invalid UUID for {key}")))
}

/// Largest exponent magnitude expanded from scientific notation
const MAX_EXPONENT: i32 = 64;

/// Parse decimal text exactly, accepting scientific notation
///
/// Values that need more than 28 significant digits are rejected, never
/// rounded.
#[must_use]
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    if raw.is_empty() {
        return None;
    }
    if raw.contains(|c| c == 'e' || c == 'E') {
        Decimal::from_str_exact(&expand_scientific(raw)?).ok()
    } else {
        Decimal::from_str_exact(raw).ok()
    }
}

/// Rewrite `1.5e3` style text as plain positional notation
fn expand_scientific(raw: &str) -> Option<String> {
    let (mantissa, exponent) = raw.split_once(|c| c == 'e' || c == 'E')?;
    let exponent: i32 = exponent.strip_prefix('+').unwrap_or(exponent).parse().ok()?;
    if exponent.abs() > MAX_EXPONENT {
        return None;
    }

    let (sign, unsigned) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa.strip_prefix('+').unwrap_or(mantissa)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let digits = format!("{int_part}{frac_part}");
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let len = i32::try_from(digits.len()).ok()?;
    let point = i32::try_from(int_part.len()).ok()? + exponent;
    let plain = if point <= 0 {
        format!("0.{}{digits}", "0".repeat(usize::try_from(-point).ok()?))
    } else if point >= len {
        format!("{digits}{}", "0".repeat(usize::try_from(point - len).ok()?))
    } else {
        let (whole, fraction) = digits.split_at(usize::try_from(point).ok()?);
        format!("{whole}.{fraction}")
    };
    Some(format!("{sign}{plain}"))
}
