//! Field codecs for the ASCII command protocol.
//!
//! Every response is `TAG=VALUE`. Integers are plain decimal; error codes are
//! 1-2 hex digits or a longer decimal number.

use crate::error::{Result, WireError};

// ---------------------------------------------------------------------------
// Read helpers
// ---------------------------------------------------------------------------

/// Return the value part of `TAG=VALUE`, or `None` if the line has another tag.
pub fn value_of<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let rest = line.trim().strip_prefix(tag)?;
    rest.strip_prefix('=').map(str::trim)
}

/// True if `line` is an assignment for `tag` (`TAG=...`).
pub fn has_tag(line: &str, tag: &str) -> bool {
    value_of(line, tag).is_some()
}

/// Read the signed decimal integer assigned to `tag`.
pub fn read_int(line: &str, tag: &'static str) -> Result<i64> {
    let value = value_of(line, tag).ok_or_else(|| WireError::unexpected_tag(tag, line))?;
    value.parse::<i64>().map_err(|_| WireError::NotInteger {
        field: tag,
        value: value.to_string(),
    })
}

/// Read a non-negative integer that must fit in `u32`.
pub fn read_u32(line: &str, tag: &'static str) -> Result<u32> {
    let value = read_int(line, tag)?;
    u32::try_from(value).map_err(|_| WireError::OutOfRange { field: tag, value })
}

/// Parse an error-code token.
///
/// One or two hex digits are read as hex (`0B` = 11). Longer tokens must be
/// decimal.
pub fn read_code(token: &str) -> Result<u32> {
    let token = token.trim();
    let invalid = || WireError::InvalidCode {
        token: token.to_string(),
    };
    if token.is_empty() {
        return Err(invalid());
    }
    if token.len() <= 2 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        return u32::from_str_radix(token, 16).map_err(|_| invalid());
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return token.parse::<u32>().map_err(|_| invalid());
    }
    Err(invalid())
}

// ---------------------------------------------------------------------------
// Write helpers
// ---------------------------------------------------------------------------

/// Format `TAG=VALUE`.
pub fn write_assign(tag: &str, value: impl std::fmt::Display) -> String {
    format!("{tag}={value}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
