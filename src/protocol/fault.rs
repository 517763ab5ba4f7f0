//! Device error responses (`#ERR=<code>`).
//!
//! The code token is 1-2 hex digits or a decimal number. Codes follow the
//! firmware's status enumeration in order, `0x00` (OK) to `0x0D` (BUFFER_EMPTY).

use std::fmt;

use crate::codec;

/// Marker that introduces an error response.
pub const ERR_MARKER: &str = "#ERR=";

/// Symbolic device error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ErrorKind {
    Ok,
    Error,
    Busy,
    Timeout,
    BufferOverflow,
    PacketError,
    CommandError,
    CrcError,
    DataSizeError,
    UnsupportedProtocol,
    IdOutOfRange,
    DataEmpty,
    DataNotInteger,
    BufferEmpty,
    /// Code outside the table, or an unreadable code token.
    Unknown,
}

impl ErrorKind {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x00 => Self::Ok,
            0x01 => Self::Error,
            0x02 => Self::Busy,
            0x03 => Self::Timeout,
            0x04 => Self::BufferOverflow,
            0x05 => Self::PacketError,
            0x06 => Self::CommandError,
            0x07 => Self::CrcError,
            0x08 => Self::DataSizeError,
            0x09 => Self::UnsupportedProtocol,
            0x0A => Self::IdOutOfRange,
            0x0B => Self::DataEmpty,
            0x0C => Self::DataNotInteger,
            0x0D => Self::BufferEmpty,
            _ => Self::Unknown,
        }
    }

    /// Wire code for this kind. `None` for [`ErrorKind::Unknown`].
    pub fn code(self) -> Option<u32> {
        (0x00..=0x0D).find(|&c| Self::from_code(c) == self)
    }

    /// Kinds worth re-issuing the same request for.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Busy | Self::Timeout | Self::DataEmpty)
    }

    /// Firmware name, e.g. `"DATA_EMPTY"`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Busy => "BUSY",
            Self::Timeout => "TIMEOUT",
            Self::BufferOverflow => "BUFFER_OVERFLOW",
            Self::PacketError => "PACKET_ERROR",
            Self::CommandError => "COMMAND_ERROR",
            Self::CrcError => "CRC_ERROR",
            Self::DataSizeError => "DATA_SIZE_ERROR",
            Self::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            Self::IdOutOfRange => "ID_OUT_OF_RANGE",
            Self::DataEmpty => "DATA_EMPTY",
            Self::DataNotInteger => "DATA_NOT_INTEGER",
            Self::BufferEmpty => "BUFFER_EMPTY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded `#ERR=` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceError {
    /// Raw code, `None` if the token could not be read.
    pub code: Option<u32>,
    pub kind: ErrorKind,
}

impl DeviceError {
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (0x{code:02X})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// Decode `line` as an error response. `None` if it carries no error marker.
pub fn decode(line: &str) -> Option<DeviceError> {
    let start = line.find(ERR_MARKER)? + ERR_MARKER.len();
    let token = line[start..].split_whitespace().next().unwrap_or("");
    let code = codec::read_code(token).ok();
    Some(DeviceError {
        code,
        kind: code.map_or(ErrorKind::Unknown, ErrorKind::from_code),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
