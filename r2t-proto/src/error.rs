//! The error taxonomy carried in a CONN/BIND answer's `err` byte (spec.md §6), plus the fatal
//! channel-framing error type.

use std::fmt;

use crate::cmd::Cmd;

/// `err` byte of a connection answer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    Generic = 1,
    BadMessage = 2,
    ConnRefused = 3,
    Forbidden = 4,
    NotAvailable = 5,
    ResolveFailed = 6,
    NotFound = 7,
}

impl ErrorCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Generic),
            2 => Some(Self::BadMessage),
            3 => Some(Self::ConnRefused),
            4 => Some(Self::Forbidden),
            5 => Some(Self::NotAvailable),
            6 => Some(Self::ResolveFailed),
            7 => Some(Self::NotFound),
            _ => None,
        }
    }

    pub fn into_u8(self) -> u8 {
        self as u8
    }

    /// Maps a local I/O failure onto the closest wire error code, for reporting connect/bind
    /// failures back across the channel.
    pub fn from_connect_error(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::ConnectionRefused => Self::ConnRefused,
            ErrorKind::PermissionDenied => Self::Forbidden,
            ErrorKind::AddrNotAvailable | ErrorKind::NotConnected => Self::NotAvailable,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Generic => "generic failure",
            Self::BadMessage => "bad message",
            Self::ConnRefused => "connection refused",
            Self::Forbidden => "forbidden",
            Self::NotAvailable => "not available",
            Self::ResolveFailed => "resolve failed",
            Self::NotFound => "not found",
        };
        f.write_str(s)
    }
}

/// A fatal error in the channel's framing layer (spec.md §4.1, §7 layer 1). Any of these tears
/// down the channel.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame length {length} is zero or exceeds the {max} byte maximum")]
    LengthOutOfRange { length: u32, max: u32 },

    #[error("unknown command byte {0}")]
    UnknownCommand(u8),

    #[error("frame for {cmd} is undersized: length={length}, minimum={minimum}")]
    Undersized { cmd: Cmd, length: u32, minimum: u32 },

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
