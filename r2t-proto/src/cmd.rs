//! The command byte carried by every frame header.

use std::fmt;

/// Identifies the kind of message a [`Frame`](crate::frame::Frame) carries.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmd {
    Conn = 0,
    Close = 1,
    Data = 2,
    Ping = 3,
    Bind = 4,
    Rconn = 5,
}

impl Cmd {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Conn),
            1 => Some(Self::Close),
            2 => Some(Self::Data),
            3 => Some(Self::Ping),
            4 => Some(Self::Bind),
            5 => Some(Self::Rconn),
            _ => None,
        }
    }

    pub fn into_u8(self) -> u8 {
        self as u8
    }

    /// PING is the one command with no tunnel id on the wire.
    pub fn has_tid(self) -> bool {
        !matches!(self, Cmd::Ping)
    }

    /// Minimum total frame length (`cmd [+ tid] + payload`) for this command, i.e. the value the
    /// length prefix must be at least. Frames shorter than this are a fatal protocol error.
    pub fn min_frame_len(self) -> u32 {
        match self {
            Cmd::Conn => 3,
            Cmd::Close => 2,
            Cmd::Data => 2,
            Cmd::Ping => 1,
            Cmd::Bind => 3,
            Cmd::Rconn => 2,
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cmd::Conn => "CONN",
            Cmd::Close => "CLOSE",
            Cmd::Data => "DATA",
            Cmd::Ping => "PING",
            Cmd::Bind => "BIND",
            Cmd::Rconn => "RCONN",
        };
        f.write_str(s)
    }
}
