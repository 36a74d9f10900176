//! Typed payloads carried inside CONN/BIND/RCONN frames (spec.md §3).

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorCode, ProtocolError};

/// Address family on the wire. `Any` in an answer means the address bytes are a process id.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any = 0,
    V4 = 1,
    V6 = 2,
}

impl AddressFamily {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Any),
            1 => Some(Self::V4),
            2 => Some(Self::V6),
            _ => None,
        }
    }

    pub fn into_u8(self) -> u8 {
        self as u8
    }
}

fn bad_message(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedPayload(msg.into())
}

/// Payload of a CONN or BIND request (client -> server): `u16 port | u8 af | NUL-terminated
/// hostname`. Port 0 means "execute `hostname` as a command line" (spec.md §3, §4.8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnRequest {
    pub port: u16,
    pub af: AddressFamily,
    pub hostname: String,
}

impl ConnRequest {
    pub fn new(port: u16, af: AddressFamily, hostname: impl Into<String>) -> Self {
        Self { port, af, hostname: hostname.into() }
    }

    /// A port of zero means "exec this command line and attach its stdio".
    pub fn is_process(&self) -> bool {
        self.port == 0
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u16(self.port);
        out.put_u8(self.af.into_u8());
        out.put_slice(self.hostname.as_bytes());
        out.put_u8(0);
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 3 {
            return Err(bad_message("CONN/BIND request payload too short"));
        }

        let port = payload.get_u16();
        let af_byte = payload.get_u8();
        let af = AddressFamily::from_u8(af_byte).ok_or_else(|| bad_message(format!("invalid address family {af_byte}")))?;

        let bytes = payload.chunk();
        let nul_at = bytes.iter().position(|&b| b == 0).ok_or_else(|| bad_message("hostname is not NUL-terminated"))?;
        let hostname =
            std::str::from_utf8(&bytes[..nul_at]).map_err(|_| bad_message("hostname is not valid UTF-8"))?.to_owned();

        Ok(Self { port, af, hostname })
    }
}

/// An address carried in a successful connection answer or RCONN notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    /// `af_any`: the "address" bytes are actually a big-endian process id (process tunnels only).
    Pid(u32),
}

/// Payload of a CONN or BIND answer (server -> client): `u8 err | u8 af | u16 port | addr`. When
/// `err != 0` only the err byte is present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAnswer {
    pub err: ErrorCode,
    pub port: u16,
    pub addr: Option<ConnAddr>,
}

impl ConnAnswer {
    pub fn success(port: u16, addr: ConnAddr) -> Self {
        Self { err: ErrorCode::Success, port, addr: Some(addr) }
    }

    pub fn failure(err: ErrorCode) -> Self {
        debug_assert_ne!(err, ErrorCode::Success, "use ConnAnswer::success for a successful answer");
        Self { err, port: 0, addr: None }
    }

    pub fn is_success(&self) -> bool {
        self.err == ErrorCode::Success
    }

    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.err.into_u8());
        if !self.is_success() {
            return;
        }

        match self.addr.expect("successful ConnAnswer always carries an address") {
            ConnAddr::V4(ip) => {
                out.put_u8(AddressFamily::V4.into_u8());
                out.put_u16(self.port);
                out.put_slice(&ip.octets());
            }
            ConnAddr::V6(ip) => {
                out.put_u8(AddressFamily::V6.into_u8());
                out.put_u16(self.port);
                out.put_slice(&ip.octets());
            }
            ConnAddr::Pid(pid) => {
                out.put_u8(AddressFamily::Any.into_u8());
                out.put_u16(self.port);
                out.put_slice(&pid.to_be_bytes());
            }
        }
    }

    /// Decodes a connection answer. The address bytes must match the family's exact length (spec.md
    /// §9's open question about it) — a longer frame is rejected as a bad message, not silently
    /// truncated.
    pub fn decode(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.is_empty() {
            return Err(bad_message("CONN/BIND answer payload is empty"));
        }

        let err_byte = payload.get_u8();
        let err = ErrorCode::from_u8(err_byte).ok_or_else(|| bad_message(format!("invalid error code {err_byte}")))?;

        if err != ErrorCode::Success {
            return Ok(Self { err, port: 0, addr: None });
        }

        if payload.len() < 3 {
            return Err(bad_message("successful CONN/BIND answer payload too short"));
        }

        let af_byte = payload.get_u8();
        let af = AddressFamily::from_u8(af_byte).ok_or_else(|| bad_message(format!("invalid address family {af_byte}")))?;
        let port = payload.get_u16();

        let addr = match af {
            AddressFamily::V4 => {
                if payload.len() != 4 {
                    return Err(bad_message("IPv4 answer address must be exactly 4 bytes"));
                }
                let mut octets = [0u8; 4];
                payload.copy_to_slice(&mut octets);
                ConnAddr::V4(octets.into())
            }
            AddressFamily::V6 => {
                if payload.len() != 16 {
                    return Err(bad_message("IPv6 answer address must be exactly 16 bytes"));
                }
                let mut octets = [0u8; 16];
                payload.copy_to_slice(&mut octets);
                ConnAddr::V6(octets.into())
            }
            AddressFamily::Any => {
                if payload.len() != 4 {
                    return Err(bad_message("process answer pid must be exactly 4 bytes"));
                }
                ConnAddr::Pid(payload.get_u32())
            }
        };

        Ok(Self { err, port, addr: Some(addr) })
    }
}

/// RCONN payload (server -> client): shaped like a successful [`ConnAnswer`], except the byte in
/// the `err` position carries the freshly allocated tunnel id instead. The frame's own `tid` is
/// the *listener's* tid (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RconnNotify {
    pub new_tid: u8,
    pub port: u16,
    pub addr: ConnAddr,
}

impl RconnNotify {
    pub fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.new_tid);
        match self.addr {
            ConnAddr::V4(ip) => {
                out.put_u8(AddressFamily::V4.into_u8());
                out.put_u16(self.port);
                out.put_slice(&ip.octets());
            }
            ConnAddr::V6(ip) => {
                out.put_u8(AddressFamily::V6.into_u8());
                out.put_u16(self.port);
                out.put_slice(&ip.octets());
            }
            ConnAddr::Pid(_) => unreachable!("RCONN never carries a process address"),
        }
    }

    pub fn decode(mut payload: Bytes) -> Result<Self, ProtocolError> {
        if payload.len() < 4 {
            return Err(bad_message("RCONN payload too short"));
        }

        let new_tid = payload.get_u8();
        let af_byte = payload.get_u8();
        let af = AddressFamily::from_u8(af_byte).ok_or_else(|| bad_message(format!("invalid address family {af_byte}")))?;
        let port = payload.get_u16();

        let addr = match af {
            AddressFamily::V4 => {
                if payload.len() != 4 {
                    return Err(bad_message("IPv4 RCONN address must be exactly 4 bytes"));
                }
                let mut octets = [0u8; 4];
                payload.copy_to_slice(&mut octets);
                ConnAddr::V4(octets.into())
            }
            AddressFamily::V6 => {
                if payload.len() != 16 {
                    return Err(bad_message("IPv6 RCONN address must be exactly 16 bytes"));
                }
                let mut octets = [0u8; 16];
                payload.copy_to_slice(&mut octets);
                ConnAddr::V6(octets.into())
            }
            AddressFamily::Any => return Err(bad_message("RCONN cannot carry af_any")),
        };

        Ok(Self { new_tid, port, addr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_request_round_trips() {
        let req = ConnRequest::new(80, AddressFamily::Any, "example.com");
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        assert_eq!(ConnRequest::decode(buf.freeze()).unwrap(), req);
    }

    #[test]
    fn conn_request_process_sentinel() {
        let req = ConnRequest::new(0, AddressFamily::Any, "cmd.exe");
        assert!(req.is_process());
    }

    #[test]
    fn conn_request_rejects_missing_nul() {
        let mut buf = BytesMut::new();
        buf.put_u16(80);
        buf.put_u8(AddressFamily::Any.into_u8());
        buf.put_slice(b"nonul");
        assert!(ConnRequest::decode(buf.freeze()).is_err());
    }

    #[test]
    fn conn_answer_v4_round_trips() {
        let ans = ConnAnswer::success(80, ConnAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        let mut buf = BytesMut::new();
        ans.encode(&mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(ConnAnswer::decode(buf.freeze()).unwrap(), ans);
    }

    #[test]
    fn conn_answer_v6_round_trips() {
        let ans = ConnAnswer::success(443, ConnAddr::V6(Ipv6Addr::LOCALHOST));
        let mut buf = BytesMut::new();
        ans.encode(&mut buf);
        assert_eq!(buf.len(), 20);
        assert_eq!(ConnAnswer::decode(buf.freeze()).unwrap(), ans);
    }

    #[test]
    fn conn_answer_failure_is_just_the_err_byte() {
        let ans = ConnAnswer::failure(ErrorCode::ConnRefused);
        let mut buf = BytesMut::new();
        ans.encode(&mut buf);
        assert_eq!(buf.len(), 1);
        assert_eq!(ConnAnswer::decode(buf.freeze()).unwrap(), ans);
    }

    #[test]
    fn conn_answer_rejects_oversized_address() {
        let mut buf = BytesMut::new();
        buf.put_u8(ErrorCode::Success.into_u8());
        buf.put_u8(AddressFamily::V4.into_u8());
        buf.put_u16(80);
        buf.put_slice(&[1, 2, 3, 4, 5]); // one byte too many
        assert!(ConnAnswer::decode(buf.freeze()).is_err());
    }

    #[test]
    fn rconn_round_trips() {
        let notify = RconnNotify { new_tid: 12, port: 2222, addr: ConnAddr::V4(Ipv4Addr::new(127, 0, 0, 1)) };
        let mut buf = BytesMut::new();
        notify.encode(&mut buf);
        assert_eq!(RconnNotify::decode(buf.freeze()).unwrap(), notify);
    }

    #[test]
    fn rconn_rejects_af_any() {
        let mut buf = BytesMut::new();
        buf.put_u8(5);
        buf.put_u8(AddressFamily::Any.into_u8());
        buf.put_u16(0);
        buf.put_slice(&[0, 0, 0, 1]);
        assert!(RconnNotify::decode(buf.freeze()).is_err());
    }
}
