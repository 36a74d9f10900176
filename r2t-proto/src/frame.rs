//! The wire frame: `[u32 big-endian length][u8 cmd][u8 tid][payload]` (spec.md §3, §4.1).
//!
//! PING is the single exception: it carries no tunnel id, so its frame is just
//! `[u32 length=1][u8 cmd=PING]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{cmd::Cmd, error::ProtocolError};

/// The largest value the length prefix may carry.
pub const MAX_FRAME_LEN: u32 = 512 * 1024;

/// Size of the big-endian length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Sentinel tunnel id meaning "no tunnel" (the tid space is 0..=254).
pub const NO_TID: u8 = 0xff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Cmd,
    pub tid: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(cmd: Cmd, tid: u8, payload: impl Into<Bytes>) -> Self {
        Self { cmd, tid, payload: payload.into() }
    }

    pub fn ping() -> Self {
        Self { cmd: Cmd::Ping, tid: NO_TID, payload: Bytes::new() }
    }

    /// Length of `cmd [+ tid] + payload` — the value carried in the length prefix.
    pub fn body_len(&self) -> usize {
        1 + usize::from(self.cmd.has_tid()) + self.payload.len()
    }

    /// Appends this frame's wire encoding to `out`. If `out` was empty beforehand, the caller may
    /// treat this as the zero-copy fast path described in spec.md §4.9 and attempt an immediate
    /// non-blocking send of `out`'s contents.
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(LENGTH_PREFIX_LEN + self.body_len());
        out.put_u32(self.body_len() as u32);
        out.put_u8(self.cmd.into_u8());
        if self.cmd.has_tid() {
            out.put_u8(self.tid);
        }
        out.put_slice(&self.payload);
    }
}

/// Attempts to parse one complete frame from the front of `buf`, per the channel's framing
/// contract: a frame is complete once at least 5 header bytes are buffered and
/// `length + 4 <= buffered`.
///
/// Returns `Ok(None)` when more bytes are needed. On success the frame's bytes are removed from
/// the front of `buf`. Any fatal framing violation (bad length, unknown command, undersized
/// payload) is returned as an `Err`, per spec.md §4.1/§7: the caller must tear down the channel.
pub fn try_parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_LEN + 1 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if length == 0 || length > MAX_FRAME_LEN {
        return Err(ProtocolError::LengthOutOfRange { length, max: MAX_FRAME_LEN });
    }

    let total = LENGTH_PREFIX_LEN + length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let cmd_byte = buf[LENGTH_PREFIX_LEN];
    let cmd = Cmd::from_u8(cmd_byte).ok_or(ProtocolError::UnknownCommand(cmd_byte))?;

    if length < cmd.min_frame_len() {
        return Err(ProtocolError::Undersized { cmd, length, minimum: cmd.min_frame_len() });
    }

    let mut frame_buf = buf.split_to(total);
    frame_buf.advance(LENGTH_PREFIX_LEN + 1);

    let tid = if cmd.has_tid() { frame_buf.get_u8() } else { NO_TID };
    let payload = frame_buf.freeze();

    Ok(Some(Frame { cmd, tid, payload }))
}
