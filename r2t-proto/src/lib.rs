//! Wire protocol for the rdp2tcp tunneling channel.
//!
//! This crate only defines the framed, tid-multiplexed protocol that runs over the channel
//! (spec.md §3). It knows nothing about sockets, processes, or event loops — see `r2t-core` for
//! that.

pub mod cmd;
pub mod constants;
pub mod error;
pub mod frame;
pub mod messages;

pub use cmd::Cmd;
pub use constants::*;
pub use error::{ErrorCode, ProtocolError};
pub use frame::{try_parse_frame, Frame, LENGTH_PREFIX_LEN, MAX_FRAME_LEN, NO_TID};
pub use messages::{AddressFamily, ConnAddr, ConnAnswer, ConnRequest, RconnNotify};
