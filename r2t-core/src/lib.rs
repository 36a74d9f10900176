//! Tunnel table, event loop, SOCKS5 front-end and controller for the rdp2tcp mux (spec.md §4).
//!
//! This crate knows nothing about the virtual-channel transport itself — both [`client::run`] and
//! [`server::run`] take any `AsyncRead + AsyncWrite` pair, letting the binaries (`r2tcli`, `r2tsrv`)
//! wire up whatever concrete transport their platform provides (spec.md §6).

pub mod channel;
pub mod client;
pub mod controller;
pub mod error;
pub mod iobuf;
pub mod peer;
pub mod server;
pub mod socks5;
pub mod tunnels;

pub use peer::{ClientPeer, ServerPeer, SharedClientPeer, SharedServerPeer};
