//! The single explicit context (spec.md §9, replacing the original's process-wide globals) each
//! peer's handlers borrow: `Rc<RefCell<ClientPeer>>` / `Rc<RefCell<ServerPeer>>`. Every task lives
//! on the same `LocalSet`, so a `RefCell` borrow conflict can only mean a logic bug — handler code
//! never holds a borrow across an `.await` — never a real data race (spec.md §5).

use std::{cell::RefCell, net::SocketAddr, rc::Rc};

use tokio::task::AbortHandle;

use crate::{
    channel::ChannelHandle,
    tunnels::{ClientEntry, ServerEntry, TunnelTable},
};

/// A client-side forward listener (spec.md §3): a local TCP listener with no tid of its own,
/// carrying the remote target every accepted connection will dial on the server.
pub struct ForwardListenerHandle {
    pub lhost: SocketAddr,
    pub rhost: String,
    pub rport: u16,
    pub abort: AbortHandle,
}

/// A client-side SOCKS5 front-end listener (spec.md §4.6), also tid-less.
pub struct Socks5ListenerHandle {
    pub bind: SocketAddr,
    pub abort: AbortHandle,
}

/// An accepted controller connection (spec.md §3). Tid-less like the listeners above; the
/// original tags it with the `0xff` sentinel purely so one generic dump loop can skip over it.
pub struct ControllerClientHandle {
    pub peer_addr: SocketAddr,
    pub abort: AbortHandle,
}

pub struct ClientPeer {
    pub table: TunnelTable<ClientEntry>,
    pub channel: Option<ChannelHandle>,
    pub forward_listeners: Vec<ForwardListenerHandle>,
    pub socks5_listeners: Vec<Socks5ListenerHandle>,
    pub controller_clients: Vec<ControllerClientHandle>,
    /// Recomputed every event-loop tick from the channel's liveness clock (spec.md §4.3 step 4).
    pub connected: bool,
}

impl ClientPeer {
    pub fn new() -> Self {
        Self {
            table: TunnelTable::new(),
            channel: None,
            forward_listeners: Vec::new(),
            socks5_listeners: Vec::new(),
            controller_clients: Vec::new(),
            connected: false,
        }
    }

    /// Panics if called before the channel transport has been attached — a programming error, not
    /// a runtime condition, since the channel is wired up before any task that could call this.
    pub fn channel(&self) -> ChannelHandle {
        self.channel.clone().expect("channel attached before use")
    }
}

impl Default for ClientPeer {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedClientPeer = Rc<RefCell<ClientPeer>>;

pub struct ServerPeer {
    pub table: TunnelTable<ServerEntry>,
    pub channel: Option<ChannelHandle>,
}

impl ServerPeer {
    pub fn new() -> Self {
        Self { table: TunnelTable::new(), channel: None }
    }

    pub fn channel(&self) -> ChannelHandle {
        self.channel.clone().expect("channel attached before use")
    }
}

impl Default for ServerPeer {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedServerPeer = Rc<RefCell<ServerPeer>>;
