//! The tid-keyed tunnel table (spec.md §4.2) and the tagged records it holds (spec.md §3, §9).
//!
//! Two tagged unions replace the original's single `netsock_t` (role tag + field union): one for
//! the client's tid-bearing roles, one for the server's. Local-only bookkeeping that never gets a
//! wire tid — forward listeners, the SOCKS5/controller listeners, accepted controller clients —
//! lives in flat `Vec`s on `Peer` instead (see `r2t-core::peer`).

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use r2t_proto::{ConnAddr, ConnAnswer};

/// Tid space is `0..=254`; `255` is the reserved "none" sentinel.
pub const TABLE_SIZE: usize = 255;
pub use r2t_proto::NO_TID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Init,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
}

/// Delivers DATA-frame payloads arriving from the peer into the task that owns this tunnel's
/// local socket or pipe. Dropping the sender — which happens automatically when the entry is
/// removed from the table — is how a tunnel is cancelled: the receiving task's `recv()` drains
/// whatever is queued and then returns `None`, telling it to shut down. This stands in for
/// spec.md §5's separate `Cancelled` state and reap pass: removal from the table *is* cancellation.
pub type DataSender = mpsc::UnboundedSender<Bytes>;

/// Channel through which the dispatcher hands a just-arrived CONN/BIND answer back to the task
/// that's waiting on it (`Connecting` state). Consumed exactly once.
pub type AnswerSender = oneshot::Sender<ConnAnswer>;

#[derive(Debug)]
pub struct ForwardSocket {
    pub state: TunnelState,
    pub data_tx: DataSender,
    pub answer_tx: Option<AnswerSender>,
}

#[derive(Debug)]
pub struct Socks5Socket {
    pub state: TunnelState,
    pub data_tx: DataSender,
    pub answer_tx: Option<AnswerSender>,
}

/// A reverse listener marker (client, no OS socket of its own until the server's BIND answer
/// comes back). Occupies a real tid: that tid is the frame id on the BIND request/answer and on
/// every subsequent RCONN for connections accepted on the server's listener.
#[derive(Debug)]
pub struct ReverseListener {
    pub lhost: String,
    pub lport: u16,
    pub rhost: String,
    pub rport: u16,
    pub bound: Option<ConnAddr>,
}

#[derive(Debug)]
pub struct ReverseSocket {
    pub state: TunnelState,
    pub data_tx: DataSender,
}

/// The four client-side roles that occupy a wire tid.
#[derive(Debug)]
pub enum ClientEntry {
    Forward(ForwardSocket),
    Socks5(Socks5Socket),
    ReverseListener(ReverseListener),
    Reverse(ReverseSocket),
}

impl ClientEntry {
    pub fn state(&self) -> Option<TunnelState> {
        match self {
            ClientEntry::Forward(s) => Some(s.state),
            ClientEntry::Socks5(s) => Some(s.state),
            ClientEntry::Reverse(s) => Some(s.state),
            ClientEntry::ReverseListener(_) => None,
        }
    }

    pub fn set_state(&mut self, state: TunnelState) {
        match self {
            ClientEntry::Forward(s) => s.state = state,
            ClientEntry::Socks5(s) => s.state = state,
            ClientEntry::Reverse(s) => s.state = state,
            ClientEntry::ReverseListener(_) => {}
        }
    }

    pub fn data_tx(&self) -> Option<&DataSender> {
        match self {
            ClientEntry::Forward(s) => Some(&s.data_tx),
            ClientEntry::Socks5(s) => Some(&s.data_tx),
            ClientEntry::Reverse(s) => Some(&s.data_tx),
            ClientEntry::ReverseListener(_) => None,
        }
    }

    /// Short role tag used by the controller's `l` (list) dump.
    pub fn kind_str(&self) -> &'static str {
        match self {
            ClientEntry::Forward(_) => "tun",
            ClientEntry::Socks5(_) => "s5",
            ClientEntry::ReverseListener(_) => "rtunsrv",
            ClientEntry::Reverse(_) => "rtun",
        }
    }
}

#[derive(Debug)]
pub struct OutboundTunnel {
    pub data_tx: DataSender,
}

#[derive(Debug)]
pub struct ProcessTunnel {
    pub data_tx: DataSender,
}

/// Tracks a server-side reverse listener so a later CLOSE(tid) can stop accepting on it.
#[derive(Debug)]
pub struct ListenerTunnel {
    pub abort: tokio::task::AbortHandle,
}

/// The three server-side roles that occupy a wire tid.
#[derive(Debug)]
pub enum ServerEntry {
    Outbound(OutboundTunnel),
    Process(ProcessTunnel),
    Listener(ListenerTunnel),
}

impl ServerEntry {
    pub fn data_tx(&self) -> Option<&DataSender> {
        match self {
            ServerEntry::Outbound(o) => Some(&o.data_tx),
            ServerEntry::Process(p) => Some(&p.data_tx),
            ServerEntry::Listener(_) => None,
        }
    }
}

impl Drop for ServerEntry {
    fn drop(&mut self) {
        if let ServerEntry::Listener(l) = self {
            l.abort.abort();
        }
    }
}

/// Dense tid -> tunnel-record table. Replaces the original's intrusive doubly-linked list
/// (spec.md §9): iteration is a cheap linear scan over at most 255 slots.
pub struct TunnelTable<T> {
    slots: Vec<Option<T>>,
    last_tid: u8,
}

impl<T> TunnelTable<T> {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(TABLE_SIZE);
        slots.resize_with(TABLE_SIZE, || None);
        Self { slots, last_tid: (TABLE_SIZE - 1) as u8 }
    }

    pub fn get(&self, tid: u8) -> Option<&T> {
        self.slots.get(usize::from(tid))?.as_ref()
    }

    pub fn get_mut(&mut self, tid: u8) -> Option<&mut T> {
        self.slots.get_mut(usize::from(tid))?.as_mut()
    }

    pub fn contains(&self, tid: u8) -> bool {
        self.slots.get(usize::from(tid)).is_some_and(Option::is_some)
    }

    pub fn insert(&mut self, tid: u8, entry: T) {
        self.slots[usize::from(tid)] = Some(entry);
    }

    /// Removes and returns the entry at `tid`. If `tid` was the allocator's cursor, steps it back
    /// by one so the id is favored for reuse (spec.md §4.2).
    pub fn remove(&mut self, tid: u8) -> Option<T> {
        let removed = self.slots.get_mut(usize::from(tid))?.take();
        if removed.is_some() && tid == self.last_tid {
            self.last_tid = if tid == 0 { (TABLE_SIZE - 1) as u8 } else { tid - 1 };
        }
        removed
    }

    /// Scans `last_tid+1, last_tid+2, ...` modulo 255 (skipping the 255 sentinel by construction,
    /// since the table only has 255 slots) and returns the first free id, or `NO_TID` if full.
    pub fn generate_id(&mut self) -> u8 {
        for step in 1..=TABLE_SIZE {
            let candidate = ((usize::from(self.last_tid) + step) % TABLE_SIZE) as u8;
            if self.slots[usize::from(candidate)].is_none() {
                self.last_tid = candidate;
                return candidate;
            }
        }
        NO_TID
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &T)> {
        self.slots.iter().enumerate().filter_map(|(tid, slot)| slot.as_ref().map(|e| (tid as u8, e)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u8, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(tid, slot)| slot.as_mut().map(|e| (tid as u8, e)))
    }
}

impl<T> Default for TunnelTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
