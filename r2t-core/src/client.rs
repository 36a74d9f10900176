//! Client-side command dispatch, tunnel lifecycle, liveness tracking, and event loop (spec.md
//! §4.3, §4.5, §4.8 client-side cases). The SOCKS5 front-end (`r2t_core::socks5`) and the
//! controller (`r2t_core::controller`) both create tunnels through the functions here.

use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};

use r2t_proto::{AddressFamily, Cmd, ConnAnswer, ConnRequest, Frame, RconnNotify, NO_TID, PING_DELAY};

use crate::{
    channel,
    controller,
    peer::{ClientPeer, ForwardListenerHandle, SharedClientPeer},
    tunnels::{ClientEntry, ForwardSocket, ReverseListener, ReverseSocket, TunnelState},
};

/// Runs the client peer to completion: wires the channel transport, starts the controller
/// listener, and recomputes the liveness-derived `connected` flag once a second (spec.md §4.3
/// steps 3-4). Returns once the channel transport hits EOF — per spec.md §7 the caller (`r2tcli`)
/// exits, since the host RDP client pipes are gone.
pub async fn run<R, W>(read_half: R, write_half: W, controller_bind: SocketAddr)
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let peer: SharedClientPeer = Rc::new(RefCell::new(ClientPeer::new()));

    let dispatch_peer = Rc::clone(&peer);
    let channel = channel::spawn(read_half, write_half, move |frame| dispatch(&dispatch_peer, frame));
    peer.borrow_mut().channel = Some(channel.clone());

    if let Err(error) = controller::install_listener(&peer, controller_bind) {
        tracing::error!("failed to bind controller at {controller_bind}: {error}");
        return;
    }

    let liveness_timeout = PING_DELAY + Duration::from_secs(4);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let was_connected = peer.borrow().connected;
        let now_connected = channel.is_alive(liveness_timeout);
        peer.borrow_mut().connected = now_connected;

        if was_connected && !now_connected {
            tracing::warn!("channel liveness timed out; closing all non-listener tunnels");
            disconnect_tunnels(&peer);
        } else if !was_connected && now_connected {
            tracing::info!("channel reconnected; re-issuing BIND for every reverse listener");
            rebind_reverse_listeners(&peer);
        }
    }
}

fn dispatch(peer: &SharedClientPeer, frame: Frame) {
    match frame.cmd {
        Cmd::Conn => handle_conn_answer(peer, frame.tid, frame.payload),
        Cmd::Bind => handle_bind_answer(peer, frame.tid, frame.payload),
        Cmd::Rconn => handle_rconn(peer, frame.tid, frame.payload),
        Cmd::Data => handle_data(peer, frame.tid, frame.payload),
        Cmd::Close => handle_close(peer, frame.tid),
        Cmd::Ping => {}
    }
}

fn handle_conn_answer(peer: &SharedClientPeer, tid: u8, payload: Bytes) {
    let answer = match ConnAnswer::decode(payload) {
        Ok(answer) => answer,
        Err(error) => {
            tracing::warn!("malformed CONN answer for tid {tid}: {error}");
            return;
        }
    };

    let sender = match peer.borrow_mut().table.get_mut(tid) {
        Some(ClientEntry::Forward(s)) => s.answer_tx.take(),
        Some(ClientEntry::Socks5(s)) => s.answer_tx.take(),
        _ => {
            tracing::debug!("CONN answer for tid {tid} with no pending tunnel; ignoring");
            None
        }
    };

    if let Some(sender) = sender {
        let _ = sender.send(answer);
    }
}

fn handle_bind_answer(peer: &SharedClientPeer, tid: u8, payload: Bytes) {
    let answer = match ConnAnswer::decode(payload) {
        Ok(answer) => answer,
        Err(error) => {
            tracing::warn!("malformed BIND answer for tid {tid}: {error}");
            return;
        }
    };

    let mut borrowed = peer.borrow_mut();
    match borrowed.table.get_mut(tid) {
        Some(ClientEntry::ReverseListener(rl)) if answer.is_success() => {
            rl.bound = answer.addr;
            tracing::info!("reverse listener {tid} bound remotely on port {}", answer.port);
        }
        Some(ClientEntry::ReverseListener(_)) => {
            tracing::warn!("reverse listener {tid} BIND refused by server: {}", answer.err);
        }
        _ => tracing::debug!("BIND answer for tid {tid} with no pending reverse listener; ignoring"),
    }
}

fn handle_rconn(peer: &SharedClientPeer, listener_tid: u8, payload: Bytes) {
    let notify = match RconnNotify::decode(payload) {
        Ok(notify) => notify,
        Err(error) => {
            tracing::warn!("malformed RCONN for listener {listener_tid}: {error}");
            return;
        }
    };

    let dial_target = match peer.borrow().table.get(listener_tid) {
        Some(ClientEntry::ReverseListener(rl)) => Some((rl.lhost.clone(), rl.lport)),
        _ => None,
    };

    let Some((lhost, lport)) = dial_target else {
        tracing::warn!("RCONN for unknown listener {listener_tid}; closing new tunnel {}", notify.new_tid);
        peer.borrow().channel().send(Frame::new(Cmd::Close, notify.new_tid, Bytes::new()));
        return;
    };

    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let new_tid = notify.new_tid;
    peer.borrow_mut().table.insert(new_tid, ClientEntry::Reverse(ReverseSocket { state: TunnelState::Connecting, data_tx }));

    let peer = Rc::clone(peer);
    tokio::task::spawn_local(async move {
        let socket = match TcpStream::connect((lhost.as_str(), lport)).await {
            Ok(socket) => socket,
            Err(error) => {
                tracing::warn!("reverse tunnel {new_tid} failed to dial local target {lhost}:{lport}: {error}");
                peer.borrow_mut().table.remove(new_tid);
                peer.borrow().channel().send(Frame::new(Cmd::Close, new_tid, Bytes::new()));
                return;
            }
        };

        if let Some(entry) = peer.borrow_mut().table.get_mut(new_tid) {
            entry.set_state(TunnelState::Connected);
        }
        run_local_socket(peer, new_tid, socket, data_rx).await;
    });
}

fn handle_data(peer: &SharedClientPeer, tid: u8, payload: Bytes) {
    let borrowed = peer.borrow();
    let sink = borrowed.table.get(tid).and_then(ClientEntry::data_tx);
    match sink {
        Some(tx) => {
            let _ = tx.send(payload);
        }
        None => {
            drop(borrowed);
            tracing::debug!("DATA for unknown tid {tid}; sending CLOSE");
            peer.borrow().channel().send(Frame::new(Cmd::Close, tid, Bytes::new()));
        }
    }
}

fn handle_close(peer: &SharedClientPeer, tid: u8) {
    if peer.borrow_mut().table.remove(tid).is_none() {
        tracing::debug!("CLOSE for unknown tid {tid}; ignoring");
    }
}

fn disconnect_tunnels(peer: &SharedClientPeer) {
    let mut borrowed = peer.borrow_mut();
    let stale: Vec<u8> =
        borrowed.table.iter().filter(|(_, e)| !matches!(e, ClientEntry::ReverseListener(_))).map(|(tid, _)| tid).collect();
    for tid in stale {
        borrowed.table.remove(tid);
    }
    for (_, entry) in borrowed.table.iter_mut() {
        if let ClientEntry::ReverseListener(rl) = entry {
            rl.bound = None;
        }
    }
}

fn rebind_reverse_listeners(peer: &SharedClientPeer) {
    let listeners: Vec<(u8, String, u16)> = peer
        .borrow()
        .table
        .iter()
        .filter_map(|(tid, e)| match e {
            ClientEntry::ReverseListener(rl) => Some((tid, rl.rhost.clone(), rl.rport)),
            _ => None,
        })
        .collect();

    for (tid, rhost, rport) in listeners {
        send_bind_request(peer, tid, &rhost, rport);
    }
}

fn send_bind_request(peer: &SharedClientPeer, tid: u8, rhost: &str, rport: u16) {
    let req = ConnRequest::new(rport, AddressFamily::Any, rhost);
    let mut buf = BytesMut::new();
    req.encode(&mut buf);
    peer.borrow().channel().send(Frame::new(Cmd::Bind, tid, buf.freeze()));
}

/// Drives one tunnel's local socket: bytes read locally become outbound DATA frames; bytes
/// arriving from `data_rx` are written locally. Shared by forward tunnels, SOCKS5 tunnels (after
/// negotiation) and RCONN-accepted reverse tunnels — all of them reduce to "a connected tid plus a
/// local socket" once past their respective handshakes.
pub(crate) async fn run_local_socket(
    peer: SharedClientPeer,
    tid: u8,
    mut socket: TcpStream,
    mut data_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            biased;
            incoming = data_rx.recv() => match incoming {
                Some(bytes) => {
                    if let Err(error) = socket.write_all(&bytes).await {
                        tracing::debug!("tunnel {tid} local write failed: {error}");
                        break;
                    }
                }
                None => break,
            },
            result = socket.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => peer.borrow().channel().send(Frame::new(Cmd::Data, tid, Bytes::copy_from_slice(&buf[..n]))),
                Err(error) => {
                    tracing::debug!("tunnel {tid} local read failed: {error}");
                    break;
                }
            },
        }
    }

    if peer.borrow_mut().table.remove(tid).is_some() {
        peer.borrow().channel().send(Frame::new(Cmd::Close, tid, Bytes::new()));
    }
}

/// Registers a pending CONN tunnel (forward listener accept, or SOCKS5 CONNECT) and sends the
/// request. Returns the allocated tid and the answer receiver; the caller awaits the receiver to
/// learn success/failure, exactly matching the `Connecting` state of spec.md §3.
pub(crate) fn open_forward_tunnel(
    peer: &SharedClientPeer,
    af: AddressFamily,
    hostname: String,
    port: u16,
) -> Option<(u8, oneshot::Receiver<ConnAnswer>, mpsc::UnboundedReceiver<Bytes>)> {
    let tid = peer.borrow_mut().table.generate_id();
    if tid == NO_TID {
        return None;
    }

    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let (answer_tx, answer_rx) = oneshot::channel();
    peer.borrow_mut().table.insert(
        tid,
        ClientEntry::Forward(ForwardSocket { state: TunnelState::Connecting, data_tx, answer_tx: Some(answer_tx) }),
    );

    let req = ConnRequest::new(port, af, hostname);
    let mut buf = BytesMut::new();
    req.encode(&mut buf);
    peer.borrow().channel().send(Frame::new(Cmd::Conn, tid, buf.freeze()));

    Some((tid, answer_rx, data_rx))
}

/// Same as [`open_forward_tunnel`] but registers a `Socks5` role instead of `Forward`, so the
/// controller's `l` dump and the liveness-driven teardown can tell the two apart.
pub(crate) fn open_socks5_tunnel(
    peer: &SharedClientPeer,
    af: AddressFamily,
    hostname: String,
    port: u16,
) -> Option<(u8, oneshot::Receiver<ConnAnswer>, mpsc::UnboundedReceiver<Bytes>)> {
    let tid = peer.borrow_mut().table.generate_id();
    if tid == NO_TID {
        return None;
    }

    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let (answer_tx, answer_rx) = oneshot::channel();
    peer.borrow_mut().table.insert(
        tid,
        ClientEntry::Socks5(crate::tunnels::Socks5Socket { state: TunnelState::Connecting, data_tx, answer_tx: Some(answer_tx) }),
    );

    let req = ConnRequest::new(port, af, hostname);
    let mut buf = BytesMut::new();
    req.encode(&mut buf);
    peer.borrow().channel().send(Frame::new(Cmd::Conn, tid, buf.freeze()));

    Some((tid, answer_rx, data_rx))
}

pub(crate) fn mark_connected(peer: &SharedClientPeer, tid: u8) {
    if let Some(entry) = peer.borrow_mut().table.get_mut(tid) {
        entry.set_state(TunnelState::Connected);
    }
}

pub(crate) fn drop_tunnel(peer: &SharedClientPeer, tid: u8) {
    peer.borrow_mut().table.remove(tid);
}

/// Installs a forward listener (spec.md §4.8): `t`/`x` controller commands both funnel through
/// here, the latter with `rport = 0` (the process-tunnel sentinel) and the command line as
/// `rhost`.
pub fn install_forward_listener(
    peer: &SharedClientPeer,
    lhost: SocketAddr,
    rhost: String,
    rport: u16,
    raf: AddressFamily,
) -> std::io::Result<SocketAddr> {
    let peer_for_bind = Rc::clone(peer);
    let rhost_for_storage = rhost.clone();

    // `TcpListener::bind` is async, but binding a local address never blocks in practice; the
    // original's forward listener install is synchronous too (spec.md §4.8). A blocking
    // `std::net` bind would work just as well; we stay on Tokio's listener type for consistency
    // with the rest of the codec.
    let listener = std::net::TcpListener::bind(lhost)?;
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let bound = listener.local_addr()?;

    let task = tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _remote)) => {
                    let peer = Rc::clone(&peer_for_bind);
                    let rhost = rhost.clone();
                    tokio::task::spawn_local(handle_forward_accept(peer, socket, rhost, rport, raf));
                }
                Err(error) => {
                    tracing::warn!("forward listener at {bound} accept failed: {error}");
                    break;
                }
            }
        }
    });

    peer.borrow_mut().forward_listeners.push(ForwardListenerHandle {
        lhost: bound,
        rhost: rhost_for_storage,
        rport,
        abort: task.abort_handle(),
    });

    Ok(bound)
}

async fn handle_forward_accept(peer: SharedClientPeer, socket: TcpStream, rhost: String, rport: u16, raf: AddressFamily) {
    let Some((tid, answer_rx, data_rx)) = open_forward_tunnel(&peer, raf, rhost, rport) else {
        tracing::warn!("forward accept: tunnel table full, dropping connection");
        return;
    };

    let answer = match answer_rx.await {
        Ok(answer) => answer,
        Err(_) => {
            drop_tunnel(&peer, tid);
            return;
        }
    };

    if !answer.is_success() {
        tracing::warn!("forward tunnel {tid} refused by server: {}", answer.err);
        drop_tunnel(&peer, tid);
        return;
    }

    mark_connected(&peer, tid);
    run_local_socket(peer, tid, socket, data_rx).await;
}

/// Registers a reverse listener marker (spec.md §4.8) and, if the channel is currently connected,
/// immediately sends its BIND request.
pub fn install_reverse_listener(peer: &SharedClientPeer, lhost: String, lport: u16, rhost: String, rport: u16) -> Option<u8> {
    let tid = peer.borrow_mut().table.generate_id();
    if tid == NO_TID {
        return None;
    }

    peer.borrow_mut().table.insert(
        tid,
        ClientEntry::ReverseListener(ReverseListener { lhost, lport, rhost: rhost.clone(), rport, bound: None }),
    );

    if peer.borrow().connected {
        send_bind_request(peer, tid, &rhost, rport);
    }

    Some(tid)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use r2t_proto::{ConnAddr, ErrorCode};
    use tokio::io::duplex;

    use super::*;

    fn test_peer() -> SharedClientPeer {
        Rc::new(RefCell::new(ClientPeer::new()))
    }

    /// Wires `peer`'s channel to one half of an in-memory duplex pair and returns the frames
    /// collected off the other half, in arrival order.
    fn wire_channel(peer: &SharedClientPeer) -> Rc<RefCell<Vec<Frame>>> {
        let (a, b) = duplex(8192);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let received = Rc::new(RefCell::new(Vec::new()));
        let received_clone = Rc::clone(&received);
        let _b_handle = channel::spawn(b_read, b_write, move |frame| received_clone.borrow_mut().push(frame));

        let a_handle = channel::spawn(a_read, a_write, |_| {});
        peer.borrow_mut().channel = Some(a_handle);
        received
    }

    async fn wait_for_frame(received: &Rc<RefCell<Vec<Frame>>>) -> Frame {
        for _ in 0..200 {
            if !received.borrow().is_empty() {
                return received.borrow_mut().remove(0);
            }
            tokio::task::yield_now().await;
        }
        panic!("timed out waiting for a frame on the channel");
    }

    #[tokio::test]
    async fn open_forward_tunnel_sends_conn_request_and_marks_connecting() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let peer = test_peer();
                let received = wire_channel(&peer);

                let (tid, _answer_rx, _data_rx) =
                    open_forward_tunnel(&peer, AddressFamily::V4, "example.com".to_owned(), 80).expect("tid allocated");

                let frame = wait_for_frame(&received).await;
                assert_eq!(frame.cmd, Cmd::Conn);
                assert_eq!(frame.tid, tid);

                let req = ConnRequest::decode(frame.payload).unwrap();
                assert_eq!(req.port, 80);
                assert_eq!(req.hostname, "example.com");

                match peer.borrow().table.get(tid) {
                    Some(ClientEntry::Forward(s)) => assert_eq!(s.state, TunnelState::Connecting),
                    other => panic!("expected a pending forward tunnel, got {other:?}"),
                }
            })
            .await;
    }

    #[test]
    fn conn_answer_delivers_to_the_waiting_tunnel_and_ignores_unknown_tid() {
        let peer = test_peer();
        let (data_tx, _data_rx) = mpsc::unbounded_channel();
        let (answer_tx, mut answer_rx) = oneshot::channel();
        peer.borrow_mut().table.insert(
            2,
            ClientEntry::Forward(ForwardSocket { state: TunnelState::Connecting, data_tx, answer_tx: Some(answer_tx) }),
        );

        let answer = ConnAnswer::success(80, ConnAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        let mut buf = BytesMut::new();
        answer.encode(&mut buf);
        handle_conn_answer(&peer, 2, buf.freeze());

        let got = answer_rx.try_recv().expect("answer delivered to the waiting tunnel");
        assert!(got.is_success());

        // An answer for a tid with no pending tunnel must not panic.
        let mut unknown_buf = BytesMut::new();
        ConnAnswer::failure(ErrorCode::ConnRefused).encode(&mut unknown_buf);
        handle_conn_answer(&peer, 99, unknown_buf.freeze());
    }

    #[test]
    fn handle_close_removes_known_tid_and_ignores_unknown() {
        let peer = test_peer();
        let (data_tx, _data_rx) = mpsc::unbounded_channel();
        peer.borrow_mut()
            .table
            .insert(4, ClientEntry::Forward(ForwardSocket { state: TunnelState::Connected, data_tx, answer_tx: None }));

        handle_close(&peer, 4);
        assert!(peer.borrow().table.get(4).is_none());

        handle_close(&peer, 4); // already gone; must not panic
    }

    #[tokio::test]
    async fn run_local_socket_sends_close_when_the_local_side_hits_eof() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let peer = test_peer();
                let received = wire_channel(&peer);

                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let client_side = TcpStream::connect(addr).await.unwrap();
                let (accepted_side, _) = listener.accept().await.unwrap();
                drop(accepted_side); // the remote peer hangs up; client_side must see EOF

                let (data_tx, data_rx) = mpsc::unbounded_channel();
                peer.borrow_mut()
                    .table
                    .insert(5, ClientEntry::Forward(ForwardSocket { state: TunnelState::Connected, data_tx, answer_tx: None }));

                run_local_socket(Rc::clone(&peer), 5, client_side, data_rx).await;

                assert!(peer.borrow().table.get(5).is_none());
                let frame = wait_for_frame(&received).await;
                assert_eq!(frame.cmd, Cmd::Close);
                assert_eq!(frame.tid, 5);
            })
            .await;
    }

    #[test]
    fn disconnect_tunnels_drops_tunnels_but_clears_reverse_listener_binding() {
        let peer = test_peer();
        let (data_tx, _data_rx) = mpsc::unbounded_channel();
        peer.borrow_mut()
            .table
            .insert(3, ClientEntry::Forward(ForwardSocket { state: TunnelState::Connected, data_tx, answer_tx: None }));
        peer.borrow_mut().table.insert(
            9,
            ClientEntry::ReverseListener(ReverseListener {
                lhost: "127.0.0.1".to_owned(),
                lport: 2222,
                rhost: "0.0.0.0".to_owned(),
                rport: 2222,
                bound: Some(ConnAddr::V4(Ipv4Addr::new(1, 2, 3, 4))),
            }),
        );

        disconnect_tunnels(&peer);

        assert!(peer.borrow().table.get(3).is_none());
        match peer.borrow().table.get(9) {
            Some(ClientEntry::ReverseListener(rl)) => assert!(rl.bound.is_none()),
            other => panic!("expected the reverse listener to survive disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rebind_reverse_listeners_reissues_bind_for_every_listener() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let peer = test_peer();
                let received = wire_channel(&peer);

                peer.borrow_mut().table.insert(
                    7,
                    ClientEntry::ReverseListener(ReverseListener {
                        lhost: "127.0.0.1".to_owned(),
                        lport: 2222,
                        rhost: "0.0.0.0".to_owned(),
                        rport: 2222,
                        bound: None,
                    }),
                );

                rebind_reverse_listeners(&peer);

                let frame = wait_for_frame(&received).await;
                assert_eq!(frame.cmd, Cmd::Bind);
                assert_eq!(frame.tid, 7);

                let req = ConnRequest::decode(frame.payload).unwrap();
                assert_eq!(req.port, 2222);
                assert_eq!(req.hostname, "0.0.0.0");
            })
            .await;
    }
}
