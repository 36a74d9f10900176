//! Server-side command dispatch, tunnel lifecycle, and event loop (spec.md §4.4, §4.5, §4.8): one
//! accept/connect/reply/bidirectional-copy handler per tunnel, running until either side closes,
//! targeted at mux DATA frames instead of a raw socket pair. Process tunnels merge the child's
//! stdout and stderr toward the channel, feed stdin from DATA frames, and report the pid as the
//! answer's address when `af=any`.

use std::{cell::RefCell, net::SocketAddr, rc::Rc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    process::Command,
    sync::{mpsc, oneshot},
};

use r2t_proto::{Cmd, ConnAddr, ConnAnswer, ConnRequest, ErrorCode, Frame, RconnNotify, NO_TID, PING_DELAY};

use crate::{
    channel,
    error::TunnelError,
    peer::{ServerPeer, SharedServerPeer},
    tunnels::{ListenerTunnel, OutboundTunnel, ProcessTunnel, ServerEntry},
};

/// Runs the server peer to completion: wires the channel transport, dispatches every inbound
/// frame, and emits a PING whenever the writer has been idle for `ping_delay - 1` seconds
/// (spec.md §4.4). Returns once the channel transport is gone (EOF or I/O error) — the caller
/// (`r2tsrv`) is expected to sleep and reopen the transport per spec.md §7's recovery rule.
pub async fn run<R, W>(read_half: R, write_half: W)
where
    R: AsyncRead + Unpin + 'static,
    W: AsyncWrite + Unpin + 'static,
{
    let peer: SharedServerPeer = Rc::new(RefCell::new(ServerPeer::new()));

    let dispatch_peer = Rc::clone(&peer);
    let channel = channel::spawn(read_half, write_half, move |frame| dispatch(&dispatch_peer, frame));
    peer.borrow_mut().channel = Some(channel.clone());

    // Ping ticker: emits PING on a fixed cadence. The original only pings when the writer has
    // been otherwise idle; an unconditional tick at `ping_delay - 1` is simpler and at most sends
    // a few redundant PINGs when the link is already busy, which is harmless (spec.md §4.4, §5).
    let mut ticker = tokio::time::interval(PING_DELAY - Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        channel.send(Frame::ping());
    }
}

fn dispatch(peer: &SharedServerPeer, frame: Frame) {
    match frame.cmd {
        Cmd::Conn => handle_conn(peer, frame.tid, frame.payload),
        Cmd::Bind => handle_bind(peer, frame.tid, frame.payload),
        Cmd::Close => handle_close(peer, frame.tid),
        Cmd::Data => handle_data(peer, frame.tid, frame.payload),
        Cmd::Ping => {}
        Cmd::Rconn => tracing::warn!("server received RCONN, a client-only frame; ignoring"),
    }
}

fn conn_addr(addr: SocketAddr) -> ConnAddr {
    match addr {
        SocketAddr::V4(a) => ConnAddr::V4(*a.ip()),
        SocketAddr::V6(a) => ConnAddr::V6(*a.ip()),
    }
}

fn send_answer(peer: &SharedServerPeer, cmd: Cmd, tid: u8, answer: ConnAnswer) {
    let mut buf = BytesMut::new();
    answer.encode(&mut buf);
    peer.borrow().channel().send(Frame::new(cmd, tid, buf.freeze()));
}

fn handle_conn(peer: &SharedServerPeer, tid: u8, payload: Bytes) {
    let req = match ConnRequest::decode(payload) {
        Ok(req) => req,
        Err(error) => {
            tracing::warn!("malformed CONN payload for tid {tid}: {error}");
            return;
        }
    };

    // spec.md §9 open question: the original errors without reply on a reused tid; we preserve
    // that asymmetry with the unknown-tid DATA case rather than silently overwrite the entry.
    if peer.borrow().table.contains(tid) {
        tracing::error!("CONN for tid {tid} already in use; ignoring");
        return;
    }

    // Reserve the tid synchronously, before the connect/spawn ever yields: `generate_id`'s
    // emptiness check and this guard above only hold if no other caller can observe the tid as
    // free while this CONN is still being serviced. Inserting the (still-connecting) entry here,
    // rather than after `connect()`/`spawn()` completes, closes the window where a concurrent
    // reverse accept could `generate_id()` the same tid and collide with it (spec.md §3 invariant
    // 1 / §8 "no two live tunnel records share a tid").
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    if req.is_process() {
        peer.borrow_mut().table.insert(tid, ServerEntry::Process(ProcessTunnel { data_tx }));
        spawn_process_tunnel(peer, tid, req.hostname, data_rx);
    } else {
        peer.borrow_mut().table.insert(tid, ServerEntry::Outbound(OutboundTunnel { data_tx }));
        spawn_forward_tunnel(peer, tid, req, data_rx);
    }
}

fn handle_bind(peer: &SharedServerPeer, tid: u8, payload: Bytes) {
    let req = match ConnRequest::decode(payload) {
        Ok(req) => req,
        Err(error) => {
            tracing::warn!("malformed BIND payload for tid {tid}: {error}");
            return;
        }
    };

    if peer.borrow().table.contains(tid) {
        tracing::error!("BIND for tid {tid} already in use; ignoring");
        return;
    }

    let peer = Rc::clone(peer);
    tokio::task::spawn_local(async move {
        let listener = match TcpListener::bind((req.hostname.as_str(), req.port)).await {
            Ok(listener) => listener,
            Err(error) => {
                let err = TunnelError::Connect(error);
                send_answer(&peer, Cmd::Bind, tid, ConnAnswer::failure(err.code()));
                return;
            }
        };

        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(error) => {
                tracing::warn!("reverse listener for tid {tid}: could not read bound address: {error}");
                send_answer(&peer, Cmd::Bind, tid, ConnAnswer::failure(ErrorCode::Generic));
                return;
            }
        };

        let accept_peer = Rc::clone(&peer);
        let accept_task = tokio::task::spawn_local(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => accept_reverse_connection(&accept_peer, tid, stream, remote),
                    Err(error) => {
                        tracing::warn!("reverse listener for tid {tid} accept failed: {error}");
                        break;
                    }
                }
            }
        });

        peer.borrow_mut().table.insert(tid, ServerEntry::Listener(ListenerTunnel { abort: accept_task.abort_handle() }));
        send_answer(&peer, Cmd::Bind, tid, ConnAnswer::success(local_addr.port(), conn_addr(local_addr)));
    });
}

fn accept_reverse_connection(peer: &SharedServerPeer, listener_tid: u8, stream: TcpStream, remote: SocketAddr) {
    let new_tid = peer.borrow_mut().table.generate_id();
    if new_tid == NO_TID {
        tracing::warn!("reverse accept on listener {listener_tid}: tunnel table full, dropping connection");
        return;
    }

    let (data_tx, data_rx) = mpsc::unbounded_channel();
    peer.borrow_mut().table.insert(new_tid, ServerEntry::Outbound(OutboundTunnel { data_tx }));

    let notify = RconnNotify { new_tid, port: remote.port(), addr: conn_addr(remote) };
    let mut buf = BytesMut::new();
    notify.encode(&mut buf);
    peer.borrow().channel().send(Frame::new(Cmd::Rconn, listener_tid, buf.freeze()));

    tokio::task::spawn_local(run_forward_socket(Rc::clone(peer), new_tid, stream, data_rx));
}

fn spawn_forward_tunnel(peer: &SharedServerPeer, tid: u8, req: ConnRequest, data_rx: mpsc::UnboundedReceiver<Bytes>) {
    let peer = Rc::clone(peer);
    tokio::task::spawn_local(async move {
        let stream = match TcpStream::connect((req.hostname.as_str(), req.port)).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::warn!("forward tunnel {tid} failed to connect to {}:{}: {error}", req.hostname, req.port);
                peer.borrow_mut().table.remove(tid);
                let err = TunnelError::Connect(error);
                send_answer(&peer, Cmd::Conn, tid, ConnAnswer::failure(err.code()));
                return;
            }
        };

        // The answer carries the *remote* target's address (spec.md §4.8, §8 scenario 1/3), not
        // this socket's own ephemeral local endpoint.
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(error) => {
                tracing::warn!("forward tunnel {tid}: could not read peer address: {error}");
                peer.borrow_mut().table.remove(tid);
                send_answer(&peer, Cmd::Conn, tid, ConnAnswer::failure(ErrorCode::Generic));
                return;
            }
        };

        send_answer(&peer, Cmd::Conn, tid, ConnAnswer::success(peer_addr.port(), conn_addr(peer_addr)));

        run_forward_socket(peer, tid, stream, data_rx).await;
    });
}

/// Drives one outbound (forward or reverse-accepted) tunnel's socket: bytes read locally become
/// DATA frames outbound; DATA frames arriving from `data_rx` are written to the socket. Exits —
/// and reclaims the tid — on local EOF/error or once `data_rx` is drained after the table entry
/// was removed by a CLOSE.
async fn run_forward_socket(peer: SharedServerPeer, tid: u8, mut stream: TcpStream, mut data_rx: mpsc::UnboundedReceiver<Bytes>) {
    let mut read_buf = [0u8; 16 * 1024];
    loop {
        tokio::select! {
            biased;
            incoming = data_rx.recv() => match incoming {
                Some(bytes) => {
                    if let Err(error) = stream.write_all(&bytes).await {
                        tracing::debug!("tunnel {tid} local write failed: {error}");
                        break;
                    }
                }
                None => break,
            },
            result = stream.read(&mut read_buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    peer.borrow().channel().send(Frame::new(Cmd::Data, tid, Bytes::copy_from_slice(&read_buf[..n])));
                }
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

fn spawn_process_tunnel(peer: &SharedServerPeer, tid: u8, cmdline: String, mut data_rx: mpsc::UnboundedReceiver<Bytes>) {
    let peer = Rc::clone(peer);
    tokio::task::spawn_local(async move {
        let mut parts = cmdline.split_whitespace();
        let Some(program) = parts.next() else {
            peer.borrow_mut().table.remove(tid);
            send_answer(&peer, Cmd::Conn, tid, ConnAnswer::failure(ErrorCode::BadMessage));
            return;
        };

        let mut command = Command::new(program);
        command.args(parts);
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                peer.borrow_mut().table.remove(tid);
                let err = TunnelError::Spawn(error);
                send_answer(&peer, Cmd::Conn, tid, ConnAnswer::failure(err.code()));
                return;
            }
        };

        let pid = child.id().unwrap_or(0);
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let mut stderr = child.stderr.take().expect("stderr was piped");

        send_answer(&peer, Cmd::Conn, tid, ConnAnswer::success(0, ConnAddr::Pid(pid)));

        // stdout and stderr are merged into a single stream toward the channel as two concurrent
        // readers writing the same tid. `stdout_done` lets stdout's own EOF reach the main select
        // loop below: a child that closes stdout while still running (daemonizing, redirecting
        // its output elsewhere) must still tear the tunnel down per spec.md §4.8's "on EOF from
        // the stdout pipe or child exit, send CLOSE and drop" — waiting on `child.wait()` alone
        // would never observe that.
        let (stdout_done_tx, mut stdout_done_rx) = oneshot::channel::<()>();
        let stdout_peer = Rc::clone(&peer);
        let stdout_task = tokio::task::spawn_local(async move {
            let mut buf = [0u8; 16 * 1024];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stdout_peer.borrow().channel().send(Frame::new(Cmd::Data, tid, Bytes::copy_from_slice(&buf[..n]))),
                }
            }
            let _ = stdout_done_tx.send(());
        });
        let stderr_peer = Rc::clone(&peer);
        let stderr_task = tokio::task::spawn_local(async move {
            let mut buf = [0u8; 16 * 1024];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => stderr_peer.borrow().channel().send(Frame::new(Cmd::Data, tid, Bytes::copy_from_slice(&buf[..n]))),
                }
            }
        });

        loop {
            tokio::select! {
                biased;
                incoming = data_rx.recv() => match incoming {
                    Some(bytes) => {
                        if stdin.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                status = child.wait() => {
                    tracing::debug!("process tunnel {tid} exited: {status:?}");
                    break;
                }
                _ = &mut stdout_done_rx => {
                    tracing::debug!("process tunnel {tid} stdout closed; tearing down");
                    break;
                }
            }
        }

        stdout_task.abort();
        stderr_task.abort();
        let _ = child.start_kill();

        if peer.borrow_mut().table.remove(tid).is_some() {
            peer.borrow().channel().send(Frame::new(Cmd::Close, tid, Bytes::new()));
        }
    });
}

fn handle_close(peer: &SharedServerPeer, tid: u8) {
    // Removing the entry drops its `data_tx`/listener abort handle, which is how the task that
    // owns it observes cancellation (spec.md §9: table removal replaces the separate `Cancelled`
    // state and reap pass).
    if peer.borrow_mut().table.remove(tid).is_none() {
        tracing::debug!("CLOSE for unknown tid {tid}; ignoring");
    }
}

fn handle_data(peer: &SharedServerPeer, tid: u8, payload: Bytes) {
    let borrowed = peer.borrow();
    let sink = borrowed.table.get(tid).and_then(ServerEntry::data_tx);
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

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use r2t_proto::AddressFamily;
    use tokio::io::duplex;

    use super::*;

    fn test_peer() -> SharedServerPeer {
        Rc::new(RefCell::new(ServerPeer::new()))
    }

    /// Wires `peer`'s channel to one half of an in-memory duplex pair and returns the frames
    /// collected off the other half, in arrival order.
    fn wire_channel(peer: &SharedServerPeer) -> Rc<RefCell<Vec<Frame>>> {
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

    /// Polls for a specific `(cmd, tid)` pair with a real deadline, for assertions that depend on
    /// OS-scheduled work (subprocess spawn/exit) rather than purely in-process wakeups.
    async fn wait_for_frame_matching(received: &Rc<RefCell<Vec<Frame>>>, cmd: Cmd, tid: u8, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut guard = received.borrow_mut();
                if let Some(pos) = guard.iter().position(|f| f.cmd == cmd && f.tid == tid) {
                    guard.remove(pos);
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn handle_conn_ignores_a_tid_already_in_use() {
        let peer = test_peer();
        let (data_tx, _data_rx) = mpsc::unbounded_channel();
        peer.borrow_mut().table.insert(3, ServerEntry::Outbound(OutboundTunnel { data_tx }));

        let req = ConnRequest::new(80, AddressFamily::V4, "example.com");
        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        handle_conn(&peer, 3, buf.freeze());

        // Still the original entry: a reused tid must not be overwritten or spawn a new tunnel.
        assert!(matches!(peer.borrow().table.get(3), Some(ServerEntry::Outbound(_))));
    }

    #[test]
    fn handle_close_removes_known_tid_and_ignores_unknown() {
        let peer = test_peer();
        let (data_tx, _data_rx) = mpsc::unbounded_channel();
        peer.borrow_mut().table.insert(6, ServerEntry::Outbound(OutboundTunnel { data_tx }));

        handle_close(&peer, 6);
        assert!(peer.borrow().table.get(6).is_none());

        handle_close(&peer, 6); // already gone; must not panic
    }

    #[test]
    fn handle_data_forwards_to_a_known_tunnel() {
        let peer = test_peer();
        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        peer.borrow_mut().table.insert(1, ServerEntry::Outbound(OutboundTunnel { data_tx }));

        handle_data(&peer, 1, Bytes::from_static(b"hello"));

        assert_eq!(data_rx.try_recv().unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn handle_data_for_an_unknown_tid_sends_close() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let peer = test_peer();
                let received = wire_channel(&peer);

                handle_data(&peer, 42, Bytes::from_static(b"x"));

                let frame = wait_for_frame(&received).await;
                assert_eq!(frame.cmd, Cmd::Close);
                assert_eq!(frame.tid, 42);
            })
            .await;
    }

    #[test]
    fn conn_addr_maps_v4_and_v6() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert!(matches!(conn_addr(v4), ConnAddr::V4(ip) if ip == Ipv4Addr::new(127, 0, 0, 1)));

        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert!(matches!(conn_addr(v6), ConnAddr::V6(ip) if ip == Ipv6Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn process_tunnel_tears_down_on_stdout_eof_even_if_the_child_keeps_running() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let peer = test_peer();
                let received = wire_channel(&peer);

                // Closes its own stdout immediately, then blocks reading an stdin that's never
                // closed: models a child that daemonizes or redirects its output elsewhere while
                // staying alive, the exact case `child.wait()` alone can't observe.
                let req = ConnRequest::new(0, AddressFamily::Any, "sh -c exec>&-;cat");
                let mut buf = BytesMut::new();
                req.encode(&mut buf);
                handle_conn(&peer, 9, buf.freeze());

                assert!(
                    wait_for_frame_matching(&received, Cmd::Conn, 9, Duration::from_secs(5)).await,
                    "expected a CONN answer carrying the spawned pid"
                );
                assert!(
                    wait_for_frame_matching(&received, Cmd::Close, 9, Duration::from_secs(5)).await,
                    "stdout EOF alone should have torn the tunnel down without waiting on child exit"
                );
            })
            .await;
    }
}
