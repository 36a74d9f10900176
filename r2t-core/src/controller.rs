//! Text control protocol (spec.md §4.7): a line-oriented TCP listener that mutates the client's
//! tunnel table. The `l` dump covers every live socket — forward/SOCKS5 listeners and the
//! controller's own accepted clients, not just wire tunnels — and is terminated by a blank line;
//! a syntactically bad line closes only that one controller connection, untouched tunnel table
//! and all (spec.md §7 layer 3, §8).

use std::{fmt::Write as _, net::SocketAddr, rc::Rc};

use inlined::TinyString;
use tokio::{
    io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use r2t_proto::AddressFamily;

use crate::{
    client::{install_forward_listener, install_reverse_listener},
    error::ControllerError,
    peer::{ControllerClientHandle, SharedClientPeer},
    socks5,
    tunnels::ClientEntry,
};

/// Installs the controller listener (`r2tcli [bind-host [bind-port]]`, spec.md §6).
pub fn install_listener(peer: &SharedClientPeer, bind: SocketAddr) -> std::io::Result<SocketAddr> {
    let std_listener = std::net::TcpListener::bind(bind)?;
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    let bound = listener.local_addr()?;

    let accept_peer = Rc::clone(peer);
    tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((socket, remote)) => {
                    let peer = Rc::clone(&accept_peer);
                    let cleanup_peer = Rc::clone(&accept_peer);
                    let task = tokio::task::spawn_local(async move {
                        if let Err(error) = handle_connection(&peer, socket).await {
                            tracing::debug!("controller connection from {remote} closed: {error}");
                        }
                        // Reclaim the netsock: without this the `l` dump would list a dead
                        // controller client forever (spec.md §4.7's `l` command only ever dumps
                        // live sockets).
                        cleanup_peer.borrow_mut().controller_clients.retain(|c| c.peer_addr != remote);
                    });
                    accept_peer.borrow_mut().controller_clients.push(ControllerClientHandle {
                        peer_addr: remote,
                        abort: task.abort_handle(),
                    });
                }
                Err(error) => {
                    tracing::warn!("controller listener at {bound} accept failed: {error}");
                    break;
                }
            }
        }
    });

    tracing::info!("controller listening on {bound}");
    Ok(bound)
}

async fn handle_connection(peer: &SharedClientPeer, socket: TcpStream) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.strip_suffix('\r').unwrap_or(&line);
        if let Err(error) = handle_line(peer, line, &mut write_half).await {
            tracing::debug!("controller line {line:?} rejected: {error}");
            let _ = write_half.write_all(format!("error: {error}\n").as_bytes()).await;
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string()));
        }
    }
    Ok(())
}

async fn handle_line<W: AsyncWrite + Unpin>(peer: &SharedClientPeer, line: &str, out: &mut W) -> Result<(), ControllerError> {
    let mut chars = line.chars();
    let cmd = chars.next().ok_or(ControllerError::Empty)?;
    let rest = chars.as_str().trim_start();

    match cmd {
        'l' => write_list(peer, out).await.map_err(ControllerError::Io),
        's' => handle_socks5(peer, rest, out).await,
        't' => handle_forward(peer, rest, out, AddressFamily::Any).await,
        'x' => handle_process(peer, rest, out).await,
        'r' => handle_reverse(peer, rest, out).await,
        '-' => handle_remove(peer, rest, out).await,
        other => Err(ControllerError::UnknownCommand(other)),
    }
}

fn parse_port(token: &str) -> Result<u16, ControllerError> {
    match token.parse::<u16>() {
        Ok(0) | Err(_) => Err(ControllerError::InvalidPort(token.to_owned())),
        Ok(port) => Ok(port),
    }
}

fn next_arg<'a>(parts: &mut impl Iterator<Item = &'a str>, expected: usize, got: usize) -> Result<&'a str, ControllerError> {
    parts.next().ok_or(ControllerError::WrongArgCount { expected, got })
}

/// Parses a bind address from separate host/port tokens, avoiding the ambiguity of `host:port`
/// string concatenation with bare (unbracketed) IPv6 literals.
fn parse_local_addr(host: &str, port: u16) -> Result<SocketAddr, ControllerError> {
    let ip: std::net::IpAddr = host.parse().map_err(|_| ControllerError::InvalidAddress(host.to_owned()))?;
    Ok(SocketAddr::new(ip, port))
}

async fn reply<W: AsyncWrite + Unpin>(out: &mut W, line: &str) -> Result<(), ControllerError> {
    out.write_all(line.as_bytes()).await?;
    out.write_all(b"\n").await?;
    Ok(())
}

async fn handle_socks5<W: AsyncWrite + Unpin>(peer: &SharedClientPeer, rest: &str, out: &mut W) -> Result<(), ControllerError> {
    let mut parts = rest.split_whitespace();
    let host = next_arg(&mut parts, 2, 0)?;
    let port_tok = next_arg(&mut parts, 2, 1)?;
    let port = parse_port(port_tok)?;

    let bind = parse_local_addr(host, port)?;
    match socks5::install_listener(peer, bind) {
        Ok(bound) => reply(out, &format!("s5 {bound}")).await,
        Err(error) => reply(out, &format!("error: {error}")).await,
    }
}

async fn handle_forward<W: AsyncWrite + Unpin>(
    peer: &SharedClientPeer,
    rest: &str,
    out: &mut W,
    raf: AddressFamily,
) -> Result<(), ControllerError> {
    let mut parts = rest.split_whitespace();
    let lhost = next_arg(&mut parts, 4, 0)?;
    let lport_tok = next_arg(&mut parts, 4, 1)?;
    let rhost = next_arg(&mut parts, 4, 2)?;
    let rport_tok = next_arg(&mut parts, 4, 3)?;

    let lport = parse_port(lport_tok)?;
    let rport = parse_port(rport_tok)?;
    let lbind = parse_local_addr(lhost, lport)?;

    match install_forward_listener(peer, lbind, rhost.to_owned(), rport, raf) {
        Ok(bound) => reply(out, &format!("tun {bound} -> {rhost}:{rport}")).await,
        Err(error) => reply(out, &format!("error: {error}")).await,
    }
}

/// `x lhost lport cmdline`: the remote side of the tunnel request is left as a command line, sent
/// to the server with port=0 (spec.md §3's process sentinel, §4.8).
async fn handle_process<W: AsyncWrite + Unpin>(peer: &SharedClientPeer, rest: &str, out: &mut W) -> Result<(), ControllerError> {
    let (head, cmdline) = rest.split_once(char::is_whitespace).ok_or(ControllerError::WrongArgCount { expected: 3, got: 1 })?;
    let lhost = head;
    let cmdline = cmdline.trim_start();
    let (lport_tok, cmdline) = cmdline.split_once(char::is_whitespace).ok_or(ControllerError::WrongArgCount { expected: 3, got: 2 })?;
    let cmdline = cmdline.trim_start();
    if cmdline.is_empty() {
        return Err(ControllerError::WrongArgCount { expected: 3, got: 2 });
    }

    let lport = parse_port(lport_tok)?;
    let lbind = parse_local_addr(lhost, lport)?;

    match install_forward_listener(peer, lbind, cmdline.to_owned(), 0, AddressFamily::Any) {
        Ok(bound) => reply(out, &format!("tun {bound} -> exec {cmdline:?}")).await,
        Err(error) => reply(out, &format!("error: {error}")).await,
    }
}

async fn handle_reverse<W: AsyncWrite + Unpin>(peer: &SharedClientPeer, rest: &str, out: &mut W) -> Result<(), ControllerError> {
    let mut parts = rest.split_whitespace();
    let lhost = next_arg(&mut parts, 4, 0)?;
    let lport_tok = next_arg(&mut parts, 4, 1)?;
    let rhost = next_arg(&mut parts, 4, 2)?;
    let rport_tok = next_arg(&mut parts, 4, 3)?;

    let lport = parse_port(lport_tok)?;
    let rport = parse_port(rport_tok)?;

    match install_reverse_listener(peer, lhost.to_owned(), lport, rhost.to_owned(), rport) {
        Some(tid) => reply(out, &format!("rtun {tid} {lhost}:{lport} <- {rhost}:{rport}")).await,
        None => reply(out, "error: tunnel table full").await,
    }
}

/// `- lhost lport`: removes whichever forward listener or reverse listener marker is registered at
/// that local address.
async fn handle_remove<W: AsyncWrite + Unpin>(peer: &SharedClientPeer, rest: &str, out: &mut W) -> Result<(), ControllerError> {
    let mut parts = rest.split_whitespace();
    let lhost = next_arg(&mut parts, 2, 0)?;
    let lport_tok = next_arg(&mut parts, 2, 1)?;
    let lport = parse_port(lport_tok)?;
    let target = parse_local_addr(lhost, lport)?;

    let mut borrowed = peer.borrow_mut();
    if let Some(pos) = borrowed.forward_listeners.iter().position(|fl| fl.lhost == target) {
        let removed = borrowed.forward_listeners.swap_remove(pos);
        removed.abort.abort();
        drop(borrowed);
        return reply(out, &format!("removed {target}")).await;
    }

    if let Some(pos) = borrowed.socks5_listeners.iter().position(|s5| s5.bind == target) {
        let removed = borrowed.socks5_listeners.swap_remove(pos);
        removed.abort.abort();
        drop(borrowed);
        return reply(out, &format!("removed {target}")).await;
    }

    let reverse_tid = borrowed.table.iter().find_map(|(tid, entry)| match entry {
        ClientEntry::ReverseListener(rl) if rl.lhost == lhost && rl.lport == lport => Some(tid),
        _ => None,
    });
    if let Some(tid) = reverse_tid {
        borrowed.table.remove(tid);
        drop(borrowed);
        return reply(out, &format!("removed {target}")).await;
    }
    drop(borrowed);

    reply(out, &format!("not found: {target}")).await
}

/// Renders the `l` dump: one line per live socket, each formatted into a bounded inline buffer
/// (the Rust analogue of the original's fixed-size line buffer) before it's flushed to the wire,
/// terminated by a blank line. The tunnel table borrow is dropped before any `.await`.
async fn write_list<W: AsyncWrite + Unpin>(peer: &SharedClientPeer, out: &mut W) -> std::io::Result<()> {
    let lines = {
        let borrowed = peer.borrow();
        let mut lines: Vec<TinyString<255>> = Vec::new();

        for fl in &borrowed.forward_listeners {
            let mut line = TinyString::new();
            let _ = write!(line, "tun {} -> {}:{}", fl.lhost, fl.rhost, fl.rport);
            lines.push(line);
        }
        for s5 in &borrowed.socks5_listeners {
            let mut line = TinyString::new();
            let _ = write!(line, "s5 {}", s5.bind);
            lines.push(line);
        }
        for ctl in &borrowed.controller_clients {
            let mut line = TinyString::new();
            let _ = write!(line, "ctl {}", ctl.peer_addr);
            lines.push(line);
        }
        for (tid, entry) in borrowed.table.iter() {
            let mut line = TinyString::new();
            match entry {
                // Per spec.md §9's resolved open question: dump every tunnel client with its tid
                // regardless of state, showing the remote address only once the BIND answer fills
                // it in — never hide a socket just because it isn't Connected yet.
                ClientEntry::ReverseListener(rl) => {
                    let bound = rl.bound.map(|a| format!("{a:?}"));
                    let _ = write!(line, "{tid} rtunsrv {}:{} <- {}:{}", rl.lhost, rl.lport, rl.rhost, rl.rport);
                    if let Some(bound) = bound {
                        let _ = write!(line, " bound={bound}");
                    }
                }
                other => {
                    let state = other.state().map(|s| format!("{s:?}")).unwrap_or_else(|| "-".to_owned());
                    let _ = write!(line, "{tid} {} {state}", other.kind_str());
                }
            }
            lines.push(line);
        }
        lines
    };

    for line in lines {
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }
    out.write_all(b"\n").await
}
