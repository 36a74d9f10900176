//! SOCKS5 front-end (spec.md §4.6): the usual `Atyp`/reply-status enums and read/write helpers,
//! but a successful CONNECT issues a tunnel CONN frame over the mux channel and awaits its answer
//! via a oneshot (`r2t_core::client::open_socks5_tunnel`) instead of opening a local connection
//! directly.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    rc::Rc,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use r2t_proto::{AddressFamily, ConnAddr};

use crate::{
    client::{drop_tunnel, mark_connected, open_socks5_tunnel, run_local_socket},
    peer::{SharedClientPeer, Socks5ListenerHandle},
};

const VERSION: u8 = 5;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Atyp {
    IPv4 = 1,
    Domainname = 3,
    IPv6 = 4,
}

impl Atyp {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::IPv4),
            3 => Some(Self::Domainname),
            4 => Some(Self::IPv6),
            _ => None,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Reply {
    Succeeded = 0,
    GeneralFailure = 1,
    CommandNotSupported = 7,
    AtypNotSupported = 8,
}

/// Binds a SOCKS5 listener (the controller's `s` command) and spawns its accept loop.
pub fn install_listener(peer: &SharedClientPeer, bind: SocketAddr) -> std::io::Result<SocketAddr> {
    let std_listener = std::net::TcpListener::bind(bind)?;
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    let bound = listener.local_addr()?;

    let accept_peer = Rc::clone(peer);
    let task = tokio::task::spawn_local(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _remote)) => {
                    let peer = Rc::clone(&accept_peer);
                    tokio::task::spawn_local(async move {
                        if let Err(error) = handle_connection(peer, socket).await {
                            tracing::debug!("SOCKS5 connection ended: {error}");
                        }
                    });
                }
                Err(error) => {
                    tracing::warn!("SOCKS5 listener at {bound} accept failed: {error}");
                    break;
                }
            }
        }
    });

    peer.borrow_mut().socks5_listeners.push(Socks5ListenerHandle { bind: bound, abort: task.abort_handle() });
    Ok(bound)
}

async fn handle_connection(peer: SharedClientPeer, mut socket: TcpStream) -> std::io::Result<()> {
    negotiate_auth(&mut socket).await?;
    let (af, hostname, port) = read_connect_request(&mut socket).await?;

    let Some((tid, answer_rx, data_rx)) = open_socks5_tunnel(&peer, af, hostname, port) else {
        send_reply(&mut socket, Reply::GeneralFailure, ConnAddr::V4(Ipv4Addr::UNSPECIFIED), 0).await?;
        return Err(protocol_error("tunnel table full"));
    };

    let answer = match answer_rx.await {
        Ok(answer) => answer,
        Err(_) => {
            drop_tunnel(&peer, tid);
            send_reply(&mut socket, Reply::GeneralFailure, ConnAddr::V4(Ipv4Addr::UNSPECIFIED), 0).await?;
            return Err(protocol_error("tunnel dropped before an answer arrived"));
        }
    };

    if !answer.is_success() {
        drop_tunnel(&peer, tid);
        send_reply(&mut socket, Reply::GeneralFailure, ConnAddr::V4(Ipv4Addr::UNSPECIFIED), 0).await?;
        return Err(protocol_error(format!("server refused CONNECT: {}", answer.err)));
    }

    let addr = answer.addr.unwrap_or(ConnAddr::V4(Ipv4Addr::UNSPECIFIED));
    send_reply(&mut socket, Reply::Succeeded, addr, answer.port).await?;
    mark_connected(&peer, tid);

    run_local_socket(peer, tid, socket, data_rx).await;
    Ok(())
}

/// Authenticating state (spec.md §4.6): read `[ver, nmethods, methods...]`, require `noauth` among
/// the offered methods, reply `[5, 0]`.
async fn negotiate_auth<S: AsyncRead + AsyncWrite + Unpin>(socket: &mut S) -> std::io::Result<()> {
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(protocol_error(format!("unsupported SOCKS version {}", header[0])));
    }

    let mut methods = vec![0u8; header[1] as usize];
    socket.read_exact(&mut methods).await?;
    if !methods.contains(&0) {
        socket.write_all(&[VERSION, 0xff]).await?;
        return Err(protocol_error("no acceptable authentication method"));
    }

    socket.write_all(&[VERSION, 0]).await?;
    Ok(())
}

/// Authenticated state (spec.md §4.6): read `[5, cmd, 0, atyp, addr, port]`; only `cmd=connect`
/// is supported.
async fn read_connect_request<S: AsyncRead + AsyncWrite + Unpin>(socket: &mut S) -> std::io::Result<(AddressFamily, String, u16)> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(protocol_error(format!("unexpected version byte {} in request", header[0])));
    }

    if header[1] != 1 {
        send_reply(socket, Reply::CommandNotSupported, ConnAddr::V4(Ipv4Addr::UNSPECIFIED), 0).await?;
        return Err(protocol_error(format!("unsupported SOCKS5 command {}", header[1])));
    }

    let atyp = match Atyp::from_u8(header[3]) {
        Some(atyp) => atyp,
        None => {
            send_reply(socket, Reply::AtypNotSupported, ConnAddr::V4(Ipv4Addr::UNSPECIFIED), 0).await?;
            return Err(protocol_error(format!("unsupported SOCKS5 address type {}", header[3])));
        }
    };

    let (af, hostname) = match atyp {
        Atyp::IPv4 => {
            let mut octets = [0u8; 4];
            socket.read_exact(&mut octets).await?;
            (AddressFamily::V4, Ipv4Addr::from(octets).to_string())
        }
        Atyp::IPv6 => {
            let mut octets = [0u8; 16];
            socket.read_exact(&mut octets).await?;
            (AddressFamily::V6, Ipv6Addr::from(octets).to_string())
        }
        Atyp::Domainname => {
            let len = socket.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            socket.read_exact(&mut name).await?;
            let name = String::from_utf8(name).map_err(|_| protocol_error("domain name is not valid UTF-8"))?;
            (AddressFamily::Any, name)
        }
    };

    let port = socket.read_u16().await?;
    if port == 0 {
        send_reply(socket, Reply::GeneralFailure, ConnAddr::V4(Ipv4Addr::UNSPECIFIED), 0).await?;
        return Err(protocol_error("port must be nonzero"));
    }

    Ok((af, hostname, port))
}

fn encode_reply(status: Reply, addr: ConnAddr, port: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    buf.push(VERSION);
    buf.push(status as u8);
    buf.push(0);
    match addr {
        ConnAddr::V4(ip) => {
            buf.push(Atyp::IPv4 as u8);
            buf.extend_from_slice(&ip.octets());
        }
        ConnAddr::V6(ip) => {
            buf.push(Atyp::IPv6 as u8);
            buf.extend_from_slice(&ip.octets());
        }
        ConnAddr::Pid(_) => {
            buf.push(Atyp::IPv4 as u8);
            buf.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
        }
    }
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

async fn send_reply<S: AsyncWrite + Unpin>(socket: &mut S, status: Reply, addr: ConnAddr, port: u16) -> std::io::Result<()> {
    socket.write_all(&encode_reply(status, addr, port)).await
}

fn protocol_error(msg: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.into())
}
