//! Socket plumbing and runtime errors.
//!
//! Both endpoints speak IPv6 UDP with `SO_REUSEADDR` and `IPV6_V6ONLY`
//! set. The sender connects to the first address the peer name resolves
//! to; the receiver only binds here and connects later, once the
//! handshake has identified the sending peer.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};

/// Conditions that abort a transfer.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no usable IPv6 address for [{0}]:{1}")]
    NoAddress(String, u16),

    #[error("the peer stopped responding (too many consecutive retransmission timeouts)")]
    RetransmitLimit,

    #[error("no I/O activity within the idle window")]
    IdleTimeout,

    #[error("could not obtain the initial chunk from any peer")]
    HandshakeFailed,
}

fn new_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransferError> {
    log::debug!("resolving [{host}]:{port}");
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await?
        .filter(SocketAddr::is_ipv6)
        .collect();
    if addrs.is_empty() {
        return Err(TransferError::NoAddress(host.to_owned(), port));
    }
    Ok(addrs)
}

/// Opens a socket connected to `[host]:port`, trying the resolved
/// addresses in order.
pub async fn connect(host: &str, port: u16) -> Result<UdpSocket, TransferError> {
    let mut last_err = None;
    for addr in resolve(host, port).await? {
        let socket = new_socket()?;
        match socket.connect(&addr.into()) {
            Ok(()) => {
                log::info!("sending to [{addr}]");
                return Ok(UdpSocket::from_std(socket.into())?);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => TransferError::Io(err),
        None => TransferError::NoAddress(host.to_owned(), port),
    })
}

/// Opens a socket bound to `[host]:port`, trying the resolved addresses
/// in order.
pub async fn bind(host: &str, port: u16) -> Result<UdpSocket, TransferError> {
    let mut last_err = None;
    for addr in resolve(host, port).await? {
        let socket = new_socket()?;
        match socket.bind(&addr.into()) {
            Ok(()) => {
                log::info!("listening on [{addr}]");
                return Ok(UdpSocket::from_std(socket.into())?);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(match last_err {
        Some(err) => TransferError::Io(err),
        None => TransferError::NoAddress(host.to_owned(), port),
    })
}
