//! UDP transport.
//!
//! The submitter shares one connected socket between all workers and sends
//! one [`MARKER`] datagram per unit of work. The listener has no connection
//! lifecycle: every record of every datagram is validated and counted on its
//! own.

use super::{resolve, PacketSource, Submitter, MARKER};
use crate::config::TargetConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::trace;

/// Bind a UDP socket with `SO_REUSEADDR`.
pub(crate) fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// Sends one datagram per unit of work.
#[derive(Debug)]
pub struct UdpSubmitter {
    socket: UdpSocket,
    target: String,
}

impl UdpSubmitter {
    pub async fn new(target: &TargetConfig) -> Result<Self> {
        let addr = resolve(&target.addr()).await?;
        let local: SocketAddr = match addr {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let connect = |source| HarnessError::Connect {
            addr: target.addr(),
            source,
        };

        let socket = UdpSocket::bind(local).await.map_err(connect)?;
        tokio::time::timeout(target.timeout, socket.connect(addr))
            .await
            .map_err(|_| HarnessError::ConnectTimeout {
                addr: target.addr(),
                timeout: target.timeout,
            })?
            .map_err(connect)?;

        Ok(Self {
            socket,
            target: target.addr(),
        })
    }
}

#[async_trait]
impl Submitter for UdpSubmitter {
    async fn submit_once(&self) -> Result<()> {
        self.socket.send(MARKER).await?;
        Ok(())
    }

    fn target(&self) -> &str {
        &self.target
    }
}

/// Receives marker datagrams.
#[derive(Debug)]
pub struct PacketListener {
    socket: UdpSocket,
}

impl PacketListener {
    pub async fn bind(target: &TargetConfig) -> Result<Self> {
        let addr = resolve(&target.addr()).await?;
        let socket = bind_socket(addr).map_err(|source| HarnessError::Bind {
            addr: target.addr(),
            source,
        })?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl PacketSource for PacketListener {
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (n, peer) = self.socket.recv_from(buf).await?;
        trace!(peer = %peer, len = n, "Received datagram");
        Ok(n)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
