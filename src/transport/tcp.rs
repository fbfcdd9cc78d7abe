//! Raw TCP transport.
//!
//! Each unit of work is one short-lived connection: the submitter connects,
//! writes [`MARKER`], half-closes, and waits for the server to close its side.
//! The server reads every connection to EOF and counts it once if the
//! payload is exactly the marker.

use super::{
    resolve, validate_payload, Connection, Listener, ServeContext, Submitter, MARKER, MAX_PAYLOAD,
};
use crate::config::TargetConfig;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, trace};

/// Listen backlog for server sockets.
const LISTEN_BACKLOG: i32 = 1024;

/// Enable keep-alive probes after `idle`, or disable them.
pub(crate) fn set_keepalive(socket: SockRef<'_>, keep_alive: Option<Duration>) -> io::Result<()> {
    match keep_alive {
        Some(idle) => socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle)),
        None => socket.set_keepalive(false),
    }
}

/// Bind a TCP listener with `SO_REUSEADDR` so restarts don't wait out TIME_WAIT.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Resolve and bind the target address.
pub(crate) async fn bind_target(target: &TargetConfig) -> Result<TcpListener> {
    let addr = resolve(&target.addr()).await?;
    bind_listener(addr).map_err(|source| HarnessError::Bind {
        addr: target.addr(),
        source,
    })
}

/// Read `stream` to EOF, bounded by [`MAX_PAYLOAD`].
pub(crate) async fn read_payload<S>(stream: &mut S) -> Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    let mut payload = BytesMut::with_capacity(MARKER.len());
    loop {
        let n = stream.read_buf(&mut payload).await?;
        if n == 0 {
            return Ok(payload);
        }
        if payload.len() > MAX_PAYLOAD {
            // Oversized can never match; stop reading and report what we have
            return Err(HarnessError::unexpected_payload(&payload[..64]));
        }
    }
}

/// Opens one connection per unit of work.
#[derive(Debug)]
pub struct TcpSubmitter {
    addr: SocketAddr,
    target: String,
    timeout: Duration,
    keep_alive: Option<Duration>,
}

impl TcpSubmitter {
    pub async fn new(target: &TargetConfig) -> Result<Self> {
        let addr = resolve(&target.addr()).await?;
        Ok(Self {
            addr,
            target: target.addr(),
            timeout: target.timeout,
            keep_alive: target.keep_alive(),
        })
    }

    async fn connect(&self) -> Result<TcpStream> {
        let socket = match self.addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        set_keepalive(SockRef::from(&socket), self.keep_alive)?;

        tokio::time::timeout(self.timeout, socket.connect(self.addr))
            .await
            .map_err(|_| HarnessError::ConnectTimeout {
                addr: self.target.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| HarnessError::Connect {
                addr: self.target.clone(),
                source,
            })
    }
}

#[async_trait]
impl Submitter for TcpSubmitter {
    async fn submit_once(&self) -> Result<()> {
        let mut stream = self.connect().await?;

        stream.write_all(MARKER).await?;
        stream.shutdown().await?;

        // The server closes once it has read and counted the payload
        let mut rest = [0u8; 16];
        tokio::time::timeout(self.timeout, stream.read(&mut rest))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "waiting for server close"))??;

        Ok(())
    }

    fn target(&self) -> &str {
        &self.target
    }
}

/// Accepts marker connections.
#[derive(Debug)]
pub struct PingListener {
    listener: TcpListener,
    keep_alive: Option<Duration>,
}

impl PingListener {
    pub async fn bind(target: &TargetConfig) -> Result<Self> {
        Ok(Self {
            listener: bind_target(target).await?,
            keep_alive: target.keep_alive(),
        })
    }
}

#[async_trait]
impl Listener for PingListener {
    type Conn = PingConnection;

    async fn accept(&mut self) -> io::Result<PingConnection> {
        let (stream, peer) = self.listener.accept().await?;
        trace!(peer = %peer, "Accepted connection");

        if let Err(e) = set_keepalive(SockRef::from(&stream), self.keep_alive) {
            debug!(peer = %peer, error = %e, "Failed to set keep-alive");
        }

        Ok(PingConnection::new(stream))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// One accepted marker connection.
#[derive(Debug)]
pub struct PingConnection<S = TcpStream> {
    stream: S,
}

impl<S> PingConnection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Connection for PingConnection<S>
where
    S: AsyncRead + Unpin + Send + 'static,
{
    async fn serve(mut self, ctx: ServeContext) -> Result<()> {
        let payload = read_payload(&mut self.stream).await?;
        validate_payload(&payload)?;
        ctx.progress.record();
        // Dropping the stream tells the submitter we are done
        Ok(())
    }
}
