//! Transport adapters.
//!
//! The harness is written once against these traits; each benchmarked
//! protocol supplies the socket work:
//! - `tcp`: one connection per unit, carrying the marker message
//! - `udp`: one datagram per unit, validated per newline-terminated record
//! - `http1`: one HTTP/1.x request per unit
//!
//! ## Marker Format
//!
//! ```text
//! TCP payload:  Ping!\n            (whole connection, read to EOF)
//! UDP records:  Ping!\nPing!\n...  (each record must be "Ping!")
//! ```

pub mod http1;
pub mod tcp;
pub mod udp;

use crate::error::{HarnessError, Result};
use crate::harness::Progress;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Message every unit of work carries.
pub const MARKER: &[u8] = b"Ping!\n";

/// [`MARKER`] without its line terminator.
pub const MARKER_RECORD: &[u8] = b"Ping!";

/// Upper bound on a single TCP payload.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Receive buffer for datagram transports.
pub const DATAGRAM_BUFFER: usize = 64 * 1024;

/// Bytes of an oversized payload quoted in errors.
const QUOTE_LIMIT: usize = 64;

/// Check that a whole connection payload is exactly the marker.
pub fn validate_payload(payload: &[u8]) -> Result<()> {
    if payload == MARKER {
        Ok(())
    } else {
        Err(HarnessError::unexpected_payload(
            &payload[..payload.len().min(QUOTE_LIMIT)],
        ))
    }
}

/// Check one datagram record (line terminator already removed).
pub fn validate_record(record: &[u8]) -> Result<()> {
    if record == MARKER_RECORD {
        Ok(())
    } else {
        Err(HarnessError::unexpected_payload(
            &record[..record.len().min(QUOTE_LIMIT)],
        ))
    }
}

/// Split a datagram into newline-terminated records.
///
/// A missing final newline still ends a record, `\r\n` endings are
/// accepted, and an empty datagram holds no records.
pub fn records(datagram: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    let body = datagram.strip_suffix(b"\n").unwrap_or(datagram);
    body.split(|&b| b == b'\n')
        .take(if datagram.is_empty() { 0 } else { usize::MAX })
        .map(|record| record.strip_suffix(b"\r").unwrap_or(record))
}

/// What an accepted connection needs from the harness.
#[derive(Debug, Clone)]
pub struct ServeContext {
    /// Counts each validated unit of work.
    pub progress: Progress,
    /// Fires when the server starts shutting down.
    pub shutdown: CancellationToken,
}

/// Performs one outgoing unit of work.
#[async_trait]
pub trait Submitter: Send + Sync + 'static {
    /// Connect, send the marker, and close.
    async fn submit_once(&self) -> Result<()>;

    /// Human-readable target, for progress output.
    fn target(&self) -> &str;
}

/// A bound connection-oriented listener.
#[async_trait]
pub trait Listener: Send + Sized + 'static {
    type Conn: Connection;

    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<Self::Conn>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Release the listening socket.
    async fn close(self) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

/// One accepted connection.
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    /// Drive the connection to completion, recording each valid unit.
    async fn serve(self, ctx: ServeContext) -> Result<()>;
}

/// A bound packet-oriented socket.
#[async_trait]
pub trait PacketSource: Send + Sized + 'static {
    /// Wait for the next datagram, returning its length.
    async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Release the socket.
    async fn close(self) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

/// Resolve `addr` to its first socket address.
pub(crate) async fn resolve(addr: &str) -> Result<SocketAddr> {
    let mut addrs =
        tokio::net::lookup_host(addr)
            .await
            .map_err(|source| HarnessError::Connect {
                addr: addr.to_string(),
                source,
            })?;

    addrs.next().ok_or_else(|| HarnessError::Connect {
        addr: addr.to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"),
    })
}
