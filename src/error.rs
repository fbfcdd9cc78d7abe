//! Error types for benchmark runs.
//!
//! Every failure a run can surface is a [`HarnessError`]. Concurrent units of
//! work funnel their failures into an [`ErrorSlot`], where the first error
//! wins and later ones are logged and dropped.

use crate::config::ConfigError;
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Result alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Boxed error from the HTTP stack.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while running a benchmark.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid configuration, detected before any socket is opened.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Binding the listening socket failed.
    #[error("failed to bind '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Resolving or dialing the target failed.
    #[error("failed to connect to '{addr}': {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dialing the target did not finish in time.
    #[error("connecting to '{addr}' timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// I/O failure of a single unit of work.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A peer sent something other than the marker message.
    #[error("msg contained unexpected data {0:?}")]
    UnexpectedPayload(String),

    /// An HTTP exchange failed below the status line.
    #[error("HTTP request failed: {0}")]
    Http(#[source] BoxError),

    /// The server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// In-flight work did not drain within the grace period.
    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// Closing a transport resource failed.
    #[error("shutdown failed: {0}")]
    Shutdown(#[source] io::Error),

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Broad class of a [`HarnessError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal before any run starts.
    Config,
    /// Fatal at startup: bind or dial failure.
    Setup,
    /// Failure of a single request, connection or datagram.
    Unit,
    /// Failure while gracefully closing.
    Shutdown,
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Config(_) => ErrorKind::Config,
            HarnessError::Bind { .. }
            | HarnessError::Connect { .. }
            | HarnessError::ConnectTimeout { .. } => ErrorKind::Setup,
            HarnessError::Io(_)
            | HarnessError::UnexpectedPayload(_)
            | HarnessError::Http(_)
            | HarnessError::HttpStatus(_)
            | HarnessError::Join(_) => ErrorKind::Unit,
            HarnessError::ShutdownTimeout(_) | HarnessError::Shutdown(_) => ErrorKind::Shutdown,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Config => 2,
            _ => 1,
        }
    }

    /// Build an [`HarnessError::UnexpectedPayload`] from raw bytes.
    pub fn unexpected_payload(payload: &[u8]) -> Self {
        HarnessError::UnexpectedPayload(String::from_utf8_lossy(payload).into_owned())
    }
}

/// Single-assignment slot holding the first error of a run.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    first: Mutex<Option<HarnessError>>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `err` if the slot is empty.
    ///
    /// Returns `true` when this call filled the slot.
    pub fn record(&self, err: HarnessError) -> bool {
        let mut first = self.first.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_some() {
            debug!(error = %err, "Discarding error after an earlier failure");
            return false;
        }
        *first = Some(err);
        true
    }

    #[cfg(test)]
    pub fn is_set(&self) -> bool {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Remove and return the recorded error.
    pub fn take(&self) -> Option<HarnessError> {
        self.first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Whether `err` means the socket was closed underneath a blocked call.
pub fn is_closed_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Classify an accept/receive error.
///
/// A "closed" error seen after cancellation was requested is the expected
/// result of tearing the listener down and is a clean stop. Anything else is
/// a real failure.
pub fn classify_accept_error(err: io::Error, cancelled: bool) -> Result<()> {
    if cancelled && is_closed_error(&err) {
        debug!(error = %err, "Listener closed after shutdown was requested");
        return Ok(());
    }
    Err(HarnessError::Io(err))
}
