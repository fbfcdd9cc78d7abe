//! Shutdown coordination.
//!
//! ```text
//! Running -> ShuttingDown -> Stopped
//!    \            \
//!     `------------`-------> Failed
//! ```
//!
//! The coordinator owns the run's cancellation token. Entering
//! `ShuttingDown` cancels it (idempotently) and runs a transport-specific
//! close future within a grace period. If the grace period elapses, the force
//! token fires so that remaining handlers drop their connections.

use super::status::Console;
use crate::error::{HarnessError, Result};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Failed)
    }
}

/// Drives a run from `Running` to a terminal phase.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    force: CancellationToken,
    grace: Duration,
    phase: Mutex<Phase>,
    console: Console,
}

impl ShutdownCoordinator {
    pub fn new(cancel: CancellationToken, grace: Duration, console: Console) -> Self {
        Self {
            cancel,
            force: CancellationToken::new(),
            grace,
            phase: Mutex::new(Phase::Running),
            console,
        }
    }

    /// Run signal observed by every component.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fires when the grace period elapsed without a clean drain.
    pub fn force_token(&self) -> &CancellationToken {
        &self.force
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Request shutdown. Safe to call any number of times.
    pub fn trigger(&self) {
        self.cancel.cancel();
    }

    /// Mark the run failed without draining, e.g. after a setup error.
    pub fn fail(&self) {
        self.cancel.cancel();
        self.transition(Phase::Failed);
    }

    /// Enter `ShuttingDown` and run `close` within the grace period.
    pub async fn drain<F>(&self, close: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        self.transition(Phase::ShuttingDown);
        self.cancel.cancel();

        info!(grace = ?self.grace, "Shutting down");
        self.console
            .print(format_args!("\nShutting down (timeout {:?})...\n", self.grace));

        match tokio::time::timeout(self.grace, close).await {
            Ok(result) => result,
            Err(_) => {
                warn!(grace = ?self.grace, "Grace period elapsed, forcing close");
                self.force.cancel();
                Err(HarnessError::ShutdownTimeout(self.grace))
            }
        }
    }

    /// Settle the final result and enter a terminal phase.
    ///
    /// `substantive` is the first failure of the run itself; `drained` is
    /// the outcome of [`ShutdownCoordinator::drain`].
    pub fn finish(&self, substantive: Option<HarnessError>, drained: Result<()>) -> Result<()> {
        let outcome = reconcile(substantive, drained);
        self.transition(if outcome.is_ok() {
            Phase::Stopped
        } else {
            Phase::Failed
        });
        self.console.print(format_args!("\nDone.\n"));
        outcome
    }

    fn transition(&self, next: Phase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if phase.is_terminal() {
            return;
        }
        debug!(from = ?*phase, to = ?next, "Shutdown phase change");
        *phase = next;
    }
}

/// A shutdown-phase error never masks an earlier substantive failure.
pub fn reconcile(substantive: Option<HarnessError>, drained: Result<()>) -> Result<()> {
    match (substantive, drained) {
        (Some(err), Err(later)) => {
            debug!(error = %later, "Shutdown error masked by earlier failure");
            Err(err)
        }
        (Some(err), Ok(())) => Err(err),
        (None, drained) => drained,
    }
}
