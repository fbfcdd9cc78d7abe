//! Console output and idle status reporting.
//!
//! Progress lines are user-facing output, not logs: they are written to a
//! [`Console`] (stdout in production) and a failed write never aborts a run.

use crate::analytics::{unix_now, RateCounter};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default idle reporting interval.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Clears the current terminal line before the idle indicator.
const WAITING: &str = "\r\x1b[2KWaiting...";

/// Shared, best-effort output sink.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// A console that discards everything.
    pub fn sink() -> Self {
        Self::new(io::sink())
    }

    /// Write and flush `args`, ignoring output failures.
    pub fn print(&self, args: fmt::Arguments<'_>) {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = out.write_fmt(args).and_then(|()| out.flush()) {
            trace!(error = %e, "Console write failed");
        }
    }
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console").finish_non_exhaustive()
    }
}

/// Print a `<label>. Total: N. Rate: R/second` progress line.
pub fn report_line(console: &Console, label: &str, total: u64, rate: u64) {
    console.print(format_args!("\r{label}. Total: {total}. Rate: {rate}/second"));
}

/// Periodically prints an idle indicator while nothing completes.
///
/// Every completed unit of work calls [`StatusReporter::reset`], which
/// restarts the interval.
#[derive(Debug)]
pub struct StatusReporter {
    interval: Duration,
    reset: Notify,
    idle_ticks: AtomicU64,
    console: Console,
}

impl StatusReporter {
    pub fn new(interval: Duration, console: Console) -> Self {
        Self {
            interval,
            reset: Notify::new(),
            idle_ticks: AtomicU64::new(0),
            console,
        }
    }

    /// Restart the idle interval.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    /// Number of idle indications emitted so far.
    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    /// Tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.reset.notified() => continue,
                _ = tokio::time::sleep(self.interval) => {
                    self.idle_ticks.fetch_add(1, Ordering::Relaxed);
                    self.console.print(format_args!("{WAITING}"));
                }
            }
        }
    }

    /// Run on a background task.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move { reporter.run(cancel).await })
    }
}

/// Counts completed units of work and reports each one.
#[derive(Debug, Clone)]
pub struct Progress {
    label: &'static str,
    counter: Arc<RateCounter>,
    status: Option<Arc<StatusReporter>>,
    console: Console,
}

impl Progress {
    pub fn new(label: &'static str, console: Console) -> Self {
        Self {
            label,
            counter: Arc::new(RateCounter::new()),
            status: None,
            console,
        }
    }

    /// Reset `status` on every completion.
    pub fn with_status(mut self, status: Arc<StatusReporter>) -> Self {
        self.status = Some(status);
        self
    }

    /// Count one successful unit of work now.
    pub fn record(&self) -> (u64, u64) {
        let (total, rate) = self.counter.incr_for_time(unix_now());
        if let Some(status) = &self.status {
            status.reset();
        }
        report_line(&self.console, self.label, total, rate);
        (total, rate)
    }

    pub fn total(&self) -> u64 {
        self.counter.total()
    }

    pub fn rate(&self) -> u64 {
        self.counter.rate()
    }

    pub fn console(&self) -> &Console {
        &self.console
    }
}
