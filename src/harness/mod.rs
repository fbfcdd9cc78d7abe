//! Protocol-independent run machinery: the submit scheduler, the serve loops,
//! shutdown coordination and progress output.

pub mod scheduler;
pub mod serve;
pub mod shutdown;
pub mod status;

pub use scheduler::submit;
pub use serve::{listen_packets, serve};
pub use shutdown::ShutdownCoordinator;
pub use status::{Console, Progress, StatusReporter, STATUS_INTERVAL};

/// Outcome of a run that finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Units of work counted by this process.
    pub total: u64,
}
