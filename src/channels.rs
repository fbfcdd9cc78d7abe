//! In-process channel loop.
//!
//! Measures how fast unit messages cross a tokio mpsc channel. There is a
//! single consumer, so counting uses the unsynchronised [`RateWindow`].

use crate::analytics::{unix_now, RateWindow};
use crate::error::{HarnessError, Result};
use crate::harness::status::report_line;
use crate::harness::{Console, RunSummary, StatusReporter};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Messages buffered between producer and consumer.
const CHANNEL_CAPACITY: usize = 1024;

/// Loop messages through a channel until `cancel` fires.
///
/// Cancellation stops the producer; the consumer drains whatever is still
/// queued, so every sent message is counted.
pub async fn run(
    console: Console,
    status: Arc<StatusReporter>,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let (_sent, summary) = loop_messages(console, status, cancel).await?;
    Ok(summary)
}

/// Run the loop, returning how many messages the producer sent alongside
/// what the consumer counted.
async fn loop_messages(
    console: Console,
    status: Arc<StatusReporter>,
    cancel: &CancellationToken,
) -> Result<(u64, RunSummary)> {
    info!(capacity = CHANNEL_CAPACITY, "Starting channel loop");
    console.print(format_args!("Starting to loop...\n"));

    let (tx, mut rx) = mpsc::channel::<()>(CHANNEL_CAPACITY);
    let producer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    result = tx.send(()) => {
                        if result.is_err() {
                            break;
                        }
                        sent += 1;
                    }
                }
            }
            sent
        })
    };

    let mut window = RateWindow::new();
    while rx.recv().await.is_some() {
        status.reset();
        let (total, rate) = window.incr_for_time(unix_now());
        report_line(&console, "Looped", total, rate);
    }

    console.print(format_args!("\nStopping...\n"));
    let sent = producer.await.map_err(HarnessError::from)?;
    console.print(format_args!("\nDone.\n"));

    info!(sent, total = window.total(), "Channel loop finished");
    Ok((
        sent,
        RunSummary {
            total: window.total(),
        },
    ))
}
