//! Bounded work scheduling for the submit side.
//!
//! A [`WorkGroup`] launches units of work on their own tasks, holding at most
//! `limit` of them in flight. The first failure is kept and, with fail-fast
//! enabled, stops further launches. Already-launched work is never
//! interrupted; [`WorkGroup::wait`] lets it finish.

use super::status::Progress;
use super::RunSummary;
use crate::config::{Concurrency, SubmitConfig};
use crate::error::{ErrorSlot, HarnessError, Result};
use crate::transport::Submitter;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Concurrency-limited group of tasks with a first-error slot.
#[derive(Debug)]
pub struct WorkGroup {
    slots: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    errors: Arc<ErrorSlot>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    fail_fast: bool,
}

impl WorkGroup {
    /// The group stops launching when `parent` is cancelled.
    pub fn new(concurrency: Concurrency, fail_fast: bool, parent: &CancellationToken) -> Self {
        Self {
            slots: concurrency
                .limit()
                .map(|limit| Arc::new(Semaphore::new(limit))),
            tracker: TaskTracker::new(),
            cancel: parent.child_token(),
            errors: Arc::new(ErrorSlot::new()),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            fail_fast,
        }
    }

    /// Units of work currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of units ever running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait for a free slot, then run `work` on its own task.
    ///
    /// Returns `false` without launching once cancellation is observed.
    pub async fn spawn<F>(&self, work: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = match &self.slots {
            Some(slots) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                permit = Arc::clone(slots).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return false,
                },
            },
            None => None,
        };

        if self.cancel.is_cancelled() {
            return false;
        }

        let running = InFlight::enter(&self.active);
        self.peak.fetch_max(running.count(), Ordering::SeqCst);

        let errors = Arc::clone(&self.errors);
        let cancel = self.cancel.clone();
        let fail_fast = self.fail_fast;

        self.tracker.spawn(async move {
            // A panicking unit comes back as a JoinError instead of vanishing
            let result = match tokio::spawn(work).await {
                Ok(result) => result,
                Err(e) => Err(HarnessError::from(e)),
            };

            if let Err(e) = result {
                debug!(error = %e, "Unit of work failed");
                // Stop launches before the slot frees up for a new one
                if errors.record(e) && fail_fast {
                    cancel.cancel();
                }
            }

            drop(running);
            drop(permit);
        });

        true
    }

    /// Wait for every launched unit, then return the first error, if any.
    pub async fn wait(self) -> Result<()> {
        self.tracker.close();
        self.tracker.wait().await;

        match self.errors.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Holds one slot of the in-flight count until dropped.
struct InFlight {
    active: Arc<AtomicUsize>,
    count: usize,
}

impl InFlight {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            active: Arc::clone(active),
            count,
        }
    }

    /// In-flight count right after this unit entered.
    fn count(&self) -> usize {
        self.count
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Submit units of work until `cancel` fires.
pub async fn submit<S>(
    submitter: Arc<S>,
    config: SubmitConfig,
    progress: Progress,
    cancel: &CancellationToken,
) -> Result<RunSummary>
where
    S: Submitter,
{
    info!(
        addr = submitter.target(),
        workers = %config.concurrency,
        fail_fast = config.fail_fast,
        "Starting to submit"
    );
    progress.console().print(format_args!(
        "Starting to submit to host '{}' with {} workers...\n",
        submitter.target(),
        config.concurrency
    ));

    let group = WorkGroup::new(config.concurrency, config.fail_fast, cancel);

    loop {
        let unit = {
            let submitter = Arc::clone(&submitter);
            let progress = progress.clone();
            async move {
                submitter.submit_once().await?;
                progress.record();
                Ok::<(), HarnessError>(())
            }
        };

        if !group.spawn(unit).await {
            break;
        }

        // Let other tasks (and cancellation) run between launches
        tokio::task::yield_now().await;
    }

    progress.console().print(format_args!("\nStopping...\n"));
    debug!(active = group.active(), "Waiting for in-flight work");
    let peak = group.peak();
    let result = group.wait().await;
    progress.console().print(format_args!("\nDone.\n"));

    let summary = RunSummary {
        total: progress.total(),
    };
    match &result {
        Ok(()) => info!(
            total = summary.total,
            rate = progress.rate(),
            peak,
            "Submit finished"
        ),
        Err(e) => warn!(total = summary.total, peak, error = %e, "Submit failed"),
    }
    result.map(|()| summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::status::Console;
    use async_trait::async_trait;
    use std::num::NonZeroUsize;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    fn limited(n: usize) -> Concurrency {
        Concurrency::Limited(NonZeroUsize::new(n).unwrap())
    }

    /// Sleeps briefly and records the highest concurrency it observed.
    struct SlowSubmitter {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
        calls: AtomicU64,
        fail_on: Option<u64>,
    }

    impl SlowSubmitter {
        fn new(fail_on: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                in_flight: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
                calls: AtomicU64::new(0),
                fail_on,
            })
        }
    }

    #[async_trait]
    impl Submitter for SlowSubmitter {
        async fn submit_once(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(2)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail_on == Some(call) {
                return Err(HarnessError::HttpStatus(500));
            }
            Ok(())
        }

        fn target(&self) -> &str {
            "test"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limit_is_never_exceeded() {
        let submitter = SlowSubmitter::new(None);
        let cancel = CancellationToken::new();
        let progress = Progress::new("Submitted", Console::sink());

        let run = {
            let submitter = Arc::clone(&submitter);
            let progress = progress.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let config = SubmitConfig {
                    concurrency: limited(3),
                    fail_fast: true,
                };
                submit(submitter, config, progress, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let summary = run.await.unwrap().unwrap();

        assert!(summary.total > 0);
        assert!(submitter.max_seen.load(Ordering::SeqCst) <= 3);
        // Every launched unit finished and was counted exactly once
        assert_eq!(summary.total, submitter.calls.load(Ordering::SeqCst));
        assert_eq!(summary.total, progress.total());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unlimited_does_not_block_on_slots() {
        let cancel = CancellationToken::new();
        let group = WorkGroup::new(Concurrency::Unlimited, true, &cancel);
        let release = CancellationToken::new();

        // Far more blocked units than any default limit
        for _ in 0..64 {
            let release = release.clone();
            assert!(
                group
                    .spawn(async move {
                        release.cancelled().await;
                        Ok(())
                    })
                    .await
            );
        }
        assert_eq!(group.active(), 64);

        release.cancel();
        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_blocks_until_slot_frees() {
        let cancel = CancellationToken::new();
        let group = WorkGroup::new(limited(1), true, &cancel);
        let release = CancellationToken::new();

        let blocker = release.clone();
        assert!(
            group
                .spawn(async move {
                    blocker.cancelled().await;
                    Ok(())
                })
                .await
        );

        // No free slot: the second launch waits
        let second = tokio::time::timeout(Duration::from_millis(50), group.spawn(async { Ok(()) }));
        assert!(second.await.is_err());
        assert_eq!(group.active(), 1);

        release.cancel();
        assert!(group.spawn(async { Ok(()) }).await);
        let peak = group.peak();
        group.wait().await.unwrap();
        assert_eq!(peak, 1);
    }

    async fn explode() -> Result<()> {
        panic!("unit of work blew up")
    }

    #[tokio::test]
    async fn test_panicking_unit_is_reported() {
        let cancel = CancellationToken::new();
        let group = WorkGroup::new(limited(2), true, &cancel);
        let active = Arc::clone(&group.active);

        assert!(group.spawn(explode()).await);
        group.cancel.cancelled().await;
        assert!(!group.spawn(async { Ok(()) }).await);

        match group.wait().await {
            Err(HarnessError::Join(e)) => assert!(e.is_panic()),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_stops_launches() {
        let cancel = CancellationToken::new();
        let group = WorkGroup::new(limited(2), true, &cancel);

        assert!(group.spawn(async { Err(HarnessError::HttpStatus(500)) }).await);
        group.cancel.cancelled().await;
        assert!(!group.spawn(async { Ok(()) }).await);
        // The parent run signal is untouched
        assert!(!cancel.is_cancelled());

        match group.wait().await {
            Err(HarnessError::HttpStatus(500)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_without_fail_fast_errors_do_not_stop_launches() {
        let cancel = CancellationToken::new();
        let group = WorkGroup::new(limited(1), false, &cancel);

        assert!(group.spawn(async { Err(HarnessError::HttpStatus(502)) }).await);
        assert!(group.spawn(async { Err(HarnessError::HttpStatus(503)) }).await);
        assert!(group.spawn(async { Ok(()) }).await);

        match group.wait().await {
            Err(HarnessError::HttpStatus(502)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_fail_fast_reports_first_error() {
        let submitter = SlowSubmitter::new(Some(5));
        let cancel = CancellationToken::new();
        let progress = Progress::new("Submitted", Console::sink());
        let config = SubmitConfig {
            concurrency: limited(1),
            fail_fast: true,
        };

        let result = submit(Arc::clone(&submitter), config, progress.clone(), &cancel).await;

        assert!(matches!(result, Err(HarnessError::HttpStatus(500))));
        assert_eq!(progress.total(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_launches_nothing() {
        let submitter = SlowSubmitter::new(None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let config = SubmitConfig {
            concurrency: limited(3),
            fail_fast: true,
        };
        let summary = submit(
            Arc::clone(&submitter),
            config,
            Progress::new("Submitted", Console::sink()),
            &cancel,
        )
        .await
        .unwrap();

        assert_eq!(summary.total, 0);
        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
    }
}
