//! Serve-side loops.
//!
//! `serve` accepts connections and hands each one to its own task;
//! `listen_packets` validates datagrams inline. Both stop when the run is
//! cancelled, then hand their socket to the [`ShutdownCoordinator`], which is
//! the only path that closes it.

use super::shutdown::ShutdownCoordinator;
use super::status::{report_line, Console, Progress, StatusReporter};
use super::RunSummary;
use crate::analytics::{unix_now, RateWindow};
use crate::error::{classify_accept_error, ErrorSlot, HarnessError, Result};
use crate::transport::{
    records, validate_record, Connection, Listener, PacketSource, ServeContext, DATAGRAM_BUFFER,
};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Accept and count connections until the run is cancelled.
///
/// Handler failures are recorded (first one wins) but never stop the accept
/// loop. The returned total includes every accepted connection, since all
/// handlers are waited for before the result is settled.
pub async fn serve<L>(
    mut listener: L,
    progress: Progress,
    coordinator: &ShutdownCoordinator,
) -> Result<RunSummary>
where
    L: Listener,
{
    let cancel = coordinator.token().clone();
    let force = coordinator.force_token().clone();
    let errors = Arc::new(ErrorSlot::new());
    let tracker = TaskTracker::new();
    let console = progress.console().clone();

    let addr = listener.local_addr()?;
    info!(addr = %addr, grace = ?coordinator.grace(), "Serving");
    console.print(format_args!("Starting to serve at host '{addr}'...\n"));

    let mut trigger = None;
    loop {
        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(conn) => {
                let ctx = ServeContext {
                    progress: progress.clone(),
                    shutdown: cancel.clone(),
                };
                let errors = Arc::clone(&errors);
                let force = force.clone();

                tracker.spawn(async move {
                    let result = tokio::select! {
                        biased;
                        _ = force.cancelled() => {
                            debug!("Connection dropped by forced shutdown");
                            return;
                        }
                        result = conn.serve(ctx) => result,
                    };
                    if let Err(e) = result {
                        warn!(error = %e, "Connection failed");
                        errors.record(e);
                    }
                });
            }
            Err(e) => {
                if let Err(err) = classify_accept_error(e, coordinator.is_shutdown_requested()) {
                    error!(error = %err, "Accept failed");
                    trigger = Some(err);
                    coordinator.trigger();
                }
                break;
            }
        }
    }

    console.print(format_args!("\nStopping...\n"));

    let drain = {
        let tracker = tracker.clone();
        async move {
            listener.close().await.map_err(HarnessError::Shutdown)?;
            tracker.close();
            tracker.wait().await;
            Ok(())
        }
    };
    let drained = coordinator.drain(drain).await;

    // After a forced close the remaining handlers unwind promptly
    tracker.close();
    tracker.wait().await;

    let summary = RunSummary {
        total: progress.total(),
    };
    info!(total = summary.total, "Serve finished");

    coordinator
        .finish(first_failure(trigger, &errors), drained)
        .map(|()| summary)
}

/// Receive and count datagram records until the run is cancelled.
///
/// Only this task touches the counter, so it uses the unsynchronised
/// [`RateWindow`].
pub async fn listen_packets<P>(
    mut source: P,
    console: Console,
    status: Arc<StatusReporter>,
    coordinator: &ShutdownCoordinator,
) -> Result<RunSummary>
where
    P: PacketSource,
{
    let cancel = coordinator.token().clone();
    let errors = ErrorSlot::new();
    let mut window = RateWindow::new();
    let mut buf = vec![0u8; DATAGRAM_BUFFER];

    let addr = source.local_addr()?;
    info!(addr = %addr, "Listening");
    console.print(format_args!("Starting to listen at host '{addr}'...\n"));

    let mut trigger = None;
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = source.recv(&mut buf) => received,
        };

        match received {
            Ok(n) => {
                status.reset();
                for record in records(&buf[..n]) {
                    match validate_record(record) {
                        Ok(()) => {
                            let (total, rate) = window.incr_for_time(unix_now());
                            report_line(&console, "Received", total, rate);
                        }
                        Err(e) => {
                            warn!(error = %e, "Datagram failed");
                            errors.record(e);
                        }
                    }
                }
            }
            Err(e) => {
                if let Err(err) = classify_accept_error(e, cancel.is_cancelled()) {
                    error!(error = %err, "Receive failed");
                    trigger = Some(err);
                    coordinator.trigger();
                }
                break;
            }
        }
    }

    console.print(format_args!("\nStopping...\n"));

    let drained = coordinator
        .drain(async move { source.close().await.map_err(HarnessError::Shutdown) })
        .await;

    let summary = RunSummary {
        total: window.total(),
    };
    info!(total = summary.total, "Listen finished");

    coordinator
        .finish(first_failure(trigger, &errors), drained)
        .map(|()| summary)
}

/// The error that stopped the loop outranks per-unit failures.
fn first_failure(trigger: Option<HarnessError>, errors: &ErrorSlot) -> Option<HarnessError> {
    match trigger {
        Some(err) => {
            if let Some(unit) = errors.take() {
                debug!(error = %unit, "Unit failure superseded by loop failure");
            }
            Some(err)
        }
        None => errors.take(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Concurrency, SubmitConfig, TargetConfig};
    use crate::harness::scheduler::submit;
    use crate::harness::shutdown::Phase;
    use crate::harness::status::capture::Captured;
    use crate::transport::http1::{HttpListener, HttpSubmitter};
    use crate::transport::tcp::{PingListener, TcpSubmitter};
    use crate::transport::udp::PacketListener;
    use crate::transport::{Submitter, MARKER};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;
    use std::num::NonZeroUsize;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio_util::sync::CancellationToken;

    fn coordinator(grace: Duration) -> ShutdownCoordinator {
        ShutdownCoordinator::new(CancellationToken::new(), grace, Console::sink())
    }

    fn local_target() -> TargetConfig {
        TargetConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            timeout: Duration::from_secs(5),
            keep_alives: true,
        }
    }

    /// Poll until `progress` reaches `total`.
    async fn wait_for_total(progress: &Progress, total: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while progress.total() < total {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("server never caught up");
    }

    struct StubConn {
        hang: bool,
    }

    #[async_trait]
    impl Connection for StubConn {
        async fn serve(self, ctx: ServeContext) -> Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            ctx.progress.record();
            Ok(())
        }
    }

    enum Step {
        Conn(StubConn),
        Fail(io::ErrorKind),
        CancelThenFail(CancellationToken, io::ErrorKind),
    }

    struct ScriptedListener {
        steps: VecDeque<Step>,
    }

    impl ScriptedListener {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
            }
        }
    }

    #[async_trait]
    impl Listener for ScriptedListener {
        type Conn = StubConn;

        async fn accept(&mut self) -> io::Result<StubConn> {
            match self.steps.pop_front() {
                Some(Step::Conn(conn)) => Ok(conn),
                Some(Step::Fail(kind)) => Err(kind.into()),
                Some(Step::CancelThenFail(cancel, kind)) => {
                    cancel.cancel();
                    Err(kind.into())
                }
                None => std::future::pending().await,
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 0)))
        }
    }

    #[tokio::test]
    async fn test_cancel_is_clean_shutdown() {
        let coord = coordinator(Duration::from_secs(1));
        let listener = ScriptedListener::new(vec![
            Step::Conn(StubConn { hang: false }),
            Step::Conn(StubConn { hang: false }),
        ]);
        let progress = Progress::new("Received", Console::sink());

        let cancel = coord.token().clone();
        let (summary, ()) = tokio::join!(serve(listener, progress.clone(), &coord), async {
            wait_for_total(&progress, 2).await;
            cancel.cancel();
            cancel.cancel();
        });

        assert_eq!(summary.unwrap().total, 2);
        assert_eq!(coord.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_closed_after_cancel_is_not_a_failure() {
        let coord = coordinator(Duration::from_secs(1));
        let listener = ScriptedListener::new(vec![Step::CancelThenFail(
            coord.token().clone(),
            io::ErrorKind::NotConnected,
        )]);

        let result = serve(listener, Progress::new("Received", Console::sink()), &coord).await;
        assert_eq!(result.unwrap().total, 0);
        assert_eq!(coord.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_unexpected_accept_failure_is_reported() {
        let coord = coordinator(Duration::from_secs(1));
        let listener = ScriptedListener::new(vec![
            Step::Conn(StubConn { hang: false }),
            Step::Fail(io::ErrorKind::NotConnected),
        ]);

        let result = serve(listener, Progress::new("Received", Console::sink()), &coord).await;
        assert!(matches!(result, Err(HarnessError::Io(_))));
        assert!(coord.is_shutdown_requested());
        assert_eq!(coord.phase(), Phase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_connection_is_forced_after_grace() {
        let coord = coordinator(Duration::from_secs(2));
        let listener = ScriptedListener::new(vec![Step::Conn(StubConn { hang: true })]);

        let cancel = coord.token().clone();
        let (result, ()) = tokio::join!(
            serve(listener, Progress::new("Received", Console::sink()), &coord),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            }
        );

        assert!(matches!(result, Err(HarnessError::ShutdownTimeout(_))));
        assert!(coord.force_token().is_cancelled());
        assert_eq!(coord.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_tcp_submit_matches_serve() {
        let listener = PingListener::bind(&local_target()).await.unwrap();
        let target = TargetConfig {
            port: listener.local_addr().unwrap().port(),
            ..local_target()
        };

        let coord = Arc::new(coordinator(Duration::from_secs(5)));
        let received = Progress::new("Received", Console::sink());
        let server = {
            let coord = Arc::clone(&coord);
            let received = received.clone();
            tokio::spawn(async move { serve(listener, received, &coord).await })
        };

        let submit_cancel = CancellationToken::new();
        let submitter = Arc::new(TcpSubmitter::new(&target).await.unwrap());
        let config = SubmitConfig {
            concurrency: Concurrency::Limited(NonZeroUsize::new(3).unwrap()),
            fail_fast: true,
        };
        let client = {
            let cancel = submit_cancel.clone();
            tokio::spawn(async move {
                submit(submitter, config, Progress::new("Submitted", Console::sink()), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        submit_cancel.cancel();
        let submitted = client.await.unwrap().unwrap().total;
        assert!(submitted > 0);

        coord.trigger();
        let served = server.await.unwrap().unwrap().total;

        assert_eq!(submitted, served);
        assert_eq!(coord.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_bad_payload_fails_connection_not_loop() {
        let listener = PingListener::bind(&local_target()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let coord = Arc::new(coordinator(Duration::from_secs(5)));
        let received = Progress::new("Received", Console::sink());
        let server = {
            let coord = Arc::clone(&coord);
            let received = received.clone();
            tokio::spawn(async move { serve(listener, received, &coord).await })
        };

        for payload in [MARKER, b"Pong!\n".as_slice(), MARKER] {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(payload).await.unwrap();
            stream.shutdown().await.unwrap();
        }

        wait_for_total(&received, 2).await;
        coord.trigger();

        match server.await.unwrap() {
            Err(HarnessError::UnexpectedPayload(msg)) => assert_eq!(msg, "Pong!\n"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(received.total(), 2);
        assert_eq!(coord.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_http_submit_matches_serve() {
        let listener = HttpListener::bind(&local_target()).await.unwrap();
        let target = TargetConfig {
            port: listener.local_addr().unwrap().port(),
            ..local_target()
        };

        let coord = Arc::new(coordinator(Duration::from_secs(5)));
        let received = Progress::new("Received", Console::sink());
        let server = {
            let coord = Arc::clone(&coord);
            let received = received.clone();
            tokio::spawn(async move { serve(listener, received, &coord).await })
        };

        let submit_cancel = CancellationToken::new();
        let submitter = Arc::new(HttpSubmitter::new(&target).unwrap());
        let config = SubmitConfig {
            concurrency: Concurrency::Limited(NonZeroUsize::new(3).unwrap()),
            fail_fast: true,
        };
        let client = {
            let cancel = submit_cancel.clone();
            tokio::spawn(async move {
                submit(submitter, config, Progress::new("Submitted", Console::sink()), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        submit_cancel.cancel();
        let submitted = client.await.unwrap().unwrap().total;
        assert!(submitted > 0);

        coord.trigger();
        let served = server.await.unwrap().unwrap().total;

        assert_eq!(submitted, served);
        assert_eq!(coord.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_udp_records_counted_individually() {
        let listener = PacketListener::bind(&local_target()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let captured = Captured::default();
        let coord = Arc::new(coordinator(Duration::from_secs(5)));
        let status = Arc::new(StatusReporter::new(Duration::from_secs(1), Console::sink()));
        let server = {
            let coord = Arc::clone(&coord);
            let console = captured.console();
            tokio::spawn(async move { listen_packets(listener, console, status, &coord).await })
        };

        // Six valid records, one bad record in the middle of a datagram
        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"Ping!\n", addr).await.unwrap();
        sender.send_to(b"Ping!\nPing!\n", addr).await.unwrap();
        sender.send_to(b"Ping!\nPong!\nPing!\n", addr).await.unwrap();
        sender.send_to(b"Ping!", addr).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !captured.contents().contains("Received. Total: 6.") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("valid records never counted");
        coord.trigger();

        match server.await.unwrap() {
            Err(HarnessError::UnexpectedPayload(msg)) => assert_eq!(msg, "Pong!"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!captured.contents().contains("Total: 7."));
        assert_eq!(coord.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_udp_submit_is_received() {
        let listener = PacketListener::bind(&local_target()).await.unwrap();
        let target = TargetConfig {
            port: listener.local_addr().unwrap().port(),
            ..local_target()
        };

        let coord = Arc::new(coordinator(Duration::from_secs(5)));
        let status = Arc::new(StatusReporter::new(Duration::from_secs(1), Console::sink()));
        let server = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                listen_packets(listener, Console::sink(), status, &coord).await
            })
        };

        let submitter = crate::transport::udp::UdpSubmitter::new(&target).await.unwrap();
        for _ in 0..10 {
            submitter.submit_once().await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        coord.trigger();

        assert_eq!(server.await.unwrap().unwrap().total, 10);
        assert_eq!(coord.phase(), Phase::Stopped);
    }
}
