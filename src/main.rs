//! connrate: a connection-rate benchmarking harness
//!
//! One process either generates load (`submit`) or absorbs it (`serve`,
//! `listen`) over one of:
//! - raw TCP, one short-lived connection per unit of work
//! - UDP, one datagram record per unit of work
//! - HTTP/1.x, one request per unit of work
//!
//! Both sides print a running total and per-second rate. `channels` runs the
//! same counting loop over an in-process channel instead of a socket.

mod analytics;
mod channels;
mod config;
mod error;
mod harness;
mod transport;

use config::{Command, Config, Transport};
use error::Result;
use harness::{
    listen_packets, serve, submit, Console, Progress, RunSummary, ShutdownCoordinator,
    StatusReporter, STATUS_INTERVAL,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::http1::{HttpListener, HttpSubmitter};
use transport::tcp::{PingListener, TcpSubmitter};
use transport::udp::{PacketListener, UdpSubmitter};

fn main() -> ExitCode {
    // Load configuration before anything touches the network
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(2);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        command = ?config.command,
        transport = ?config.command.transport(),
        addr = %config.target.addr(),
        workers = %config.submit.concurrency,
        grace = ?config.shutdown.grace,
        "Starting connrate"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(summary) => {
            info!(total = summary.total, "Run finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, kind = ?e.kind(), "Run failed");
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(config: Config) -> Result<RunSummary> {
    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let console = Console::stdout();
    let status = Arc::new(StatusReporter::new(STATUS_INTERVAL, console.clone()));
    let ticker = status.spawn(cancel.clone());
    let idle = Arc::clone(&status);

    let result = match config.command {
        Command::Submit(transport) => {
            let progress = Progress::new("Submitted", console).with_status(status);
            run_submit(transport, &config, progress, &cancel).await
        }
        Command::Serve(transport) => {
            let coordinator =
                ShutdownCoordinator::new(cancel.clone(), config.shutdown.grace, console.clone());
            let result = run_serve(transport, &config, console, status, &coordinator).await;
            info!(phase = ?coordinator.phase(), "Shutdown complete");
            result
        }
        Command::ChannelLoop => channels::run(console, status, &cancel).await,
    };

    // The ticker lives as long as the run token
    cancel.cancel();
    stop_ticker(ticker).await;
    debug!(idle_ticks = idle.idle_ticks(), "Status reporter stopped");
    result
}

async fn run_submit(
    transport: Transport,
    config: &Config,
    progress: Progress,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    match transport {
        Transport::Tcp => {
            let submitter = Arc::new(TcpSubmitter::new(&config.target).await?);
            submit(submitter, config.submit, progress, cancel).await
        }
        Transport::Udp => {
            let submitter = Arc::new(UdpSubmitter::new(&config.target).await?);
            submit(submitter, config.submit, progress, cancel).await
        }
        Transport::Http1 => {
            let submitter = Arc::new(HttpSubmitter::new(&config.target)?);
            submit(submitter, config.submit, progress, cancel).await
        }
    }
}

async fn run_serve(
    transport: Transport,
    config: &Config,
    console: Console,
    status: Arc<StatusReporter>,
    coordinator: &ShutdownCoordinator,
) -> Result<RunSummary> {
    let progress = Progress::new("Received", console.clone()).with_status(Arc::clone(&status));

    match transport {
        Transport::Tcp => {
            let listener = bind_or_fail(PingListener::bind(&config.target).await, coordinator)?;
            serve(listener, progress, coordinator).await
        }
        Transport::Http1 => {
            let listener = bind_or_fail(HttpListener::bind(&config.target).await, coordinator)?;
            serve(listener, progress, coordinator).await
        }
        Transport::Udp => {
            let source = bind_or_fail(PacketListener::bind(&config.target).await, coordinator)?;
            listen_packets(source, console, status, coordinator).await
        }
    }
}

/// A listener that cannot be bound fails the run before it starts.
fn bind_or_fail<T>(bound: Result<T>, coordinator: &ShutdownCoordinator) -> Result<T> {
    bound.inspect_err(|_| coordinator.fail())
}

async fn stop_ticker(ticker: JoinHandle<()>) {
    if let Err(e) = ticker.await {
        warn!(error = %e, "Status reporter ended abnormally");
    }
}

/// Cancel `cancel` on SIGINT/SIGTERM (Ctrl-C off unix).
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                    return;
                }
                info!("Received Ctrl-C");
            }
        }
    }

    cancel.cancel();
}
