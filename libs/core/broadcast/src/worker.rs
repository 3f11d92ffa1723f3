//! The consume loop.
//!
//! One message in flight at a time: receive, process, acknowledge, then
//! check whether to stop. Scale out by running more workers on the same
//! queue.
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            ▼                              │
//!   next_message ──► process ──► acknowledge ──► stop? ──► memory? ─┘
//!                       │                         │          │
//!                       └─ timeout ─► Timeout      ▼          ▼
//!                                               Success   MemoryLimit
//! ```
//!
//! A per-message timeout is enforced twice: `tokio::time::timeout` stops a
//! listener that yields, and a watchdog thread outside the runtime exits the
//! process when a listener blocks its thread past the limit.

use crate::consumer::Consumer;
use crate::error::BroadcastError;
use crate::metrics::BroadcastMetrics;
use crate::options::ProcessingOptions;
use crate::processor::Processor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How long one receive call waits for a delivery.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why the worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Asked to stop, or the broker connection was lost
    Success,
    /// Resident memory reached the configured ceiling
    MemoryLimit,
    /// One message took longer than the configured timeout
    Timeout,
}

impl WorkerStatus {
    /// Process exit code for this status.
    pub fn exit_code(self) -> i32 {
        match self {
            WorkerStatus::Success => 0,
            WorkerStatus::MemoryLimit => 12,
            WorkerStatus::Timeout => 1,
        }
    }
}

/// Receives every error the loop swallows.
pub trait ExceptionReporter: Send + Sync {
    fn report(&self, error: &BroadcastError);
}

/// Logs reported errors.
pub struct TracingReporter;

impl ExceptionReporter for TracingReporter {
    fn report(&self, error: &BroadcastError) {
        error!(error = %error, kind = error.kind(), "Error while processing message");
    }
}

/// Memory used by the current process, in megabytes.
pub trait MemoryProbe: Send + Sync {
    fn used_megabytes(&self) -> u64;
}

/// Reads resident set size from `/proc/self/status`. Reports 0 where that
/// file does not exist.
pub struct ProcessMemory;

impl MemoryProbe for ProcessMemory {
    fn used_megabytes(&self) -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_rss_kb(&status))
            .map_or(0, |kb| kb / 1024)
    }
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Timer on its own OS thread, armed around one message.
struct Watchdog {
    disarm: mpsc::Sender<()>,
    expired: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn arm(limit: Duration, reporter: Arc<dyn ExceptionReporter>, exit: bool) -> Self {
        let (disarm, disarmed) = mpsc::channel::<()>();
        let expired = Arc::new(AtomicBool::new(false));
        let flag = expired.clone();

        let thread = thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(limit) {
                flag.store(true, Ordering::SeqCst);
                reporter.report(&BroadcastError::Timeout(limit));
                if exit {
                    error!(timeout = ?limit, "Message still running past its timeout, exiting");
                    std::process::exit(WorkerStatus::Timeout.exit_code());
                }
            }
        });

        Self {
            disarm,
            expired,
            thread: Some(thread),
        }
    }

    /// Stop the timer. True when the limit had already passed.
    fn disarm(mut self) -> bool {
        let _ = self.disarm.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.expired.load(Ordering::SeqCst)
    }
}

/// Asks a running worker to stop after the current iteration.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct Worker {
    reporter: Arc<dyn ExceptionReporter>,
    memory: Arc<dyn MemoryProbe>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    handle_signals: bool,
    exit_on_timeout: bool,
    poll_interval: Duration,
    metrics: Option<BroadcastMetrics>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            reporter: Arc::new(TracingReporter),
            memory: Arc::new(ProcessMemory),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            handle_signals: true,
            exit_on_timeout: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ExceptionReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Whether `work` installs SIGINT/SIGTERM handlers.
    pub fn with_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Whether a message that blocks past its timeout exits the process.
    /// When disabled the iteration returns [`WorkerStatus::Timeout`] once the
    /// listener gives control back.
    pub fn with_exit_on_timeout(mut self, enabled: bool) -> Self {
        self.exit_on_timeout = enabled;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_metrics(mut self, metrics: BroadcastMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run until a stop condition is reached.
    pub async fn work(
        &self,
        processor: &Processor,
        consumer: &mut Consumer,
        options: &ProcessingOptions,
    ) -> WorkerStatus {
        info!(
            service = %options.service,
            connection = %options.connection_name,
            max_tries = options.max_tries,
            memory_mb = options.memory,
            "Worker started"
        );

        let signal_task = self.handle_signals.then(|| {
            let handle = self.shutdown_handle();
            tokio::spawn(async move {
                if let Err(e) = shutdown_signal().await {
                    error!(error = %e, "Error waiting for shutdown signal");
                    return;
                }
                info!("Shutdown signal received, stopping after current message");
                handle.shutdown();
            })
        });

        let status = loop {
            if let Some(status) = self.run_iteration(processor, consumer, options).await {
                break status;
            }
        };

        if let Some(task) = signal_task {
            task.abort();
        }

        info!(status = ?status, exit_code = status.exit_code(), "Worker stopped");
        status
    }

    /// One pass of the loop. `Some` when the worker should stop.
    pub async fn run_iteration(
        &self,
        processor: &Processor,
        consumer: &mut Consumer,
        options: &ProcessingOptions,
    ) -> Option<WorkerStatus> {
        let mut should_quit = false;

        match consumer.next_message(self.poll_interval).await {
            Ok(Some(mut message)) => {
                if let Some(metrics) = &self.metrics {
                    metrics.message_received(message.event());
                }

                let result = match options.timeout {
                    Some(limit) => {
                        let watchdog =
                            Watchdog::arm(limit, self.reporter.clone(), self.exit_on_timeout);
                        let result =
                            tokio::time::timeout(limit, processor.process(&mut message, options))
                                .await;
                        let expired = watchdog.disarm();

                        // left unacknowledged so the broker redelivers it
                        match result {
                            Ok(_) if expired => return Some(WorkerStatus::Timeout),
                            Ok(result) => result,
                            Err(_) => {
                                if !expired {
                                    self.reporter.report(&BroadcastError::Timeout(limit));
                                }
                                return Some(WorkerStatus::Timeout);
                            }
                        }
                    }
                    None => processor.process(&mut message, options).await,
                };

                if let Err(error) = result {
                    should_quit |= self.observe(&error);
                }
                if let Err(error) = consumer.acknowledge(&message).await {
                    should_quit |= self.observe(&error);
                }
            }
            Ok(None) => {}
            Err(error) => should_quit |= self.observe(&error),
        }

        if should_quit || *self.shutdown_rx.borrow() {
            return Some(WorkerStatus::Success);
        }

        let used = self.memory.used_megabytes();
        if let Some(metrics) = &self.metrics {
            metrics.memory_usage(used);
        }
        if used >= options.memory {
            warn!(used_mb = used, limit_mb = options.memory, "Memory limit reached");
            return Some(WorkerStatus::MemoryLimit);
        }

        None
    }

    /// Report `error`; true when it means the worker must stop.
    fn observe(&self, error: &BroadcastError) -> bool {
        self.reporter.report(error);
        if error.is_connection_lost() {
            warn!("Broker connection lost, stopping worker");
            return true;
        }
        false
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())?
            .recv()
            .await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = signal::ctrl_c() => result,
        result = terminate => result,
    }
}
