//! Runs external encoder processes under a global concurrency ceiling.
//!
//! An invocation first waits (bounded) for one of `capacity` permits, then is
//! handed to a fixed pool of workers through a bounded backlog. The caller
//! waits on the result under a hard wall-clock timeout; timeouts and stop
//! requests kill the process. The permit travels with the work and is
//! released on every exit path when it drops.

pub mod atomic;
pub mod progress;
pub mod registry;

use anyhow::anyhow;
use async_channel::{Receiver, Sender, TrySendError};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::settings::TranscodeSettings;
use crate::modules::transcode::error::{TranscodeError, TranscodeResult};
use progress::ProgressEvent;
pub use registry::ProcessRegistry;

const MAX_LINE_CHARS: usize = 1000;
const TAIL_LINES: usize = 5;
const READER_JOIN: Duration = Duration::from_secs(1);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Receives a 0-100 percentage for every progress line.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

type Work = BoxFuture<'static, ()>;

/// One external command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    /// Media duration the `out_time_ms` lines are measured against.
    pub total_duration: Option<Duration>,
}

impl Invocation {
    pub fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            total_duration: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn total_duration(mut self, total: Option<Duration>) -> Self {
        self.total_duration = total;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorLimits {
    pub capacity: usize,
    pub acquire_timeout: Duration,
    pub hard_timeout: Duration,
    pub backlog: usize,
}

impl From<&TranscodeSettings> for SupervisorLimits {
    fn from(settings: &TranscodeSettings) -> Self {
        Self {
            capacity: settings.max_concurrent,
            acquire_timeout: settings.acquire_timeout(),
            hard_timeout: settings.encode_timeout(),
            backlog: settings.worker_backlog,
        }
    }
}

/// Increments a counter for as long as it is alive.
struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    limits: SupervisorLimits,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    work_tx: Sender<Work>,
    registry: ProcessRegistry,
}

impl ProcessSupervisor {
    /// Must be called inside a tokio runtime; spawns the worker pool.
    pub fn new(limits: SupervisorLimits) -> Self {
        let capacity = limits.capacity.max(1);
        let (work_tx, work_rx) = async_channel::bounded::<Work>(limits.backlog.max(1));
        for worker in 0..capacity {
            tokio::spawn(run_worker(worker, work_rx.clone()));
        }

        info!(
            capacity,
            backlog = limits.backlog,
            "Process supervisor started"
        );

        Self {
            limits,
            permits: Arc::new(Semaphore::new(capacity)),
            waiting: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            work_tx,
            registry: ProcessRegistry::default(),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub async fn execute(
        &self,
        invocation: Invocation,
        cancel: &CancellationToken,
        on_progress: Option<ProgressCallback>,
    ) -> TranscodeResult<()> {
        if cancel.is_cancelled() {
            return Err(TranscodeError::Interrupted);
        }

        let permit = {
            let _waiting = CountGuard::enter(&self.waiting);
            tokio::select! {
                acquired = tokio::time::timeout(
                    self.limits.acquire_timeout,
                    self.permits.clone().acquire_owned(),
                ) => match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(anyhow!("supervisor is shut down").into()),
                    Err(_) => {
                        let queued = self.waiting.load(Ordering::SeqCst);
                        warn!(label = %invocation.label, queued, "No encoder slot available");
                        return Err(TranscodeError::Busy { queued });
                    }
                },
                _ = cancel.cancelled() => return Err(TranscodeError::Interrupted),
            }
        };

        let process_token = cancel.child_token();
        let (result_tx, mut result_rx) = oneshot::channel();
        let label = invocation.label.clone();
        let running = self.running.clone();
        let work_token = process_token.clone();
        let work: Work = Box::pin(async move {
            let _permit = permit;
            let outcome = run_process(invocation, work_token, on_progress, running).await;
            let _ = result_tx.send(outcome);
        });

        self.work_tx.try_send(work).map_err(|e| match e {
            TrySendError::Full(_) => TranscodeError::Busy {
                queued: self.limits.backlog,
            },
            TrySendError::Closed(_) => anyhow!("supervisor worker pool is closed").into(),
        })?;

        // Kill the process if the caller gives up on this future.
        let _abandon = process_token.clone().drop_guard();

        tokio::select! {
            outcome = &mut result_rx => {
                return outcome.unwrap_or_else(|_| {
                    Err(TranscodeError::EncodeFailed(format!("{} worker vanished", label)))
                });
            }
            _ = tokio::time::sleep(self.limits.hard_timeout) => {}
        }

        let seconds = self.limits.hard_timeout.as_secs();
        warn!(label = %label, seconds, "Encoder exceeded its time budget, killing");
        process_token.cancel();
        if tokio::time::timeout(KILL_GRACE, result_rx).await.is_err() {
            error!(label = %label, "Encoder did not exit within the kill grace period");
        }
        Err(TranscodeError::Timeout { seconds })
    }
}

async fn run_worker(worker: usize, work_rx: Receiver<Work>) {
    while let Ok(work) = work_rx.recv().await {
        work.await;
    }
    debug!(worker, "Supervisor worker stopped");
}

async fn run_process(
    invocation: Invocation,
    cancel: CancellationToken,
    on_progress: Option<ProgressCallback>,
    running: Arc<AtomicUsize>,
) -> TranscodeResult<()> {
    let Invocation {
        label,
        program,
        args,
        total_duration,
    } = invocation;

    let mut child = Command::new(&program)
        .args(&args)
        .env("LANG", "C.UTF-8")
        .env("LC_ALL", "C.UTF-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TranscodeError::EncodeFailed(format!("failed to start {}: {}", program, e)))?;

    let _running = CountGuard::enter(&running);
    debug!(label = %label, pid = ?child.id(), "Encoder started");

    let (line_tx, line_rx) = mpsc::channel(256);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);
    let reader = tokio::spawn(track_progress(
        line_rx,
        label.clone(),
        total_duration,
        on_progress,
    ));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(label = %label, "Failed to kill encoder: {}", e);
            }
            reader.abort();
            info!(label = %label, "Encoder interrupted");
            return Err(TranscodeError::Interrupted);
        }
    };

    let tail = match tokio::time::timeout(READER_JOIN, reader).await {
        Ok(Ok(tail)) => tail,
        _ => {
            debug!(label = %label, "Output reader still draining, detached");
            Vec::new()
        }
    };

    if status.success() {
        debug!(label = %label, "Encoder finished");
        Ok(())
    } else {
        Err(TranscodeError::EncodeFailed(format!(
            "{} exited with {}: {}",
            label,
            status,
            tail.join(" | ")
        )))
    }
}

/// Reads a stream line by line, tolerating invalid UTF-8.
async fn forward_lines<R: AsyncRead + Unpin>(stream: R, tx: mpsc::Sender<String>) {
    let mut segments = BufReader::new(stream).split(b'\n');
    while let Ok(Some(segment)) = segments.next_segment().await {
        let line: String = String::from_utf8_lossy(&segment)
            .trim_end_matches('\r')
            .chars()
            .take(MAX_LINE_CHARS)
            .collect();
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

/// Drains every line, including those after `progress=end`, so the child
/// never blocks on a full pipe. Returns the last few non-progress lines.
async fn track_progress(
    mut lines: mpsc::Receiver<String>,
    label: String,
    total: Option<Duration>,
    on_progress: Option<ProgressCallback>,
) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    while let Some(line) = lines.recv().await {
        match progress::parse_line(&line) {
            Some(ProgressEvent::Elapsed(elapsed)) => {
                if let (Some(total), Some(callback)) = (total, on_progress.as_ref()) {
                    callback(progress::percent(elapsed, total));
                }
            }
            Some(ProgressEvent::End) => {
                if let Some(callback) = on_progress.as_ref() {
                    callback(100.0);
                }
            }
            None => {
                debug!(label = %label, "{}", line);
                if line.trim().is_empty() {
                    continue;
                }
                if tail.len() == TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    }
    tail.into()
}
