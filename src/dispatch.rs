//! Orchestrator-side worker dispatch.
//!
//! The orchestrator never renders a page in its own process. Every visit
//! spawns a short-lived worker (this same executable, hidden subcommand),
//! streams its line-delimited messages, and classifies the outcome from the
//! terminal message plus exit status. The absence of a terminal message is
//! a failure even on a clean exit.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::VisitFailure;
use crate::options::{CrawlOptions, VisitFlags};
use crate::signals::SignalBundle;
use crate::worker::{WorkerErrorKind, WorkerMessage};

/// Subcommand under which the worker entrypoint hides.
pub const WORKER_SUBCOMMAND: &str = "visit-worker";

/// Extra wall-clock granted beyond the per-visit budget before the worker
/// process is killed outright; covers browser launch and teardown.
const DISPATCH_GRACE_MS: u64 = 10_000;

/// Successful worker output: the signal bundle plus any screenshot that
/// arrived in its own message.
#[derive(Debug)]
pub struct WorkerOutput {
    pub bundle: SignalBundle,
    pub screenshot: Option<Vec<u8>>,
}

/// The seam between the orchestrator and the page-visit machinery. The
/// production implementation spawns an isolated process; tests substitute
/// a stub.
pub trait VisitDispatcher: Send + Sync {
    fn dispatch(
        &self,
        url: Url,
        flags: VisitFlags,
        options: CrawlOptions,
    ) -> BoxFuture<'static, Result<WorkerOutput, VisitFailure>>;
}

/// Spawns one worker process per visit.
pub struct ProcessDispatcher {
    worker_exe: PathBuf,
}

impl ProcessDispatcher {
    /// Use the running executable as the worker binary.
    pub fn from_current_exe() -> Result<Self> {
        let worker_exe = std::env::current_exe().context("failed to locate own executable")?;
        Ok(ProcessDispatcher { worker_exe })
    }

    pub fn new(worker_exe: PathBuf) -> Self {
        ProcessDispatcher { worker_exe }
    }
}

impl VisitDispatcher for ProcessDispatcher {
    fn dispatch(
        &self,
        url: Url,
        flags: VisitFlags,
        options: CrawlOptions,
    ) -> BoxFuture<'static, Result<WorkerOutput, VisitFailure>> {
        let worker_exe = self.worker_exe.clone();

        Box::pin(async move {
            let flags_json = serde_json::to_string(&flags)
                .map_err(|e| VisitFailure::generic(format!("failed to encode flags: {e}")))?;
            let options_json = serde_json::to_string(&options)
                .map_err(|e| VisitFailure::generic(format!("failed to encode options: {e}")))?;

            let mut child = Command::new(&worker_exe)
                .arg(WORKER_SUBCOMMAND)
                .arg("--url")
                .arg(url.as_str())
                .arg("--flags")
                .arg(&flags_json)
                .arg("--options")
                .arg(&options_json)
                .stdout(Stdio::piped())
                .stderr(if options.debug {
                    Stdio::inherit()
                } else {
                    Stdio::null()
                })
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| VisitFailure::generic(format!("failed to spawn worker: {e}")))?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| VisitFailure::generic("failed to capture worker stdout"))?;
            let mut lines = BufReader::new(stdout).lines();

            let mut terminal: Option<WorkerMessage> = None;
            let mut screenshot: Option<Vec<u8>> = None;

            let read_messages = async {
                while let Ok(Some(line)) = lines.next_line().await {
                    match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(WorkerMessage::Log {
                            message,
                            source,
                            level,
                        }) => forward_log(&level, &source, &message),
                        Ok(WorkerMessage::Ss { data }) => match BASE64.decode(&data) {
                            Ok(bytes) => screenshot = Some(bytes),
                            Err(e) => warn!("discarding undecodable screenshot: {e}"),
                        },
                        Ok(message) => terminal = Some(message),
                        Err(e) => debug!("ignoring unparseable worker line: {e}"),
                    }
                }
            };

            let budget =
                Duration::from_millis(options.max_wait_ms.saturating_mul(3) + DISPATCH_GRACE_MS);
            if tokio::time::timeout(budget, read_messages).await.is_err() {
                warn!("worker for {url} exceeded its budget, killing it");
                let _ = child.kill().await;
                return Err(VisitFailure::generic(format!(
                    "worker timed out after {} ms",
                    budget.as_millis()
                )));
            }

            let status = child
                .wait()
                .await
                .map_err(|e| VisitFailure::generic(format!("failed to reap worker: {e}")))?;

            classify_outcome(terminal, status.code(), screenshot)
        })
    }
}

/// Map the worker's terminal message and exit status onto a visit outcome.
///
/// Exit code 0 with no terminal message is still a failure; a worker that
/// died before classifying itself gets the generic treatment.
fn classify_outcome(
    terminal: Option<WorkerMessage>,
    exit_code: Option<i32>,
    screenshot: Option<Vec<u8>>,
) -> Result<WorkerOutput, VisitFailure> {
    match terminal {
        Some(WorkerMessage::Data(bundle)) => Ok(WorkerOutput {
            bundle: *bundle,
            screenshot,
        }),
        Some(WorkerMessage::Error {
            kind: WorkerErrorKind::Redirect,
            original_url,
            redirect_url,
            ..
        }) => Err(VisitFailure::InvalidRedirect {
            original_url: original_url.unwrap_or_default(),
            redirect_url: redirect_url.unwrap_or_default(),
        }),
        Some(WorkerMessage::Error { message, .. }) => Err(VisitFailure::Generic(message)),
        _ => Err(VisitFailure::generic(format!(
            "worker exited (code {exit_code:?}) without a terminal message"
        ))),
    }
}

fn forward_log(level: &str, source: &str, message: &str) {
    match level {
        "error" => error!(target: "stackprobe::worker", "[{source}] {message}"),
        "warn" => warn!(target: "stackprobe::worker", "[{source}] {message}"),
        "info" => info!(target: "stackprobe::worker", "[{source}] {message}"),
        _ => debug!(target: "stackprobe::worker", "[{source}] {message}"),
    }
}
