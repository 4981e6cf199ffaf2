//! Per-run subprocess supervision.
//!
//! The supervisor is the bridge between a run request and a finished run
//! record. For each accepted request it:
//! - validates the run and its script reference
//! - resets the step list to Pending and marks the run InProgress
//! - spawns exactly one runner subprocess with `TARGET_URL` in its
//!   environment
//! - streams stdout chunks through the frame decoder and applies every
//!   decoded event in arrival order on one task, so updates to the run's
//!   step array are strictly sequential
//! - accumulates stderr and finalizes the run status from the exit outcome
//!
//! A non-zero exit with captured stderr is authoritative: it marks the run
//! Failed with that text and overrides whatever the last `run:end` event
//! claimed. A clean exit takes its verdict from the last `run:end`; a clean
//! exit with no `run:end` at all is recorded as a failure rather than
//! trusted silently.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Semaphore, broadcast};
use tracing::{error, info, warn};

use crate::db::{DbHandle, RunDb};
use crate::errors::SupervisorError;
use crate::models::RunStatus;
use crate::runner::artifacts::{ArtifactStore, save_screenshot};
use crate::runner::framing::FrameDecoder;
use crate::runner::progress::StepTracker;
use crate::runner::protocol::RunEvent;
use crate::ws::{WsMessage, broadcast_message};

/// Environment variable the runner reads its target URL from.
pub const ENV_TARGET_URL: &str = "TARGET_URL";

/// Persistence writes on the streaming path retry this many times.
const MAX_PERSIST_ATTEMPTS: u32 = 3;

/// Command line a run's script is handed to.
///
/// The script path is inserted between the leading and trailing arguments,
/// so `npx playwright test <script> --headed` and `sh <script>` both fit.
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: String,
    pub leading_args: Vec<String>,
    pub trailing_args: Vec<String>,
}

impl Default for RunnerCommand {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            leading_args: vec!["playwright".to_string(), "test".to_string()],
            trailing_args: vec!["--headed".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory script paths are resolved against.
    pub scripts_dir: PathBuf,
    pub runner: RunnerCommand,
    /// Upper bound on concurrently executing runner subprocesses. Requests
    /// beyond the bound are accepted and queue on the semaphore.
    pub max_concurrent_runs: usize,
    /// A runner that neither finishes nor fails within this window is
    /// killed and the run marked Failed.
    pub run_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("scripts"),
            runner: RunnerCommand::default(),
            max_concurrent_runs: 4,
            run_timeout: Duration::from_secs(600),
        }
    }
}

pub struct RunSupervisor {
    db: DbHandle,
    tx: broadcast::Sender<String>,
    artifacts: Arc<dyn ArtifactStore>,
    config: SupervisorConfig,
    permits: Arc<Semaphore>,
}

impl RunSupervisor {
    pub fn new(
        db: DbHandle,
        tx: broadcast::Sender<String>,
        artifacts: Arc<dyn ArtifactStore>,
        config: SupervisorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        Self {
            db,
            tx,
            artifacts,
            config,
            permits,
        }
    }

    /// Validate and launch a run. Returns as soon as the execution task is
    /// spawned; all further progress is asynchronous and observable through
    /// the store and the broadcast channel.
    pub async fn start_run(&self, run_id: i64) -> Result<(), SupervisorError> {
        let run = self
            .db
            .call(move |db| db.get_run(run_id))
            .await?
            .ok_or(SupervisorError::RunNotFound { id: run_id })?;

        let script_path = run
            .script_path
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or(SupervisorError::NoScript { id: run_id })?;

        // begin_execution claims the run atomically; a run that is already
        // InProgress stays with its current execution task, keeping the
        // apply loop the only writer of this run's steps.
        let total_steps = self
            .db
            .call(move |db| {
                if !db.begin_execution(run_id)? {
                    return Ok(None);
                }
                db.step_count(run_id).map(Some)
            })
            .await?
            .ok_or(SupervisorError::AlreadyRunning { id: run_id })?;

        broadcast_message(&self.tx, &WsMessage::RunStarted { run_id });
        info!(run_id, script = %script_path, "Run execution started");

        let ctx = ExecutionCtx {
            db: self.db.clone(),
            tx: self.tx.clone(),
            artifacts: self.artifacts.clone(),
            runner: self.config.runner.clone(),
            scripts_dir: self.config.scripts_dir.clone(),
            timeout: self.config.run_timeout,
            permits: self.permits.clone(),
            run_id,
            script_path,
            target_url: run.target_url,
            total_steps,
        };
        tokio::spawn(ctx.execute());

        Ok(())
    }
}

/// Everything one execution task owns. Cloned out of the supervisor so the
/// task borrows nothing.
struct ExecutionCtx {
    db: DbHandle,
    tx: broadcast::Sender<String>,
    artifacts: Arc<dyn ArtifactStore>,
    runner: RunnerCommand,
    scripts_dir: PathBuf,
    timeout: Duration,
    permits: Arc<Semaphore>,
    run_id: i64,
    script_path: String,
    target_url: Option<String>,
    total_steps: usize,
}

impl ExecutionCtx {
    async fn execute(self) {
        let _permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // Semaphore closed: server shutting down
        };

        let run_id = self.run_id;
        if let Err(e) = self.execute_inner().await {
            error!(run_id, "Run execution failed: {:#}", e);
        }
    }

    async fn execute_inner(self) -> Result<()> {
        let script = self.scripts_dir.join(&self.script_path);

        let mut cmd = Command::new(&self.runner.program);
        cmd.args(&self.runner.leading_args)
            .arg(&script)
            .args(&self.runner.trailing_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(url) = &self.target_url {
            cmd.env(ENV_TARGET_URL, url);
        }

        let mut child = match cmd.spawn().map_err(SupervisorError::SpawnFailed) {
            Ok(child) => child,
            Err(e) => {
                self.finalize(RunStatus::Failed, None, Some(&e.to_string()))
                    .await;
                return Err(e.into());
            }
        };

        let stdout = child.stdout.take().context("Runner stdout not captured")?;
        let stderr = child.stderr.take().context("Runner stderr not captured")?;

        // Drain stderr on its own task so a chatty runner can't deadlock on
        // a full pipe while we read stdout.
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                text.push_str(&line);
                text.push('\n');
            }
            text
        });

        let mut decoder = FrameDecoder::new();
        let mut tracker = StepTracker::new(self.total_steps);
        let mut reported_end: Option<(String, f64)> = None;
        let mut timed_out = false;

        let mut stdout = stdout;
        let mut buf = [0u8; 8192];
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            // Frames extracted from one chunk are applied
                            // one after another on this task; nothing else
                            // writes this run's steps.
                            for event in decoder.push(&buf[..n]) {
                                self.apply_event(&mut tracker, &mut reported_end, event).await;
                            }
                        }
                        Err(e) => {
                            warn!(run_id = self.run_id, error = %e, "Error reading runner stdout");
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    warn!(run_id = self.run_id, "Run timed out, killing runner process");
                    if let Err(e) = child.kill().await {
                        warn!(run_id = self.run_id, error = %e, "Failed to kill runner process");
                    }
                    timed_out = true;
                    break;
                }
            }
        }

        let exit = if timed_out {
            child.wait().await.context("Failed to await killed runner")?
        } else {
            match tokio::time::timeout(self.timeout, child.wait()).await {
                Ok(status) => status.context("Failed to await runner process")?,
                Err(_) => {
                    warn!(run_id = self.run_id, "Runner hung after closing stdout, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(run_id = self.run_id, error = %e, "Failed to kill runner process");
                    }
                    timed_out = true;
                    child.wait().await.context("Failed to await killed runner")?
                }
            }
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        let reported_duration = reported_end.as_ref().map(|(_, d)| *d);
        let (status, duration, result_text) = if timed_out {
            (
                RunStatus::Failed,
                reported_duration,
                Some(format!(
                    "Run timed out after {}s",
                    self.timeout.as_secs()
                )),
            )
        } else if !exit.success() {
            // The exit code is authoritative: it overrides whatever the last
            // run:end event reported.
            let text = if stderr_text.trim().is_empty() {
                match exit.code() {
                    Some(code) => format!("Runner exited with code {}", code),
                    None => "Runner terminated by signal".to_string(),
                }
            } else {
                stderr_text.trim().to_string()
            };
            (RunStatus::Failed, reported_duration, Some(text))
        } else {
            match &reported_end {
                Some((status, duration)) if status == "passed" => {
                    (RunStatus::Completed, Some(*duration), None)
                }
                Some((status, duration)) => (
                    RunStatus::Failed,
                    Some(*duration),
                    Some(format!("Script reported status '{}'", status)),
                ),
                None => (
                    RunStatus::Failed,
                    None,
                    Some("Script finished without reporting a result".to_string()),
                ),
            }
        };

        self.finalize(status, duration, result_text.as_deref()).await;
        Ok(())
    }

    /// Apply one decoded event: forward it to viewers unconditionally, then
    /// update the run record. Streaming-path failures are logged and never
    /// abort the run.
    async fn apply_event(
        &self,
        tracker: &mut StepTracker,
        reported_end: &mut Option<(String, f64)>,
        event: RunEvent,
    ) {
        broadcast_message(
            &self.tx,
            &WsMessage::RunEvent {
                run_id: self.run_id,
                event: event.clone(),
            },
        );

        match event {
            RunEvent::RunStart { title } => {
                info!(run_id = self.run_id, %title, "Runner reported script start");
            }
            RunEvent::StepEnd {
                duration,
                status,
                error,
                ..
            } => match tracker.claim_next() {
                Some(slot) => {
                    let run_id = self.run_id;
                    self.persist_with_retry("step result", move |db| {
                        db.record_step_result(run_id, slot, status, duration, error.as_deref())
                            .map(|_| ())
                    })
                    .await;
                }
                None => {
                    warn!(
                        run_id = self.run_id,
                        total = tracker.total(),
                        "step:end past end of step template, discarding"
                    );
                }
            },
            RunEvent::ArtifactAdd {
                failed_step_index,
                screenshot_base64,
                ..
            } => {
                let Some(slot) = tracker.artifact_slot(failed_step_index) else {
                    warn!(
                        run_id = self.run_id,
                        index = failed_step_index,
                        total = tracker.total(),
                        "Artifact target index out of range, discarding"
                    );
                    return;
                };
                // The script counts failed steps on its own; flag any drift
                // from the slot our cursor last wrote.
                if tracker.last_claimed() != Some(slot) {
                    warn!(
                        run_id = self.run_id,
                        index = slot,
                        cursor = ?tracker.last_claimed(),
                        "Artifact index disagrees with step cursor"
                    );
                }
                match save_screenshot(self.artifacts.as_ref(), self.run_id, &screenshot_base64)
                    .await
                {
                    Ok(url) => {
                        let run_id = self.run_id;
                        self.persist_with_retry("screenshot reference", move |db| {
                            db.attach_screenshot(run_id, slot, &url).map(|_| ())
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!(
                            run_id = self.run_id,
                            error = %e,
                            "Failed to store screenshot, run continues"
                        );
                    }
                }
            }
            RunEvent::RunEnd { status, duration } => {
                *reported_end = Some((status, duration));
            }
        }
    }

    async fn finalize(&self, status: RunStatus, duration: Option<f64>, result: Option<&str>) {
        let run_id = self.run_id;
        {
            let status = status.clone();
            let result = result.map(|s| s.to_string());
            self.persist_with_retry("final status", move |db| {
                db.finalize_run(run_id, &status, duration, result.as_deref())
            })
            .await;
        }
        info!(run_id, status = status.as_str(), "Run finalized");
        broadcast_message(&self.tx, &WsMessage::RunFinished { run_id, status });
    }

    /// Run a store write, retrying transient failures with doubling backoff.
    /// Gives up with a logged error after [`MAX_PERSIST_ATTEMPTS`].
    async fn persist_with_retry<F>(&self, what: &'static str, f: F)
    where
        F: Fn(&RunDb) -> Result<()> + Clone + Send + Sync + 'static,
    {
        let mut delay = Duration::from_millis(100);
        for attempt in 1..=MAX_PERSIST_ATTEMPTS {
            match self.db.call(f.clone()).await {
                Ok(()) => return,
                Err(e) if attempt < MAX_PERSIST_ATTEMPTS => {
                    warn!(
                        run_id = self.run_id,
                        attempt,
                        error = %e,
                        "Failed to persist {}, retrying",
                        what
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(
                        run_id = self.run_id,
                        error = %e,
                        "Giving up persisting {}",
                        what
                    );
                }
            }
        }
    }
}
