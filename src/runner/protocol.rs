//! Wire protocol between a spawned runner process and the server.
//!
//! The runner reports progress by writing frames to stdout. One frame is a
//! single JSON event object followed immediately by [`FRAME_SENTINEL`], with
//! no length prefix and no escaping — emitters must keep the sentinel out of
//! payload strings. Both sides of the channel share the types in this module:
//! the [`Reporter`] serializes events inside the subprocess, and the framer
//! decodes them in the parent.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::models::StepStatus;

/// Terminator appended after every serialized event.
pub const FRAME_SENTINEL: &str = "__END_OF_JSON__";

/// Events a runner process emits over its stdout channel.
///
/// Events for one run are assumed, not verified, to arrive in the same order
/// as the run's template steps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum RunEvent {
    /// The script has started executing.
    #[serde(rename = "run:start")]
    RunStart { title: String },

    /// One test step finished. The k-th such event maps to step slot k-1.
    #[serde(rename = "step:end")]
    StepEnd {
        title: String,
        duration: f64,
        status: StepStatus,
        #[serde(default)]
        error: Option<String>,
    },

    /// A failure screenshot, targeted at a step slot by the index the script
    /// itself counted. This index originates from a counter independent of
    /// the server's step cursor; the apply loop logs when they disagree.
    #[serde(rename = "artifact:add")]
    ArtifactAdd {
        #[serde(rename = "failedStepIndex")]
        failed_step_index: usize,
        #[serde(rename = "screenshotBase64")]
        screenshot_base64: String,
        #[serde(rename = "stepTitle", default)]
        step_title: Option<String>,
    },

    /// The script finished. Trusted for the final status only when the
    /// process exits cleanly.
    #[serde(rename = "run:end")]
    RunEnd { status: String, duration: f64 },
}

/// Serialize one event into a complete frame.
pub fn encode_frame(event: &RunEvent) -> serde_json::Result<String> {
    let mut frame = serde_json::to_string(event)?;
    frame.push_str(FRAME_SENTINEL);
    Ok(frame)
}

/// Child-side frame writer. Wraps the channel the parent reads (normally
/// stdout) and emits one frame per reported event, flushing each so frames
/// are not held back by stdio buffering.
pub struct Reporter<W: Write> {
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn run_start(&mut self, title: &str) -> std::io::Result<()> {
        self.emit(&RunEvent::RunStart {
            title: title.to_string(),
        })
    }

    pub fn step_end(
        &mut self,
        title: &str,
        duration: f64,
        status: StepStatus,
        error: Option<&str>,
    ) -> std::io::Result<()> {
        self.emit(&RunEvent::StepEnd {
            title: title.to_string(),
            duration,
            status,
            error: error.map(|e| e.to_string()),
        })
    }

    pub fn artifact_add(
        &mut self,
        failed_step_index: usize,
        screenshot_base64: &str,
        step_title: Option<&str>,
    ) -> std::io::Result<()> {
        self.emit(&RunEvent::ArtifactAdd {
            failed_step_index,
            screenshot_base64: screenshot_base64.to_string(),
            step_title: step_title.map(|t| t.to_string()),
        })
    }

    pub fn run_end(&mut self, status: &str, duration: f64) -> std::io::Result<()> {
        self.emit(&RunEvent::RunEnd {
            status: status.to_string(),
            duration,
        })
    }

    fn emit(&mut self, event: &RunEvent) -> std::io::Result<()> {
        let frame = encode_frame(event).map_err(std::io::Error::other)?;
        self.out.write_all(frame.as_bytes())?;
        self.out.flush()
    }
}
