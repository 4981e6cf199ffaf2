use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Outcome of a single step slot. Transitions only Pending -> Passed/Failed;
/// the tracker never writes a slot twice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Passed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid step status: {}", s)),
        }
    }
}

/// A persisted test run. The step list is fixed at creation from the
/// template names and is never resized while the run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub name: String,
    pub script_path: Option<String>,
    pub target_url: Option<String>,
    pub status: RunStatus,
    pub created_at: String,
    pub last_run: Option<String>,
    /// Total duration of the last execution, in milliseconds.
    pub duration: Option<f64>,
    /// Free-text failure summary from the last execution.
    pub last_result: Option<String>,
}

/// One named, ordered slot of a run's expected progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub status: StepStatus,
    /// Step duration in milliseconds.
    pub duration: f64,
    pub error: Option<String>,
    pub screenshot_url: Option<String>,
}

/// Aggregated view of a run and its step array, used for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<Step>,
}
