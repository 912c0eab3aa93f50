//! Step and run results.
//!
//! The step executor never propagates failures across its boundary; every
//! attempted step produces exactly one `StepResult`, persisted as
//! `meta.json` under the step's log directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a step failed, when the cause was not the user script itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The user script exited nonzero.
    Script,
    ImagePull(String),
    ImageNotFound(String),
    ContainerStart(String),
    ServiceNotReady(String),
    Timeout,
    Cancelled,
    Internal(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Script => write!(f, "script exited with a nonzero code"),
            FailureReason::ImagePull(msg) => write!(f, "image pull failed: {msg}"),
            FailureReason::ImageNotFound(msg) => write!(f, "image not found: {msg}"),
            FailureReason::ContainerStart(msg) => write!(f, "container start failed: {msg}"),
            FailureReason::ServiceNotReady(msg) => write!(f, "service not ready: {msg}"),
            FailureReason::Timeout => write!(f, "step exceeded its maximum run time"),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

/// A file captured from the build directory by an artifact pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the build directory.
    pub path: String,
    pub size: u64,
}

/// Outcome of the cache persistence pass for one declared cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub key: String,
    /// False when the cache path did not exist or was empty at step end.
    pub persisted: bool,
}

/// Produced exactly once per attempted step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub name: String,
    pub exit_code: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub artifacts: Vec<ArtifactEntry>,
    pub caches: Vec<CacheEntry>,
    pub failure: Option<FailureReason>,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.failure.is_none()
    }

    /// A result for a step that failed before its container could run.
    pub fn aborted(step_id: &str, name: &str, started_at: DateTime<Utc>, reason: FailureReason) -> Self {
        Self {
            step_id: step_id.to_string(),
            name: name.to_string(),
            exit_code: 1,
            started_at,
            ended_at: Utc::now(),
            artifacts: Vec::new(),
            caches: Vec::new(),
            failure: Some(reason),
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub success: bool,
    pub steps: Vec<StepResult>,
}

impl RunResult {
    /// Process exit code at the tool boundary: 0 success, 1 step failure.
    pub fn exit_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_results_fail_with_nominal_exit_code() {
        let result = StepResult::aborted(
            "proj-1-0-0-build",
            "build",
            Utc::now(),
            FailureReason::ImagePull("dial tcp: timeout".into()),
        );
        assert!(!result.succeeded());
        assert_eq!(result.exit_code, 1);
        assert!(matches!(result.failure, Some(FailureReason::ImagePull(_))));
    }

    #[test]
    fn zero_exit_with_no_failure_is_success() {
        let result = StepResult {
            step_id: "id".into(),
            name: "build".into(),
            exit_code: 0,
            started_at: Utc::now(),
            ended_at: Utc::now(),
            artifacts: vec![],
            caches: vec![],
            failure: None,
        };
        assert!(result.succeeded());
    }

    #[test]
    fn run_exit_code_maps_success() {
        let run = RunResult {
            run_id: "r".into(),
            success: true,
            steps: vec![],
        };
        assert_eq!(run.exit_code(), 0);
        let run = RunResult { success: false, ..run };
        assert_eq!(run.exit_code(), 1);
    }
}
