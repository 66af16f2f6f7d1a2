//! Results of one replay: per-step outcomes and the overall verdict.

use crate::errors::ConductorError;
use crate::types::{PerformanceStatus, StepStatus};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&ConductorError> for StepError {
    fn from(err: &ConductorError) -> Self {
        Self {
            message: err.to_string(),
            details: Some(err.kind().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertion_results: Option<Vec<AssertionResult>>,
}

impl StepResult {
    pub fn passed(step_id: &str, duration_ms: u64) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Passed,
            duration_ms,
            error: None,
            assertion_results: None,
        }
    }

    /// An assert step; its status follows the assertion outcomes.
    pub fn asserted(step_id: &str, duration_ms: u64, outcomes: Vec<AssertionResult>) -> Self {
        let status = if outcomes.iter().all(|outcome| outcome.passed) {
            StepStatus::Passed
        } else {
            StepStatus::Failed
        };
        Self {
            step_id: step_id.to_string(),
            status,
            duration_ms,
            error: None,
            assertion_results: Some(outcomes),
        }
    }

    pub fn errored(step_id: &str, duration_ms: u64, err: &ConductorError) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Error,
            duration_ms,
            error: Some(StepError::from(err)),
            assertion_results: None,
        }
    }

    pub fn skipped(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            duration_ms: 0,
            error: None,
            assertion_results: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    /// Failed assertions plus infrastructural errors.
    pub failed: usize,
}

impl Summary {
    pub fn tally(results: &[StepResult]) -> Self {
        let count = |status: StepStatus| results.iter().filter(|r| r.status == status).count();
        Self {
            total: results.len(),
            passed: count(StepStatus::Passed),
            failed: count(StepStatus::Failed) + count(StepStatus::Error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub id: String,
    pub composition_id: String,
    pub status: PerformanceStatus,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_ms: u64,
    pub summary: Summary,
    pub step_results: Vec<StepResult>,
}

impl Performance {
    pub fn assemble(
        id: String,
        composition_id: &str,
        start_time: i64,
        end_time: i64,
        step_results: Vec<StepResult>,
    ) -> Self {
        let clean = step_results
            .iter()
            .all(|r| !matches!(r.status, StepStatus::Failed | StepStatus::Error));
        Self {
            id,
            composition_id: composition_id.to_string(),
            status: if clean {
                PerformanceStatus::Passed
            } else {
                PerformanceStatus::Failed
            },
            start_time,
            end_time,
            duration_ms: u64::try_from(end_time.saturating_sub(start_time)).unwrap_or(0),
            summary: Summary::tally(&step_results),
            step_results,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == PerformanceStatus::Passed
    }

    pub fn result_for(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }
}
