//! Run type definitions
//!
//! A run is one execution of an assistant against a thread. Runs are created
//! `pending`, picked up FIFO by scheduled time, and finish in one of the
//! terminal statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::config::RunConfig;
use super::metadata::JsonMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Error,
    Success,
    Timeout,
    Interrupted,
}

impl RunStatus {
    /// Whether the run can still produce output.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

/// Policy for launching a run against a thread that already has pending runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultitaskStrategy {
    #[default]
    Reject,
    Rollback,
    Interrupt,
    Enqueue,
}

/// Reason carried by a cancellation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAction {
    #[default]
    Interrupt,
    Rollback,
}

/// Output channels a run may stream on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Values,
    Updates,
    Messages,
    Custom,
    Debug,
    Events,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Values => "values",
            StreamMode::Updates => "updates",
            StreamMode::Messages => "messages",
            StreamMode::Custom => "custom",
            StreamMode::Debug => "debug",
            StreamMode::Events => "events",
        }
    }
}

fn default_stream_mode() -> Vec<StreamMode> {
    vec![StreamMode::Values]
}

/// Execution arguments captured at run creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunKwargs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Resume command for an interrupted graph; mutually exclusive with input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    #[serde(default = "default_stream_mode")]
    pub stream_mode: Vec<StreamMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupt_before: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interrupt_after: Vec<String>,
    #[serde(default, skip_serializing_if = "RunConfig::is_empty")]
    pub config: RunConfig,
    #[serde(default)]
    pub subgraphs: bool,
}

impl Default for RunKwargs {
    fn default() -> Self {
        Self {
            input: None,
            command: None,
            stream_mode: default_stream_mode(),
            interrupt_before: Vec::new(),
            interrupt_after: Vec::new(),
            config: RunConfig::default(),
            subgraphs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub assistant_id: Uuid,
    pub status: RunStatus,
    pub kwargs: RunKwargs,
    #[serde(default)]
    pub multitask_strategy: MultitaskStrategy,
    #[serde(default)]
    pub metadata: JsonMap,
    /// Scheduled time; may be in the future for delayed runs.
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Eligible for the picker: still pending and scheduled at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Pending && self.created_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_run(status: RunStatus, created_at: DateTime<Utc>) -> Run {
        Run {
            run_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            assistant_id: Uuid::new_v4(),
            status,
            kwargs: RunKwargs::default(),
            multitask_strategy: MultitaskStrategy::default(),
            metadata: JsonMap::new(),
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn test_run_due_requires_pending_and_past_schedule() {
        let now = Utc::now();
        assert!(sample_run(RunStatus::Pending, now - Duration::seconds(1)).is_due(now));
        assert!(!sample_run(RunStatus::Pending, now + Duration::seconds(60)).is_due(now));
        assert!(!sample_run(RunStatus::Running, now - Duration::seconds(1)).is_due(now));
    }

    #[test]
    fn test_set_status_advances_updated_at() {
        let created = Utc::now() - Duration::seconds(5);
        let mut run = sample_run(RunStatus::Pending, created);
        run.set_status(RunStatus::Running);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.updated_at > created);
    }

    #[test]
    fn test_kwargs_default_streams_values() {
        let kwargs: RunKwargs = serde_json::from_str("{}").unwrap();
        assert_eq!(kwargs.stream_mode, vec![StreamMode::Values]);
    }
}
