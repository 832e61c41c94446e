//! Workflow and step entities (spec §3, §4.4).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::contracts::error::ErrorRecord;
use crate::reliability::RetryPolicy;

/// Workflow categories from spec §3: bound to a resource operation, or a
/// named operator-invoked golden path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowCategory {
    Provisioner,
    Goldenpath,
}

/// One step in a workflow template. `config` values may contain `${...}`/
/// `{{ .path }}` placeholders resolved at execution time (spec §3, §4.4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, with = "crate::reliability::option_duration_millis")]
    pub timeout: Option<Duration>,
}

/// A named, ordered collection of typed steps with parameter bindings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub category: WorkflowCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    pub steps: Vec<StepDefinition>,
    #[serde(default)]
    pub inputs: Option<Value>,
}

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl std::fmt::Display for WorkflowExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// One run of a workflow definition, bound to an application (and usually a
/// resource instance, via the resource's `workflow_execution_id`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub application_name: String,
    pub workflow_name: String,
    pub status: WorkflowExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorRecord>,
}

impl WorkflowExecution {
    pub fn new(application_name: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            application_name: application_name.into(),
            workflow_name: workflow_name.into(),
            status: WorkflowExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Status of a single step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// The sentinel logged for a failed step that produced no output before
/// failing (spec §7 visibility invariant).
pub const NO_OUTPUT_SENTINEL: &str = "no output before failure";

/// One step's execution record, appended to as the step runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStepExecution {
    pub id: Uuid,
    pub workflow_execution_id: Uuid,
    pub step_name: String,
    pub step_type: String,
    pub status: StepExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorRecord>,
    pub logs: String,
    pub outputs: Value,
    pub trace_id: String,
}

impl WorkflowStepExecution {
    pub fn new(workflow_execution_id: Uuid, step: &StepDefinition, trace_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_execution_id,
            step_name: step.name.clone(),
            step_type: step.step_type.clone(),
            status: StepExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            logs: String::new(),
            outputs: Value::Object(Default::default()),
            trace_id: trace_id.into(),
        }
    }

    /// Enforces the visibility invariant: a failed step never has empty
    /// logs. Called on the failure path in the executor, not left for each
    /// step executor to remember (spec §7).
    pub fn ensure_visible_failure_logs(&mut self) {
        if self.status == StepExecutionStatus::Failed && self.logs.trim().is_empty() {
            self.logs = NO_OUTPUT_SENTINEL.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_step_with_empty_logs_gets_sentinel() {
        let step = StepDefinition {
            name: "run".into(),
            step_type: "policy".into(),
            config: HashMap::new(),
            parallel_group: None,
            when: None,
            continue_on_error: false,
            retry_policy: None,
            timeout: None,
        };
        let mut exec = WorkflowStepExecution::new(Uuid::now_v7(), &step, "trace-1");
        exec.status = StepExecutionStatus::Failed;
        exec.ensure_visible_failure_logs();
        assert_eq!(exec.logs, NO_OUTPUT_SENTINEL);
    }

    #[test]
    fn failed_step_with_real_logs_keeps_them() {
        let step = StepDefinition {
            name: "run".into(),
            step_type: "policy".into(),
            config: HashMap::new(),
            parallel_group: None,
            when: None,
            continue_on_error: false,
            retry_policy: None,
            timeout: None,
        };
        let mut exec = WorkflowStepExecution::new(Uuid::now_v7(), &step, "trace-1");
        exec.status = StepExecutionStatus::Failed;
        exec.logs = "policy script failed: exit status 1".to_string();
        exec.ensure_visible_failure_logs();
        assert_eq!(exec.logs, "policy script failed: exit status 1");
    }
}
