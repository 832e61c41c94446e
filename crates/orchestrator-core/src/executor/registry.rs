//! Step-type registry: maps a step's `type` string to its executor.
//!
//! Built once at process start and never mutated afterward (spec §9
//! "Global state"), mirroring the teacher's `WorkflowRegistry`'s
//! `HashMap<String, WorkflowFactory>` shape rather than a trait-object
//! dispatch table keyed by `TypeId`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::template::ParameterScope;

/// Everything a step executor needs to run one step (spec §4.4's
/// `StepExecutor := (ctx, step_def, parameter_scope, app_name, execution_id)`).
pub struct StepContext<'a> {
    pub step_name: &'a str,
    pub config: &'a HashMap<String, Value>,
    pub scope: &'a ParameterScope,
    pub application_name: &'a str,
    pub workflow_execution_id: uuid::Uuid,
    pub timeout: Duration,
}

/// Logs stored inline are truncated at 1 MiB per step, with overflow
/// flagged rather than silently dropped (spec §6).
const MAX_LOG_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n... [log truncated at 1 MiB]";

/// Appended to as a step runs; the executor persists the accumulated text
/// into `WorkflowStepExecution::logs` (spec §4.4 "Log capture contract").
#[derive(Debug, Default)]
pub struct StepLog {
    buffer: String,
    truncated: bool,
}

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, line: impl AsRef<str>) {
        if self.truncated {
            return;
        }
        if !self.buffer.is_empty() {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line.as_ref());
        if self.buffer.len() > MAX_LOG_BYTES {
            let mut cut = MAX_LOG_BYTES;
            while !self.buffer.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buffer.truncate(cut);
            self.truncated = true;
        }
    }

    pub fn into_string(mut self) -> String {
        if self.truncated {
            self.buffer.push_str(TRUNCATION_MARKER);
        }
        self.buffer
    }
}

/// The dispatch contract concrete step implementations satisfy (spec §4.4).
/// `kubernetes`/`terraform`/`git`/`argocd` register minimal reference
/// implementations here; their real backends are external collaborators
/// (spec §1).
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: StepContext<'_>,
        log: &mut StepLog,
    ) -> Result<Value, StepExecutionError>;
}

/// A step executor's own failure, distinct from a timeout (the executor
/// wraps this in `with_timeout`, not the step implementation itself).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct StepExecutionError {
    pub message: String,
}

impl StepExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Process-wide, immutable after construction (spec §9). Built once via
/// [`StepRegistry::with_default_executors`] and shared behind an `Arc`.
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    pub fn register(&mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        self.executors.insert(step_type.into(), executor);
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.executors.contains_key(step_type)
    }

    /// Registers the minimum set spec §4.4 requires: `policy`, `kubernetes`,
    /// `terraform`, `git`, `argocd`.
    pub fn with_default_executors() -> Self {
        let mut registry = Self::new();
        registry.register("policy", Arc::new(super::steps::policy::PolicyStepExecutor));
        registry.register(
            "kubernetes",
            Arc::new(super::steps::kubernetes::KubernetesStepExecutor),
        );
        registry.register(
            "terraform",
            Arc::new(super::steps::terraform::TerraformStepExecutor),
        );
        registry.register("git", Arc::new(super::steps::git::GitStepExecutor));
        registry.register("argocd", Arc::new(super::steps::argocd::ArgocdStepExecutor));
        registry
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_default_executors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_under_the_limit_is_untouched() {
        let mut log = StepLog::new();
        log.append("hello");
        log.append("world");
        assert_eq!(log.into_string(), "hello\nworld");
    }

    #[test]
    fn log_over_one_mib_is_truncated_and_flagged() {
        let mut log = StepLog::new();
        let chunk = "x".repeat(1024);
        for _ in 0..(MAX_LOG_BYTES / 1024 + 4) {
            log.append(&chunk);
        }
        let out = log.into_string();
        assert!(out.len() < MAX_LOG_BYTES + TRUNCATION_MARKER.len() + 1024);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn default_registry_includes_the_minimum_step_types() {
        let registry = StepRegistry::with_default_executors();
        for step_type in ["policy", "kubernetes", "terraform", "git", "argocd"] {
            assert!(registry.contains(step_type), "missing {step_type}");
        }
        assert!(!registry.contains("mystery"));
    }
}
