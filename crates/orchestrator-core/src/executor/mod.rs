//! Workflow executor (spec §4.4): runs a workflow definition against a
//! parameter scope, producing per-step logs, outputs, and a final status.

pub mod dag;
pub mod registry;
pub mod steps;
pub mod template;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub use registry::{StepContext, StepExecutionError, StepExecutor, StepLog, StepRegistry};
pub use template::ParameterScope;

use crate::contracts::error::ErrorRecord;
use crate::contracts::workflow::{
    StepDefinition, StepExecutionStatus, WorkflowDefinition, WorkflowExecutionStatus,
    WorkflowStepExecution,
};
use crate::persistence::{OrchestrationStore, StoreError};
use crate::reliability::{with_timeout, CircuitBreaker, CircuitBreakerConfig, RetryPolicy, TimeoutOutcome};

/// Errors that abort a workflow run before it can reach a final status —
/// infrastructure failures, not step failures (those are recorded on the
/// step/workflow rows themselves, per spec §7).
#[derive(Debug, thiserror::Error)]
pub enum WorkflowRunError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

const MAX_PARALLEL_GROUP_WORKERS: usize = 8;

fn default_timeout_for(step_type: &str) -> Duration {
    if step_type == "policy" {
        crate::reliability::DEFAULT_POLICY_STEP_TIMEOUT
    } else {
        crate::reliability::DEFAULT_STEP_TIMEOUT
    }
}

fn is_truthy(value: &str) -> bool {
    !matches!(value.trim(), "" | "false" | "0")
}

/// Runs workflow definitions against a store and a step registry. One
/// instance is shared across all concurrently-running workflow executions
/// in the process (spec §5: "multiple Workflow Executions run in parallel
/// across the process").
pub struct WorkflowExecutor<S: OrchestrationStore> {
    store: Arc<S>,
    registry: Arc<StepRegistry>,
    breakers: Mutex<HashMap<(String, String), CircuitBreaker>>,
    circuit_breaker_config: CircuitBreakerConfig,
}

impl<S: OrchestrationStore> WorkflowExecutor<S> {
    pub fn new(store: Arc<S>, registry: Arc<StepRegistry>) -> Self {
        Self {
            store,
            registry,
            breakers: Mutex::new(HashMap::new()),
            circuit_breaker_config: CircuitBreakerConfig::default(),
        }
    }

    fn allow_dispatch(&self, provider_name: &str, step_type: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry((provider_name.to_string(), step_type.to_string()))
            .or_insert_with(|| CircuitBreaker::new(self.circuit_breaker_config.clone()))
            .allow_call()
    }

    fn record_dispatch_outcome(&self, provider_name: &str, step_type: &str, success: bool) {
        let mut breakers = self.breakers.lock().unwrap();
        let breaker = breakers
            .entry((provider_name.to_string(), step_type.to_string()))
            .or_insert_with(|| CircuitBreaker::new(self.circuit_breaker_config.clone()));
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    /// Runs one workflow execution to completion (spec §4.4 steps 1-4).
    /// `provider_name` keys the circuit breaker alongside the step type;
    /// `scope` already carries the resource/override parameter union the
    /// engine assembled (spec §4.3).
    #[instrument(skip(self, workflow, scope, cancel))]
    pub async fn run_workflow(
        &self,
        execution_id: Uuid,
        provider_name: &str,
        application_name: &str,
        workflow: &WorkflowDefinition,
        mut scope: ParameterScope,
        cancel: CancellationToken,
    ) -> Result<WorkflowExecutionStatus, WorkflowRunError> {
        self.store
            .update_workflow_execution_status(execution_id, WorkflowExecutionStatus::Running, None)
            .await?;
        info!(%execution_id, workflow = %workflow.name, "workflow execution started");

        let units = dag::plan(&workflow.steps);
        let mut aborted = false;
        let mut failed = false;

        for unit in units {
            if aborted {
                self.skip_unit(execution_id, &unit).await?;
                continue;
            }
            if cancel.is_cancelled() {
                warn!(%execution_id, "cancellation observed before next unit, skipping remainder");
                aborted = true;
                self.skip_unit(execution_id, &unit).await?;
                continue;
            }

            match unit {
                dag::ExecutionUnit::Single(step) => {
                    let outcome = self
                        .run_step(execution_id, provider_name, application_name, step, &scope, &cancel)
                        .await?;
                    if let Some(outputs) = outcome.outputs {
                        scope.record_step_outputs(&step.name, outputs);
                    }
                    if outcome.failed && !step.continue_on_error {
                        failed = true;
                        aborted = true;
                    }
                }
                dag::ExecutionUnit::Parallel { steps, .. } => {
                    let results = self
                        .run_parallel_group(execution_id, provider_name, application_name, &steps, &scope, &cancel)
                        .await?;
                    for (step, outcome) in steps.iter().zip(results) {
                        if let Some(outputs) = outcome.outputs {
                            scope.record_step_outputs(&step.name, outputs);
                        }
                        if outcome.failed && !step.continue_on_error {
                            failed = true;
                            aborted = true;
                        }
                    }
                }
            }
        }

        let final_status = if cancel.is_cancelled() {
            WorkflowExecutionStatus::Canceled
        } else if failed {
            WorkflowExecutionStatus::Failed
        } else {
            WorkflowExecutionStatus::Completed
        };

        let error = match final_status {
            WorkflowExecutionStatus::Failed => {
                Some(ErrorRecord::new("StepExecutionFailure", "one or more required steps failed"))
            }
            WorkflowExecutionStatus::Canceled => {
                Some(ErrorRecord::new("Canceled", "workflow execution was canceled"))
            }
            _ => None,
        };

        self.store
            .update_workflow_execution_status(execution_id, final_status, error)
            .await?;
        info!(%execution_id, status = %final_status, "workflow execution finished");

        Ok(final_status)
    }

    async fn skip_unit(
        &self,
        execution_id: Uuid,
        unit: &dag::ExecutionUnit<'_>,
    ) -> Result<(), WorkflowRunError> {
        match unit {
            dag::ExecutionUnit::Single(step) => self.record_skipped(execution_id, step).await,
            dag::ExecutionUnit::Parallel { steps, .. } => {
                for step in steps {
                    self.record_skipped(execution_id, step).await?;
                }
                Ok(())
            }
        }
    }

    async fn record_skipped(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
    ) -> Result<(), WorkflowRunError> {
        let mut execution = WorkflowStepExecution::new(execution_id, step, Uuid::now_v7().to_string());
        execution.status = StepExecutionStatus::Skipped;
        self.store.create_step_execution(execution).await?;
        Ok(())
    }

    async fn run_parallel_group(
        &self,
        execution_id: Uuid,
        provider_name: &str,
        application_name: &str,
        steps: &[&StepDefinition],
        scope: &ParameterScope,
        cancel: &CancellationToken,
    ) -> Result<Vec<StepRunOutcome>, WorkflowRunError> {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(
            steps.len().min(MAX_PARALLEL_GROUP_WORKERS),
        ));
        let futures = steps.iter().copied().map(|step| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                self.run_step(execution_id, provider_name, application_name, step, scope, cancel)
                    .await
            }
        });

        join_all(futures).await.into_iter().collect()
    }

    /// Runs one step: render config, evaluate `when`, dispatch with retry +
    /// circuit breaker + timeout, enforce the visibility invariant, persist
    /// the row (spec §4.4 step 3).
    async fn run_step(
        &self,
        execution_id: Uuid,
        provider_name: &str,
        application_name: &str,
        step: &StepDefinition,
        scope: &ParameterScope,
        cancel: &CancellationToken,
    ) -> Result<StepRunOutcome, WorkflowRunError> {
        if let Some(when) = &step.when {
            let rendered = template::render_config(
                &HashMap::from([("when".to_string(), Value::String(when.clone()))]),
                scope,
            );
            let condition = rendered
                .get("when")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !is_truthy(condition) {
                debug!(step = %step.name, condition, "step skipped: when condition is false");
                self.record_skipped(execution_id, step).await?;
                return Ok(StepRunOutcome {
                    outputs: None,
                    failed: false,
                });
            }
        }

        let rendered_config = template::render_config(&step.config, scope);

        if !self.registry.contains(&step.step_type) {
            error!(step = %step.name, step_type = %step.step_type, "unknown step type");
            return self
                .create_failed_step_execution(execution_id, step, "unknown step type", StepLog::new())
                .await;
        }

        let mut execution =
            WorkflowStepExecution::new(execution_id, step, Uuid::now_v7().to_string());
        execution.status = StepExecutionStatus::Running;
        execution.started_at = Some(chrono::Utc::now());
        let execution = self.store.create_step_execution(execution).await?;

        let timeout = step.timeout.unwrap_or_else(|| default_timeout_for(&step.step_type));
        let policy = step.retry_policy.clone().unwrap_or_else(RetryPolicy::no_retry);
        let executor = self
            .registry
            .get(&step.step_type)
            .expect("checked contains above");

        let mut attempt = 1;
        loop {
            if !self.allow_dispatch(provider_name, &step.step_type) {
                warn!(step = %step.name, provider_name, "circuit breaker open, failing step without dispatch");
                return self
                    .fail_step_execution(
                        execution.id,
                        "circuit breaker open for this provider/step type",
                        StepLog::new(),
                    )
                    .await;
            }

            let mut log = StepLog::new();
            let ctx = StepContext {
                step_name: &step.name,
                config: &rendered_config,
                scope,
                application_name,
                workflow_execution_id: execution_id,
                timeout,
            };

            let outcome = with_timeout(timeout, executor.execute(ctx, &mut log)).await;

            match outcome {
                TimeoutOutcome::Completed(Ok(outputs)) => {
                    self.record_dispatch_outcome(provider_name, &step.step_type, true);
                    self.store
                        .update_step_execution(
                            execution.id,
                            StepExecutionStatus::Completed,
                            log.into_string(),
                            outputs.clone(),
                            None,
                        )
                        .await?;
                    return Ok(StepRunOutcome {
                        outputs: Some(outputs),
                        failed: false,
                    });
                }
                TimeoutOutcome::Completed(Err(step_err)) => {
                    self.record_dispatch_outcome(provider_name, &step.step_type, false);
                    if policy.should_retry(None) && policy.has_attempts_remaining(attempt) {
                        let delay = policy.delay_for_attempt(attempt + 1);
                        warn!(step = %step.name, attempt, error = %step_err, ?delay, "step failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return self
                        .fail_step_execution(execution.id, &step_err.message, log)
                        .await;
                }
                TimeoutOutcome::TimedOut => {
                    self.record_dispatch_outcome(provider_name, &step.step_type, false);
                    if cancel.is_cancelled() {
                        return self
                            .fail_step_execution(execution.id, "canceled mid-step", log)
                            .await;
                    }
                    if policy.should_retry(Some("StepTimeout")) && policy.has_attempts_remaining(attempt) {
                        let delay = policy.delay_for_attempt(attempt + 1);
                        warn!(step = %step.name, attempt, elapsed_ms = timeout.as_millis() as u64, ?delay, "step timed out, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return self
                        .fail_step_execution(
                            execution.id,
                            &format!("timed out after {} ms", timeout.as_millis()),
                            log,
                        )
                        .await;
                }
            }
        }
    }

    /// Used when a step is rejected before it ever starts running (e.g.
    /// unknown step type): creates the row directly in `failed` state.
    async fn create_failed_step_execution(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        message: &str,
        log: StepLog,
    ) -> Result<StepRunOutcome, WorkflowRunError> {
        let mut execution = WorkflowStepExecution::new(execution_id, step, Uuid::now_v7().to_string());
        execution.status = StepExecutionStatus::Failed;
        execution.logs = log.into_string();
        execution.ensure_visible_failure_logs();
        execution.error = Some(ErrorRecord::new("StepExecutionFailure", message));
        self.store.create_step_execution(execution).await?;

        Ok(StepRunOutcome {
            outputs: None,
            failed: true,
        })
    }

    /// Transitions an already-`running` step row to `failed`, enforcing the
    /// visibility invariant (spec §7): a failed step's logs are never empty.
    async fn fail_step_execution(
        &self,
        step_execution_id: Uuid,
        message: &str,
        log: StepLog,
    ) -> Result<StepRunOutcome, WorkflowRunError> {
        let mut logs = log.into_string();
        if logs.trim().is_empty() {
            logs = crate::contracts::workflow::NO_OUTPUT_SENTINEL.to_string();
        }
        self.store
            .update_step_execution(
                step_execution_id,
                StepExecutionStatus::Failed,
                logs,
                Value::Object(Default::default()),
                Some(ErrorRecord::new("StepExecutionFailure", message)),
            )
            .await?;

        Ok(StepRunOutcome {
            outputs: None,
            failed: true,
        })
    }
}

struct StepRunOutcome {
    outputs: Option<Value>,
    failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::workflow::{WorkflowCategory, WorkflowExecution};
    use crate::persistence::InMemoryStore;
    use std::collections::HashMap as StdHashMap;

    fn policy_step(name: &str, command: &str, args: &[&str]) -> StepDefinition {
        let mut config = StdHashMap::new();
        config.insert("command".to_string(), Value::from(command));
        config.insert(
            "args".to_string(),
            Value::from(args.iter().map(|a| a.to_string()).collect::<Vec<_>>()),
        );
        StepDefinition {
            name: name.to_string(),
            step_type: "policy".into(),
            config,
            parallel_group: None,
            when: None,
            continue_on_error: false,
            retry_policy: None,
            timeout: None,
        }
    }

    fn workflow(name: &str, steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: String::new(),
            category: WorkflowCategory::Provisioner,
            tags: vec![],
            steps,
            inputs: None,
        }
    }

    async fn new_executor() -> (Arc<WorkflowExecutor<InMemoryStore>>, Arc<InMemoryStore>, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(StepRegistry::with_default_executors());
        let executor = Arc::new(WorkflowExecutor::new(Arc::clone(&store), Arc::clone(&registry)));
        let execution = store
            .create_workflow_execution(WorkflowExecution::new("demo", "wf"))
            .await
            .unwrap();
        (executor, store, execution.id)
    }

    #[tokio::test]
    async fn zero_step_workflow_completes_immediately() {
        let (executor, _store, execution_id) = new_executor().await;
        let wf = workflow("empty", vec![]);
        let status = executor
            .run_workflow(
                execution_id,
                "provider",
                "demo",
                &wf,
                ParameterScope::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn continue_on_error_step_failure_still_completes_workflow() {
        let (executor, store, execution_id) = new_executor().await;
        let mut failing = policy_step("flaky", "sh", &["-c", "exit 1"]);
        failing.continue_on_error = true;
        let ok = policy_step("after", "true", &[]);
        let wf = workflow("tolerant", vec![failing, ok]);

        let status = executor
            .run_workflow(
                execution_id,
                "provider",
                "demo",
                &wf,
                ParameterScope::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Completed);

        let steps = store.get_step_executions(execution_id).await.unwrap();
        let flaky = steps.iter().find(|s| s.step_name == "flaky").unwrap();
        assert_eq!(flaky.status, StepExecutionStatus::Failed);
        let after = steps.iter().find(|s| s.step_name == "after").unwrap();
        assert_eq!(after.status, StepExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn required_step_failure_aborts_remaining_steps() {
        let (executor, store, execution_id) = new_executor().await;
        let failing = policy_step("flaky", "sh", &["-c", "echo boom; exit 1"]);
        let never_runs = policy_step("after", "true", &[]);
        let wf = workflow("strict", vec![failing, never_runs]);

        let status = executor
            .run_workflow(
                execution_id,
                "provider",
                "demo",
                &wf,
                ParameterScope::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Failed);

        let steps = store.get_step_executions(execution_id).await.unwrap();
        let flaky = steps.iter().find(|s| s.step_name == "flaky").unwrap();
        assert_eq!(flaky.status, StepExecutionStatus::Failed);
        assert!(flaky.logs.contains("boom"));
        let after = steps.iter().find(|s| s.step_name == "after").unwrap();
        assert_eq!(after.status, StepExecutionStatus::Skipped);
    }

    #[tokio::test]
    async fn cancellation_mid_flight_finishes_current_step_and_skips_the_rest() {
        let (executor, store, execution_id) = new_executor().await;
        let steps = vec![
            policy_step("one", "sh", &["-c", "sleep 0.3"]),
            policy_step("two", "sh", &["-c", "sleep 0.3"]),
            policy_step("three", "sh", &["-c", "sleep 0.3"]),
        ];
        let wf = workflow("cancelable", steps);
        let cancel = CancellationToken::new();

        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel_clone.cancel();
        });

        let status = executor
            .run_workflow(execution_id, "provider", "demo", &wf, ParameterScope::new(), cancel)
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Canceled);

        let recorded = store.get_step_executions(execution_id).await.unwrap();
        let one = recorded.iter().find(|s| s.step_name == "one").unwrap();
        assert_eq!(one.status, StepExecutionStatus::Completed);
        let two = recorded.iter().find(|s| s.step_name == "two").unwrap();
        assert_eq!(two.status, StepExecutionStatus::Skipped);
        let three = recorded.iter().find(|s| s.step_name == "three").unwrap();
        assert_eq!(three.status, StepExecutionStatus::Skipped);
    }

    #[tokio::test]
    async fn sequential_step_outputs_are_visible_to_the_next_step() {
        let (executor, store, execution_id) = new_executor().await;
        let mut first_config = StdHashMap::new();
        first_config.insert("command".to_string(), Value::from("echo"));
        first_config.insert("args".to_string(), Value::from(vec!["hi"]));
        let first = StepDefinition {
            name: "first".into(),
            step_type: "policy".into(),
            config: first_config,
            parallel_group: None,
            when: None,
            continue_on_error: false,
            retry_policy: None,
            timeout: None,
        };

        let mut second_config = StdHashMap::new();
        second_config.insert(
            "command".to_string(),
            Value::from("echo"),
        );
        second_config.insert(
            "args".to_string(),
            Value::from(vec!["{{ .outputs.first.exit_code }}"]),
        );
        let second = StepDefinition {
            name: "second".into(),
            step_type: "policy".into(),
            config: second_config,
            parallel_group: None,
            when: None,
            continue_on_error: false,
            retry_policy: None,
            timeout: None,
        };

        let wf = workflow("chained", vec![first, second]);
        let status = executor
            .run_workflow(
                execution_id,
                "provider",
                "demo",
                &wf,
                ParameterScope::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Completed);

        let steps = store.get_step_executions(execution_id).await.unwrap();
        let second = steps.iter().find(|s| s.step_name == "second").unwrap();
        assert!(second.logs.contains('0'));
    }

    #[tokio::test]
    async fn parallel_group_of_one_behaves_like_a_single_sequential_step() {
        let (executor, store, execution_id) = new_executor().await;
        let mut only = policy_step("solo", "true", &[]);
        only.parallel_group = Some("g".to_string());
        let wf = workflow("solo-group", vec![only]);

        let status = executor
            .run_workflow(
                execution_id,
                "provider",
                "demo",
                &wf,
                ParameterScope::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Completed);

        let steps = store.get_step_executions(execution_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_step_type_fails_the_step_and_the_workflow() {
        let (executor, store, execution_id) = new_executor().await;
        let step = StepDefinition {
            name: "mystery".into(),
            step_type: "smoke-signal".into(),
            config: StdHashMap::new(),
            parallel_group: None,
            when: None,
            continue_on_error: false,
            retry_policy: None,
            timeout: None,
        };
        let wf = workflow("unknown-type", vec![step]);

        let status = executor
            .run_workflow(
                execution_id,
                "provider",
                "demo",
                &wf,
                ParameterScope::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Failed);

        let steps = store.get_step_executions(execution_id).await.unwrap();
        let mystery = &steps[0];
        assert_eq!(mystery.status, StepExecutionStatus::Failed);
        assert!(!mystery.logs.trim().is_empty());
    }

    #[tokio::test]
    async fn when_false_skips_the_step_without_failing() {
        let (executor, store, execution_id) = new_executor().await;
        let mut skipped = policy_step("conditional", "true", &[]);
        skipped.when = Some("false".to_string());
        let wf = workflow("conditional-wf", vec![skipped]);

        let status = executor
            .run_workflow(
                execution_id,
                "provider",
                "demo",
                &wf,
                ParameterScope::new(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, WorkflowExecutionStatus::Completed);

        let steps = store.get_step_executions(execution_id).await.unwrap();
        assert_eq!(steps[0].status, StepExecutionStatus::Skipped);
    }
}
