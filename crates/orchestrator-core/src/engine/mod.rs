//! Orchestration engine (spec §4.3): polls for pending work, resolves
//! providers, launches workflow executions asynchronously, and reconciles
//! resource state once a workflow finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::contracts::error::{EngineError, ErrorRecord, ResolverError};
use crate::contracts::provider::Operation;
use crate::contracts::resource::{ResourceInstance, ResourceState};
use crate::contracts::workflow::{WorkflowDefinition, WorkflowExecution, WorkflowExecutionStatus};
use crate::executor::{ParameterScope, WorkflowExecutor};
use crate::persistence::OrchestrationStore;
use crate::resolver::ProviderResolver;
use crate::resource::{ResourceError, ResourceManager};

/// Tunables named in SPEC_FULL.md §10. `strict_resolution` lives on the
/// resolver itself (`ResolveMode`) rather than duplicated here.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub poll_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            poll_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Outcome of one resource's admission attempt in a tick, used for the
/// tick's summary counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Launched,
    RejectedUnknownType,
    AbandonedConcurrent,
}

/// Per-tick counts, useful for tests and tick-level logging.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub pending_seen: usize,
    pub launched: usize,
    pub rejected_unknown_type: usize,
    pub abandoned_concurrent: usize,
}

/// Closes the loop from "resource exists in state=requested" to "workflow
/// has been launched and state updated" (spec §4.3).
pub struct Engine<S: OrchestrationStore> {
    resources: Arc<ResourceManager<S>>,
    resolver: Arc<ProviderResolver>,
    executor: Arc<WorkflowExecutor<S>>,
    config: EngineConfig,
    /// One entry per in-flight workflow execution, keyed by execution id, so
    /// an external `cancel_workflow` call can reach the right token (spec
    /// §5/§6). Removed once the execution finishes.
    cancel_tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl<S: OrchestrationStore> Engine<S> {
    pub fn new(
        resources: Arc<ResourceManager<S>>,
        resolver: Arc<ProviderResolver>,
        executor: Arc<WorkflowExecutor<S>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            resources,
            resolver,
            executor,
            config,
            cancel_tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs the poll loop until `cancel` fires, following the teacher's
    /// `tokio::time::interval` + cancellation-token idiom used for its
    /// worker pool's poll/heartbeat/reclaim loops.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("engine poll loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(summary) => debug!(?summary, "engine tick complete"),
                        Err(err) => error!(%err, "engine tick failed"),
                    }
                }
            }
        }
    }

    /// One poll iteration (spec §4.3 control loop, steps 1-2). Never blocks
    /// on a launched workflow's completion (step 2d): the hand-off spawns
    /// the executor run and returns immediately.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickSummary, EngineError> {
        let pending = self.resources.get_pending().await?;
        let pending_seen = pending.len();

        let launched = AtomicUsize::new(0);
        let rejected = AtomicUsize::new(0);
        let abandoned = AtomicUsize::new(0);

        stream::iter(pending)
            .for_each_concurrent(self.config.poll_concurrency, |resource| {
                let launched = &launched;
                let rejected = &rejected;
                let abandoned = &abandoned;
                async move {
                    match self.admit(resource).await {
                        Outcome::Launched => {
                            launched.fetch_add(1, Ordering::Relaxed);
                        }
                        Outcome::RejectedUnknownType => {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                        Outcome::AbandonedConcurrent => {
                            abandoned.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        Ok(TickSummary {
            pending_seen,
            launched: launched.load(Ordering::Relaxed),
            rejected_unknown_type: rejected.load(Ordering::Relaxed),
            abandoned_concurrent: abandoned.load(Ordering::Relaxed),
        })
    }

    /// Spec §4.3 step 2, one pending resource: resolve, create the
    /// workflow execution row, guarded transition to `provisioning`, hand
    /// off.
    async fn admit(&self, resource: ResourceInstance) -> Outcome {
        let (provider_name, workflow_name) =
            match self.resolver.resolve(&resource.resource_type, Operation::Create, None) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(
                        resource_id = %resource.id,
                        resource_type = %resource.resource_type,
                        %err,
                        "unknown resource type, failing resource"
                    );
                    let error_record = ErrorRecord::from(&err);
                    if let Err(e) = self
                        .resources
                        .transition_state(
                            resource.id,
                            resource.state,
                            ResourceState::Failed,
                            resource.version,
                            Some(error_record),
                            None,
                        )
                        .await
                    {
                        error!(%e, resource_id = %resource.id, "failed to mark resource failed after resolver error");
                    }
                    return Outcome::RejectedUnknownType;
                }
            };

        let workflow_def = match self.resolver.find_workflow(&provider_name, &workflow_name) {
            Some(wf) => wf.clone(),
            None => {
                error!(
                    provider_name,
                    workflow_name, "resolver returned a workflow its own provider doesn't declare"
                );
                return Outcome::RejectedUnknownType;
            }
        };

        let mut execution =
            WorkflowExecution::new(resource.application_name.clone(), workflow_name.clone());
        execution.status = WorkflowExecutionStatus::Pending;
        let execution = match self.resources.store().create_workflow_execution(execution).await {
            Ok(e) => e,
            Err(e) => {
                error!(%e, "failed to create workflow execution row");
                return Outcome::AbandonedConcurrent;
            }
        };

        let transitioned = self
            .resources
            .transition_state(
                resource.id,
                resource.state,
                ResourceState::Provisioning,
                resource.version,
                None,
                Some(execution.id),
            )
            .await;

        let resource = match transitioned {
            Ok(r) => r,
            Err(ResourceError::ConcurrentModification { .. }) => {
                debug!(resource_id = %resource.id, "abandoned: another worker already picked this resource up");
                return Outcome::AbandonedConcurrent;
            }
            Err(e) => {
                error!(%e, resource_id = %resource.id, "failed to transition resource to provisioning");
                return Outcome::AbandonedConcurrent;
            }
        };

        let scope = build_parameter_scope(&resource, &Value::Null);
        self.hand_off(
            Some(resource.id),
            resource.application_name.clone(),
            provider_name,
            workflow_def,
            execution.id,
            scope,
        );
        Outcome::Launched
    }

    /// Spawns the workflow execution without awaiting it (spec §4.3 step
    /// 2d). Reconciliation runs once the spawned task finishes, but only
    /// when the execution is bound to a resource — an explicitly triggered
    /// golden-path run (`trigger_workflow`) has nothing to reconcile.
    fn hand_off(
        &self,
        resource_id: Option<Uuid>,
        application_name: String,
        provider_name: String,
        workflow_def: WorkflowDefinition,
        execution_id: Uuid,
        scope: ParameterScope,
    ) {
        let executor = Arc::clone(&self.executor);
        let resources = Arc::clone(&self.resources);
        let cancel_tokens = Arc::clone(&self.cancel_tokens);
        let cancel = CancellationToken::new();
        cancel_tokens.lock().unwrap().insert(execution_id, cancel.clone());

        tokio::spawn(async move {
            let outcome = executor
                .run_workflow(execution_id, &provider_name, &application_name, &workflow_def, scope, cancel)
                .await;
            cancel_tokens.lock().unwrap().remove(&execution_id);
            match outcome {
                Ok(status) => {
                    if let Some(resource_id) = resource_id {
                        Self::reconcile(&resources, resource_id, execution_id, status).await;
                    }
                }
                Err(err) => {
                    error!(%err, ?resource_id, %execution_id, "workflow execution aborted by an infrastructure error");
                }
            }
        });
    }

    /// Explicit entry point for an operator-invoked golden-path run (spec
    /// §6 "Trigger a named workflow with a parameter map"; spec §4
    /// `StartWorkflow(workflow_def, parameter_scope)`). Looked up by name
    /// across every loaded provider rather than by resource-type
    /// resolution, since golden-path workflows aren't bound to a resource
    /// operation. Returns the new execution id immediately; the run itself
    /// proceeds in the background like any other hand-off.
    #[instrument(skip(self, parameters))]
    pub async fn trigger_workflow(
        &self,
        application_name: &str,
        workflow_name: &str,
        parameters: Value,
    ) -> Result<Uuid, EngineError> {
        let (provider_name, workflow_def) = self
            .resolver
            .find_workflow_by_name(workflow_name)
            .ok_or_else(|| EngineError::Resolver(ResolverError::UnknownWorkflow(workflow_name.to_string())))?;

        let mut execution =
            WorkflowExecution::new(application_name.to_string(), workflow_name.to_string());
        execution.status = WorkflowExecutionStatus::Pending;
        let execution = self.resources.store().create_workflow_execution(execution).await?;

        let mut parameter_map = serde_json::Map::new();
        if let Value::Object(params) = parameters {
            parameter_map = params;
        }
        let mut metadata = serde_json::Map::new();
        metadata.insert("app_name".to_string(), json!(application_name));

        let scope = ParameterScope {
            parameters: parameter_map,
            outputs: HashMap::new(),
            metadata,
        };

        info!(execution_id = %execution.id, workflow = workflow_name, "golden-path workflow triggered");
        self.hand_off(
            None,
            application_name.to_string(),
            provider_name,
            workflow_def,
            execution.id,
            scope,
        );
        Ok(execution.id)
    }

    /// External cancel entry point (spec §5 "Cancellation", §6 "Cancel a
    /// workflow execution"). Marks the execution row `canceled` if it's
    /// still pending/running, then fires the cooperative cancellation
    /// token so the in-flight executor loop skips its remaining steps once
    /// it next checks. A no-op if the execution already finished or was
    /// never started by this process.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let execution = self
            .resources
            .store()
            .get_workflow_execution(execution_id)
            .await?;
        if matches!(
            execution.status,
            WorkflowExecutionStatus::Pending | WorkflowExecutionStatus::Running
        ) {
            self.resources
                .store()
                .update_workflow_execution_status(
                    execution_id,
                    WorkflowExecutionStatus::Canceled,
                    Some(ErrorRecord::new(
                        "Canceled",
                        "workflow execution was canceled by external request",
                    )),
                )
                .await?;
        }

        let token = self.cancel_tokens.lock().unwrap().get(&execution_id).cloned();
        match token {
            Some(token) => token.cancel(),
            None => debug!(
                %execution_id,
                "cancel requested for an execution with no in-flight token (already finished or unknown to this process)"
            ),
        }
        Ok(())
    }

    /// Post-completion reconciliation (spec §4.3): locates the resource
    /// bound to `workflow_execution_id` and transitions it per the
    /// status table, or logs and skips if it's not in an expected
    /// pre-transition state.
    async fn reconcile(
        resources: &Arc<ResourceManager<S>>,
        resource_id: Uuid,
        workflow_execution_id: Uuid,
        status: WorkflowExecutionStatus,
    ) {
        let resource = match resources.get(resource_id).await {
            Ok(r) => r,
            Err(e) => {
                error!(%e, %resource_id, "reconciliation: resource lookup failed");
                return;
            }
        };

        if resource.workflow_execution_id != Some(workflow_execution_id) {
            debug!(%resource_id, "reconciliation: resource no longer bound to this execution, skipping");
            return;
        }

        use ResourceState::*;
        use WorkflowExecutionStatus::*;
        let target = match (resource.state, status) {
            (Provisioning, Completed) => Active,
            (Provisioning, Failed) | (Provisioning, Canceled) => Failed,
            (Updating, Completed) => Active,
            (Updating, Failed) | (Updating, Canceled) => Failed,
            (Terminating, Completed) => Terminated,
            (Terminating, Failed) | (Terminating, Canceled) => Failed,
            _ => {
                debug!(
                    %resource_id,
                    state = %resource.state,
                    status = %status,
                    "reconciliation: resource not in an expected pre-transition state, skipping"
                );
                return;
            }
        };

        let error = match status {
            WorkflowExecutionStatus::Failed => {
                Some(ErrorRecord::new("WorkflowFailed", "workflow execution failed"))
            }
            WorkflowExecutionStatus::Canceled => {
                Some(ErrorRecord::new("WorkflowCanceled", "workflow execution was canceled"))
            }
            _ => None,
        };

        if let Err(e) = resources
            .transition_state(resource.id, resource.state, target, resource.version, error, None)
            .await
        {
            error!(%e, %resource_id, "reconciliation transition failed");
        }
    }
}

/// Builds the parameter scope the executor renders templates against (spec
/// §4.3): the union of caller overrides, the resource's own configuration
/// flattened to top-level keys, and spec-level metadata, highest precedence
/// last so later inserts win. A defect in the source omitted this
/// injection entirely, producing `<no value>` template renders (spec §9);
/// every path that hands a workflow to the executor MUST go through this.
fn build_parameter_scope(resource: &ResourceInstance, overrides: &Value) -> ParameterScope {
    let mut parameters = serde_json::Map::new();
    parameters.insert("app_name".to_string(), json!(resource.application_name));
    parameters.insert("resource_name".to_string(), json!(resource.resource_name));
    if let Value::Object(cfg) = &resource.configuration {
        for (k, v) in cfg {
            parameters.insert(k.clone(), v.clone());
        }
    }
    if let Value::Object(over) = overrides {
        for (k, v) in over {
            parameters.insert(k.clone(), v.clone());
        }
    }

    let mut metadata = serde_json::Map::new();
    metadata.insert("app_name".to_string(), json!(resource.application_name));
    metadata.insert("resource_name".to_string(), json!(resource.resource_name));

    ParameterScope {
        parameters,
        outputs: HashMap::new(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::provider::{Provider, ProviderCapabilities};
    use crate::contracts::workflow::{StepDefinition, WorkflowCategory};
    use crate::executor::StepRegistry;
    use crate::persistence::InMemoryStore;
    use crate::resolver::ResolveMode;
    use std::collections::HashMap as StdHashMap;

    fn provider_with_policy_workflow(resource_type: &str, command: &str) -> Provider {
        let workflow_name = format!("create-{resource_type}");
        Provider {
            name: "test-provider".into(),
            version: "1.0.0".into(),
            category: "provisioner".into(),
            capabilities: ProviderCapabilities {
                resource_types: vec![resource_type.to_string()],
                resource_type_capabilities: vec![],
            },
            workflows: vec![WorkflowDefinition {
                name: workflow_name,
                description: String::new(),
                category: WorkflowCategory::Provisioner,
                tags: vec![],
                steps: vec![StepDefinition {
                    name: "run".into(),
                    step_type: "policy".into(),
                    config: StdHashMap::from([("command".to_string(), json!(command))]),
                    parallel_group: None,
                    when: None,
                    continue_on_error: false,
                    retry_policy: None,
                    timeout: None,
                }],
                inputs: None,
            }],
        }
    }

    fn engine_with_provider(resource_type: &str, command: &str) -> (Engine<InMemoryStore>, Arc<ResourceManager<InMemoryStore>>) {
        let store = Arc::new(InMemoryStore::new());
        let resources = Arc::new(ResourceManager::new(Arc::clone(&store)));
        let mut resolver = ProviderResolver::new(ResolveMode::FirstWins);
        resolver.load(provider_with_policy_workflow(resource_type, command));
        let resolver = Arc::new(resolver);
        let registry = Arc::new(StepRegistry::with_default_executors());
        let executor = Arc::new(WorkflowExecutor::new(Arc::clone(&store), registry));
        let engine = Engine::new(Arc::clone(&resources), resolver, executor, EngineConfig::default());
        (engine, resources)
    }

    #[tokio::test]
    async fn tick_launches_a_resolvable_pending_resource() {
        let (engine, resources) = engine_with_provider("postgres-mock", "true");
        let resource = resources
            .create_resource_instance("demo", "db", "postgres-mock", json!({}))
            .await
            .unwrap();

        let summary = engine.tick().await.unwrap();
        assert_eq!(summary.pending_seen, 1);
        assert_eq!(summary.launched, 1);

        let provisioning = resources.get(resource.id).await.unwrap();
        assert_eq!(provisioning.state, ResourceState::Provisioning);
        assert!(provisioning.workflow_execution_id.is_some());
    }

    #[tokio::test]
    async fn tick_fails_unresolvable_resource_type_immediately() {
        let (engine, resources) = engine_with_provider("postgres-mock", "true");
        resources
            .create_resource_instance("demo", "mystery", "unregistered-type", json!({}))
            .await
            .unwrap();

        let summary = engine.tick().await.unwrap();
        assert_eq!(summary.rejected_unknown_type, 1);

        let all = resources.get_by_application("demo").await.unwrap();
        let failed = all.iter().find(|r| r.resource_name == "mystery").unwrap();
        assert_eq!(failed.state, ResourceState::Failed);
        assert!(failed.last_error.is_some());
    }

    #[tokio::test]
    async fn second_tick_does_not_relaunch_an_already_provisioning_resource() {
        let (engine, resources) = engine_with_provider("postgres-mock", "true");
        resources
            .create_resource_instance("demo", "db", "postgres-mock", json!({}))
            .await
            .unwrap();

        let first = engine.tick().await.unwrap();
        assert_eq!(first.launched, 1);

        // Resource is now `provisioning`, no longer returned by GetPending.
        let second = engine.tick().await.unwrap();
        assert_eq!(second.pending_seen, 0);
        assert_eq!(second.launched, 0);
    }

    #[tokio::test]
    async fn reconcile_transitions_provisioning_to_active_on_completed_workflow() {
        let store = Arc::new(InMemoryStore::new());
        let resources = Arc::new(ResourceManager::new(Arc::clone(&store)));
        let resource = resources
            .create_resource_instance("demo", "db", "postgres-mock", json!({}))
            .await
            .unwrap();
        let execution = store
            .create_workflow_execution(WorkflowExecution::new("demo", "create-postgres-mock"))
            .await
            .unwrap();
        let provisioning = resources
            .transition_state(
                resource.id,
                ResourceState::Requested,
                ResourceState::Provisioning,
                resource.version,
                None,
                Some(execution.id),
            )
            .await
            .unwrap();

        Engine::<InMemoryStore>::reconcile(
            &resources,
            provisioning.id,
            execution.id,
            WorkflowExecutionStatus::Completed,
        )
        .await;

        let reconciled = resources.get(resource.id).await.unwrap();
        assert_eq!(reconciled.state, ResourceState::Active);
    }

    #[test]
    fn parameter_scope_precedence_overrides_beat_configuration_beat_metadata() {
        let resource = ResourceInstance::new(
            "demo",
            "db",
            "postgres-mock",
            json!({"app_name": "from-config", "db_name": "orders"}),
        );
        let overrides = json!({"app_name": "from-override"});
        let scope = build_parameter_scope(&resource, &overrides);
        assert_eq!(scope.parameters.get("app_name").unwrap(), "from-override");
        assert_eq!(scope.parameters.get("db_name").unwrap(), "orders");
        assert_eq!(scope.parameters.get("resource_name").unwrap(), "db");
    }

    fn provider_with_goldenpath_workflow(name: &str, shell_command: &str) -> Provider {
        Provider {
            name: "ops-team".into(),
            version: "1.0.0".into(),
            category: "provisioner".into(),
            capabilities: ProviderCapabilities {
                resource_types: vec![],
                resource_type_capabilities: vec![],
            },
            workflows: vec![WorkflowDefinition {
                name: name.to_string(),
                description: String::new(),
                category: WorkflowCategory::Goldenpath,
                tags: vec![],
                steps: vec![StepDefinition {
                    name: "run".into(),
                    step_type: "policy".into(),
                    config: StdHashMap::from([
                        ("command".to_string(), json!("sh")),
                        ("args".to_string(), json!(["-c", shell_command])),
                    ]),
                    parallel_group: None,
                    when: None,
                    continue_on_error: false,
                    retry_policy: None,
                    timeout: None,
                }],
                inputs: None,
            }],
        }
    }

    fn engine_with_goldenpath(name: &str, shell_command: &str) -> (Engine<InMemoryStore>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let resources = Arc::new(ResourceManager::new(Arc::clone(&store)));
        let mut resolver = ProviderResolver::new(ResolveMode::FirstWins);
        resolver.load(provider_with_goldenpath_workflow(name, shell_command));
        let resolver = Arc::new(resolver);
        let registry = Arc::new(StepRegistry::with_default_executors());
        let executor = Arc::new(WorkflowExecutor::new(Arc::clone(&store), registry));
        let engine = Engine::new(resources, resolver, executor, EngineConfig::default());
        (engine, store)
    }

    #[tokio::test]
    async fn trigger_workflow_runs_a_named_golden_path_and_returns_an_execution_id() {
        let (engine, store) = engine_with_goldenpath("nightly-rotation", "true");
        let execution_id = engine
            .trigger_workflow("demo", "nightly-rotation", json!({"target": "db"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let execution = store.get_workflow_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, WorkflowExecutionStatus::Completed);
        assert_eq!(execution.application_name, "demo");
    }

    #[tokio::test]
    async fn trigger_workflow_rejects_unknown_workflow_name() {
        let (engine, _store) = engine_with_goldenpath("nightly-rotation", "true");
        let err = engine
            .trigger_workflow("demo", "mystery", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Resolver(ResolverError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn cancel_workflow_marks_the_execution_row_canceled() {
        let (engine, store) = engine_with_goldenpath("long-running", "sleep 0.3");
        let execution_id = engine
            .trigger_workflow("demo", "long-running", json!({}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        engine.cancel_workflow(execution_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let execution = store.get_workflow_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, WorkflowExecutionStatus::Canceled);
    }

    #[tokio::test]
    async fn cancel_workflow_on_unknown_execution_id_is_an_error() {
        let (engine, _store) = engine_with_goldenpath("nightly-rotation", "true");
        let err = engine.cancel_workflow(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }
}
