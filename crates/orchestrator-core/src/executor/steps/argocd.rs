//! `argocd` step: reference executor. See `kubernetes.rs` for rationale.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::super::registry::{StepContext, StepExecutionError, StepExecutor, StepLog};

pub struct ArgocdStepExecutor;

#[async_trait]
impl StepExecutor for ArgocdStepExecutor {
    async fn execute(
        &self,
        ctx: StepContext<'_>,
        log: &mut StepLog,
    ) -> Result<Value, StepExecutionError> {
        log.append(format!(
            "no-op: external integration (argocd app creation for step '{}')",
            ctx.step_name
        ));
        Ok(json!({"status": "no-op: external integration"}))
    }
}
