//! `kubernetes` step: reference executor.
//!
//! The real cluster client is an external collaborator (spec §1); this
//! satisfies the dispatch contract so the registry's minimum-set
//! requirement (spec §4.4) holds without fabricating a Kubernetes client.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::super::registry::{StepContext, StepExecutionError, StepExecutor, StepLog};

pub struct KubernetesStepExecutor;

#[async_trait]
impl StepExecutor for KubernetesStepExecutor {
    async fn execute(
        &self,
        ctx: StepContext<'_>,
        log: &mut StepLog,
    ) -> Result<Value, StepExecutionError> {
        let manifest = ctx.config.get("manifest");
        log.append(format!(
            "no-op: external integration (kubernetes apply for step '{}')",
            ctx.step_name
        ));
        Ok(json!({
            "status": "no-op: external integration",
            "manifest_rendered": manifest.is_some(),
        }))
    }
}
