//! `policy` step: runs a local shell/script (spec §4.4's one concrete,
//! testable step type).
//!
//! Config: `command` (string, required), `args` (array of strings,
//! optional), `working_dir` (string, optional). Stdout and stderr are both
//! streamed into the step log as they arrive, so a failing process never
//! leaves `logs` empty (spec §4.4 "Log capture contract").

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::super::registry::{StepContext, StepExecutionError, StepExecutor, StepLog};

pub struct PolicyStepExecutor;

#[async_trait]
impl StepExecutor for PolicyStepExecutor {
    async fn execute(
        &self,
        ctx: StepContext<'_>,
        log: &mut StepLog,
    ) -> Result<Value, StepExecutionError> {
        let command = ctx
            .config
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| StepExecutionError::new("policy step requires a 'command' string"))?;

        let args: Vec<String> = ctx
            .config
            .get("args")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut cmd = Command::new(command);
        cmd.args(&args);
        if let Some(dir) = ctx.config.get("working_dir").and_then(Value::as_str) {
            cmd.current_dir(dir);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| StepExecutionError::new(format!("failed to spawn '{command}': {e}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log.append(line);
            }
        }
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log.append(line);
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| StepExecutionError::new(format!("failed to wait on '{command}': {e}")))?;

        if !status.success() {
            return Err(StepExecutionError::new(format!(
                "'{command}' exited with status {status}"
            )));
        }

        Ok(Value::Object(serde_json::Map::from_iter([(
            "exit_code".to_string(),
            Value::from(status.code().unwrap_or(0)),
        )])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::template::ParameterScope;
    use std::collections::HashMap;
    use std::time::Duration;

    fn config(entries: &[(&str, Value)]) -> HashMap<String, Value> {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn runs_a_command_and_captures_stdout() {
        let executor = PolicyStepExecutor;
        let config = config(&[
            ("command", Value::from("echo")),
            ("args", Value::from(vec!["hello-from-policy"])),
        ]);
        let scope = ParameterScope::new();
        let mut log = StepLog::new();
        let outputs = executor
            .execute(
                StepContext {
                    step_name: "run",
                    config: &config,
                    scope: &scope,
                    application_name: "demo",
                    workflow_execution_id: uuid::Uuid::now_v7(),
                    timeout: Duration::from_secs(5),
                },
                &mut log,
            )
            .await
            .unwrap();

        assert_eq!(outputs.get("exit_code").unwrap(), 0);
        assert!(log.into_string().contains("hello-from-policy"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_step_execution_error_with_logs_preserved() {
        let executor = PolicyStepExecutor;
        let config = config(&[
            ("command", Value::from("sh")),
            ("args", Value::from(vec!["-c", "echo failing; exit 1"])),
        ]);
        let scope = ParameterScope::new();
        let mut log = StepLog::new();
        let err = executor
            .execute(
                StepContext {
                    step_name: "run",
                    config: &config,
                    scope: &scope,
                    application_name: "demo",
                    workflow_execution_id: uuid::Uuid::now_v7(),
                    timeout: Duration::from_secs(5),
                },
                &mut log,
            )
            .await
            .unwrap_err();

        assert!(err.message.contains("exited with status"));
        assert!(log.into_string().contains("failing"));
    }

    #[tokio::test]
    async fn missing_command_is_rejected() {
        let executor = PolicyStepExecutor;
        let config = config(&[]);
        let scope = ParameterScope::new();
        let mut log = StepLog::new();
        let err = executor
            .execute(
                StepContext {
                    step_name: "run",
                    config: &config,
                    scope: &scope,
                    application_name: "demo",
                    workflow_execution_id: uuid::Uuid::now_v7(),
                    timeout: Duration::from_secs(5),
                },
                &mut log,
            )
            .await
            .unwrap_err();
        assert!(err.message.contains("command"));
    }
}
