//! PostgreSQL implementation of [`OrchestrationStore`].
//!
//! Guarded updates use `UPDATE ... WHERE id = $1 AND state = $2 AND
//! version = $3`, mirroring the teacher's `append_events` guarded update
//! over `sequence_num` (spec §9, §4.2).

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::contracts::{
    Application, ErrorRecord, ResourceHint, ResourceInstance, ResourceOutput, ResourceState,
    StepExecutionStatus, WorkflowExecution, WorkflowExecutionStatus, WorkflowStepExecution,
};

use super::store::{OrchestrationStore, StoreError};

/// Production backend over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the embedded migrations (spec §6 table layout).
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn parse_state(s: &str) -> Result<ResourceState, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| StoreError::Database(format!("unrecognized resource state '{s}'")))
}

fn parse_wf_status(s: &str) -> Result<WorkflowExecutionStatus, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| StoreError::Database(format!("unrecognized workflow status '{s}'")))
}

fn parse_step_status(s: &str) -> Result<StepExecutionStatus, StoreError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| StoreError::Database(format!("unrecognized step status '{s}'")))
}

fn row_to_resource(row: &sqlx::postgres::PgRow) -> Result<ResourceInstance, StoreError> {
    let state_str: String = row.get("state");
    let outputs_json: Value = row.get("outputs");
    let hints_json: Value = row.get("hints");
    let last_error_json: Option<Value> = row.get("last_error");

    Ok(ResourceInstance {
        id: row.get("id"),
        application_name: row.get("application_name"),
        resource_name: row.get("resource_name"),
        resource_type: row.get("resource_type"),
        configuration: row.get("configuration"),
        state: parse_state(&state_str)?,
        health_status: row.get("health_status"),
        provider_id: row.get("provider_id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        outputs: serde_json::from_value::<Vec<ResourceOutput>>(outputs_json)?,
        hints: serde_json::from_value::<Vec<ResourceHint>>(hints_json)?,
        last_error: last_error_json
            .map(serde_json::from_value::<ErrorRecord>)
            .transpose()?,
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_workflow_execution(row: &sqlx::postgres::PgRow) -> Result<WorkflowExecution, StoreError> {
    let status_str: String = row.get("status");
    let error_json: Option<Value> = row.get("error");
    Ok(WorkflowExecution {
        id: row.get("id"),
        application_name: row.get("application_name"),
        workflow_name: row.get("workflow_name"),
        status: parse_wf_status(&status_str)?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: error_json.map(serde_json::from_value::<ErrorRecord>).transpose()?,
    })
}

fn row_to_step_execution(row: &sqlx::postgres::PgRow) -> Result<WorkflowStepExecution, StoreError> {
    let status_str: String = row.get("status");
    let error_json: Option<Value> = row.get("error");
    Ok(WorkflowStepExecution {
        id: row.get("id"),
        workflow_execution_id: row.get("workflow_execution_id"),
        step_name: row.get("step_name"),
        step_type: row.get("step_type"),
        status: parse_step_status(&status_str)?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: error_json.map(serde_json::from_value::<ErrorRecord>).transpose()?,
        logs: row.get("logs"),
        outputs: row.get("outputs"),
        trace_id: row.get("trace_id"),
    })
}

#[async_trait]
impl OrchestrationStore for PostgresStore {
    #[instrument(skip(self))]
    async fn ensure_application(&self, name: &str) -> Result<Application, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO applications (name, created_at)
            VALUES ($1, now())
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING name, created_at
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to ensure application: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(Application {
            name: row.get("name"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self, instance))]
    async fn create_resource_instance(
        &self,
        instance: ResourceInstance,
    ) -> Result<ResourceInstance, StoreError> {
        let outputs = serde_json::to_value(&instance.outputs)?;
        let hints = serde_json::to_value(&instance.hints)?;
        let last_error = instance
            .last_error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO resource_instances
                (id, application_name, resource_name, resource_type, configuration,
                 state, health_status, provider_id, workflow_execution_id,
                 outputs, hints, last_error, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(instance.id)
        .bind(&instance.application_name)
        .bind(&instance.resource_name)
        .bind(&instance.resource_type)
        .bind(&instance.configuration)
        .bind(instance.state.to_string())
        .bind(&instance.health_status)
        .bind(&instance.provider_id)
        .bind(instance.workflow_execution_id)
        .bind(&outputs)
        .bind(&hints)
        .bind(&last_error)
        .bind(instance.version)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &result {
            if db_err.constraint() == Some("resource_instances_application_name_resource_name_key") {
                return Err(StoreError::DuplicateResource {
                    application_name: instance.application_name,
                    resource_name: instance.resource_name,
                });
            }
        }
        result.map_err(|e| StoreError::Database(e.to_string()))?;

        debug!(id = %instance.id, "created resource instance");
        Ok(instance)
    }

    #[instrument(skip(self))]
    async fn get_resource(&self, id: Uuid) -> Result<ResourceInstance, StoreError> {
        let row = sqlx::query("SELECT * FROM resource_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ResourceNotFound(id))?;
        row_to_resource(&row)
    }

    #[instrument(skip(self))]
    async fn get_by_application(
        &self,
        application_name: &str,
    ) -> Result<Vec<ResourceInstance>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM resource_instances WHERE application_name = $1 ORDER BY created_at",
        )
        .bind(application_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_resource).collect()
    }

    #[instrument(skip(self))]
    async fn get_pending(&self) -> Result<Vec<ResourceInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM resource_instances
            WHERE state = 'requested' AND workflow_execution_id IS NULL
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_resource).collect()
    }

    #[instrument(skip(self, error))]
    async fn transition_state(
        &self,
        id: Uuid,
        expected_state: ResourceState,
        expected_version: i32,
        to: ResourceState,
        error: Option<ErrorRecord>,
        workflow_execution_id: Option<Uuid>,
    ) -> Result<ResourceInstance, StoreError> {
        let error_json = error.clone().map(|e| serde_json::to_value(e)).transpose()?;

        let row = sqlx::query(
            r#"
            UPDATE resource_instances
            SET state = $1,
                version = version + 1,
                updated_at = now(),
                last_error = $2,
                workflow_execution_id = COALESCE($3, workflow_execution_id)
            WHERE id = $4 AND state = $5 AND version = $6
            RETURNING *
            "#,
        )
        .bind(to.to_string())
        .bind(&error_json)
        .bind(workflow_execution_id)
        .bind(id)
        .bind(expected_state.to_string())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        match row {
            Some(row) => row_to_resource(&row),
            None => {
                // Distinguish "doesn't exist" from "guard mismatch" so the
                // caller gets a meaningful error. If the row already landed
                // on exactly the target state, a re-run of the same call is
                // a no-op returning the current row, not a conflict (spec §8).
                let current = self.get_resource(id).await?;
                if current.state == to
                    && workflow_execution_id.map_or(true, |w| current.workflow_execution_id == Some(w))
                    && current.last_error == error
                {
                    return Ok(current);
                }
                Err(StoreError::ConcurrencyConflict {
                    id,
                    expected: expected_version,
                    actual: current.version,
                })
            }
        }
    }

    #[instrument(skip(self, outputs))]
    async fn set_outputs(
        &self,
        id: Uuid,
        outputs: Vec<ResourceOutput>,
    ) -> Result<ResourceInstance, StoreError> {
        let current = self.get_resource(id).await?;
        let mut merged = current.outputs;
        for output in outputs {
            if let Some(existing) = merged.iter_mut().find(|o| o.key == output.key) {
                existing.value = output.value;
            } else {
                merged.push(output);
            }
        }
        let merged_json = serde_json::to_value(&merged)?;

        let row = sqlx::query(
            "UPDATE resource_instances SET outputs = $1, updated_at = now() WHERE id = $2 RETURNING *",
        )
        .bind(&merged_json)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::ResourceNotFound(id))?;

        row_to_resource(&row)
    }

    #[instrument(skip(self, hints))]
    async fn append_hints(
        &self,
        id: Uuid,
        hints: Vec<ResourceHint>,
    ) -> Result<ResourceInstance, StoreError> {
        let current = self.get_resource(id).await?;
        let mut merged = current.hints;
        merged.extend(hints);
        let merged_json = serde_json::to_value(&merged)?;

        let row = sqlx::query(
            "UPDATE resource_instances SET hints = $1, updated_at = now() WHERE id = $2 RETURNING *",
        )
        .bind(&merged_json)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::ResourceNotFound(id))?;

        row_to_resource(&row)
    }

    #[instrument(skip(self))]
    async fn get_resources_by_workflow_execution(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<ResourceInstance>, StoreError> {
        let rows = sqlx::query("SELECT * FROM resource_instances WHERE workflow_execution_id = $1")
            .bind(workflow_execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_resource).collect()
    }

    #[instrument(skip(self))]
    async fn delete_resource(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "DELETE FROM resource_instances WHERE id = $1 AND state IN ('terminated', 'failed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ResourceNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, execution))]
    async fn create_workflow_execution(
        &self,
        execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, application_name, workflow_name, status, started_at, completed_at, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.application_name)
        .bind(&execution.workflow_name)
        .bind(execution.status.to_string())
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.error.as_ref().map(serde_json::to_value).transpose()?)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(execution)
    }

    #[instrument(skip(self))]
    async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::WorkflowExecutionNotFound(id))?;
        row_to_workflow_execution(&row)
    }

    #[instrument(skip(self))]
    async fn list_workflow_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query("SELECT * FROM workflow_executions ORDER BY started_at NULLS LAST")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_workflow_execution).collect()
    }

    #[instrument(skip(self, error))]
    async fn update_workflow_execution_status(
        &self,
        id: Uuid,
        status: WorkflowExecutionStatus,
        error: Option<ErrorRecord>,
    ) -> Result<WorkflowExecution, StoreError> {
        let now = Utc::now();
        let (started_at, completed_at): (Option<chrono::DateTime<Utc>>, Option<chrono::DateTime<Utc>>) =
            match status {
                WorkflowExecutionStatus::Running => (Some(now), None),
                WorkflowExecutionStatus::Completed
                | WorkflowExecutionStatus::Failed
                | WorkflowExecutionStatus::Canceled => (None, Some(now)),
                WorkflowExecutionStatus::Pending => (None, None),
            };
        let error_json = error.map(|e| serde_json::to_value(e)).transpose()?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $1,
                error = $2,
                started_at = COALESCE(started_at, $3),
                completed_at = COALESCE($4, completed_at)
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(status.to_string())
        .bind(&error_json)
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::WorkflowExecutionNotFound(id))?;

        row_to_workflow_execution(&row)
    }

    #[instrument(skip(self, step))]
    async fn create_step_execution(
        &self,
        step: WorkflowStepExecution,
    ) -> Result<WorkflowStepExecution, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_step_executions
                (id, workflow_execution_id, step_name, step_type, status,
                 started_at, completed_at, error, logs, outputs, trace_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(step.id)
        .bind(step.workflow_execution_id)
        .bind(&step.step_name)
        .bind(&step.step_type)
        .bind(step.status.to_string())
        .bind(step.started_at)
        .bind(step.completed_at)
        .bind(step.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(&step.logs)
        .bind(&step.outputs)
        .bind(&step.trace_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(step)
    }

    #[instrument(skip(self))]
    async fn get_step_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<WorkflowStepExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_step_executions WHERE workflow_execution_id = $1 ORDER BY started_at NULLS LAST",
        )
        .bind(workflow_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_step_execution).collect()
    }

    #[instrument(skip(self, logs, outputs, error))]
    async fn update_step_execution(
        &self,
        id: Uuid,
        status: StepExecutionStatus,
        logs: String,
        outputs: Value,
        error: Option<ErrorRecord>,
    ) -> Result<WorkflowStepExecution, StoreError> {
        let now = Utc::now();
        let (started_at, completed_at) = match status {
            StepExecutionStatus::Running => (Some(now), None),
            StepExecutionStatus::Completed
            | StepExecutionStatus::Failed
            | StepExecutionStatus::Skipped => (None, Some(now)),
            StepExecutionStatus::Pending => (None, None),
        };
        let error_json = error.map(|e| serde_json::to_value(e)).transpose()?;

        let row = sqlx::query(
            r#"
            UPDATE workflow_step_executions
            SET status = $1,
                logs = $2,
                outputs = $3,
                error = $4,
                started_at = COALESCE(started_at, $5),
                completed_at = COALESCE($6, completed_at)
            WHERE id = $7
            RETURNING *
            "#,
        )
        .bind(status.to_string())
        .bind(&logs)
        .bind(&outputs)
        .bind(&error_json)
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::StepExecutionNotFound(id))?;

        row_to_step_execution(&row)
    }
}
