//! The coordination core: creates job records, hands them to the
//! deferred-action queue, and dispatches them to task handlers when the
//! queue calls back — possibly in a different process than the one that
//! scheduled them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::agent::{ACTION_GROUP, HANDLE_TASK_HOOK};
use crate::error::{Error, JobError, TaskError};
use crate::queue::{ActionHook, ActionQueue};
use crate::status::JobStatus;
use crate::store::{Database, NewJob};
use crate::tasks::TaskRegistry;

/// Origin sentinel for jobs scheduled directly, outside any pipeline.
const DIRECT_ORIGIN: &str = "direct";

/// Schedules long-running tasks as durable jobs and reconciles their
/// completion or failure.
pub struct SystemAgent {
    db: Arc<dyn Database>,
    registry: Arc<TaskRegistry>,
    queue: Arc<dyn ActionQueue>,
}

impl SystemAgent {
    /// Create a new agent. The registry is fixed for the agent's
    /// lifetime — handler providers register at composition time.
    pub fn new(
        db: Arc<dyn Database>,
        registry: Arc<TaskRegistry>,
        queue: Arc<dyn ActionQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            registry,
            queue,
        })
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Schedule a task for deferred execution. Returns the job id.
    ///
    /// Unknown task types are rejected before any record is created —
    /// nothing could ever execute them. Once a job record exists, every
    /// later failure in this method finalizes it as failed so the
    /// record always explains why nothing further will happen.
    pub async fn schedule_task(
        &self,
        task_type: &str,
        params: serde_json::Map<String, serde_json::Value>,
        context: serde_json::Value,
    ) -> Result<i64, Error> {
        if !self.registry.contains(task_type) {
            warn!(task_type, "Refusing to schedule unknown task type");
            return Err(JobError::UnknownTaskType {
                task_type: task_type.to_string(),
            }
            .into());
        }

        let new_job = NewJob {
            pipeline_id: DIRECT_ORIGIN.to_string(),
            flow_id: DIRECT_ORIGIN.to_string(),
            source: "system".to_string(),
            label: humanize_task_type(task_type),
        };
        let job_id = match self.db.create_job(&new_job).await {
            Ok(id) => id,
            Err(e) => {
                error!(task_type, error = %e, "Failed to create job record");
                return Err(e.into());
            }
        };

        // Params first; the routing keys below win on collision so a
        // caller can't smuggle a different task type into the bag.
        let mut data = params;
        data.insert("task_type".to_string(), json!(task_type));
        data.insert("context".to_string(), context);
        data.insert("scheduled_at".to_string(), json!(Utc::now().to_rfc3339()));

        if let Err(e) = self
            .db
            .store_engine_data(job_id, &serde_json::Value::Object(data))
            .await
        {
            self.finalize_failed(job_id, format!("failed to persist task data: {e}"))
                .await;
            return Err(e.into());
        }

        if let Err(e) = self.db.start_job(job_id, &JobStatus::processing()).await {
            self.finalize_failed(job_id, format!("failed to mark job active: {e}"))
                .await;
            return Err(e.into());
        }

        // Enqueue last: any dispatch the queue fires sees a fully
        // written record.
        match self
            .queue
            .schedule_at(
                Utc::now(),
                HANDLE_TASK_HOOK,
                json!({ "job_id": job_id }),
                ACTION_GROUP,
            )
            .await
        {
            Ok(action_id) => {
                info!(job_id, task_type, action_id, "Task scheduled");
                Ok(job_id)
            }
            Err(e) => {
                let reason = format!("failed to enqueue dispatch action: {e}");
                self.finalize_failed(job_id, reason.clone()).await;
                Err(JobError::ScheduleFailed { id: job_id, reason }.into())
            }
        }
    }

    /// Dispatch entrypoint, invoked by the queue when a job's action
    /// comes due. Never returns an error and never panics outward —
    /// the invoking worker has no one to hand a failure to, so every
    /// failure ends as a finalized job status plus a log event.
    pub async fn handle_task(&self, job_id: i64) {
        let job = match self.db.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "Dispatch fired for unknown job, nothing to do");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to load job for dispatch");
                return;
            }
        };

        let status = job.status();
        if status.is_final() {
            // At-least-once delivery: a redelivered dispatch for a
            // settled job is a no-op.
            debug!(job_id, status = %status, "Job already final, skipping dispatch");
            return;
        }

        let Some(task_type) = job.engine_str("task_type").map(str::to_string) else {
            error!(job_id, "Job data has no task type");
            self.finalize_failed(job_id, "no task type found").await;
            return;
        };

        // Deployment skew can leave a job whose scheduler knew a type
        // this process doesn't.
        let Some(handler) = self.registry.get(&task_type) else {
            error!(job_id, task_type, "No handler registered for task type");
            self.finalize_failed(job_id, format!("unknown task type: {task_type}"))
                .await;
            return;
        };

        debug!(job_id, task_type, "Dispatching task");

        let data = job.engine_data.clone();
        let result = tokio::spawn(async move { handler.execute(job_id, data).await }).await;

        match result {
            Ok(Ok(())) => {
                debug!(job_id, task_type, "Task handler finished");
            }
            Ok(Err(e)) => {
                error!(job_id, task_type, error = %e, "Task handler failed");
                self.finalize_failed(job_id, e.to_string()).await;
            }
            Err(e) => {
                error!(job_id, task_type, error = %e, "Task handler panicked");
                self.finalize_failed(job_id, format!("task handler panicked: {e}"))
                    .await;
            }
        }
    }

    /// Re-enqueue dispatch for a non-final job — the re-entry point for
    /// jobs parked `waiting` once their external event has arrived.
    pub async fn resume_job(&self, job_id: i64) -> Result<(), Error> {
        let job = self
            .db
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        let status = job.status();
        if status.is_final() {
            return Err(JobError::AlreadyFinal {
                id: job_id,
                status: status.to_string(),
            }
            .into());
        }

        let action_id = self
            .queue
            .schedule_at(
                Utc::now(),
                HANDLE_TASK_HOOK,
                json!({ "job_id": job_id }),
                ACTION_GROUP,
            )
            .await
            .map_err(|e| JobError::ScheduleFailed {
                id: job_id,
                reason: e.to_string(),
            })?;

        info!(job_id, action_id, "Job resumed");
        Ok(())
    }

    /// Best-effort terminal write; failures here can only be logged.
    async fn finalize_failed(&self, job_id: i64, reason: impl Into<String>) {
        let status = JobStatus::failed(reason);
        if let Err(e) = self.db.complete_job(job_id, &status).await {
            error!(job_id, status = %status, error = %e, "Failed to finalize job");
        }
    }
}

/// The queue-facing adapter for [`SystemAgent::handle_task`].
pub struct HandleTaskHook {
    agent: Arc<SystemAgent>,
}

impl HandleTaskHook {
    pub fn new(agent: Arc<SystemAgent>) -> Arc<Self> {
        Arc::new(Self { agent })
    }
}

#[async_trait]
impl ActionHook for HandleTaskHook {
    async fn invoke(&self, args: serde_json::Value) -> Result<(), Error> {
        let Some(job_id) = args.get("job_id").and_then(|v| v.as_i64()) else {
            return Err(TaskError::ExecutionFailed(
                "dispatch args missing job_id".to_string(),
            )
            .into());
        };
        self.agent.handle_task(job_id).await;
        Ok(())
    }
}

/// `"image_generation"` → `"Image Generation"`.
fn humanize_task_type(task_type: &str) -> String {
    task_type
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
