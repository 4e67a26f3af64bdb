//! Image generation task — reconciles a job against a hosted prediction.
//!
//! The prediction itself is created upstream (a pipeline step or an
//! operator action); this handler polls its status. A still-running
//! prediction re-enters the scheduling path with a delayed follow-up
//! check instead of blocking a dispatch worker, so the job stays in
//! `processing` between checks.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agent::{ACTION_GROUP, HANDLE_TASK_HOOK};
use crate::config::PredictionConfig;
use crate::error::TaskError;
use crate::prediction::PredictionClient;
use crate::queue::ActionQueue;
use crate::status::JobStatus;
use crate::store::Database;
use crate::tasks::TaskHandler;

pub const IMAGE_GENERATION_TASK: &str = "image_generation";

/// Polls a prediction until it settles and finalizes the job.
pub struct ImageGenerationTask {
    db: Arc<dyn Database>,
    queue: Arc<dyn ActionQueue>,
    config: PredictionConfig,
    /// Absent when no API token is configured; jobs then fail with a
    /// descriptive status instead of a connection error.
    client: Option<PredictionClient>,
}

impl ImageGenerationTask {
    pub fn new(
        db: Arc<dyn Database>,
        queue: Arc<dyn ActionQueue>,
        config: PredictionConfig,
    ) -> Self {
        let client = config
            .api_token
            .clone()
            .map(|token| PredictionClient::new(config.base_url.clone(), token));
        Self {
            db,
            queue,
            config,
            client,
        }
    }

    /// Record the attempt count and schedule the next status check.
    async fn schedule_recheck(
        &self,
        job_id: i64,
        attempts: u64,
        note: Option<String>,
    ) -> Result<(), TaskError> {
        let mut patch = json!({ "poll_attempts": attempts });
        if let Some(note) = note {
            patch["last_poll_error"] = json!(note);
        }
        self.db.store_engine_data(job_id, &patch).await?;

        let delay = ChronoDuration::from_std(self.config.poll_interval)
            .unwrap_or_else(|_| ChronoDuration::seconds(10));
        let action_id = self
            .queue
            .schedule_at(
                Utc::now() + delay,
                HANDLE_TASK_HOOK,
                json!({ "job_id": job_id }),
                ACTION_GROUP,
            )
            .await?;

        debug!(job_id, action_id, attempts, "Scheduled follow-up prediction check");
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ImageGenerationTask {
    fn task_type(&self) -> &str {
        IMAGE_GENERATION_TASK
    }

    async fn execute(&self, job_id: i64, data: serde_json::Value) -> Result<(), TaskError> {
        let Some(prediction_id) = data.get("prediction_id").and_then(|v| v.as_str()) else {
            warn!(job_id, "Image generation job has no prediction id");
            self.db
                .complete_job(job_id, &JobStatus::failed("missing prediction_id parameter"))
                .await?;
            return Ok(());
        };

        let Some(client) = &self.client else {
            warn!(job_id, "Prediction API token not configured");
            self.db
                .complete_job(
                    job_id,
                    &JobStatus::failed("prediction API token not configured"),
                )
                .await?;
            return Ok(());
        };

        let attempts = data
            .get("poll_attempts")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
            + 1;
        let max_attempts = u64::from(self.config.max_poll_attempts.max(1));

        match client.get_prediction(prediction_id).await {
            Ok(prediction) if prediction.is_succeeded() => {
                self.db
                    .store_engine_data(
                        job_id,
                        &json!({
                            "result": {
                                "prediction_id": prediction.id,
                                "output": prediction.output,
                            }
                        }),
                    )
                    .await?;
                self.db
                    .complete_job(job_id, &JobStatus::completed())
                    .await?;
                info!(job_id, prediction_id, "Image generation completed");
            }
            Ok(prediction) if prediction.is_terminal() => {
                let detail = prediction
                    .error
                    .unwrap_or_else(|| format!("prediction {}", prediction.status));
                warn!(job_id, prediction_id, detail = %detail, "Prediction did not succeed");
                self.db
                    .complete_job(job_id, &JobStatus::failed(format!("prediction failed: {detail}")))
                    .await?;
            }
            Ok(_) if attempts >= max_attempts => {
                self.db
                    .complete_job(
                        job_id,
                        &JobStatus::failed(format!(
                            "prediction still running after {attempts} checks"
                        )),
                    )
                    .await?;
            }
            Ok(_) => {
                self.schedule_recheck(job_id, attempts, None).await?;
            }
            // Request errors are retried like a still-running prediction
            // until the attempt budget runs out.
            Err(e) if attempts >= max_attempts => {
                self.db
                    .complete_job(
                        job_id,
                        &JobStatus::failed(format!(
                            "prediction status checks exhausted after {attempts} attempts: {e}"
                        )),
                    )
                    .await?;
            }
            Err(e) => {
                warn!(job_id, prediction_id, error = %e, "Prediction check failed, will retry");
                self.schedule_recheck(job_id, attempts, Some(e.to_string()))
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::store::{LibSqlBackend, NewJob};
    use chrono::DateTime;
    use secrecy::SecretString;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingQueue {
        scheduled: Mutex<Vec<(DateTime<Utc>, String, serde_json::Value)>>,
    }

    impl RecordingQueue {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scheduled: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ActionQueue for RecordingQueue {
        async fn schedule_at(
            &self,
            run_at: DateTime<Utc>,
            hook: &str,
            args: serde_json::Value,
            _group: &str,
        ) -> Result<i64, QueueError> {
            let mut scheduled = self.scheduled.lock().unwrap();
            scheduled.push((run_at, hook.to_string(), args));
            Ok(scheduled.len() as i64)
        }
    }

    async fn job_in_db(db: &Arc<dyn Database>) -> i64 {
        db.create_job(&NewJob {
            pipeline_id: "direct".to_string(),
            flow_id: "direct".to_string(),
            source: "system".to_string(),
            label: "Image Generation".to_string(),
        })
        .await
        .unwrap()
    }

    fn unreachable_config(max_poll_attempts: u32) -> PredictionConfig {
        PredictionConfig {
            api_token: Some(SecretString::from("test-token")),
            base_url: "http://127.0.0.1:9".to_string(),
            poll_interval: Duration::from_millis(10),
            max_poll_attempts,
        }
    }

    #[tokio::test]
    async fn missing_prediction_id_finalizes_failed() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = RecordingQueue::new();
        let task = ImageGenerationTask::new(
            Arc::clone(&db),
            queue.clone(),
            PredictionConfig::default(),
        );

        let job_id = job_in_db(&db).await;
        task.execute(job_id, json!({"task_type": IMAGE_GENERATION_TASK}))
            .await
            .unwrap();

        let job = db.get_job(job_id).await.unwrap().unwrap();
        let status = job.status();
        assert!(status.is_failure());
        assert!(status.reason().unwrap().contains("prediction_id"));
        assert!(queue.scheduled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_api_token_finalizes_failed() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = RecordingQueue::new();
        // Default config carries no token.
        let task = ImageGenerationTask::new(
            Arc::clone(&db),
            queue.clone(),
            PredictionConfig::default(),
        );

        let job_id = job_in_db(&db).await;
        task.execute(job_id, json!({"prediction_id": "p1"}))
            .await
            .unwrap();

        let status = db.get_job(job_id).await.unwrap().unwrap().status();
        assert!(status.is_failure());
        assert!(status.reason().unwrap().contains("not configured"));
    }

    #[tokio::test]
    async fn transient_check_failure_schedules_recheck() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = RecordingQueue::new();
        let task = ImageGenerationTask::new(Arc::clone(&db), queue.clone(), unreachable_config(3));

        let job_id = job_in_db(&db).await;
        db.start_job(job_id, &JobStatus::processing()).await.unwrap();
        task.execute(job_id, json!({"prediction_id": "p1"}))
            .await
            .unwrap();

        let job = db.get_job(job_id).await.unwrap().unwrap();
        // Re-scheduled polling is deferred processing, not waiting.
        assert_eq!(job.status, "processing");
        assert_eq!(job.engine_data["poll_attempts"], json!(1));

        let scheduled = queue.scheduled.lock().unwrap();
        assert_eq!(scheduled.len(), 1);
        let (run_at, hook, args) = &scheduled[0];
        assert!(*run_at > Utc::now() - ChronoDuration::seconds(1));
        assert_eq!(hook, HANDLE_TASK_HOOK);
        assert_eq!(args["job_id"], json!(job_id));
    }

    #[tokio::test]
    async fn attempt_budget_exhaustion_finalizes_failed() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = RecordingQueue::new();
        let task = ImageGenerationTask::new(Arc::clone(&db), queue.clone(), unreachable_config(2));

        let job_id = job_in_db(&db).await;
        // Second check (first attempt already recorded in the bag).
        task.execute(job_id, json!({"prediction_id": "p1", "poll_attempts": 1}))
            .await
            .unwrap();

        let status = db.get_job(job_id).await.unwrap().unwrap().status();
        assert!(status.is_failure());
        assert!(status.reason().unwrap().contains("2 attempts"));
        assert!(queue.scheduled.lock().unwrap().is_empty());
    }
}
