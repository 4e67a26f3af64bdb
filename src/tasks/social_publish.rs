//! Social publish task — delivers rendered content to an outbound webhook.
//!
//! When the approval gate is enabled, unapproved jobs park as
//! `waiting - approval gate` until an external approval merges
//! `approved: true` into the data bag and resumes the job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::config::PublishConfig;
use crate::error::TaskError;
use crate::status::JobStatus;
use crate::store::Database;
use crate::tasks::TaskHandler;

pub const SOCIAL_PUBLISH_TASK: &str = "social_publish";

/// Posts content to the configured publishing webhook.
pub struct SocialPublishTask {
    db: Arc<dyn Database>,
    config: PublishConfig,
    http: reqwest::Client,
}

impl SocialPublishTask {
    pub fn new(db: Arc<dyn Database>, config: PublishConfig) -> Self {
        Self {
            db,
            config,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TaskHandler for SocialPublishTask {
    fn task_type(&self) -> &str {
        SOCIAL_PUBLISH_TASK
    }

    async fn execute(&self, job_id: i64, data: serde_json::Value) -> Result<(), TaskError> {
        let Some(message) = data.get("message").and_then(|v| v.as_str()) else {
            warn!(job_id, "Publish job has no message");
            self.db
                .complete_job(job_id, &JobStatus::failed("missing message parameter"))
                .await?;
            return Ok(());
        };

        let Some(webhook_url) = self.config.webhook_url.as_deref() else {
            warn!(job_id, "Publish webhook not configured");
            self.db
                .complete_job(job_id, &JobStatus::failed("publish webhook not configured"))
                .await?;
            return Ok(());
        };

        let approved = data
            .get("approved")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if self.config.require_approval && !approved {
            info!(job_id, "Publish job parked pending approval");
            self.db
                .update_job_status(job_id, &JobStatus::waiting_on("approval gate"))
                .await?;
            return Ok(());
        }

        let payload = json!({
            "job_id": job_id,
            "message": message,
            "context": data.get("context"),
        });

        match self.http.post(webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                self.db
                    .store_engine_data(
                        job_id,
                        &json!({ "published_at": Utc::now().to_rfc3339() }),
                    )
                    .await?;
                self.db
                    .complete_job(job_id, &JobStatus::completed())
                    .await?;
                info!(job_id, "Content published");
            }
            Ok(response) => {
                let status = response.status();
                warn!(job_id, http_status = %status, "Publish webhook rejected content");
                self.db
                    .complete_job(
                        job_id,
                        &JobStatus::failed(format!("webhook returned HTTP {status}")),
                    )
                    .await?;
            }
            Err(e) => {
                warn!(job_id, error = %e, "Publish webhook unreachable");
                self.db
                    .complete_job(
                        job_id,
                        &JobStatus::failed(format!("webhook request failed: {e}")),
                    )
                    .await?;
            }
        }

        Ok(())
    }
}
