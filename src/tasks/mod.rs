//! Task abstraction — the polymorphic units of deferred work.

pub mod image_generation;
pub mod registry;
pub mod social_publish;

use async_trait::async_trait;

use crate::error::TaskError;

/// Executes one task type against a job's persisted data bag.
///
/// All outcomes are communicated by writing the job's status through
/// the store — the orchestrator never inspects a success return value.
/// An `Err` is the unexpected-failure path: the orchestrator's dispatch
/// boundary converts it into a finalized-failed job. Known failure
/// modes (missing parameter, missing configuration) should be written
/// as explicit failed statuses followed by `Ok(())`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// The task-type key this handler executes.
    fn task_type(&self) -> &str;

    /// Perform the unit of work for `job_id` with its engine data.
    async fn execute(&self, job_id: i64, data: serde_json::Value) -> Result<(), TaskError>;
}

pub use image_generation::{IMAGE_GENERATION_TASK, ImageGenerationTask};
pub use registry::{TaskRegistry, TaskRegistryBuilder};
pub use social_publish::{SOCIAL_PUBLISH_TASK, SocialPublishTask};
