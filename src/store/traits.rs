//! Unified `Database` trait — single async interface for all persistence.
//!
//! Covers the two durable tables the engine owns: `jobs` (one record per
//! deferred unit of work) and `actions` (the queue of pending dispatch
//! invocations). Both the orchestrator and the queue dispatcher work
//! through this trait so tests can swap in an in-memory backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::status::JobStatus;

/// A persisted job record.
#[derive(Debug, Clone)]
pub struct Job {
    /// Store-assigned integer id, unique and never reused.
    pub id: i64,
    /// Originating pipeline, or `"direct"` for orchestrator-originated jobs.
    pub pipeline_id: String,
    /// Originating flow, or `"direct"`.
    pub flow_id: String,
    /// Origin tag, e.g. `"system"`.
    pub source: String,
    /// Human-readable label.
    pub label: String,
    /// Serialized `JobStatus` string.
    pub status: String,
    /// Open-ended data bag: task type, parameters, routing context,
    /// scheduling timestamp, handler result data.
    pub engine_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Parse the persisted status string.
    pub fn status(&self) -> JobStatus {
        JobStatus::parse(&self.status)
    }

    /// Read a string field from the engine data bag.
    pub fn engine_str(&self, key: &str) -> Option<&str> {
        self.engine_data.get(key).and_then(|v| v.as_str())
    }
}

/// Origin fields for a new job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub pipeline_id: String,
    pub flow_id: String,
    pub source: String,
    pub label: String,
}

/// A claimed deferred action, ready to dispatch.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub id: i64,
    /// Name of the registered dispatch entrypoint.
    pub hook: String,
    /// Args bag passed to the hook verbatim.
    pub args: serde_json::Value,
    /// Grouping tag, e.g. `"content-pilot"`.
    pub group: String,
    pub run_at: DateTime<Utc>,
    /// Delivery attempts so far, including the current one.
    pub attempts: u32,
}

/// Backend-agnostic database trait covering jobs and deferred actions.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job record with status `pending` and an empty
    /// engine-data bag. Returns the assigned id.
    async fn create_job(&self, new: &NewJob) -> Result<i64, DatabaseError>;

    /// Merge the given object's top-level keys into the job's
    /// engine-data bag (JSON merge-patch: nested objects merge, `null`
    /// values remove keys).
    async fn store_engine_data(
        &self,
        job_id: i64,
        data: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Transition the job to an active status, recording attempt start.
    async fn start_job(&self, job_id: i64, status: &JobStatus) -> Result<(), DatabaseError>;

    /// Write a non-terminal status (e.g. parking a job as waiting).
    async fn update_job_status(
        &self,
        job_id: i64,
        status: &JobStatus,
    ) -> Result<(), DatabaseError>;

    /// Load a job. `Ok(None)` means not found.
    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, DatabaseError>;

    /// Write a final status. Skips the write when the job is already
    /// final; see the backend for the residual-race note.
    async fn complete_job(&self, job_id: i64, status: &JobStatus) -> Result<(), DatabaseError>;

    /// Most recent jobs, newest first.
    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    // ── Deferred actions ────────────────────────────────────────────

    /// Persist a deferred action. Returns the action id (the external
    /// handle the orchestrator logs).
    async fn enqueue_action(
        &self,
        hook: &str,
        args: &serde_json::Value,
        group: &str,
        run_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError>;

    /// Atomically claim up to `batch` due pending actions under the
    /// given claim id and return them.
    async fn claim_due_actions(
        &self,
        claim_id: Uuid,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<ScheduledAction>, DatabaseError>;

    /// Mark a claimed action as successfully dispatched.
    async fn mark_action_done(&self, action_id: i64) -> Result<(), DatabaseError>;

    /// Mark a claimed action as failed, recording the error.
    async fn mark_action_failed(
        &self,
        action_id: i64,
        error: &str,
    ) -> Result<(), DatabaseError>;

    /// Return claimed-but-unfinished actions older than `older_than` to
    /// pending so they are redelivered. Returns the number released.
    async fn release_stale_claims(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;
}
