//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::status::JobStatus;
use crate::store::migrations;
use crate::store::traits::{Database, Job, NewJob, ScheduledAction};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS:
/// 0:id, 1:pipeline_id, 2:flow_id, 3:source, 4:label, 5:status,
/// 6:engine_data, 7:created_at, 8:started_at, 9:updated_at
fn row_to_job(row: &libsql::Row) -> Result<Job, libsql::Error> {
    let engine_data_str: String = row.get(6)?;
    let created_str: String = row.get(7)?;
    let started_str: Option<String> = row.get(8).ok();
    let updated_str: String = row.get(9)?;

    Ok(Job {
        id: row.get(0)?,
        pipeline_id: row.get(1)?,
        flow_id: row.get(2)?,
        source: row.get(3)?,
        label: row.get(4)?,
        status: row.get(5)?,
        engine_data: serde_json::from_str(&engine_data_str)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        created_at: parse_datetime(&created_str),
        started_at: parse_optional_datetime(&started_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a ScheduledAction.
///
/// Column order matches ACTION_COLUMNS:
/// 0:id, 1:hook, 2:args, 3:group_name, 4:run_at, 5:attempts
fn row_to_action(row: &libsql::Row) -> Result<ScheduledAction, libsql::Error> {
    let args_str: String = row.get(2)?;
    let run_at_str: String = row.get(4)?;
    let attempts: i64 = row.get(5)?;

    Ok(ScheduledAction {
        id: row.get(0)?,
        hook: row.get(1)?,
        args: serde_json::from_str(&args_str)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
        group: row.get(3)?,
        run_at: parse_datetime(&run_at_str),
        attempts: attempts.max(0) as u32,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str =
    "id, pipeline_id, flow_id, source, label, status, engine_data, created_at, started_at, updated_at";

const ACTION_COLUMNS: &str = "id, hook, args, group_name, run_at, attempts";

#[async_trait]
impl Database for LibSqlBackend {
    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, new: &NewJob) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO jobs (pipeline_id, flow_id, source, label, status, engine_data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', '{}', ?5, ?5)",
            params![
                new.pipeline_id.as_str(),
                new.flow_id.as_str(),
                new.source.as_str(),
                new.label.as_str(),
                now
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_job: {e}")))?;

        let id = conn.last_insert_rowid();
        debug!(job_id = id, label = %new.label, "Job created");
        Ok(id)
    }

    async fn store_engine_data(
        &self,
        job_id: i64,
        data: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let patch = serde_json::to_string(data)
            .map_err(|e| DatabaseError::Serialization(format!("store_engine_data: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET engine_data = json_patch(engine_data, ?1), updated_at = ?2 WHERE id = ?3",
                params![patch, now, job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_engine_data: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn start_job(&self, job_id: i64, status: &JobStatus) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE jobs SET status = ?1, started_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), now, job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("start_job: {e}")))?;

        debug!(job_id, status = %status, "Job started");
        Ok(())
    }

    async fn update_job_status(
        &self,
        job_id: i64,
        status: &JobStatus,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), now, job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_job_status: {e}")))?;

        debug!(job_id, status = %status, "Job status updated");
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let job = row_to_job(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_job row parse: {e}")))?;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn complete_job(&self, job_id: i64, status: &JobStatus) -> Result<(), DatabaseError> {
        // Non-final guard: a redelivered dispatch must not overwrite an
        // outcome that is already recorded. The read→write window is not
        // serialized; two completions racing inside it are last-write-wins.
        if let Some(job) = self.get_job(job_id).await? {
            let current = job.status();
            if current.is_final() {
                debug!(
                    job_id,
                    current = %current,
                    attempted = %status,
                    "Skipping terminal write, job already final"
                );
                return Ok(());
            }
        } else {
            return Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: job_id.to_string(),
            });
        }

        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.to_string(), now, job_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;

        debug!(job_id, status = %status, "Job finalized");
        Ok(())
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    // ── Deferred actions ────────────────────────────────────────────

    async fn enqueue_action(
        &self,
        hook: &str,
        args: &serde_json::Value,
        group: &str,
        run_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let args_str = serde_json::to_string(args)
            .map_err(|e| DatabaseError::Serialization(format!("enqueue_action: {e}")))?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO actions (hook, args, group_name, run_at, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![hook, args_str, group, run_at.to_rfc3339(), now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("enqueue_action: {e}")))?;

        let id = conn.last_insert_rowid();
        debug!(action_id = id, hook, group, run_at = %run_at, "Action enqueued");
        Ok(id)
    }

    async fn claim_due_actions(
        &self,
        claim_id: Uuid,
        now: DateTime<Utc>,
        batch: usize,
    ) -> Result<Vec<ScheduledAction>, DatabaseError> {
        let conn = self.conn();
        let now_str = now.to_rfc3339();
        let claim = claim_id.to_string();

        let claimed = conn
            .execute(
                "UPDATE actions
                 SET status = 'claimed', claim_id = ?1, claimed_at = ?2,
                     attempts = attempts + 1, updated_at = ?2
                 WHERE id IN (
                     SELECT id FROM actions
                     WHERE status = 'pending' AND run_at <= ?2
                     ORDER BY run_at ASC, id ASC
                     LIMIT ?3
                 )",
                params![claim.as_str(), now_str, batch as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_due_actions: {e}")))?;

        if claimed == 0 {
            return Ok(Vec::new());
        }

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACTION_COLUMNS} FROM actions
                     WHERE claim_id = ?1 AND status = 'claimed'
                     ORDER BY run_at ASC, id ASC"
                ),
                params![claim.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_due_actions fetch: {e}")))?;

        let mut actions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_action(&row) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping action row: {e}"),
            }
        }
        Ok(actions)
    }

    async fn mark_action_done(&self, action_id: i64) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE actions SET status = 'done', updated_at = ?1 WHERE id = ?2",
                params![now, action_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_action_done: {e}")))?;
        Ok(())
    }

    async fn mark_action_failed(&self, action_id: i64, error: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE actions SET status = 'failed', last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, now, action_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_action_failed: {e}")))?;
        Ok(())
    }

    async fn release_stale_claims(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let released = self
            .conn()
            .execute(
                "UPDATE actions
                 SET status = 'pending', claim_id = NULL, claimed_at = NULL, updated_at = ?1
                 WHERE status = 'claimed' AND claimed_at <= ?2",
                params![now, older_than.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_stale_claims: {e}")))?;

        if released > 0 {
            warn!(released, "Released stale action claims for redelivery");
        }
        Ok(released as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job() -> NewJob {
        NewJob {
            pipeline_id: "direct".to_string(),
            flow_id: "direct".to_string(),
            source: "system".to_string(),
            label: "Image Generation".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.create_job(&new_job()).await.unwrap();
        assert!(id > 0);

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.pipeline_id, "direct");
        assert_eq!(job.flow_id, "direct");
        assert_eq!(job.source, "system");
        assert_eq!(job.label, "Image Generation");
        assert_eq!(job.status, "pending");
        assert!(job.engine_data.as_object().unwrap().is_empty());
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn get_missing_job_is_none() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(db.get_job(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_ids_are_not_reused() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let first = db.create_job(&new_job()).await.unwrap();
        let second = db.create_job(&new_job()).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn engine_data_merges_top_level_keys() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.create_job(&new_job()).await.unwrap();

        db.store_engine_data(id, &json!({"task_type": "image_generation", "prediction_id": "p1"}))
            .await
            .unwrap();
        db.store_engine_data(id, &json!({"poll_attempts": 3}))
            .await
            .unwrap();

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.engine_str("task_type"), Some("image_generation"));
        assert_eq!(job.engine_str("prediction_id"), Some("p1"));
        assert_eq!(job.engine_data["poll_attempts"], json!(3));
    }

    #[tokio::test]
    async fn engine_data_overwrites_existing_keys() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.create_job(&new_job()).await.unwrap();

        db.store_engine_data(id, &json!({"poll_attempts": 1}))
            .await
            .unwrap();
        db.store_engine_data(id, &json!({"poll_attempts": 2}))
            .await
            .unwrap();

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.engine_data["poll_attempts"], json!(2));
    }

    #[tokio::test]
    async fn store_engine_data_missing_job_errors() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let err = db
            .store_engine_data(42, &json!({"k": "v"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn start_job_records_attempt_start() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.create_job(&new_job()).await.unwrap();

        db.start_job(id, &JobStatus::processing()).await.unwrap();

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "processing");
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn complete_job_skips_already_final() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.create_job(&new_job()).await.unwrap();

        db.complete_job(id, &JobStatus::completed()).await.unwrap();
        db.complete_job(id, &JobStatus::failed("late retry"))
            .await
            .unwrap();

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "completed");
    }

    #[tokio::test]
    async fn complete_job_writes_reason_qualified_status() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.create_job(&new_job()).await.unwrap();

        db.complete_job(id, &JobStatus::failed("no task type found"))
            .await
            .unwrap();

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "failed - no task type found");
        assert!(job.status().is_failure());
    }

    #[tokio::test]
    async fn park_then_resume_status() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.create_job(&new_job()).await.unwrap();

        db.update_job_status(id, &JobStatus::waiting_on("approval gate"))
            .await
            .unwrap();
        let job = db.get_job(id).await.unwrap().unwrap();
        assert!(job.status().is_waiting());
        assert_eq!(job.status().reason(), Some("approval gate"));

        // Parked is not final — a later terminal write still lands.
        db.complete_job(id, &JobStatus::completed()).await.unwrap();
        assert!(db.get_job(id).await.unwrap().unwrap().status().is_success());
    }

    #[tokio::test]
    async fn claim_due_actions_skips_future_and_marks_claimed() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();

        let due = db
            .enqueue_action("dispatch", &json!({"job_id": 1}), "content-pilot", now)
            .await
            .unwrap();
        let _future = db
            .enqueue_action(
                "dispatch",
                &json!({"job_id": 2}),
                "content-pilot",
                now + chrono::Duration::hours(1),
            )
            .await
            .unwrap();

        let claimed = db
            .claim_due_actions(Uuid::new_v4(), now, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due);
        assert_eq!(claimed[0].hook, "dispatch");
        assert_eq!(claimed[0].args["job_id"], json!(1));
        assert_eq!(claimed[0].attempts, 1);

        // A second claim pass finds nothing — the action is held.
        let again = db
            .claim_due_actions(Uuid::new_v4(), now, 10)
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_batch_size() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        for i in 0..5 {
            db.enqueue_action("dispatch", &json!({"job_id": i}), "g", now)
                .await
                .unwrap();
        }

        let claimed = db.claim_due_actions(Uuid::new_v4(), now, 3).await.unwrap();
        assert_eq!(claimed.len(), 3);
    }

    #[tokio::test]
    async fn done_actions_are_not_redelivered() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        let id = db
            .enqueue_action("dispatch", &json!({}), "g", now)
            .await
            .unwrap();

        let claimed = db.claim_due_actions(Uuid::new_v4(), now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        db.mark_action_done(id).await.unwrap();

        let stale_cutoff = now + chrono::Duration::hours(1);
        assert_eq!(db.release_stale_claims(stale_cutoff).await.unwrap(), 0);
        assert!(
            db.claim_due_actions(Uuid::new_v4(), stale_cutoff, 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn stale_claims_are_released_and_redelivered() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        db.enqueue_action("dispatch", &json!({}), "g", now)
            .await
            .unwrap();

        let claimed = db.claim_due_actions(Uuid::new_v4(), now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Claim never finished; a later sweep returns it to pending.
        let released = db
            .release_stale_claims(now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(released, 1);

        let redelivered = db
            .claim_due_actions(Uuid::new_v4(), now, 10)
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempts, 2);
    }

    #[tokio::test]
    async fn list_jobs_newest_first() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let a = db.create_job(&new_job()).await.unwrap();
        let b = db.create_job(&new_job()).await.unwrap();

        let jobs = db.list_jobs(10).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, b);
        assert_eq!(jobs[1].id, a);
    }

    #[tokio::test]
    async fn file_backed_database_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");

        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            let id = db.create_job(&new_job()).await.unwrap();
            db.store_engine_data(id, &json!({"task_type": "image_generation"}))
                .await
                .unwrap();
            db.start_job(id, &JobStatus::processing()).await.unwrap();
            id
        };

        // Reopen — the record survives the process boundary.
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, "processing");
        assert_eq!(job.engine_str("task_type"), Some("image_generation"));
    }
}
