//! Job status — base state plus an optional free-text reason.
//!
//! Persisted as a single string, `"<base> - <reason>"` when a reason is
//! present. Parsing splits on the first `" - "` and never fails: unknown
//! base statuses are carried verbatim so status strings written by newer
//! handler versions don't break dispatch.

use serde::{Deserialize, Serialize};

/// Separator between base status and reason in the serialized form.
const REASON_SEPARATOR: &str = " - ";

/// Base lifecycle state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseStatus {
    /// Job record exists but has not been marked active yet.
    Pending,
    /// Job is active — scheduled or executing.
    Processing,
    /// Job is parked awaiting an external event (approval, webhook).
    /// Not a terminal state, and not a scheduled follow-up.
    Waiting,
    /// Job finished successfully.
    Completed,
    /// Job finished unsuccessfully.
    Failed,
    /// A base status this version doesn't know. Preserved verbatim.
    #[serde(untagged)]
    Other(String),
}

impl BaseStatus {
    fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Other(s) => s,
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "processing" => Self::Processing,
            "waiting" => Self::Waiting,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for BaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A job's lifecycle status with an optional human-readable qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    base: BaseStatus,
    reason: Option<String>,
}

impl JobStatus {
    /// Status with no reason.
    pub fn new(base: BaseStatus) -> Self {
        Self { base, reason: None }
    }

    /// Status with a reason qualifier.
    pub fn with_reason(base: BaseStatus, reason: impl Into<String>) -> Self {
        Self {
            base,
            reason: Some(reason.into()),
        }
    }

    pub fn pending() -> Self {
        Self::new(BaseStatus::Pending)
    }

    pub fn processing() -> Self {
        Self::new(BaseStatus::Processing)
    }

    pub fn waiting() -> Self {
        Self::new(BaseStatus::Waiting)
    }

    /// Waiting on a named external gate, e.g. `waiting_on("webhook gate")`.
    pub fn waiting_on(reason: impl Into<String>) -> Self {
        Self::with_reason(BaseStatus::Waiting, reason)
    }

    pub fn completed() -> Self {
        Self::new(BaseStatus::Completed)
    }

    /// Failure always carries a reason — an unexplained failed job is
    /// useless to an operator.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::with_reason(BaseStatus::Failed, reason)
    }

    /// Parse a serialized status string. Splits on the first `" - "`;
    /// the base is not validated against the known vocabulary.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(REASON_SEPARATOR) {
            Some((base, reason)) => Self {
                base: BaseStatus::parse(base),
                reason: Some(reason.to_string()),
            },
            None => Self {
                base: BaseStatus::parse(raw),
                reason: None,
            },
        }
    }

    pub fn base(&self) -> &BaseStatus {
        &self.base
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Terminal — no further orchestrator-driven transition occurs.
    pub fn is_final(&self) -> bool {
        matches!(self.base, BaseStatus::Completed | BaseStatus::Failed)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.base, BaseStatus::Completed)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.base, BaseStatus::Failed)
    }

    /// Parked awaiting an external event. Never final, never success,
    /// never failure.
    pub fn is_waiting(&self) -> bool {
        matches!(self.base, BaseStatus::Waiting)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{}{REASON_SEPARATOR}{reason}", self.base),
            None => write!(f, "{}", self.base),
        }
    }
}
