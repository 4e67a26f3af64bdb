//! Deferred-action queue — durable scheduling with at-least-once dispatch.
//!
//! Core components:
//! - `ActionQueue` — the enqueue contract callers depend on
//! - `ActionHook` — a registered dispatch entrypoint
//! - `QueueDispatcher` — poll loop that claims due actions and invokes hooks

pub mod dispatcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, QueueError};

/// The enqueue side of the deferred-execution facility. Handing an
/// action to the queue is a handoff, not a guarantee of immediate
/// execution — the dispatcher owns timing, concurrency, and redelivery.
#[async_trait]
pub trait ActionQueue: Send + Sync {
    /// Persist an invocation of `hook` with `args`, due at `run_at`.
    /// Returns the action handle.
    async fn schedule_at(
        &self,
        run_at: DateTime<Utc>,
        hook: &str,
        args: serde_json::Value,
        group: &str,
    ) -> Result<i64, QueueError>;
}

/// A dispatch entrypoint the queue can invoke. Registered once at
/// composition time; invoked with the args bag persisted at enqueue.
#[async_trait]
pub trait ActionHook: Send + Sync {
    async fn invoke(&self, args: serde_json::Value) -> Result<(), Error>;
}

pub use dispatcher::QueueDispatcher;
