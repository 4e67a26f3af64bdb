//! System agent — schedules deferred tasks and reconciles their outcomes.

pub mod orchestrator;

/// Name of the dispatch entrypoint the agent registers with the queue.
pub const HANDLE_TASK_HOOK: &str = "content_pilot.handle_task";

/// Group tag for all actions this engine enqueues.
pub const ACTION_GROUP: &str = "content-pilot";

pub use orchestrator::{HandleTaskHook, SystemAgent};
