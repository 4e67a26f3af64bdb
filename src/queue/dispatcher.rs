//! Queue dispatcher — claims due actions and invokes registered hooks.
//!
//! Delivery is at-least-once: claims that are never marked done (process
//! crash, hung hook) are released back to pending after
//! `stale_claim_timeout` and redelivered. No ordering is guaranteed
//! between actions; within a batch, invocations run concurrently bounded
//! by `concurrency`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio::sync::{Notify, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::queue::{ActionHook, ActionQueue};
use crate::store::{Database, ScheduledAction};

/// Dispatches persisted deferred actions to registered hooks.
pub struct QueueDispatcher {
    db: Arc<dyn Database>,
    config: QueueConfig,
    hooks: RwLock<HashMap<String, Arc<dyn ActionHook>>>,
    /// Nudged on enqueue so due actions don't wait out a full poll tick.
    notify: Notify,
}

impl QueueDispatcher {
    /// Create a new dispatcher over the given store.
    pub fn new(db: Arc<dyn Database>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            hooks: RwLock::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Register a dispatch entrypoint (sync version for startup).
    pub fn register_hook(&self, name: &str, hook: Arc<dyn ActionHook>) {
        if let Ok(mut hooks) = self.hooks.try_write() {
            hooks.insert(name.to_string(), hook);
            debug!(hook = name, "Registered action hook");
        } else {
            warn!(hook = name, "Hook registration skipped: registry busy");
        }
    }

    /// Release stale claims, then claim and dispatch one batch of due
    /// actions. Returns the number of actions processed.
    pub async fn poll_once(&self) -> usize {
        let now = Utc::now();

        let stale_cutoff = now
            - ChronoDuration::from_std(self.config.stale_claim_timeout)
                .unwrap_or_else(|_| ChronoDuration::seconds(300));
        if let Err(e) = self.db.release_stale_claims(stale_cutoff).await {
            error!(error = %e, "Failed to release stale claims");
        }

        let claim_id = Uuid::new_v4();
        let actions = match self
            .db
            .claim_due_actions(claim_id, now, self.config.batch_size)
            .await
        {
            Ok(actions) => actions,
            Err(e) => {
                error!(error = %e, "Failed to claim due actions");
                return 0;
            }
        };

        if actions.is_empty() {
            return 0;
        }

        debug!(
            claim_id = %claim_id,
            count = actions.len(),
            "Claimed due actions"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let futures: Vec<_> = actions
            .into_iter()
            .map(|action| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    self.dispatch_action(action).await;
                }
            })
            .collect();

        let count = futures.len();
        join_all(futures).await;
        count
    }

    /// Invoke the hook for one claimed action and record the outcome.
    async fn dispatch_action(&self, action: ScheduledAction) {
        let hook = self.hooks.read().await.get(&action.hook).cloned();

        let Some(hook) = hook else {
            // A different deployment may have enqueued this; never crash.
            error!(
                action_id = action.id,
                hook = %action.hook,
                "No hook registered for action"
            );
            let err = QueueError::UnknownHook {
                hook: action.hook.clone(),
            };
            if let Err(e) = self.db.mark_action_failed(action.id, &err.to_string()).await {
                error!(action_id = action.id, error = %e, "Failed to record action failure");
            }
            return;
        };

        let action_id = action.id;
        let args = action.args.clone();
        // Spawned so a panicking hook surfaces as a JoinError instead of
        // taking the dispatch loop down.
        let result = tokio::spawn(async move { hook.invoke(args).await }).await;

        let outcome = match result {
            Ok(Ok(())) => {
                debug!(action_id, hook = %action.hook, attempts = action.attempts, "Action dispatched");
                self.db.mark_action_done(action_id).await
            }
            Ok(Err(e)) => {
                warn!(action_id, hook = %action.hook, error = %e, "Action hook failed");
                self.db.mark_action_failed(action_id, &e.to_string()).await
            }
            Err(e) => {
                error!(action_id, hook = %action.hook, error = %e, "Action hook panicked");
                self.db
                    .mark_action_failed(action_id, &format!("hook panicked: {e}"))
                    .await
            }
        };

        if let Err(e) = outcome {
            error!(action_id, error = %e, "Failed to record action outcome");
        }
    }

    /// Run the dispatch loop until the surrounding task is dropped.
    pub async fn run(&self) {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "Queue dispatcher running"
        );

        loop {
            let processed = self.poll_once().await;

            // A full batch suggests more work is due; poll again now.
            if processed >= self.config.batch_size {
                continue;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl ActionQueue for QueueDispatcher {
    async fn schedule_at(
        &self,
        run_at: DateTime<Utc>,
        hook: &str,
        args: serde_json::Value,
        group: &str,
    ) -> Result<i64, QueueError> {
        let id = self
            .db
            .enqueue_action(hook, &args, group, run_at)
            .await
            .map_err(|e| QueueError::EnqueueFailed {
                hook: hook.to_string(),
                reason: e.to_string(),
            })?;

        self.notify.notify_one();
        Ok(id)
    }
}
