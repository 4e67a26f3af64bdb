//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine name for identification.
    pub name: String,
    /// Deferred-action queue tuning.
    pub queue: QueueConfig,
    /// Prediction API settings.
    pub prediction: PredictionConfig,
    /// Outbound publishing settings.
    pub publish: PublishConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "content-pilot".to_string(),
            queue: QueueConfig::default(),
            prediction: PredictionConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

/// Deferred-action queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How often the dispatcher polls for due actions.
    pub poll_interval: Duration,
    /// Maximum actions claimed per poll.
    pub batch_size: usize,
    /// Maximum hook invocations running at once.
    pub concurrency: usize,
    /// Claimed actions older than this are returned to pending
    /// (crash recovery; redelivery is at-least-once).
    pub stale_claim_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            concurrency: 4,
            stale_claim_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Prediction API settings.
#[derive(Clone)]
pub struct PredictionConfig {
    /// API token. Image generation jobs fail with a descriptive status
    /// when this is absent.
    pub api_token: Option<SecretString>,
    /// Base URL of the predictions endpoint.
    pub base_url: String,
    /// Delay between prediction status checks.
    pub poll_interval: Duration,
    /// Checks before a still-running prediction is treated as failed.
    pub max_poll_attempts: u32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            base_url: "https://api.replicate.com/v1".to_string(),
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: 30,
        }
    }
}

impl std::fmt::Debug for PredictionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionConfig")
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_attempts", &self.max_poll_attempts)
            .finish()
    }
}

/// Outbound publishing settings.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Webhook that receives published content. Publish jobs fail with
    /// a descriptive status when this is absent.
    pub webhook_url: Option<String>,
    /// When set, publish jobs park as waiting until approved.
    pub require_approval: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            require_approval: false,
        }
    }
}
