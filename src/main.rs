use std::sync::Arc;
use std::time::Duration;

use content_pilot::agent::{HANDLE_TASK_HOOK, HandleTaskHook, SystemAgent};
use content_pilot::config::{EngineConfig, PredictionConfig, PublishConfig, QueueConfig};
use content_pilot::queue::QueueDispatcher;
use content_pilot::store::{Database, LibSqlBackend};
use content_pilot::tasks::{ImageGenerationTask, SocialPublishTask, TaskRegistry};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = EngineConfig {
        queue: QueueConfig {
            poll_interval: Duration::from_secs(env_parse("CONTENT_PILOT_POLL_SECS", 5)),
            batch_size: env_parse("CONTENT_PILOT_BATCH_SIZE", 20),
            concurrency: env_parse("CONTENT_PILOT_CONCURRENCY", 4),
            ..QueueConfig::default()
        },
        prediction: PredictionConfig {
            api_token: std::env::var("PREDICTION_API_TOKEN")
                .ok()
                .map(secrecy::SecretString::from),
            poll_interval: Duration::from_secs(env_parse("PREDICTION_POLL_SECS", 10)),
            ..PredictionConfig::default()
        },
        publish: PublishConfig {
            webhook_url: std::env::var("CONTENT_PILOT_WEBHOOK_URL").ok(),
            require_approval: env_parse("CONTENT_PILOT_REQUIRE_APPROVAL", false),
        },
        ..EngineConfig::default()
    };
    if let Ok(base_url) = std::env::var("PREDICTION_BASE_URL") {
        config.prediction.base_url = base_url;
    }

    let db_path = env_or("CONTENT_PILOT_DB_PATH", "./data/content-pilot.db");

    eprintln!("🛠  {} v{}", config.name, env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", db_path);
    eprintln!(
        "   Prediction API: {} ({})",
        config.prediction.base_url,
        if config.prediction.api_token.is_some() {
            "token set"
        } else {
            "no token"
        }
    );
    eprintln!(
        "   Publish webhook: {}",
        config.publish.webhook_url.as_deref().unwrap_or("(unset)")
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", db_path, e);
                std::process::exit(1);
            }),
    );

    // ── Startup Recovery: redeliver actions claimed by a dead process ──
    {
        let released = db.release_stale_claims(chrono::Utc::now()).await?;
        if released > 0 {
            tracing::info!(released, "Recovered in-flight actions from previous run");
        }
    }

    // ── Queue + Agent ───────────────────────────────────────────────────
    let dispatcher = QueueDispatcher::new(Arc::clone(&db), config.queue.clone());

    let registry = Arc::new(
        TaskRegistry::builder()
            .register(Arc::new(ImageGenerationTask::new(
                Arc::clone(&db),
                dispatcher.clone(),
                config.prediction.clone(),
            )))
            .register(Arc::new(SocialPublishTask::new(
                Arc::clone(&db),
                config.publish.clone(),
            )))
            .build(),
    );
    tracing::info!(task_types = ?registry.task_types(), "Task registry loaded");

    let agent = SystemAgent::new(Arc::clone(&db), registry, dispatcher.clone());
    dispatcher.register_hook(HANDLE_TASK_HOOK, HandleTaskHook::new(agent));

    tokio::select! {
        _ = dispatcher.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
