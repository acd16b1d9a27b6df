use anyhow::Result;
use axum::{response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lexibot_core::OpenAiClient;
use lexibot_server::config::{Config, CLEANUP_INTERVAL, EVENT_RETENTION};
use lexibot_server::repository::{SqliteRepository, ThreadRef, VocabRepository};
use lexibot_server::scheduler::{self, DailySchedule};
use lexibot_server::slack::SlackClient;
use lexibot_server::webhook::webhook_router;
use lexibot_server::AppState;

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "lexibot"
    }))
}

async fn help_handler() -> Json<serde_json::Value> {
    Json(json!({
        "service": "lexibot",
        "version": lexibot_server::get_bot_version(),
        "description": "Daily vocabulary tutor posting words to a Slack channel",
        "endpoints": [
            {
                "path": "/health",
                "method": "GET",
                "description": "Health check endpoint",
                "authentication": "None"
            },
            {
                "path": "/slack/events",
                "method": "POST",
                "description": "Slack events webhook receiver",
                "authentication": "Slack request signature (X-Slack-Signature)"
            },
            {
                "path": "/help",
                "method": "GET",
                "description": "API documentation and service information",
                "authentication": "None"
            }
        ],
        "configuration": {
            "required_env_vars": [
                "SLACK_BOT_TOKEN",
                "SLACK_CHANNEL_ID",
                "SLACK_SIGNING_SECRET",
                "OPENAI_API_KEY"
            ],
            "optional_env_vars": [
                "OPENAI_MODEL (default: gpt-4o)",
                "DAILY_WORD_TIME (default: 09:00)",
                "TIMEZONE (default: America/New_York)",
                "PORT (default: 3000)",
                "STATE_DIR (default: current directory)",
                "THEME_THREAD (default: unset)"
            ]
        }
    }))
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting lexibot vocabulary tutor");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let schedule = DailySchedule::parse(&config.daily_word_time, &config.timezone)
        .expect("Invalid daily schedule configuration");

    let platform = SlackClient::new(
        config.slack_bot_token.clone(),
        config.slack_channel_id.clone(),
    );
    let backend = OpenAiClient::new(config.openai_api_key.clone(), config.openai_model.clone());

    let db_path = config.state_dir.join("lexibot-state.db");
    info!("Using state database: {}", db_path.display());
    let repository =
        SqliteRepository::new(&db_path).expect("Failed to initialize SQLite database");
    let repository: Arc<dyn VocabRepository> = Arc::new(repository);

    // Seed the theme-thread setting once; an existing value wins so a
    // restart never clobbers a thread configured at runtime.
    if let Some(theme_thread) = &config.theme_thread {
        match repository.theme_thread().await {
            Ok(None) => {
                repository
                    .set_theme_thread(&ThreadRef(theme_thread.clone()))
                    .await
                    .expect("Failed to seed theme thread setting");
                info!("Seeded theme thread {}", theme_thread);
            }
            Ok(Some(_)) => {}
            Err(e) => error!("Could not read theme thread setting: {}", e),
        }
    }

    let app_state = Arc::new(AppState::new(
        Arc::new(platform),
        Arc::new(backend),
        repository,
        config.slack_signing_secret.clone(),
        config.openai_temperature,
        config.openai_max_tokens,
    ));

    // First run: post the initial word before accepting any events.
    scheduler::run_startup_check(&app_state).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let daily_state = app_state.clone();
    let daily_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        scheduler::daily_post_loop(daily_state, schedule, daily_shutdown).await;
    });

    let cleanup_state = app_state.clone();
    let cleanup_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        scheduler::cleanup_loop(
            cleanup_state,
            CLEANUP_INTERVAL,
            EVENT_RETENTION,
            cleanup_shutdown,
        )
        .await;
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/help", get(help_handler))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining in-flight requests");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    info!("lexibot stopped");
    Ok(())
}
