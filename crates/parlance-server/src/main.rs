//! Parlance server binary.
//!
//! Starts an axum HTTP server with structured logging, database initialization,
//! and graceful shutdown on SIGTERM/SIGINT.

use parlance_agent::ChatCompletionsAgent;
use parlance_lock::{LockBackend, MemoryLockBackend, SessionLock, SqliteLockBackend};
use parlance_server::config::{self, LockBackendKind};
use parlance_server::storage::LocalBlobStore;
use parlance_server::{app, AppState, AudioMount, StreamSettings};
use parlance_voice::{HttpRecognizer, HttpSynthesizer, ToolPrompts};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("PARLANCE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = parlance_db::create_pool(
        &config.database.path,
        parlance_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied =
            parlance_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    // Collaborators
    let lock_backend: Arc<dyn LockBackend> = match config.lock.backend {
        LockBackendKind::Sqlite => Arc::new(SqliteLockBackend::new(pool.clone())),
        LockBackendKind::Memory => Arc::new(MemoryLockBackend::new()),
    };
    let locks = SessionLock::new(lock_backend, Duration::from_secs(config.lock.ttl_seconds));

    let agent = ChatCompletionsAgent::new(config.agent.clone())
        .expect("failed to build agent client; check the [agent] section");
    let synthesizer = HttpSynthesizer::new(config.voice.tts.clone())
        .expect("failed to build TTS client; check the [voice] section");
    if config.voice.tts.api_key.is_empty() {
        tracing::warn!("voice.api_key is empty; synthesis requests will likely be rejected");
    }
    let recognizer = HttpRecognizer::new(config.voice.resolved_asr())
        .expect("failed to build ASR client; check the [voice.asr] section");

    std::fs::create_dir_all(&config.storage.dir)
        .expect("failed to create storage.dir for audio clips");
    let storage = LocalBlobStore::new(
        &config.storage.dir,
        &config.server.public_url,
        &config.storage.url_prefix,
    );

    let state = AppState {
        pool,
        locks,
        agent: Arc::new(agent),
        synthesizer: Arc::new(synthesizer),
        recognizer: Arc::new(recognizer),
        storage: Arc::new(storage),
        tool_prompts: Arc::new(ToolPrompts::with_overrides(
            config.voice.tool_prompts.clone(),
        )),
        stream: StreamSettings::from(&config),
        audio_mount: Some(AudioMount {
            url_prefix: config.storage.url_prefix.clone(),
            dir: config.storage.dir.clone().into(),
        }),
    };

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, model = %config.agent.model, "starting parlance server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("parlance server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
