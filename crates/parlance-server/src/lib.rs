//! Parlance server library logic.

pub mod api;
pub mod api_chat;
pub mod api_sessions;
pub mod config;
pub mod sse;
pub mod storage;
pub mod turn;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use parlance_agent::Agent;
use parlance_db::DbPool;
use parlance_lock::SessionLock;
use parlance_types::AudioEncoding;
use parlance_voice::{Recognizer, SegmenterConfig, Synthesizer, ToolPrompts};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use storage::BlobStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// Per-conversation turn locks.
    pub locks: SessionLock,
    /// Upstream agent invoked once per turn.
    pub agent: Arc<dyn Agent>,
    /// Speech synthesis backend.
    pub synthesizer: Arc<dyn Synthesizer>,
    /// Transcribes spoken user input.
    pub recognizer: Arc<dyn Recognizer>,
    /// Store for finished audio clips.
    pub storage: Arc<dyn BlobStore>,
    /// Spoken notices for tool calls.
    pub tool_prompts: Arc<ToolPrompts>,
    /// Turn streaming settings.
    pub stream: StreamSettings,
    /// Local clip directory to serve, if clips are stored on disk.
    pub audio_mount: Option<AudioMount>,
}

/// Streaming behavior of turns.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub segmenter: SegmenterConfig,
    /// Hold all events of a turn until it is committed.
    pub deliver_after_commit: bool,
    /// Messages returned by the history listing.
    pub history_limit: u32,
    /// Encoding requested from the synthesizer and used for stored clips.
    pub encoding: AudioEncoding,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            deliver_after_commit: false,
            history_limit: 100,
            encoding: AudioEncoding::default(),
        }
    }
}

impl From<&config::Config> for StreamSettings {
    fn from(config: &config::Config) -> Self {
        Self {
            segmenter: SegmenterConfig {
                min_len: config.stream.segment_min_len,
                max_len: config.stream.segment_max_len,
            },
            deliver_after_commit: config.stream.deliver_after_commit,
            history_limit: config.stream.history_limit,
            encoding: config.voice.tts.encoding,
        }
    }
}

/// A directory served under a URL prefix.
#[derive(Debug, Clone)]
pub struct AudioMount {
    pub url_prefix: String,
    pub dir: PathBuf,
}

/// Maximum request body size (8 MiB), enough for a base64 voice clip.
const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route(
            "/api/assistants",
            get(api_sessions::list_assistants_handler).post(api_sessions::create_assistant_handler),
        )
        .route(
            "/api/assistants/{assistantId}",
            get(api_sessions::get_assistant_handler)
                .put(api_sessions::update_assistant_handler)
                .delete(api_sessions::delete_assistant_handler),
        )
        .route("/api/sessions", get(api_sessions::list_sessions_handler))
        .route(
            "/api/sessions/{sessionId}",
            get(api_sessions::get_session_handler)
                .put(api_sessions::bind_session_handler)
                .delete(api_sessions::unbind_session_handler),
        )
        .route(
            "/api/chats/{sessionId}/completions",
            post(api_chat::completions_handler),
        )
        .route(
            "/api/chats/{sessionId}/messages",
            get(api_chat::list_messages_handler),
        )
        .route(
            "/api/chats/{sessionId}/messages/{messageId}",
            delete(api_chat::truncate_handler),
        );

    let router = match &state.audio_mount {
        Some(mount) => {
            tracing::info!(
                path = %mount.dir.display(),
                prefix = %mount.url_prefix,
                "serving audio clips"
            );
            router.nest_service(&mount.url_prefix, ServeDir::new(&mount.dir))
        }
        None => router,
    };

    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
