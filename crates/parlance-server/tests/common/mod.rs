#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use futures_util::StreamExt;
use parlance_agent::{Agent, AgentError, AgentEvent, AgentRequest, AgentStream};
use parlance_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use parlance_history::{bind_session, commit_turn, create_assistant, NewAssistant};
use parlance_lock::{LockBackend, LockError, MemoryLockBackend, SessionLock, SqliteLockBackend};
use parlance_server::storage::{BlobStore, StorageError};
use parlance_server::{AppState, StreamSettings};
use parlance_types::{Message, VoiceOptions};
use parlance_voice::{Recognizer, Synthesizer, ToolPrompts, VoiceError};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;

pub const SESSION: &str = "s1";
pub const WORKING_DIR: &str = "/srv/files";

/// One scripted agent output.
#[derive(Clone)]
pub enum Step {
    Delta(&'static str, &'static str),
    Update(&'static str, Message),
    Fail(&'static str),
}

/// Replays the same script on every invocation.
pub struct ScriptedAgent {
    script: Vec<Step>,
    pub requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedAgent {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait::async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentStream, AgentError> {
        self.requests.lock().unwrap().push(request);
        let events: Vec<Result<AgentEvent, AgentError>> = self
            .script
            .iter()
            .cloned()
            .map(|step| match step {
                Step::Delta(step_id, text) => Ok(AgentEvent::TokenDelta {
                    step_id: step_id.to_string(),
                    text: text.to_string(),
                }),
                Step::Update(step_id, message) => Ok(AgentEvent::StepUpdate {
                    step_id: step_id.to_string(),
                    message,
                }),
                Step::Fail(msg) => Err(AgentError::Protocol(msg.to_string())),
            })
            .collect();
        Ok(futures_util::stream::iter(events).boxed())
    }
}

/// Agent whose events are pushed by the test while the turn runs.
pub struct ChannelAgent {
    rx: Mutex<Option<mpsc::Receiver<Result<AgentEvent, AgentError>>>>,
}

impl ChannelAgent {
    pub fn new() -> (Arc<Self>, mpsc::Sender<Result<AgentEvent, AgentError>>) {
        let (tx, rx) = mpsc::channel(16);
        let agent = Arc::new(Self {
            rx: Mutex::new(Some(rx)),
        });
        (agent, tx)
    }
}

#[async_trait::async_trait]
impl Agent for ChannelAgent {
    async fn invoke(&self, _request: AgentRequest) -> Result<AgentStream, AgentError> {
        match self.rx.lock().unwrap().take() {
            Some(rx) => Ok(ReceiverStream::new(rx).boxed()),
            None => Ok(futures_util::stream::empty().boxed()),
        }
    }
}

/// "Synthesizes" text into its UTF-8 bytes. Texts containing `失败` fail.
#[derive(Default)]
pub struct FakeSynthesizer {
    pub texts: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        self.texts.lock().unwrap().push(text.to_string());
        if text.contains("失败") {
            return Err(VoiceError::Tts("scripted failure".to_string()));
        }
        Ok(text.as_bytes().to_vec())
    }
}

/// Returns a fixed transcript and records the clip URLs it was given.
pub struct FakeRecognizer {
    pub transcript: Mutex<Result<String, String>>,
    pub urls: Mutex<Vec<(String, String)>>,
}

impl Default for FakeRecognizer {
    fn default() -> Self {
        Self {
            transcript: Mutex::new(Ok("你好".to_string())),
            urls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRecognizer {
    pub fn answer(&self, transcript: Result<&str, &str>) {
        *self.transcript.lock().unwrap() = transcript.map(str::to_string).map_err(str::to_string);
    }
}

#[async_trait::async_trait]
impl Recognizer for FakeRecognizer {
    async fn transcribe(&self, audio_url: &str, format: &str) -> Result<String, VoiceError> {
        self.urls
            .lock()
            .unwrap()
            .push((audio_url.to_string(), format.to_string()));
        self.transcript.lock().unwrap().clone().map_err(VoiceError::Asr)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub blobs: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait::async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _mime_type: &str) -> Result<(), StorageError> {
        self.blobs.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get_url(&self, key: &str) -> Result<String, StorageError> {
        Ok(format!("/audio/{key}"))
    }
}

/// Grants and releases locks but never renews them.
#[derive(Default)]
pub struct ForgetfulLockBackend {
    inner: MemoryLockBackend,
}

#[async_trait::async_trait]
impl LockBackend for ForgetfulLockBackend {
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        self.inner.set_if_absent(key, token, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, LockError> {
        self.inner.compare_and_delete(key, token).await
    }

    async fn extend(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, LockError> {
        Ok(false)
    }
}

pub fn memory_locks(ttl: Duration) -> SessionLock {
    SessionLock::new(Arc::new(MemoryLockBackend::new()), ttl)
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub synth: Arc<FakeSynthesizer>,
    pub asr: Arc<FakeRecognizer>,
    _dir: TempDir,
}

impl Harness {
    pub fn app(&self) -> Router {
        parlance_server::app(self.state.clone())
    }

    pub fn pool(&self) -> &DbPool {
        &self.state.pool
    }

    pub fn history(&self) -> Vec<Message> {
        let conn = self.pool().get().unwrap();
        parlance_history::window(&conn, SESSION, 100).unwrap()
    }

    /// Commits `messages` as one turn of `thread`, chaining parents.
    pub fn seed(&self, thread: &str, messages: Vec<Message>) {
        let mut conn = self.pool().get().unwrap();
        let mut parent = parlance_history::window(&conn, thread, 1)
            .unwrap()
            .pop()
            .map(|m| m.id);
        let mut batch = Vec::new();
        for mut message in messages {
            message.parent_id = parent.clone();
            parent = Some(message.id.clone());
            batch.push(message);
        }
        commit_turn(&mut conn, thread, &batch).unwrap();
    }
}

pub fn harness(agent: Arc<dyn Agent>) -> Harness {
    harness_with(agent, StreamSettings::default())
}

pub fn harness_with(agent: Arc<dyn Agent>, stream: StreamSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("parlance.db");
    let pool = create_pool(db_path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        let assistant = create_assistant(
            &conn,
            &NewAssistant {
                name: "helper".to_string(),
                model_name: "test-model".to_string(),
                prompt_text: "Answer briefly.".to_string(),
                window_size: 30,
                voice_type: "qiniu_zh_female_wwxkjx".to_string(),
                speed_ratio: 1.0,
                base_file_path: Some(WORKING_DIR.to_string()),
            },
        )
        .unwrap();
        bind_session(&conn, SESSION, assistant.id).unwrap();
    }

    let store = Arc::new(MemoryStore::default());
    let synth = Arc::new(FakeSynthesizer::default());
    let asr = Arc::new(FakeRecognizer::default());
    let state = AppState {
        locks: SessionLock::new(
            Arc::new(SqliteLockBackend::new(pool.clone())),
            Duration::from_secs(60),
        ),
        pool,
        agent,
        synthesizer: synth.clone(),
        recognizer: asr.clone(),
        storage: store.clone(),
        tool_prompts: Arc::new(ToolPrompts::default()),
        stream,
        audio_mount: None,
    };

    Harness {
        state,
        store,
        synth,
        asr,
        _dir: dir,
    }
}

pub async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// A decoded SSE frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event: String,
    pub data: Value,
}

impl Frame {
    pub fn audio_text(&self) -> String {
        use base64::Engine;
        let encoded = self.data["base64"].as_str().unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        String::from_utf8(bytes).unwrap()
    }
}

/// Reads the whole SSE body.
pub async fn read_frames(response: Response<Body>) -> Vec<Frame> {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    let mut frames = Vec::new();
    for block in text.split("\n\n") {
        let mut event = None;
        let mut data = Vec::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim().to_string());
            } else if let Some(payload) = line.strip_prefix("data:") {
                data.push(payload.trim_start().to_string());
            }
        }
        if let Some(event) = event {
            frames.push(Frame {
                event,
                data: serde_json::from_str(&data.join("\n")).unwrap(),
            });
        }
    }
    frames
}

pub fn event_names(frames: &[Frame]) -> Vec<&str> {
    frames.iter().map(|f| f.event.as_str()).collect()
}

pub fn completion(id: &str, content: &str) -> Value {
    serde_json::json!({ "id": id, "content": content })
}

pub fn voice_completion(id: &str, clip: &[u8]) -> Value {
    use base64::Engine;
    serde_json::json!({
        "id": id,
        "type": "audio",
        "content": base64::engine::general_purpose::STANDARD.encode(clip),
    })
}

pub async fn wait_for_lock(state: &AppState, session: &str) {
    for _ in 0..100 {
        if let Ok(guard) = state.locks.acquire(session).await {
            guard.release().await.unwrap();
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session lock for {session} was never released");
}
