use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use futures_util::StreamExt;
use parlance_agent::{
    Agent, AgentConfig, AgentError, AgentEvent, AgentRequest, ChatCompletionsAgent,
};
use parlance_types::{Message, Role};
use serde_json::Value;

#[derive(Clone)]
struct Backend {
    status: StatusCode,
    body: &'static str,
    seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn completions(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    backend.seen.lock().unwrap().push((auth, request));
    (
        backend.status,
        [(header::CONTENT_TYPE, "text/event-stream")],
        backend.body,
    )
}

async fn spawn_backend(status: StatusCode, body: &'static str) -> (AgentConfig, Backend) {
    let backend = Backend {
        status,
        body,
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let config = AgentConfig {
        base_url: format!("http://{addr}/v1"),
        api_key: "sk-test".to_string(),
        model: "default-model".to_string(),
        timeout_seconds: 10,
    };
    (config, backend)
}

const STREAM: &str = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"你好，\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"今天天气不错。\"}}]}\n\n\
data: [DONE]\n\n";

fn request() -> AgentRequest {
    let mut request = AgentRequest {
        model: Some("qwen-plus".to_string()),
        system_prompt: Some("Be brief.".to_string()),
        messages: vec![Message::human("h1", "天气怎么样？")],
        ..AgentRequest::default()
    };
    request
        .options
        .insert("working_dir".to_string(), Value::from("/srv/files"));
    request
}

#[tokio::test]
async fn streams_deltas_then_the_finished_step() {
    let (config, backend) = spawn_backend(StatusCode::OK, STREAM).await;
    let agent = ChatCompletionsAgent::new(config).unwrap();

    let events: Vec<AgentEvent> = agent
        .invoke(request())
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], AgentEvent::TokenDelta { text, .. } if text == "你好，"));
    assert!(matches!(&events[1], AgentEvent::TokenDelta { text, .. } if text == "今天天气不错。"));
    match &events[2] {
        AgentEvent::StepUpdate { step_id, message } => {
            assert_eq!(step_id, events[0].step_id());
            assert_eq!(message.role, Role::Ai);
            assert_eq!(message.content, "你好，今天天气不错。");
            assert!(!message.id.is_empty());
        }
        other => panic!("expected step update, got {other:?}"),
    }

    let seen = backend.seen.lock().unwrap();
    let (auth, body) = &seen[0];
    assert_eq!(auth.as_deref(), Some("Bearer sk-test"));
    assert_eq!(body["model"], "qwen-plus");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["role"], "user");
    assert_eq!(body["messages"][1]["content"], "天气怎么样？");
}

#[tokio::test]
async fn error_status_fails_the_invocation() {
    let (config, _) = spawn_backend(StatusCode::TOO_MANY_REQUESTS, "slow down").await;
    let agent = ChatCompletionsAgent::new(config).unwrap();

    match agent.invoke(request()).await {
        Err(AgentError::Status { status, body }) => {
            assert_eq!(status, 429);
            assert_eq!(body, "slow down");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected failure"),
    }
}

#[tokio::test]
async fn truncated_stream_ends_with_an_error() {
    let truncated = "data: {\"choices\":[{\"delta\":{\"content\":\"half\"}}]}\n\n";
    let (config, _) = spawn_backend(StatusCode::OK, truncated).await;
    let agent = ChatCompletionsAgent::new(config).unwrap();

    let events: Vec<_> = agent.invoke(request()).await.unwrap().collect().await;
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], Ok(AgentEvent::TokenDelta { .. })));
    assert!(matches!(&events[1], Err(AgentError::Protocol(_))));
}

async fn slow_completions() -> impl IntoResponse {
    let chunks = [
        "data: {\"choices\":[{\"delta\":{\"content\":\"一，\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"二，\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"三。\"}}]}\n\n",
        "data: [DONE]\n\n",
    ];
    let body = futures_util::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        Ok::<_, std::convert::Infallible>(chunk)
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        axum::body::Body::from_stream(body),
    )
}

#[tokio::test]
async fn generation_may_outlast_the_timeout() {
    let app = Router::new().route("/v1/chat/completions", post(slow_completions));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Each gap stays under the timeout; the whole stream takes twice as long.
    let agent = ChatCompletionsAgent::new(AgentConfig {
        base_url: format!("http://{addr}/v1"),
        timeout_seconds: 1,
        ..AgentConfig::default()
    })
    .unwrap();

    let events: Vec<AgentEvent> = agent
        .invoke(request())
        .await
        .unwrap()
        .map(|e| e.unwrap())
        .collect()
        .await;

    assert_eq!(events.len(), 4);
    match &events[3] {
        AgentEvent::StepUpdate { message, .. } => assert_eq!(message.content, "一，二，三。"),
        other => panic!("expected step update, got {other:?}"),
    }
}
