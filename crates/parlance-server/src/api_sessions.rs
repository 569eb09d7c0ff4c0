//! Assistant profiles and session binding.

use crate::api::{check_id, with_conn, ApiError};
use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
};
use parlance_history::{AssistantProfile, AssistantUpdate, NewAssistant, SessionProfile};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Request body for `PUT /api/sessions/{sessionId}`.
#[derive(Debug, Deserialize)]
pub struct BindSessionRequest {
    pub assistant_id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssistantsResponse {
    pub assistants: Vec<AssistantProfile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionProfile>,
}

fn check_not_blank(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(())
}

fn check_speed_ratio(speed_ratio: f32) -> Result<(), ApiError> {
    if !(0.1..=10.0).contains(&speed_ratio) {
        return Err(ApiError::BadRequest(format!(
            "speed_ratio {speed_ratio} out of range 0.1..=10"
        )));
    }
    Ok(())
}

/// Handler for `POST /api/assistants`.
pub async fn create_assistant_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<NewAssistant>,
) -> Result<(StatusCode, Json<AssistantProfile>), ApiError> {
    check_not_blank("name", &payload.name)?;
    check_not_blank("model_name", &payload.model_name)?;
    check_speed_ratio(payload.speed_ratio)?;

    let profile = with_conn(&state.pool, move |conn| {
        Ok(parlance_history::create_assistant(conn, &payload)?)
    })
    .await?;

    tracing::info!(assistant_id = profile.id, name = %profile.name, "assistant created");
    Ok((StatusCode::CREATED, Json(profile)))
}

/// Handler for `GET /api/assistants`.
pub async fn list_assistants_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<AssistantsResponse>, ApiError> {
    let assistants = with_conn(&state.pool, |conn| {
        Ok(parlance_history::list_assistants(conn)?)
    })
    .await?;
    Ok(Json(AssistantsResponse { assistants }))
}

/// Handler for `GET /api/assistants/{assistantId}`.
pub async fn get_assistant_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(assistant_id): Path<i64>,
) -> Result<Json<AssistantProfile>, ApiError> {
    let profile = with_conn(&state.pool, move |conn| {
        Ok(parlance_history::get_assistant(conn, assistant_id)?)
    })
    .await?;
    Ok(Json(profile))
}

/// Handler for `PUT /api/assistants/{assistantId}`.
///
/// Only the fields present in the body change.
pub async fn update_assistant_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(assistant_id): Path<i64>,
    Json(payload): Json<AssistantUpdate>,
) -> Result<Json<AssistantProfile>, ApiError> {
    if let Some(name) = &payload.name {
        check_not_blank("name", name)?;
    }
    if let Some(model_name) = &payload.model_name {
        check_not_blank("model_name", model_name)?;
    }
    if let Some(speed_ratio) = payload.speed_ratio {
        check_speed_ratio(speed_ratio)?;
    }

    let profile = with_conn(&state.pool, move |conn| {
        Ok(parlance_history::update_assistant(conn, assistant_id, &payload)?)
    })
    .await?;
    Ok(Json(profile))
}

/// Handler for `DELETE /api/assistants/{assistantId}`.
///
/// Conversations bound to the assistant become unbound.
pub async fn delete_assistant_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(assistant_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    with_conn(&state.pool, move |conn| {
        Ok(parlance_history::delete_assistant(conn, assistant_id)?)
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `PUT /api/sessions/{sessionId}`.
///
/// Binds the conversation to an assistant, replacing any earlier binding.
pub async fn bind_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(payload): Json<BindSessionRequest>,
) -> Result<Json<SessionProfile>, ApiError> {
    check_id("session_id", &session_id)?;

    let profile = with_conn(&state.pool, move |conn| {
        Ok(parlance_history::bind_session(
            conn,
            &session_id,
            payload.assistant_id,
        )?)
    })
    .await?;

    Ok(Json(profile))
}

/// Handler for `GET /api/sessions`.
pub async fn list_sessions_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let sessions = with_conn(&state.pool, |conn| {
        Ok(parlance_history::list_sessions(conn)?)
    })
    .await?;
    Ok(Json(SessionsResponse { sessions }))
}

/// Handler for `GET /api/sessions/{sessionId}`.
pub async fn get_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionProfile>, ApiError> {
    check_id("session_id", &session_id)?;

    let sid = session_id.clone();
    with_conn(&state.pool, move |conn| {
        Ok(parlance_history::get_session_profile(conn, &sid)?)
    })
    .await?
    .map(Json)
    .ok_or_else(|| ApiError::NotFound(format!("session {session_id} is not bound")))
}

/// Handler for `DELETE /api/sessions/{sessionId}`.
///
/// Removes the binding only; the conversation's messages stay.
pub async fn unbind_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    check_id("session_id", &session_id)?;

    let sid = session_id.clone();
    let removed = with_conn(&state.pool, move |conn| {
        Ok(parlance_history::unbind_session(conn, &sid)?)
    })
    .await?;
    if !removed {
        return Err(ApiError::NotFound(format!("session {session_id} is not bound")));
    }
    Ok(StatusCode::NO_CONTENT)
}
