//! Assistant profiles and conversation bindings.
//!
//! A conversation (`session_id`) is bound to one assistant. The profile
//! supplies the model, the system prompt, the history window size, the
//! working directory handed to the agent, and the voice used for speech.

use parlance_types::{AudioEncoding, VoiceOptions};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::HistoryError;

/// A stored assistant profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantProfile {
    pub id: i64,
    pub name: String,
    pub model_name: String,
    pub prompt_text: String,
    /// Number of recent messages loaded as agent context.
    pub window_size: u32,
    pub voice_type: String,
    pub speed_ratio: f32,
    /// Working directory exposed to the agent's tools.
    pub base_file_path: Option<String>,
    pub created_at: String,
}

impl AssistantProfile {
    /// Voice settings for synthesis with this assistant.
    pub fn voice_options(&self, encoding: AudioEncoding) -> VoiceOptions {
        VoiceOptions {
            voice_type: self.voice_type.clone(),
            encoding,
            speed_ratio: self.speed_ratio,
        }
    }
}

/// Parameters for creating an assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAssistant {
    pub name: String,
    pub model_name: String,
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default = "default_window_size")]
    pub window_size: u32,
    #[serde(default = "default_voice_type")]
    pub voice_type: String,
    #[serde(default = "default_speed_ratio")]
    pub speed_ratio: f32,
    #[serde(default)]
    pub base_file_path: Option<String>,
}

fn default_window_size() -> u32 {
    30
}

fn default_voice_type() -> String {
    VoiceOptions::default().voice_type
}

fn default_speed_ratio() -> f32 {
    1.0
}

/// Partial update of an assistant. Absent fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub window_size: Option<u32>,
    #[serde(default)]
    pub voice_type: Option<String>,
    #[serde(default)]
    pub speed_ratio: Option<f32>,
    #[serde(default)]
    pub base_file_path: Option<String>,
}

impl AssistantUpdate {
    fn apply(&self, profile: &mut AssistantProfile) {
        if let Some(name) = &self.name {
            profile.name.clone_from(name);
        }
        if let Some(model_name) = &self.model_name {
            profile.model_name.clone_from(model_name);
        }
        if let Some(prompt_text) = &self.prompt_text {
            profile.prompt_text.clone_from(prompt_text);
        }
        if let Some(window_size) = self.window_size {
            profile.window_size = window_size;
        }
        if let Some(voice_type) = &self.voice_type {
            profile.voice_type.clone_from(voice_type);
        }
        if let Some(speed_ratio) = self.speed_ratio {
            profile.speed_ratio = speed_ratio;
        }
        if let Some(path) = &self.base_file_path {
            profile.base_file_path = Some(path.clone());
        }
    }
}

/// A conversation together with the assistant bound to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionProfile {
    pub session_id: String,
    pub assistant: AssistantProfile,
}

/// Creates an assistant and returns the stored profile.
pub fn create_assistant(
    conn: &Connection,
    params: &NewAssistant,
) -> Result<AssistantProfile, HistoryError> {
    if params.window_size == 0 {
        return Err(HistoryError::InvalidInput(
            "window_size must be positive".to_string(),
        ));
    }

    conn.execute(
        "INSERT INTO assistants (
            name, model_name, prompt_text, window_size, voice_type, speed_ratio, base_file_path
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            params.name,
            params.model_name,
            params.prompt_text,
            params.window_size,
            params.voice_type,
            f64::from(params.speed_ratio),
            params.base_file_path,
        ],
    )?;

    let id = conn.last_insert_rowid();
    get_assistant(conn, id)
}

/// Retrieves an assistant by id.
pub fn get_assistant(conn: &Connection, assistant_id: i64) -> Result<AssistantProfile, HistoryError> {
    conn.query_row(
        &format!("SELECT {ASSISTANT_COLUMNS} FROM assistants WHERE id = ?1"),
        [assistant_id],
        map_row_to_assistant,
    )
    .optional()?
    .ok_or_else(|| HistoryError::NotFound(format!("assistant {assistant_id}")))
}

const ASSISTANT_COLUMNS: &str = "id, name, model_name, prompt_text, window_size, voice_type, \
     speed_ratio, base_file_path, created_at";

/// Lists every assistant, oldest first.
pub fn list_assistants(conn: &Connection) -> Result<Vec<AssistantProfile>, HistoryError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ASSISTANT_COLUMNS} FROM assistants ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([], map_row_to_assistant)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(HistoryError::from)
}

/// Applies `update` to an assistant and returns the stored result.
///
/// Conversations bound to the assistant pick up the change on their next
/// turn.
pub fn update_assistant(
    conn: &Connection,
    assistant_id: i64,
    update: &AssistantUpdate,
) -> Result<AssistantProfile, HistoryError> {
    let mut profile = get_assistant(conn, assistant_id)?;
    update.apply(&mut profile);
    if profile.window_size == 0 {
        return Err(HistoryError::InvalidInput(
            "window_size must be positive".to_string(),
        ));
    }

    conn.execute(
        "UPDATE assistants SET
            name = ?2, model_name = ?3, prompt_text = ?4, window_size = ?5,
            voice_type = ?6, speed_ratio = ?7, base_file_path = ?8,
            updated_at = datetime('now')
         WHERE id = ?1",
        params![
            assistant_id,
            profile.name,
            profile.model_name,
            profile.prompt_text,
            profile.window_size,
            profile.voice_type,
            f64::from(profile.speed_ratio),
            profile.base_file_path,
        ],
    )?;

    tracing::info!(assistant_id, "assistant updated");
    Ok(profile)
}

/// Deletes an assistant together with the bindings that point at it.
///
/// Messages of those conversations stay; the conversations become unbound.
pub fn delete_assistant(conn: &Connection, assistant_id: i64) -> Result<(), HistoryError> {
    let tx = conn.unchecked_transaction()?;
    let unbound = tx.execute(
        "DELETE FROM sessions WHERE assistant_id = ?1",
        [assistant_id],
    )?;
    let deleted = tx.execute("DELETE FROM assistants WHERE id = ?1", [assistant_id])?;
    if deleted == 0 {
        return Err(HistoryError::NotFound(format!("assistant {assistant_id}")));
    }
    tx.commit()?;

    tracing::info!(assistant_id, unbound, "assistant deleted");
    Ok(())
}

/// Binds `session_id` to an assistant, replacing any earlier binding.
pub fn bind_session(
    conn: &Connection,
    session_id: &str,
    assistant_id: i64,
) -> Result<SessionProfile, HistoryError> {
    let assistant = get_assistant(conn, assistant_id)?;

    conn.execute(
        "INSERT INTO sessions (session_id, assistant_id) VALUES (?1, ?2)
         ON CONFLICT(session_id) DO UPDATE SET
            assistant_id = excluded.assistant_id,
            updated_at = datetime('now')",
        params![session_id, assistant_id],
    )?;

    tracing::info!(session_id, assistant_id, "session bound");

    Ok(SessionProfile {
        session_id: session_id.to_string(),
        assistant,
    })
}

/// Looks up the assistant bound to `session_id`.
///
/// Returns `None` if the conversation has no binding.
pub fn get_session_profile(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<SessionProfile>, HistoryError> {
    let assistant = conn
        .query_row(
            "SELECT a.id, a.name, a.model_name, a.prompt_text, a.window_size, a.voice_type,
                    a.speed_ratio, a.base_file_path, a.created_at
             FROM sessions s JOIN assistants a ON a.id = s.assistant_id
             WHERE s.session_id = ?1",
            [session_id],
            map_row_to_assistant,
        )
        .optional()?;

    Ok(assistant.map(|assistant| SessionProfile {
        session_id: session_id.to_string(),
        assistant,
    }))
}

/// Lists every bound conversation, most recently bound first.
pub fn list_sessions(conn: &Connection) -> Result<Vec<SessionProfile>, HistoryError> {
    let mut stmt = conn.prepare(
        "SELECT a.id, a.name, a.model_name, a.prompt_text, a.window_size, a.voice_type,
                a.speed_ratio, a.base_file_path, a.created_at, s.session_id
         FROM sessions s JOIN assistants a ON a.id = s.assistant_id
         ORDER BY s.updated_at DESC, s.session_id ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(SessionProfile {
            assistant: map_row_to_assistant(row)?,
            session_id: row.get(9)?,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(HistoryError::from)
}

/// Removes the binding of `session_id`. Returns whether one existed.
///
/// The conversation's messages are kept and a later binding resumes them.
pub fn unbind_session(conn: &Connection, session_id: &str) -> Result<bool, HistoryError> {
    let removed = conn.execute("DELETE FROM sessions WHERE session_id = ?1", [session_id])?;
    if removed > 0 {
        tracing::info!(session_id, "session unbound");
    }
    Ok(removed > 0)
}

fn map_row_to_assistant(row: &Row) -> rusqlite::Result<AssistantProfile> {
    Ok(AssistantProfile {
        id: row.get(0)?,
        name: row.get(1)?,
        model_name: row.get(2)?,
        prompt_text: row.get(3)?,
        window_size: row.get(4)?,
        voice_type: row.get(5)?,
        speed_ratio: row.get::<_, f64>(6)? as f32,
        base_file_path: row.get(7)?,
        created_at: row.get(8)?,
    })
}
