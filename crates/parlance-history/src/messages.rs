//! Append-only message chain.

use std::collections::HashSet;

use parlance_types::{Message, Role, ToolCall};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};

use crate::HistoryError;

/// Upper bound on parent references followed by [`chain`].
pub const MAX_CHAIN_DEPTH: usize = 10_000;

const MESSAGE_COLUMNS: &str = "seq, message_id, thread_id, role, content, tool_calls_json, \
     artifact, name, tool_call_id, parent_message_id, audio_key, deleted, created_at, updated_at";

/// Checks that `messages` form a well-shaped turn.
///
/// A turn opens with exactly one human message, followed by ai and tool
/// messages only. Every tool message must answer a tool call issued by an
/// earlier ai message of the same batch.
pub fn validate_turn(messages: &[Message]) -> Result<(), HistoryError> {
    let Some(first) = messages.first() else {
        return Err(HistoryError::InvalidTurn("empty turn".to_string()));
    };
    if first.role != Role::Human {
        return Err(HistoryError::InvalidTurn(format!(
            "turn must open with a human message, got {}",
            first.role
        )));
    }

    let mut issued: HashSet<&str> = HashSet::new();
    for msg in &messages[1..] {
        match msg.role {
            Role::Ai => issued.extend(msg.tool_calls.iter().map(|c| c.id.as_str())),
            Role::Tool => {
                let answered = msg.tool_call_id.as_deref().unwrap_or_default();
                if !issued.contains(answered) {
                    return Err(HistoryError::InvalidTurn(format!(
                        "tool message {} answers unknown tool call {answered:?}",
                        msg.id
                    )));
                }
            }
            Role::Human | Role::System => {
                return Err(HistoryError::InvalidTurn(format!(
                    "unexpected {} message {} inside a turn",
                    msg.role, msg.id
                )));
            }
        }
    }
    Ok(())
}

/// Inserts `messages` into `thread_id` inside an open transaction.
///
/// Returns the assigned `seq` values in input order. The caller decides
/// whether to commit.
pub fn insert_messages(
    tx: &Transaction<'_>,
    thread_id: &str,
    messages: &[Message],
) -> Result<Vec<i64>, HistoryError> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO chat_messages (
            message_id, thread_id, role, content, tool_calls_json, artifact,
            name, tool_call_id, parent_message_id, audio_key
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;

    let mut seqs = Vec::with_capacity(messages.len());
    for msg in messages {
        let tool_calls_json = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&msg.tool_calls)?)
        };
        stmt.execute(params![
            msg.id,
            thread_id,
            msg.role.as_str(),
            msg.content,
            tool_calls_json,
            msg.artifact,
            msg.name,
            msg.tool_call_id,
            msg.parent_id,
            msg.audio_key,
        ])?;
        seqs.push(tx.last_insert_rowid());
    }
    Ok(seqs)
}

/// Validates and writes a completed turn atomically.
///
/// Either every message of the batch becomes visible or none does.
pub fn commit_turn(
    conn: &mut Connection,
    thread_id: &str,
    messages: &[Message],
) -> Result<Vec<i64>, HistoryError> {
    validate_turn(messages)?;

    let tx = conn.transaction()?;
    let seqs = insert_messages(&tx, thread_id, messages)?;
    tx.commit()?;

    tracing::debug!(thread_id, count = seqs.len(), "turn committed");
    Ok(seqs)
}

/// Returns the newest `limit` non-deleted messages of `thread_id`, oldest
/// first.
pub fn window(conn: &Connection, thread_id: &str, limit: u32) -> Result<Vec<Message>, HistoryError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages
         WHERE thread_id = ?1 AND deleted = 0
         ORDER BY seq DESC
         LIMIT ?2"
    ))?;

    let rows = stmt.query_map(params![thread_id, limit], map_row_to_message)?;
    let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
    messages.reverse();
    Ok(messages)
}

/// Walks parent references from `anchor_id` back to the root.
///
/// The result is ordered root first and ends with the anchor. Deleted
/// messages are walked through but left out. The walk stops at a missing
/// parent, a repeated message or after [`MAX_CHAIN_DEPTH`] steps.
///
/// # Errors
///
/// Returns `HistoryError::NotFound` if the anchor is not part of `thread_id`.
pub fn chain(
    conn: &Connection,
    thread_id: &str,
    anchor_id: &str,
) -> Result<Vec<Message>, HistoryError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages
         WHERE message_id = ?1 AND thread_id = ?2"
    ))?;

    let mut lineage = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(anchor_id.to_string());

    while let Some(id) = current.take() {
        if visited.len() >= MAX_CHAIN_DEPTH {
            tracing::warn!(thread_id, anchor_id, "chain depth limit reached");
            break;
        }
        if !visited.insert(id.clone()) {
            tracing::warn!(thread_id, message_id = %id, "cycle in parent references");
            break;
        }

        let Some(msg) = stmt
            .query_row(params![id, thread_id], map_row_to_message)
            .optional()?
        else {
            if lineage.is_empty() && visited.len() == 1 {
                return Err(HistoryError::NotFound(anchor_id.to_string()));
            }
            tracing::warn!(thread_id, message_id = %id, "dangling parent reference");
            break;
        };

        current = msg.parent_id.clone();
        if !msg.deleted {
            lineage.push(msg);
        }
    }

    lineage.reverse();
    Ok(lineage)
}

/// Fetches a single message by id, deleted or not.
pub fn get_message(conn: &Connection, message_id: &str) -> Result<Option<Message>, HistoryError> {
    let msg = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE message_id = ?1"),
            [message_id],
            map_row_to_message,
        )
        .optional()?;
    Ok(msg)
}

/// Returns the ids of `message_id` and every later non-deleted message of
/// `thread_id`, in arrival order.
///
/// Returns an empty list if the message is unknown or already deleted.
pub fn tail_ids_from(
    conn: &Connection,
    thread_id: &str,
    message_id: &str,
) -> Result<Vec<String>, HistoryError> {
    let start: Option<i64> = conn
        .query_row(
            "SELECT seq FROM chat_messages
             WHERE message_id = ?1 AND thread_id = ?2 AND deleted = 0",
            params![message_id, thread_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(start) = start else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare_cached(
        "SELECT message_id FROM chat_messages
         WHERE thread_id = ?1 AND deleted = 0 AND seq >= ?2
         ORDER BY seq ASC",
    )?;
    let ids = stmt
        .query_map(params![thread_id, start], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Marks the given messages as deleted. Returns the number of rows changed.
pub fn logical_delete(conn: &Connection, message_ids: &[String]) -> Result<usize, HistoryError> {
    if message_ids.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["?"; message_ids.len()].join(", ");
    let changed = conn.execute(
        &format!(
            "UPDATE chat_messages
             SET deleted = 1, updated_at = datetime('now')
             WHERE deleted = 0 AND message_id IN ({placeholders})"
        ),
        params_from_iter(message_ids.iter()),
    )?;

    tracing::debug!(requested = message_ids.len(), changed, "messages deleted");
    Ok(changed)
}

/// Drops tool results at the head of a context window whose originating
/// tool call fell outside the window.
///
/// Chat models reject a conversation that opens with a tool result.
pub fn trim_orphan_tool_results(messages: Vec<Message>) -> Vec<Message> {
    let skip = messages
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count();
    if skip == 0 {
        return messages;
    }
    messages.into_iter().skip(skip).collect()
}

fn map_row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let role_text: String = row.get(3)?;
    let role = role_text
        .parse::<Role>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    let tool_calls_json: Option<String> = row.get(5)?;
    let tool_calls = match tool_calls_json.as_deref() {
        None | Some("") | Some("null") => Vec::new(),
        Some(raw) => serde_json::from_str::<Vec<ToolCall>>(raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
    };

    Ok(Message {
        seq: Some(row.get(0)?),
        id: row.get(1)?,
        thread_id: row.get(2)?,
        role,
        content: row.get(4)?,
        tool_calls,
        artifact: row.get(6)?,
        name: row.get(7)?,
        tool_call_id: row.get(8)?,
        parent_id: row.get(9)?,
        audio_key: row.get(10)?,
        deleted: row.get::<_, i64>(11)? != 0,
        created_at: Some(row.get(12)?),
        updated_at: Some(row.get(13)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        parlance_db::run_migrations(&conn).expect("migrations");
        conn
    }

    /// Commits `human -> ai` pairs, linking each message to the previous one.
    fn seed_pairs(conn: &mut Connection, thread: &str, pairs: usize) -> Vec<String> {
        let mut ids = Vec::new();
        let mut parent: Option<String> = None;
        for i in 0..pairs {
            let human = Message::human(format!("h{i}"), format!("question {i}"))
                .with_parent(parent.clone());
            let ai = Message::ai(format!("a{i}"), format!("answer {i}"))
                .with_parent(Some(human.id.clone()));
            parent = Some(ai.id.clone());
            ids.push(human.id.clone());
            ids.push(ai.id.clone());
            commit_turn(conn, thread, &[human, ai]).expect("commit");
        }
        ids
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn window_keeps_newest_in_arrival_order() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 3);

        let recent = window(&conn, "t1", 4).expect("window");
        assert_eq!(ids(&recent), ["h1", "a1", "h2", "a2"]);

        let all = window(&conn, "t1", 100).expect("window");
        assert_eq!(all.len(), 6);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn window_is_scoped_to_thread_and_skips_deleted() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 2);
        seed_pairs_with_prefix(&mut conn, "t2", "x");

        logical_delete(&conn, &["a1".to_string()]).expect("delete");

        let t1 = window(&conn, "t1", 10).expect("window");
        assert_eq!(ids(&t1), ["h0", "a0", "h1"]);
    }

    fn seed_pairs_with_prefix(conn: &mut Connection, thread: &str, prefix: &str) {
        let human = Message::human(format!("{prefix}-h"), "hi");
        let ai = Message::ai(format!("{prefix}-a"), "hello");
        commit_turn(conn, thread, &[human, ai]).expect("commit");
    }

    #[test]
    fn chain_runs_root_to_anchor() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 3);

        let lineage = chain(&conn, "t1", "a1").expect("chain");
        assert_eq!(ids(&lineage), ["h0", "a0", "h1", "a1"]);
    }

    #[test]
    fn chain_walks_through_deleted_messages() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 3);
        logical_delete(&conn, &["a0".to_string(), "h1".to_string()]).expect("delete");

        let lineage = chain(&conn, "t1", "a2").expect("chain");
        assert_eq!(ids(&lineage), ["h0", "a1", "h2", "a2"]);
    }

    #[test]
    fn chain_rejects_unknown_anchor() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 1);

        assert!(matches!(
            chain(&conn, "t1", "missing"),
            Err(HistoryError::NotFound(id)) if id == "missing"
        ));
        assert!(matches!(
            chain(&conn, "other-thread", "a0"),
            Err(HistoryError::NotFound(_))
        ));
    }

    #[test]
    fn chain_stops_on_cycles() {
        let mut conn = setup();
        let human = Message::human("h0", "hi").with_parent(Some("a0".to_string()));
        let ai = Message::ai("a0", "hello").with_parent(Some("h0".to_string()));
        commit_turn(&mut conn, "t1", &[human, ai]).expect("commit");

        let lineage = chain(&conn, "t1", "a0").expect("chain");
        assert_eq!(ids(&lineage), ["h0", "a0"]);
    }

    #[test]
    fn rejected_turn_writes_nothing() {
        let mut conn = setup();
        let human = Message::human("h0", "hi");
        let orphan = Message::tool("t0", "call-unknown", "search", "{}");

        let err = commit_turn(&mut conn, "t1", &[human, orphan]).unwrap_err();
        assert!(matches!(err, HistoryError::InvalidTurn(_)));
        assert!(window(&conn, "t1", 10).expect("window").is_empty());
    }

    #[test]
    fn failed_insert_rolls_back_the_whole_batch() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 1);

        // Second message reuses an existing id and violates the unique key.
        let human = Message::human("h-new", "again");
        let dup = Message::ai("a0", "duplicate");
        let err = commit_turn(&mut conn, "t1", &[human, dup]).unwrap_err();
        assert!(matches!(err, HistoryError::Database(_)));

        assert!(get_message(&conn, "h-new").expect("lookup").is_none());
        assert_eq!(window(&conn, "t1", 10).expect("window").len(), 2);
    }

    #[test]
    fn tool_calls_survive_storage() {
        let mut conn = setup();
        let human = Message::human("h0", "what's the weather");
        let ai = Message::ai("a0", "").with_tool_calls(vec![ToolCall {
            id: "call-1".to_string(),
            name: "weather".to_string(),
            arguments: json!({"city": "Hangzhou"}),
        }]);
        let tool = Message::tool("t0", "call-1", "weather", "sunny");
        let answer = Message::ai("a1", "It's sunny.");
        commit_turn(&mut conn, "t1", &[human, ai, tool, answer]).expect("commit");

        let stored = get_message(&conn, "a0").expect("lookup").expect("present");
        assert_eq!(stored.tool_calls.len(), 1);
        assert_eq!(stored.tool_calls[0].arguments["city"], "Hangzhou");

        let tool = get_message(&conn, "t0").expect("lookup").expect("present");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
        assert_eq!(tool.name.as_deref(), Some("weather"));
    }

    #[test]
    fn tail_ids_cover_message_and_everything_after() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 3);

        let tail = tail_ids_from(&conn, "t1", "a1").expect("tail");
        assert_eq!(tail, ["a1", "h2", "a2"]);

        assert!(tail_ids_from(&conn, "t1", "nope").expect("tail").is_empty());
        assert!(tail_ids_from(&conn, "t2", "a1").expect("tail").is_empty());
    }

    #[test]
    fn logical_delete_counts_only_live_rows() {
        let mut conn = setup();
        seed_pairs(&mut conn, "t1", 2);

        let ids = vec!["h1".to_string(), "a1".to_string()];
        assert_eq!(logical_delete(&conn, &ids).expect("delete"), 2);
        assert_eq!(logical_delete(&conn, &ids).expect("delete again"), 0);
        assert_eq!(logical_delete(&conn, &[]).expect("empty"), 0);

        let stored = get_message(&conn, "h1").expect("lookup").expect("kept");
        assert!(stored.deleted);
    }

    #[test]
    fn leading_tool_results_are_trimmed() {
        let msgs = vec![
            Message::tool("t0", "call-0", "search", "result"),
            Message::ai("a0", "done"),
            Message::human("h1", "thanks"),
        ];
        let trimmed = trim_orphan_tool_results(msgs);
        assert_eq!(ids(&trimmed), ["a0", "h1"]);
    }
}
