//! SQLite-backed [`LedgerStore`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior};
use tracing::{debug, instrument};

use convo_core::{
    ConversationId, ElicitationId, MessageId, MessageStatus, MessageType, PayloadId, PayloadKind,
    StorageKind, TurnId, TurnStatus,
};

use crate::database::Database;
use crate::error::{map_constraint, Result, StoreError};
use crate::ledger::LedgerStore;
use crate::records::{
    activate_turn, call_turn, check_duplicate, check_transition, format_ts, merge_model_call,
    merge_tool_call, now_ts, CallPayload, Conversation, ConversationFilter, Message, ModelCall,
    ModelCallPayloads, ModelCallRecord, NewConversation, NewMessage, PayloadBody,
    RecordedModelCall, StartTurn, TokenCounts, ToolCall, ToolCallRecord, Turn,
};
use crate::row_helpers::{get, get_bool, get_enum, get_enum_opt, get_opt, parse_json};

const CONVERSATION_COLUMNS: &str = "id, summary, visibility, archived, message_count, turn_count,
     last_message_at, retention_ttl_secs, expires_at, created_at, updated_at, deleted_at";

const TURN_COLUMNS: &str = "id, conversation_id, turn_index, status, status_reason,
     started_by_message_id, retry_of, model_override, agent_override, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, turn_id, sequence, role, type, status,
     status_reason, interim, content, elicitation_id, parent_message_id, superseded_by,
     payload_id, created_at";

const TOOL_CALL_COLUMNS: &str = "message_id, turn_id, op_id, attempt, tool_name, tool_kind,
     status, request_payload_id, request_hash, response_payload_id, response_hash, retriable,
     error, latency_ms, cost, created_at, updated_at, completed_at";

const MODEL_CALL_COLUMNS: &str = "message_id, turn_id, provider, model, model_kind, status,
     prompt_tokens, completion_tokens, total_tokens, cached_tokens, prompt_audio_tokens,
     completion_audio_tokens, reasoning_tokens, cache_hit, cache_key, cost, safety_blocked,
     safety_reasons, trace_id, span_id, request_payload_id, response_payload_id,
     provider_request_payload_id, provider_response_payload_id, stream_payload_id, error,
     latency_ms, created_at, updated_at, completed_at";

const PAYLOAD_COLUMNS: &str = "id, tenant_id, kind, storage, inline_body, object_uri, digest,
     compression, mime_type, redacted, redaction_policy, size_bytes, preview, created_at";

/// Per-turn append lock for sequence allocation. Entries live only while an
/// append holds or waits on them.
struct TurnLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl TurnLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn acquire(&mut self, turn_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(turn_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the entry when the map and `lock` are its only holders.
    fn release(&mut self, turn_id: &str, lock: Arc<Mutex<()>>) {
        let idle = self
            .locks
            .get(turn_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            let _ = self.locks.remove(turn_id);
        }
    }

    fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Durable ledger on a single SQLite database.
///
/// Sequence allocation holds the turn's lock and runs `max(sequence) + 1`
/// inside an immediate transaction, so a second process sharing the file
/// is serialized by SQLite and caught by the `(turn_id, sequence)` index.
pub struct SqliteLedger {
    db: Database,
    turn_locks: Mutex<TurnLocks>,
}

impl SqliteLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            turn_locks: Mutex::new(TurnLocks::new()),
        }
    }

    /// Shared database handle.
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Turns with an append in progress.
    pub fn active_turn_locks(&self) -> usize {
        self.turn_locks.lock().len()
    }

    /// Sequence allocation and insert; the caller holds the turn's lock.
    fn append_locked(&self, turn_id: &TurnId, msg: NewMessage) -> Result<Message> {
        self.db.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let turn = require_turn(&tx, turn_id)?;
            let id = msg.id.clone().unwrap_or_default();
            if let Some(existing) = check_duplicate(fetch_message(&tx, &id)?, &turn.conversation_id)?
            {
                debug!(message_id = %id, "duplicate message, returning stored row");
                return Ok(existing);
            }

            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE turn_id = ?1",
                [turn_id.as_str()],
                |row| row.get(0),
            )?;
            let now = now_ts();
            let row = msg.into_row(
                id,
                turn.conversation_id.clone(),
                Some(turn_id.clone()),
                Some(sequence),
                now.clone(),
            );
            insert_message(&tx, &row)?;
            let _ = tx.execute(
                "UPDATE conversations
                 SET message_count = message_count + 1, last_message_at = ?1, updated_at = ?1
                 WHERE id = ?2",
                params![now, turn.conversation_id.as_str()],
            )?;
            tx.commit()?;
            debug!(message_id = %row.id, sequence, "message appended");
            Ok(row)
        })
    }
}

impl LedgerStore for SqliteLedger {
    // ── Conversations ───────────────────────────────────────────────

    #[instrument(skip(self, opts), fields(conversation_id = %id))]
    fn create_conversation(
        &self,
        id: &ConversationId,
        opts: NewConversation,
    ) -> Result<Conversation> {
        let row = opts.into_row(id, Utc::now());
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO conversations
                   (id, summary, visibility, archived, message_count, turn_count,
                    retention_ttl_secs, expires_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, 0, 0, ?4, ?5, ?6, ?6)",
                params![
                    id.as_str(),
                    row.summary,
                    row.visibility.as_str(),
                    row.retention_ttl_secs,
                    row.expires_at,
                    row.created_at,
                ],
            )?;
            if inserted == 1 {
                debug!("conversation created");
            }
            require_conversation(conn, id)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.db.with_conn(|conn| require_conversation(conn, id))
    }

    #[instrument(skip(self, filter))]
    fn list_conversations(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {CONVERSATION_COLUMNS} FROM conversations
                     WHERE (?1 OR archived = 0) AND (?2 OR deleted_at IS NULL)
                     ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC
                     LIMIT ?3 OFFSET ?4"
                ),
                params![
                    filter.include_archived,
                    filter.include_deleted,
                    filter.limit.map_or(-1, i64::from),
                    filter.offset.unwrap_or(0),
                ],
                row_to_conversation,
            )
        })
    }

    #[instrument(skip(self, summary), fields(conversation_id = %id))]
    fn set_conversation_summary(&self, id: &ConversationId, summary: Option<&str>) -> Result<()> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conversations SET summary = ?1, updated_at = ?2 WHERE id = ?3",
                params![summary, now_ts(), id.as_str()],
            )?;
            expect_one(n, "conversation", id)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn archive_conversation(&self, id: &ConversationId, archived: bool) -> Result<()> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE conversations SET archived = ?1, updated_at = ?2 WHERE id = ?3",
                params![archived, now_ts(), id.as_str()],
            )?;
            expect_one(n, "conversation", id)
        })
    }

    #[instrument(skip(self), fields(conversation_id = %id))]
    fn soft_delete_conversation(&self, id: &ConversationId) -> Result<()> {
        self.db.with_conn(|conn| {
            let now = now_ts();
            let n = conn.execute(
                "UPDATE conversations
                 SET deleted_at = COALESCE(deleted_at, ?1), archived = 1, updated_at = ?1
                 WHERE id = ?2",
                params![now, id.as_str()],
            )?;
            expect_one(n, "conversation", id)
        })
    }

    #[instrument(skip(self))]
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(now);
        let purged = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM conversations WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                [&cutoff],
            )?)
        })?;
        if purged > 0 {
            debug!(purged, "expired conversations purged");
        }
        Ok(purged)
    }

    #[instrument(skip(self, opts), fields(conversation_id = %conversation_id))]
    fn start_turn(&self, conversation_id: &ConversationId, opts: StartTurn) -> Result<Turn> {
        self.db.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let conversation = require_conversation(&tx, conversation_id)?;
            if conversation.deleted_at.is_some() {
                return Err(StoreError::InvalidState(format!(
                    "conversation {conversation_id} is deleted"
                )));
            }
            if let Some(retry_of) = &opts.retry_of {
                let prior = require_turn(&tx, retry_of)?;
                if &prior.conversation_id != conversation_id {
                    return Err(StoreError::not_found("turn", retry_of));
                }
            }

            let id = opts.id.unwrap_or_default();
            let index: i64 = tx.query_row(
                "SELECT COALESCE(MAX(turn_index), 0) + 1 FROM turns WHERE conversation_id = ?1",
                [conversation_id.as_str()],
                |row| row.get(0),
            )?;
            let now = now_ts();
            let _ = tx
                .execute(
                    "INSERT INTO turns
                       (id, conversation_id, turn_index, status, started_by_message_id, retry_of,
                        model_override, agent_override, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        id.as_str(),
                        conversation_id.as_str(),
                        index,
                        TurnStatus::Pending.as_str(),
                        opts.started_by_message_id.as_ref().map(MessageId::as_str),
                        opts.retry_of.as_ref().map(TurnId::as_str),
                        opts.model_override,
                        opts.agent_override,
                        now,
                    ],
                )
                .map_err(|e| map_constraint(e, || format!("turn {id} already exists")))?;
            let mut turn = require_turn(&tx, &id)?;
            activate_turn(&mut turn)?;
            let _ = tx.execute(
                "UPDATE turns SET status = ?1 WHERE id = ?2",
                params![turn.status.as_str(), id.as_str()],
            )?;
            let _ = tx.execute(
                "UPDATE conversations SET turn_count = turn_count + 1, updated_at = ?1
                 WHERE id = ?2",
                params![now, conversation_id.as_str()],
            )?;
            let turn = require_turn(&tx, &id)?;
            tx.commit()?;
            debug!(turn_id = %turn.id, index, "turn started");
            Ok(turn)
        })
    }

    #[instrument(skip(self), fields(turn_id = %id))]
    fn get_turn(&self, id: &TurnId) -> Result<Turn> {
        self.db.with_conn(|conn| require_turn(conn, id))
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    fn list_turns(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {TURN_COLUMNS} FROM turns WHERE conversation_id = ?1
                     ORDER BY turn_index ASC"
                ),
                [conversation_id.as_str()],
                row_to_turn,
            )
        })
    }

    #[instrument(skip(self, reason), fields(turn_id = %id, to = %to))]
    fn transition_turn(&self, id: &TurnId, to: TurnStatus, reason: Option<&str>) -> Result<Turn> {
        self.db.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let turn = require_turn(&tx, id)?;
            check_transition(&turn, to)?;
            let _ = tx.execute(
                "UPDATE turns SET status = ?1, status_reason = COALESCE(?2, status_reason),
                                  updated_at = ?3
                 WHERE id = ?4",
                params![to.as_str(), reason, now_ts(), id.as_str()],
            )?;
            let turn = require_turn(&tx, id)?;
            tx.commit()?;
            debug!("turn transitioned");
            Ok(turn)
        })
    }

    #[instrument(skip(self), fields(turn_id = %id))]
    fn turn_age(&self, id: &TurnId) -> Result<u32> {
        self.db.with_conn(|conn| {
            let turn = require_turn(conn, id)?;
            let later: u32 = conn.query_row(
                "SELECT COUNT(*) FROM turns WHERE conversation_id = ?1 AND turn_index > ?2",
                params![turn.conversation_id.as_str(), turn.index],
                |row| row.get(0),
            )?;
            Ok(later)
        })
    }

    #[instrument(skip(self), fields(turn_id = %id))]
    fn delete_turn(&self, id: &TurnId) -> Result<()> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM turns WHERE id = ?1", [id.as_str()])?;
            expect_one(n, "turn", id)
        })?;
        debug!("turn deleted");
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    #[instrument(skip(self, msg), fields(turn_id = %turn_id, role = %msg.role))]
    fn append_message(&self, turn_id: &TurnId, msg: NewMessage) -> Result<Message> {
        let lock = self.turn_locks.lock().acquire(turn_id.as_str());
        let appended = {
            let _guard = lock.lock();
            self.append_locked(turn_id, msg)
        };
        self.turn_locks.lock().release(turn_id.as_str(), lock);
        appended
    }

    #[instrument(skip(self, msg), fields(parent = %parent))]
    fn append_derived_message(&self, parent: &MessageId, msg: NewMessage) -> Result<Message> {
        self.db.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let parent_row = require_message(&tx, parent)?;
            let id = msg.id.clone().unwrap_or_default();
            if let Some(existing) =
                check_duplicate(fetch_message(&tx, &id)?, &parent_row.conversation_id)?
            {
                return Ok(existing);
            }
            let mut row = msg.into_row(id, parent_row.conversation_id, None, None, now_ts());
            row.parent_message_id = Some(parent.clone());
            insert_message(&tx, &row)?;
            tx.commit()?;
            debug!(message_id = %row.id, "derived message appended");
            Ok(row)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.db.with_conn(|conn| require_message(conn, id))
    }

    #[instrument(skip(self), fields(turn_id = %turn_id))]
    fn list_turn_messages(&self, turn_id: &TurnId) -> Result<Vec<Message>> {
        self.db.with_conn(|conn| {
            let _ = require_turn(conn, turn_id)?;
            query_all(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE turn_id = ?1
                     ORDER BY sequence ASC"
                ),
                [turn_id.as_str()],
                row_to_message,
            )
        })
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        self.db.with_conn(|conn| {
            let _ = require_conversation(conn, conversation_id)?;
            query_all(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
                     ORDER BY rowid ASC"
                ),
                [conversation_id.as_str()],
                row_to_message,
            )
        })
    }

    #[instrument(skip(self, reason), fields(message_id = %id))]
    fn set_message_status(
        &self,
        id: &MessageId,
        status: Option<MessageStatus>,
        reason: Option<&str>,
    ) -> Result<Message> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET status = ?1, status_reason = ?2 WHERE id = ?3",
                params![status.map(MessageStatus::as_str), reason, id.as_str()],
            )?;
            expect_one(n, "message", id)?;
            require_message(conn, id)
        })
    }

    #[instrument(skip(self, content), fields(message_id = %id))]
    fn finalize_message(
        &self,
        id: &MessageId,
        content: Option<&str>,
        payload_id: Option<&PayloadId>,
    ) -> Result<Message> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages
                 SET interim = 0, content = COALESCE(?1, content),
                     payload_id = COALESCE(?2, payload_id)
                 WHERE id = ?3",
                params![content, payload_id.map(PayloadId::as_str), id.as_str()],
            )?;
            expect_one(n, "message", id)?;
            require_message(conn, id)
        })
    }

    #[instrument(skip(self), fields(message_id = %id, elicitation_id = %elicitation_id))]
    fn link_elicitation(&self, id: &MessageId, elicitation_id: &ElicitationId) -> Result<()> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET elicitation_id = ?1 WHERE id = ?2",
                params![elicitation_id.as_str(), id.as_str()],
            )?;
            expect_one(n, "message", id)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    fn set_superseded_by(&self, id: &MessageId, superseded_by: Option<&MessageId>) -> Result<()> {
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET superseded_by = ?1 WHERE id = ?2",
                params![superseded_by.map(MessageId::as_str), id.as_str()],
            )?;
            expect_one(n, "message", id)
        })
    }

    #[instrument(skip(self), fields(message_id = %id))]
    fn delete_message(&self, id: &MessageId) -> Result<()> {
        self.db.with_conn(|conn| {
            let message = require_message(conn, id)?;
            if message.sequence.is_some() {
                return Err(StoreError::InvalidState(format!(
                    "message {id} is part of a turn log and cannot be deleted"
                )));
            }
            let _ = conn.execute("DELETE FROM messages WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }

    // ── Calls ───────────────────────────────────────────────────────

    #[instrument(skip(self, rec), fields(message_id = %rec.message_id, op_id = %rec.op_id, status = %rec.status))]
    fn record_tool_call(&self, rec: ToolCallRecord) -> Result<ToolCall> {
        self.db.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let message = require_message(&tx, &rec.message_id)?;
            if message.message_type != MessageType::ToolOp {
                return Err(StoreError::InvalidState(format!(
                    "message {} is {}, not tool_op",
                    message.id, message.message_type
                )));
            }
            let turn_id = call_turn(&message)?;
            let existing = fetch_tool_call(&tx, &rec.message_id)?;
            let attempt = match (&existing, rec.attempt) {
                (Some(row), _) => row.attempt,
                (None, Some(attempt)) => attempt,
                (None, None) => next_attempt_in(&tx, &turn_id, &rec.op_id)?,
            };
            let row = merge_tool_call(existing, rec, turn_id, attempt, &now_ts())?;
            require_payloads(
                &tx,
                [row.request_payload_id.as_ref(), row.response_payload_id.as_ref()],
            )?;
            upsert_tool_call(&tx, &row)?;
            tx.commit()?;
            debug!(attempt = row.attempt, "tool call recorded");
            Ok(row)
        })
    }

    #[instrument(skip(self), fields(message_id = %message_id))]
    fn get_tool_call(&self, message_id: &MessageId) -> Result<ToolCall> {
        self.db.with_conn(|conn| {
            fetch_tool_call(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("tool call", message_id))
        })
    }

    #[instrument(skip(self), fields(turn_id = %turn_id))]
    fn list_tool_calls(&self, turn_id: &TurnId) -> Result<Vec<ToolCall>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE turn_id = ?1
                     ORDER BY op_id ASC, attempt ASC"
                ),
                [turn_id.as_str()],
                row_to_tool_call,
            )
        })
    }

    #[instrument(skip(self), fields(turn_id = %turn_id))]
    fn next_attempt(&self, turn_id: &TurnId, op_id: &str) -> Result<u32> {
        self.db.with_conn(|conn| next_attempt_in(conn, turn_id, op_id))
    }

    #[instrument(skip(self, rec), fields(message_id = %rec.message_id, model = %rec.model, status = %rec.status))]
    fn record_model_call(&self, rec: ModelCallRecord) -> Result<RecordedModelCall> {
        self.db.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let message = require_message(&tx, &rec.message_id)?;
            let turn_id = call_turn(&message)?;
            let existing = fetch_model_call(&tx, &rec.message_id)?;
            let previous_status = existing.as_ref().map(|c| c.status);
            let row = merge_model_call(existing, rec, turn_id, &now_ts())?;
            require_payloads(&tx, row.payloads.iter())?;
            upsert_model_call(&tx, &row)?;
            tx.commit()?;
            debug!("model call recorded");
            Ok(RecordedModelCall {
                call: row,
                previous_status,
            })
        })
    }

    #[instrument(skip(self), fields(message_id = %message_id))]
    fn get_model_call(&self, message_id: &MessageId) -> Result<ModelCall> {
        self.db.with_conn(|conn| {
            fetch_model_call(conn, message_id)?
                .ok_or_else(|| StoreError::not_found("model call", message_id))
        })
    }

    #[instrument(skip(self), fields(turn_id = %turn_id))]
    fn list_model_calls(&self, turn_id: &TurnId) -> Result<Vec<ModelCall>> {
        self.db.with_conn(|conn| {
            query_all(
                conn,
                &format!(
                    "SELECT {MODEL_CALL_COLUMNS} FROM model_calls WHERE turn_id = ?1
                     ORDER BY created_at ASC, message_id ASC"
                ),
                [turn_id.as_str()],
                row_to_model_call,
            )
        })
    }

    // ── Payloads ────────────────────────────────────────────────────

    #[instrument(skip(self, payload), fields(kind = %payload.kind, digest = %payload.digest))]
    fn insert_payload(&self, payload: CallPayload) -> Result<CallPayload> {
        self.db.with_conn(|conn| {
            let (inline_body, object_uri) = match &payload.body {
                PayloadBody::Inline { bytes } => (Some(bytes.as_slice()), None),
                PayloadBody::Object { uri } => (None, Some(uri.as_str())),
            };
            let inserted = conn.execute(
                "INSERT INTO call_payloads
                   (id, tenant_id, kind, storage, inline_body, object_uri, digest, compression,
                    mime_type, redacted, redaction_policy, size_bytes, preview, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT (tenant_id, kind, digest) DO NOTHING",
                params![
                    payload.id.as_str(),
                    payload.tenant_id,
                    payload.kind.as_str(),
                    payload.storage().as_str(),
                    inline_body,
                    object_uri,
                    payload.digest,
                    payload.compression,
                    payload.mime_type,
                    payload.redacted,
                    payload.redaction_policy,
                    payload.size_bytes,
                    payload.preview,
                    payload.created_at,
                ],
            )?;
            if inserted == 0 {
                debug!("payload already stored, reusing");
            }
            fetch_payload_by_digest(conn, &payload.tenant_id, payload.kind, &payload.digest)?
                .ok_or_else(|| StoreError::not_found("payload", &payload.digest))
        })
    }

    #[instrument(skip(self), fields(payload_id = %id))]
    fn get_payload(&self, id: &PayloadId) -> Result<CallPayload> {
        self.db.with_conn(|conn| {
            query_one(
                conn,
                &format!("SELECT {PAYLOAD_COLUMNS} FROM call_payloads WHERE id = ?1"),
                [id.as_str()],
                row_to_payload,
            )?
            .ok_or_else(|| StoreError::not_found("payload", id))
        })
    }

    #[instrument(skip(self), fields(kind = %kind))]
    fn find_payload(
        &self,
        tenant: &str,
        kind: PayloadKind,
        digest: &str,
    ) -> Result<Option<CallPayload>> {
        self.db
            .with_conn(|conn| fetch_payload_by_digest(conn, tenant, kind, digest))
    }

    #[instrument(skip(self), fields(payload_id = %id))]
    fn read_inline_range(&self, id: &PayloadId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let start = i64::try_from(offset).unwrap_or(i64::MAX).saturating_add(1);
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let row: Option<(String, Option<Vec<u8>>)> = conn
                .query_row(
                    "SELECT storage, substr(inline_body, ?2, ?3) FROM call_payloads WHERE id = ?1",
                    params![id.as_str(), start, len],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                None => Err(StoreError::not_found("payload", id)),
                Some((storage, bytes)) if storage == StorageKind::Inline.as_str() => {
                    Ok(bytes.unwrap_or_default())
                }
                Some(_) => Err(StoreError::InvalidState(format!(
                    "payload {id} is stored as an object"
                ))),
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Query helpers
// ─────────────────────────────────────────────────────────────────────────────

fn query_one<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> Result<T>,
) -> Result<Option<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params)?;
    rows.next()?.map(map).transpose()
}

fn query_all<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(map(row)?);
    }
    Ok(out)
}

fn expect_one(changed: usize, entity: &'static str, id: impl ToString) -> Result<()> {
    if changed == 0 {
        Err(StoreError::not_found(entity, id))
    } else {
        Ok(())
    }
}

fn require_conversation(conn: &Connection, id: &ConversationId) -> Result<Conversation> {
    query_one(
        conn,
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
        [id.as_str()],
        row_to_conversation,
    )?
    .ok_or_else(|| StoreError::not_found("conversation", id))
}

fn require_turn(conn: &Connection, id: &TurnId) -> Result<Turn> {
    query_one(
        conn,
        &format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?1"),
        [id.as_str()],
        row_to_turn,
    )?
    .ok_or_else(|| StoreError::not_found("turn", id))
}

fn fetch_message(conn: &Connection, id: &MessageId) -> Result<Option<Message>> {
    query_one(
        conn,
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        [id.as_str()],
        row_to_message,
    )
}

fn require_message(conn: &Connection, id: &MessageId) -> Result<Message> {
    fetch_message(conn, id)?.ok_or_else(|| StoreError::not_found("message", id))
}

fn fetch_tool_call(conn: &Connection, message_id: &MessageId) -> Result<Option<ToolCall>> {
    query_one(
        conn,
        &format!("SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE message_id = ?1"),
        [message_id.as_str()],
        row_to_tool_call,
    )
}

fn fetch_model_call(conn: &Connection, message_id: &MessageId) -> Result<Option<ModelCall>> {
    query_one(
        conn,
        &format!("SELECT {MODEL_CALL_COLUMNS} FROM model_calls WHERE message_id = ?1"),
        [message_id.as_str()],
        row_to_model_call,
    )
}

fn fetch_payload_by_digest(
    conn: &Connection,
    tenant: &str,
    kind: PayloadKind,
    digest: &str,
) -> Result<Option<CallPayload>> {
    query_one(
        conn,
        &format!(
            "SELECT {PAYLOAD_COLUMNS} FROM call_payloads
             WHERE tenant_id = ?1 AND kind = ?2 AND digest = ?3"
        ),
        params![tenant, kind.as_str(), digest],
        row_to_payload,
    )
}

/// Fail with `NotFound` for a call row referencing an unknown payload.
fn require_payloads<'a>(
    conn: &Connection,
    ids: impl IntoIterator<Item = Option<&'a PayloadId>>,
) -> Result<()> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM call_payloads WHERE id = ?1")?;
    for id in ids.into_iter().flatten() {
        if !stmt.exists([id.as_str()])? {
            return Err(StoreError::not_found("payload", id));
        }
    }
    Ok(())
}

fn next_attempt_in(conn: &Connection, turn_id: &TurnId, op_id: &str) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(attempt), 0) + 1 FROM tool_calls WHERE turn_id = ?1 AND op_id = ?2",
        params![turn_id.as_str(), op_id],
        |row| row.get(0),
    )?)
}

fn insert_message(conn: &Connection, m: &Message) -> Result<()> {
    let _ = conn
        .execute(
            &format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                m.id.as_str(),
                m.conversation_id.as_str(),
                m.turn_id.as_ref().map(TurnId::as_str),
                m.sequence,
                m.role.as_str(),
                m.message_type.as_str(),
                m.status.map(MessageStatus::as_str),
                m.status_reason,
                m.interim,
                m.content,
                m.elicitation_id.as_ref().map(ElicitationId::as_str),
                m.parent_message_id.as_ref().map(MessageId::as_str),
                m.superseded_by.as_ref().map(MessageId::as_str),
                m.payload_id.as_ref().map(PayloadId::as_str),
                m.created_at,
            ],
        )
        .map_err(|e| map_constraint(e, || format!("message {} conflicts", m.id)))?;
    Ok(())
}

fn upsert_tool_call(conn: &Connection, c: &ToolCall) -> Result<()> {
    let _ = conn
        .execute(
            &format!(
                "INSERT INTO tool_calls ({TOOL_CALL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18)
                 ON CONFLICT (message_id) DO UPDATE SET
                   tool_kind = excluded.tool_kind,
                   status = excluded.status,
                   request_payload_id = excluded.request_payload_id,
                   request_hash = excluded.request_hash,
                   response_payload_id = excluded.response_payload_id,
                   response_hash = excluded.response_hash,
                   retriable = excluded.retriable,
                   error = excluded.error,
                   latency_ms = excluded.latency_ms,
                   cost = excluded.cost,
                   updated_at = excluded.updated_at,
                   completed_at = excluded.completed_at"
            ),
            params![
                c.message_id.as_str(),
                c.turn_id.as_str(),
                c.op_id,
                c.attempt,
                c.tool_name,
                c.tool_kind,
                c.status.as_str(),
                c.request_payload_id.as_ref().map(PayloadId::as_str),
                c.request_hash,
                c.response_payload_id.as_ref().map(PayloadId::as_str),
                c.response_hash,
                c.retriable,
                c.error,
                c.latency_ms,
                c.cost,
                c.created_at,
                c.updated_at,
                c.completed_at,
            ],
        )
        .map_err(|e| {
            map_constraint(e, || {
                format!(
                    "tool call ({}, attempt {}) already recorded in turn {}",
                    c.op_id, c.attempt, c.turn_id
                )
            })
        })?;
    Ok(())
}

fn upsert_model_call(conn: &Connection, c: &ModelCall) -> Result<()> {
    fn id(v: &Option<PayloadId>) -> Option<&str> {
        v.as_ref().map(PayloadId::as_str)
    }

    let reasons = serde_json::to_string(&c.safety_reasons)?;
    let p = &c.payloads;
    let _ = conn.execute(
        &format!(
            "INSERT INTO model_calls ({MODEL_CALL_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)
             ON CONFLICT (message_id) DO UPDATE SET
               provider = excluded.provider,
               model = excluded.model,
               model_kind = excluded.model_kind,
               status = excluded.status,
               prompt_tokens = excluded.prompt_tokens,
               completion_tokens = excluded.completion_tokens,
               total_tokens = excluded.total_tokens,
               cached_tokens = excluded.cached_tokens,
               prompt_audio_tokens = excluded.prompt_audio_tokens,
               completion_audio_tokens = excluded.completion_audio_tokens,
               reasoning_tokens = excluded.reasoning_tokens,
               cache_hit = excluded.cache_hit,
               cache_key = excluded.cache_key,
               cost = excluded.cost,
               safety_blocked = excluded.safety_blocked,
               safety_reasons = excluded.safety_reasons,
               trace_id = excluded.trace_id,
               span_id = excluded.span_id,
               request_payload_id = excluded.request_payload_id,
               response_payload_id = excluded.response_payload_id,
               provider_request_payload_id = excluded.provider_request_payload_id,
               provider_response_payload_id = excluded.provider_response_payload_id,
               stream_payload_id = excluded.stream_payload_id,
               error = excluded.error,
               latency_ms = excluded.latency_ms,
               updated_at = excluded.updated_at,
               completed_at = excluded.completed_at"
        ),
        params![
            c.message_id.as_str(),
            c.turn_id.as_str(),
            c.provider,
            c.model,
            c.model_kind.as_str(),
            c.status.as_str(),
            c.tokens.prompt,
            c.tokens.completion,
            c.tokens.total,
            c.tokens.cached,
            c.tokens.prompt_audio,
            c.tokens.completion_audio,
            c.tokens.reasoning,
            c.cache_hit,
            c.cache_key,
            c.cost,
            c.safety_blocked,
            reasons,
            c.trace_id,
            c.span_id,
            id(&p.request),
            id(&p.response),
            id(&p.provider_request),
            id(&p.provider_response),
            id(&p.stream),
            c.error,
            c.latency_ms,
            c.created_at,
            c.updated_at,
            c.completed_at,
        ],
    )?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

fn row_to_conversation(row: &Row<'_>) -> Result<Conversation> {
    const T: &str = "conversations";
    Ok(Conversation {
        id: get::<String>(row, "id", T)?.into(),
        summary: get_opt(row, "summary", T)?,
        visibility: get_enum(row, "visibility", T)?,
        archived: get_bool(row, "archived", T)?,
        message_count: get(row, "message_count", T)?,
        turn_count: get(row, "turn_count", T)?,
        last_message_at: get_opt(row, "last_message_at", T)?,
        retention_ttl_secs: get_opt(row, "retention_ttl_secs", T)?,
        expires_at: get_opt(row, "expires_at", T)?,
        created_at: get(row, "created_at", T)?,
        updated_at: get(row, "updated_at", T)?,
        deleted_at: get_opt(row, "deleted_at", T)?,
    })
}

fn row_to_turn(row: &Row<'_>) -> Result<Turn> {
    const T: &str = "turns";
    Ok(Turn {
        id: get::<String>(row, "id", T)?.into(),
        conversation_id: get::<String>(row, "conversation_id", T)?.into(),
        index: get(row, "turn_index", T)?,
        status: get_enum(row, "status", T)?,
        status_reason: get_opt(row, "status_reason", T)?,
        started_by_message_id: get_opt::<String>(row, "started_by_message_id", T)?
            .map(MessageId::from),
        retry_of: get_opt::<String>(row, "retry_of", T)?.map(TurnId::from),
        model_override: get_opt(row, "model_override", T)?,
        agent_override: get_opt(row, "agent_override", T)?,
        created_at: get(row, "created_at", T)?,
        updated_at: get(row, "updated_at", T)?,
    })
}

fn row_to_message(row: &Row<'_>) -> Result<Message> {
    const T: &str = "messages";
    Ok(Message {
        id: get::<String>(row, "id", T)?.into(),
        conversation_id: get::<String>(row, "conversation_id", T)?.into(),
        turn_id: get_opt::<String>(row, "turn_id", T)?.map(TurnId::from),
        sequence: get_opt(row, "sequence", T)?,
        role: get_enum(row, "role", T)?,
        message_type: get_enum(row, "type", T)?,
        status: get_enum_opt(row, "status", T)?,
        status_reason: get_opt(row, "status_reason", T)?,
        interim: get_bool(row, "interim", T)?,
        content: get_opt(row, "content", T)?,
        elicitation_id: get_opt::<String>(row, "elicitation_id", T)?.map(ElicitationId::from),
        parent_message_id: get_opt::<String>(row, "parent_message_id", T)?.map(MessageId::from),
        superseded_by: get_opt::<String>(row, "superseded_by", T)?.map(MessageId::from),
        payload_id: get_opt::<String>(row, "payload_id", T)?.map(PayloadId::from),
        created_at: get(row, "created_at", T)?,
    })
}

fn row_to_tool_call(row: &Row<'_>) -> Result<ToolCall> {
    const T: &str = "tool_calls";
    Ok(ToolCall {
        message_id: get::<String>(row, "message_id", T)?.into(),
        turn_id: get::<String>(row, "turn_id", T)?.into(),
        op_id: get(row, "op_id", T)?,
        attempt: get(row, "attempt", T)?,
        tool_name: get(row, "tool_name", T)?,
        tool_kind: get_opt(row, "tool_kind", T)?,
        status: get_enum(row, "status", T)?,
        request_payload_id: get_opt::<String>(row, "request_payload_id", T)?.map(PayloadId::from),
        request_hash: get_opt(row, "request_hash", T)?,
        response_payload_id: get_opt::<String>(row, "response_payload_id", T)?
            .map(PayloadId::from),
        response_hash: get_opt(row, "response_hash", T)?,
        retriable: get_bool(row, "retriable", T)?,
        error: get_opt(row, "error", T)?,
        latency_ms: get_opt(row, "latency_ms", T)?,
        cost: get_opt(row, "cost", T)?,
        created_at: get(row, "created_at", T)?,
        updated_at: get(row, "updated_at", T)?,
        completed_at: get_opt(row, "completed_at", T)?,
    })
}

fn row_to_model_call(row: &Row<'_>) -> Result<ModelCall> {
    const T: &str = "model_calls";
    let payload = |column: &'static str| -> Result<Option<PayloadId>> {
        Ok(get_opt::<String>(row, column, T)?.map(PayloadId::from))
    };
    let reasons: String = get(row, "safety_reasons", T)?;
    Ok(ModelCall {
        message_id: get::<String>(row, "message_id", T)?.into(),
        turn_id: get::<String>(row, "turn_id", T)?.into(),
        provider: get(row, "provider", T)?,
        model: get(row, "model", T)?,
        model_kind: get_enum(row, "model_kind", T)?,
        status: get_enum(row, "status", T)?,
        tokens: TokenCounts {
            prompt: get(row, "prompt_tokens", T)?,
            completion: get(row, "completion_tokens", T)?,
            total: get(row, "total_tokens", T)?,
            cached: get(row, "cached_tokens", T)?,
            prompt_audio: get(row, "prompt_audio_tokens", T)?,
            completion_audio: get(row, "completion_audio_tokens", T)?,
            reasoning: get(row, "reasoning_tokens", T)?,
        },
        cache_hit: get_bool(row, "cache_hit", T)?,
        cache_key: get_opt(row, "cache_key", T)?,
        cost: get_opt(row, "cost", T)?,
        safety_blocked: get_bool(row, "safety_blocked", T)?,
        safety_reasons: parse_json(&reasons, T, "safety_reasons")?,
        trace_id: get_opt(row, "trace_id", T)?,
        span_id: get_opt(row, "span_id", T)?,
        payloads: ModelCallPayloads {
            request: payload("request_payload_id")?,
            response: payload("response_payload_id")?,
            provider_request: payload("provider_request_payload_id")?,
            provider_response: payload("provider_response_payload_id")?,
            stream: payload("stream_payload_id")?,
        },
        error: get_opt(row, "error", T)?,
        latency_ms: get_opt(row, "latency_ms", T)?,
        created_at: get(row, "created_at", T)?,
        updated_at: get(row, "updated_at", T)?,
        completed_at: get_opt(row, "completed_at", T)?,
    })
}

fn row_to_payload(row: &Row<'_>) -> Result<CallPayload> {
    const T: &str = "call_payloads";
    let storage: StorageKind = get_enum(row, "storage", T)?;
    let body = match storage {
        StorageKind::Inline => PayloadBody::Inline {
            bytes: get(row, "inline_body", T)?,
        },
        StorageKind::Object => PayloadBody::Object {
            uri: get(row, "object_uri", T)?,
        },
    };
    Ok(CallPayload {
        id: get::<String>(row, "id", T)?.into(),
        tenant_id: get(row, "tenant_id", T)?,
        kind: get_enum(row, "kind", T)?,
        body,
        digest: get(row, "digest", T)?,
        compression: get(row, "compression", T)?,
        mime_type: get_opt(row, "mime_type", T)?,
        redacted: get_bool(row, "redacted", T)?,
        redaction_policy: get_opt(row, "redaction_policy", T)?,
        size_bytes: get(row, "size_bytes", T)?,
        preview: get_opt(row, "preview", T)?,
        created_at: get(row, "created_at", T)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use convo_core::{CallStatus, Role};

    fn ledger() -> SqliteLedger {
        SqliteLedger::new(Database::in_memory().unwrap())
    }

    #[test]
    fn deleting_turn_detaches_messages() {
        let ledger = ledger();
        let c = ConversationId::from("c1");
        ledger.create_conversation(&c, NewConversation::default()).unwrap();
        let turn = ledger.start_turn(&c, StartTurn::default()).unwrap();
        let m = ledger
            .append_message(&turn.id, NewMessage::tool_op().with_id("m1"))
            .unwrap();
        ledger
            .record_tool_call(ToolCallRecord::queued("m1", "op1", "grep"))
            .unwrap();

        ledger.delete_turn(&turn.id).unwrap();

        let kept = ledger.get_message(&m.id).unwrap();
        assert!(kept.turn_id.is_none());
        assert_eq!(kept.sequence, Some(1));
        assert_matches!(
            ledger.get_tool_call(&m.id),
            Err(StoreError::NotFound { .. })
        );
    }

    #[test]
    fn duplicate_attempt_is_conflict() {
        let ledger = ledger();
        let c = ConversationId::from("c1");
        ledger.create_conversation(&c, NewConversation::default()).unwrap();
        let turn = ledger.start_turn(&c, StartTurn::default()).unwrap();
        ledger
            .append_message(&turn.id, NewMessage::tool_op().with_id("a"))
            .unwrap();
        ledger
            .append_message(&turn.id, NewMessage::tool_op().with_id("b"))
            .unwrap();
        ledger
            .record_tool_call(ToolCallRecord::queued("a", "op1", "grep").with_attempt(1))
            .unwrap();
        let err = ledger
            .record_tool_call(ToolCallRecord::queued("b", "op1", "grep").with_attempt(1))
            .unwrap_err();
        assert_matches!(err, StoreError::Conflict(_));
    }

    #[test]
    fn read_inline_range_uses_substr() {
        let ledger = ledger();
        let payload = CallPayload {
            id: PayloadId::from("p1"),
            tenant_id: "t".into(),
            kind: PayloadKind::ToolResponse,
            body: PayloadBody::Inline {
                bytes: b"hello world".to_vec(),
            },
            digest: "d".into(),
            compression: "none".into(),
            mime_type: None,
            redacted: false,
            redaction_policy: None,
            size_bytes: 11,
            preview: None,
            created_at: now_ts(),
        };
        ledger.insert_payload(payload).unwrap();
        let bytes = ledger.read_inline_range(&PayloadId::from("p1"), 6, 5).unwrap();
        assert_eq!(bytes, b"world");
        let past_end = ledger.read_inline_range(&PayloadId::from("p1"), 50, 5).unwrap();
        assert!(past_end.is_empty());
    }

    #[test]
    fn model_call_safety_reasons_roundtrip() {
        let ledger = ledger();
        let c = ConversationId::from("c1");
        ledger.create_conversation(&c, NewConversation::default()).unwrap();
        let turn = ledger.start_turn(&c, StartTurn::default()).unwrap();
        ledger
            .append_message(&turn.id, NewMessage::text(Role::Assistant, "").with_id("m1"))
            .unwrap();
        let mut rec = ModelCallRecord::queued("m1", "anthropic", "claude", convo_core::ModelKind::Chat);
        rec.status = CallStatus::Completed;
        rec.safety_blocked = Some(true);
        rec.safety_reasons = vec!["violence".into()];
        ledger.record_model_call(rec).unwrap();

        let stored = ledger.get_model_call(&MessageId::from("m1")).unwrap();
        assert!(stored.safety_blocked);
        assert_eq!(stored.safety_reasons, vec!["violence".to_string()]);
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn file_backed_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        {
            let db = Database::open(&path, std::time::Duration::from_millis(100)).unwrap();
            let ledger = SqliteLedger::new(db);
            let c = ConversationId::from("c1");
            ledger.create_conversation(&c, NewConversation::default()).unwrap();
            let turn = ledger.start_turn(&c, StartTurn::with_id("t1")).unwrap();
            ledger
                .append_message(&turn.id, NewMessage::text(Role::User, "hi"))
                .unwrap();
        }
        let db = Database::open(&path, std::time::Duration::from_millis(100)).unwrap();
        let ledger = SqliteLedger::new(db);
        let messages = ledger.list_turn_messages(&TurnId::from("t1")).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            ledger.get_conversation(&ConversationId::from("c1")).unwrap().message_count,
            1
        );
    }

    #[test]
    fn turn_locks_are_released_after_appends() {
        let ledger = Arc::new(ledger());
        let c = ConversationId::from("c1");
        ledger.create_conversation(&c, NewConversation::default()).unwrap();
        let turns: Vec<TurnId> = (0..4)
            .map(|_| ledger.start_turn(&c, StartTurn::default()).unwrap().id)
            .collect();

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let turn = turns[i % turns.len()].clone();
                std::thread::spawn(move || {
                    ledger
                        .append_message(&turn, NewMessage::text(Role::User, "hi"))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.active_turn_locks(), 0);
        for turn in &turns {
            let sequences: Vec<i64> = ledger
                .list_turn_messages(turn)
                .unwrap()
                .iter()
                .filter_map(|m| m.sequence)
                .collect();
            assert_eq!(sequences, (1..=8).collect::<Vec<_>>());
        }
    }
}
