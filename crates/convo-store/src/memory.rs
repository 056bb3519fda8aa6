//! In-process [`LedgerStore`].
//!
//! Used when no database is configured and in tests. A single
//! `RwLock` guards all state, so every write (including sequence
//! allocation) is serialized.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, instrument};

use convo_core::{
    ConversationId, ElicitationId, MessageId, MessageStatus, MessageType, PayloadId, PayloadKind,
    TurnId, TurnStatus,
};

use crate::error::{Result, StoreError};
use crate::ledger::LedgerStore;
use crate::records::{
    activate_turn, call_turn, check_duplicate, check_transition, clamp_range, format_ts,
    merge_model_call, merge_tool_call, now_ts, CallPayload, Conversation, ConversationFilter,
    Message, ModelCall, ModelCallRecord, NewConversation, NewMessage, PayloadBody,
    RecordedModelCall, StartTurn, ToolCall, ToolCallRecord, Turn,
};

type DigestKey = (String, PayloadKind, String);

#[derive(Default)]
struct State {
    conversations: HashMap<ConversationId, Conversation>,
    turns: HashMap<TurnId, Turn>,
    messages: HashMap<MessageId, Message>,
    /// Insertion order of `messages`.
    message_order: Vec<MessageId>,
    tool_calls: HashMap<MessageId, ToolCall>,
    model_calls: HashMap<MessageId, ModelCall>,
    payloads: HashMap<PayloadId, CallPayload>,
    digests: HashMap<DigestKey, PayloadId>,
}

impl State {
    fn conversation(&self, id: &ConversationId) -> Result<&Conversation> {
        self.conversations
            .get(id)
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    fn conversation_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    fn turn(&self, id: &TurnId) -> Result<&Turn> {
        self.turns
            .get(id)
            .ok_or_else(|| StoreError::not_found("turn", id))
    }

    fn message(&self, id: &MessageId) -> Result<&Message> {
        self.messages
            .get(id)
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    fn message_mut(&mut self, id: &MessageId) -> Result<&mut Message> {
        self.messages
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("message", id))
    }

    fn require_payloads<'a>(
        &self,
        ids: impl IntoIterator<Item = Option<&'a PayloadId>>,
    ) -> Result<()> {
        for id in ids.into_iter().flatten() {
            if !self.payloads.contains_key(id) {
                return Err(StoreError::not_found("payload", id));
            }
        }
        Ok(())
    }

    fn insert_message(&mut self, row: Message) {
        self.message_order.push(row.id.clone());
        let _ = self.messages.insert(row.id.clone(), row);
    }

    fn remove_message(&mut self, id: &MessageId) {
        let _ = self.messages.remove(id);
        let _ = self.tool_calls.remove(id);
        let _ = self.model_calls.remove(id);
        self.message_order.retain(|m| m != id);
    }

    fn next_attempt(&self, turn_id: &TurnId, op_id: &str) -> u32 {
        self.tool_calls
            .values()
            .filter(|c| &c.turn_id == turn_id && c.op_id == op_id)
            .map(|c| c.attempt)
            .max()
            .unwrap_or(0)
            + 1
    }
}

fn activity(c: &Conversation) -> &str {
    c.last_message_at.as_deref().unwrap_or(&c.created_at)
}

/// Ledger held entirely in memory. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<State>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryLedger {
    // ── Conversations ───────────────────────────────────────────────

    #[instrument(skip(self, opts), fields(conversation_id = %id))]
    fn create_conversation(
        &self,
        id: &ConversationId,
        opts: NewConversation,
    ) -> Result<Conversation> {
        let mut state = self.state.write();
        let row = state
            .conversations
            .entry(id.clone())
            .or_insert_with(|| opts.into_row(id, Utc::now()));
        Ok(row.clone())
    }

    fn get_conversation(&self, id: &ConversationId) -> Result<Conversation> {
        self.state.read().conversation(id).cloned()
    }

    fn list_conversations(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>> {
        let state = self.state.read();
        let mut rows: Vec<Conversation> = state
            .conversations
            .values()
            .filter(|c| filter.admits(c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            activity(b)
                .cmp(activity(a))
                .then_with(|| b.id.cmp(&a.id))
        });
        let offset = filter.offset.map_or(0, |o| usize::try_from(o).unwrap_or(usize::MAX));
        let limit = filter.limit.map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    fn set_conversation_summary(&self, id: &ConversationId, summary: Option<&str>) -> Result<()> {
        let mut state = self.state.write();
        let c = state.conversation_mut(id)?;
        c.summary = summary.map(str::to_string);
        c.updated_at = now_ts();
        Ok(())
    }

    fn archive_conversation(&self, id: &ConversationId, archived: bool) -> Result<()> {
        let mut state = self.state.write();
        let c = state.conversation_mut(id)?;
        c.archived = archived;
        c.updated_at = now_ts();
        Ok(())
    }

    fn soft_delete_conversation(&self, id: &ConversationId) -> Result<()> {
        let mut state = self.state.write();
        let c = state.conversation_mut(id)?;
        let now = now_ts();
        if c.deleted_at.is_none() {
            c.deleted_at = Some(now.clone());
        }
        c.archived = true;
        c.updated_at = now;
        Ok(())
    }

    #[instrument(skip(self))]
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(now);
        let mut state = self.state.write();
        let expired: Vec<ConversationId> = state
            .conversations
            .values()
            .filter(|c| c.expires_at.as_ref().is_some_and(|at| *at <= cutoff))
            .map(|c| c.id.clone())
            .collect();
        for id in &expired {
            let _ = state.conversations.remove(id);
            state.turns.retain(|_, t| &t.conversation_id != id);
            let doomed: Vec<MessageId> = state
                .messages
                .values()
                .filter(|m| &m.conversation_id == id)
                .map(|m| m.id.clone())
                .collect();
            for m in &doomed {
                state.remove_message(m);
            }
        }
        if !expired.is_empty() {
            debug!(purged = expired.len(), "expired conversations purged");
        }
        Ok(expired.len())
    }

    // ── Turns ───────────────────────────────────────────────────────

    #[instrument(skip(self, opts), fields(conversation_id = %conversation_id))]
    fn start_turn(&self, conversation_id: &ConversationId, opts: StartTurn) -> Result<Turn> {
        let mut state = self.state.write();
        if state.conversation(conversation_id)?.deleted_at.is_some() {
            return Err(StoreError::InvalidState(format!(
                "conversation {conversation_id} is deleted"
            )));
        }
        if let Some(retry_of) = &opts.retry_of {
            let prior = state.turn(retry_of)?;
            if &prior.conversation_id != conversation_id {
                return Err(StoreError::not_found("turn", retry_of));
            }
        }
        let id = opts.id.unwrap_or_default();
        if state.turns.contains_key(&id) {
            return Err(StoreError::Conflict(format!("turn {id} already exists")));
        }
        let index = state
            .turns
            .values()
            .filter(|t| &t.conversation_id == conversation_id)
            .map(|t| t.index)
            .max()
            .unwrap_or(0)
            + 1;
        let now = now_ts();
        let mut turn = Turn {
            id: id.clone(),
            conversation_id: conversation_id.clone(),
            index,
            status: TurnStatus::Pending,
            status_reason: None,
            started_by_message_id: opts.started_by_message_id,
            retry_of: opts.retry_of,
            model_override: opts.model_override,
            agent_override: opts.agent_override,
            created_at: now.clone(),
            updated_at: now.clone(),
        };
        activate_turn(&mut turn)?;
        let _ = state.turns.insert(id, turn.clone());
        let c = state.conversation_mut(conversation_id)?;
        c.turn_count += 1;
        c.updated_at = now;
        debug!(turn_id = %turn.id, index, "turn started");
        Ok(turn)
    }

    fn get_turn(&self, id: &TurnId) -> Result<Turn> {
        self.state.read().turn(id).cloned()
    }

    fn list_turns(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>> {
        let state = self.state.read();
        let mut turns: Vec<Turn> = state
            .turns
            .values()
            .filter(|t| &t.conversation_id == conversation_id)
            .cloned()
            .collect();
        turns.sort_by_key(|t| t.index);
        Ok(turns)
    }

    #[instrument(skip(self, reason), fields(turn_id = %id, to = %to))]
    fn transition_turn(&self, id: &TurnId, to: TurnStatus, reason: Option<&str>) -> Result<Turn> {
        let mut state = self.state.write();
        let turn = state
            .turns
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("turn", id))?;
        check_transition(turn, to)?;
        turn.status = to;
        if let Some(reason) = reason {
            turn.status_reason = Some(reason.to_string());
        }
        turn.updated_at = now_ts();
        debug!("turn transitioned");
        Ok(turn.clone())
    }

    fn turn_age(&self, id: &TurnId) -> Result<u32> {
        let state = self.state.read();
        let turn = state.turn(id)?;
        let later = state
            .turns
            .values()
            .filter(|t| t.conversation_id == turn.conversation_id && t.index > turn.index)
            .count();
        Ok(u32::try_from(later).unwrap_or(u32::MAX))
    }

    #[instrument(skip(self), fields(turn_id = %id))]
    fn delete_turn(&self, id: &TurnId) -> Result<()> {
        let mut state = self.state.write();
        if state.turns.remove(id).is_none() {
            return Err(StoreError::not_found("turn", id));
        }
        for m in state.messages.values_mut() {
            if m.turn_id.as_ref() == Some(id) {
                m.turn_id = None;
            }
        }
        for t in state.turns.values_mut() {
            if t.retry_of.as_ref() == Some(id) {
                t.retry_of = None;
            }
        }
        state.tool_calls.retain(|_, c| &c.turn_id != id);
        state.model_calls.retain(|_, c| &c.turn_id != id);
        debug!("turn deleted");
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────

    #[instrument(skip(self, msg), fields(turn_id = %turn_id, role = %msg.role))]
    fn append_message(&self, turn_id: &TurnId, msg: NewMessage) -> Result<Message> {
        let mut state = self.state.write();
        let conversation_id = state.turn(turn_id)?.conversation_id.clone();
        let id = msg.id.clone().unwrap_or_default();
        if let Some(existing) = check_duplicate(state.messages.get(&id).cloned(), &conversation_id)?
        {
            debug!(message_id = %id, "duplicate message, returning stored row");
            return Ok(existing);
        }

        let sequence = state
            .messages
            .values()
            .filter(|m| m.turn_id.as_ref() == Some(turn_id))
            .filter_map(|m| m.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        let now = now_ts();
        let row = msg.into_row(
            id,
            conversation_id.clone(),
            Some(turn_id.clone()),
            Some(sequence),
            now.clone(),
        );
        state.insert_message(row.clone());
        let c = state.conversation_mut(&conversation_id)?;
        c.message_count += 1;
        c.last_message_at = Some(now.clone());
        c.updated_at = now;
        debug!(message_id = %row.id, sequence, "message appended");
        Ok(row)
    }

    #[instrument(skip(self, msg), fields(parent = %parent))]
    fn append_derived_message(&self, parent: &MessageId, msg: NewMessage) -> Result<Message> {
        let mut state = self.state.write();
        let conversation_id = state.message(parent)?.conversation_id.clone();
        let id = msg.id.clone().unwrap_or_default();
        if let Some(existing) = check_duplicate(state.messages.get(&id).cloned(), &conversation_id)?
        {
            return Ok(existing);
        }
        let mut row = msg.into_row(id, conversation_id, None, None, now_ts());
        row.parent_message_id = Some(parent.clone());
        state.insert_message(row.clone());
        debug!(message_id = %row.id, "derived message appended");
        Ok(row)
    }

    fn get_message(&self, id: &MessageId) -> Result<Message> {
        self.state.read().message(id).cloned()
    }

    fn list_turn_messages(&self, turn_id: &TurnId) -> Result<Vec<Message>> {
        let state = self.state.read();
        let _ = state.turn(turn_id)?;
        let mut rows: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.turn_id.as_ref() == Some(turn_id))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.sequence);
        Ok(rows)
    }

    fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let state = self.state.read();
        let _ = state.conversation(conversation_id)?;
        Ok(state
            .message_order
            .iter()
            .filter_map(|id| state.messages.get(id))
            .filter(|m| &m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    fn set_message_status(
        &self,
        id: &MessageId,
        status: Option<MessageStatus>,
        reason: Option<&str>,
    ) -> Result<Message> {
        let mut state = self.state.write();
        let m = state.message_mut(id)?;
        m.status = status;
        m.status_reason = reason.map(str::to_string);
        Ok(m.clone())
    }

    fn finalize_message(
        &self,
        id: &MessageId,
        content: Option<&str>,
        payload_id: Option<&PayloadId>,
    ) -> Result<Message> {
        let mut state = self.state.write();
        let m = state.message_mut(id)?;
        m.interim = false;
        if let Some(content) = content {
            m.content = Some(content.to_string());
        }
        if let Some(payload_id) = payload_id {
            m.payload_id = Some(payload_id.clone());
        }
        Ok(m.clone())
    }

    fn link_elicitation(&self, id: &MessageId, elicitation_id: &ElicitationId) -> Result<()> {
        self.state.write().message_mut(id)?.elicitation_id = Some(elicitation_id.clone());
        Ok(())
    }

    fn set_superseded_by(&self, id: &MessageId, superseded_by: Option<&MessageId>) -> Result<()> {
        self.state.write().message_mut(id)?.superseded_by = superseded_by.cloned();
        Ok(())
    }

    fn delete_message(&self, id: &MessageId) -> Result<()> {
        let mut state = self.state.write();
        if state.message(id)?.sequence.is_some() {
            return Err(StoreError::InvalidState(format!(
                "message {id} is part of a turn log and cannot be deleted"
            )));
        }
        state.remove_message(id);
        Ok(())
    }

    // ── Calls ───────────────────────────────────────────────────────

    #[instrument(skip(self, rec), fields(message_id = %rec.message_id, op_id = %rec.op_id, status = %rec.status))]
    fn record_tool_call(&self, rec: ToolCallRecord) -> Result<ToolCall> {
        let mut state = self.state.write();
        let message = state.message(&rec.message_id)?;
        if message.message_type != MessageType::ToolOp {
            return Err(StoreError::InvalidState(format!(
                "message {} is {}, not tool_op",
                message.id, message.message_type
            )));
        }
        let turn_id = call_turn(message)?;
        let existing = state.tool_calls.get(&rec.message_id).cloned();
        let attempt = match (&existing, rec.attempt) {
            (Some(row), _) => row.attempt,
            (None, Some(attempt)) => attempt,
            (None, None) => state.next_attempt(&turn_id, &rec.op_id),
        };
        let row = merge_tool_call(existing, rec, turn_id, attempt, &now_ts())?;
        state.require_payloads([
            row.request_payload_id.as_ref(),
            row.response_payload_id.as_ref(),
        ])?;
        let taken = state.tool_calls.values().any(|c| {
            c.message_id != row.message_id
                && c.turn_id == row.turn_id
                && c.op_id == row.op_id
                && c.attempt == row.attempt
        });
        if taken {
            return Err(StoreError::Conflict(format!(
                "tool call ({}, attempt {}) already recorded in turn {}",
                row.op_id, row.attempt, row.turn_id
            )));
        }
        let _ = state.tool_calls.insert(row.message_id.clone(), row.clone());
        debug!(attempt = row.attempt, "tool call recorded");
        Ok(row)
    }

    fn get_tool_call(&self, message_id: &MessageId) -> Result<ToolCall> {
        self.state
            .read()
            .tool_calls
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tool call", message_id))
    }

    fn list_tool_calls(&self, turn_id: &TurnId) -> Result<Vec<ToolCall>> {
        let state = self.state.read();
        let mut rows: Vec<ToolCall> = state
            .tool_calls
            .values()
            .filter(|c| &c.turn_id == turn_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.op_id.cmp(&b.op_id).then(a.attempt.cmp(&b.attempt)));
        Ok(rows)
    }

    fn next_attempt(&self, turn_id: &TurnId, op_id: &str) -> Result<u32> {
        Ok(self.state.read().next_attempt(turn_id, op_id))
    }

    #[instrument(skip(self, rec), fields(message_id = %rec.message_id, model = %rec.model, status = %rec.status))]
    fn record_model_call(&self, rec: ModelCallRecord) -> Result<RecordedModelCall> {
        let mut state = self.state.write();
        let turn_id = call_turn(state.message(&rec.message_id)?)?;
        let existing = state.model_calls.get(&rec.message_id).cloned();
        let previous_status = existing.as_ref().map(|c| c.status);
        let row = merge_model_call(existing, rec, turn_id, &now_ts())?;
        state.require_payloads(row.payloads.iter())?;
        let _ = state.model_calls.insert(row.message_id.clone(), row.clone());
        debug!("model call recorded");
        Ok(RecordedModelCall {
            call: row,
            previous_status,
        })
    }

    fn get_model_call(&self, message_id: &MessageId) -> Result<ModelCall> {
        self.state
            .read()
            .model_calls
            .get(message_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("model call", message_id))
    }

    fn list_model_calls(&self, turn_id: &TurnId) -> Result<Vec<ModelCall>> {
        let state = self.state.read();
        let mut rows: Vec<ModelCall> = state
            .model_calls
            .values()
            .filter(|c| &c.turn_id == turn_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        Ok(rows)
    }

    // ── Payloads ────────────────────────────────────────────────────

    #[instrument(skip(self, payload), fields(kind = %payload.kind, digest = %payload.digest))]
    fn insert_payload(&self, payload: CallPayload) -> Result<CallPayload> {
        let mut state = self.state.write();
        let key = (
            payload.tenant_id.clone(),
            payload.kind,
            payload.digest.clone(),
        );
        if let Some(existing) = state.digests.get(&key).and_then(|id| state.payloads.get(id)) {
            debug!("payload already stored, reusing");
            return Ok(existing.clone());
        }
        if state.payloads.contains_key(&payload.id) {
            return Err(StoreError::Conflict(format!(
                "payload {} already exists",
                payload.id
            )));
        }
        let _ = state.digests.insert(key, payload.id.clone());
        let _ = state.payloads.insert(payload.id.clone(), payload.clone());
        Ok(payload)
    }

    fn get_payload(&self, id: &PayloadId) -> Result<CallPayload> {
        self.state
            .read()
            .payloads
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("payload", id))
    }

    fn find_payload(
        &self,
        tenant: &str,
        kind: PayloadKind,
        digest: &str,
    ) -> Result<Option<CallPayload>> {
        let state = self.state.read();
        let key = (tenant.to_string(), kind, digest.to_string());
        Ok(state
            .digests
            .get(&key)
            .and_then(|id| state.payloads.get(id))
            .cloned())
    }

    fn read_inline_range(&self, id: &PayloadId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.state.read();
        let payload = state
            .payloads
            .get(id)
            .ok_or_else(|| StoreError::not_found("payload", id))?;
        match &payload.body {
            PayloadBody::Inline { bytes } => {
                Ok(bytes[clamp_range(bytes.len(), offset, len)].to_vec())
            }
            PayloadBody::Object { .. } => Err(StoreError::InvalidState(format!(
                "payload {id} is stored as an object"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use convo_core::Role;

    #[test]
    fn purge_removes_everything_under_conversation() {
        let ledger = MemoryLedger::new();
        let c = ConversationId::from("c1");
        ledger
            .create_conversation(
                &c,
                NewConversation {
                    retention_ttl_secs: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        let turn = ledger.start_turn(&c, StartTurn::default()).unwrap();
        ledger
            .append_message(&turn.id, NewMessage::text(Role::User, "hi").with_id("m1"))
            .unwrap();

        let purged = ledger
            .purge_expired(Utc::now() + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(purged, 1);
        assert_matches!(ledger.get_turn(&turn.id), Err(StoreError::NotFound { .. }));
        assert_matches!(
            ledger.get_message(&MessageId::from("m1")),
            Err(StoreError::NotFound { .. })
        );
    }

    #[test]
    fn list_conversations_paginates() {
        let ledger = MemoryLedger::new();
        for i in 0..5 {
            ledger
                .create_conversation(&ConversationId::from(format!("c{i}")), NewConversation::default())
                .unwrap();
        }
        let page = ledger
            .list_conversations(&ConversationFilter {
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn derived_message_is_outside_turn_log() {
        let ledger = MemoryLedger::new();
        let c = ConversationId::from("c1");
        ledger.create_conversation(&c, NewConversation::default()).unwrap();
        let turn = ledger.start_turn(&c, StartTurn::default()).unwrap();
        let original = ledger
            .append_message(&turn.id, NewMessage::text(Role::Tool, "long"))
            .unwrap();
        let summary = ledger
            .append_derived_message(&original.id, NewMessage::text(Role::Tool, "short"))
            .unwrap();

        assert!(summary.sequence.is_none());
        assert_eq!(summary.parent_message_id.as_ref(), Some(&original.id));
        assert_eq!(ledger.list_turn_messages(&turn.id).unwrap().len(), 1);
        assert_eq!(ledger.get_conversation(&c).unwrap().message_count, 1);

        ledger.delete_message(&summary.id).unwrap();
        assert_matches!(
            ledger.delete_message(&original.id),
            Err(StoreError::InvalidState(_))
        );
    }
}
