//! The conversation ledger contract.
//!
//! [`LedgerStore`] is implemented by [`SqliteLedger`](crate::sqlite::SqliteLedger)
//! for durable storage and [`MemoryLedger`](crate::memory::MemoryLedger) as an
//! in-process fallback. Both give the same guarantees:
//!
//! - message sequences within a turn are `1..=n`, strictly increasing and
//!   gap-free, allocated under a single writer per turn
//! - appending a message whose id already exists in the conversation returns
//!   the stored row and changes nothing
//! - `(turn, op_id, attempt)` is unique across tool calls
//! - `(tenant, kind, digest)` is unique across payloads
//! - turn status only moves along the allowed transition set

use chrono::{DateTime, Utc};

use convo_core::{
    ConversationId, ElicitationId, MessageId, MessageStatus, PayloadId, PayloadKind, TurnId,
    TurnStatus,
};

use crate::error::Result;
use crate::records::{
    CallPayload, Conversation, ConversationFilter, Message, ModelCall, ModelCallRecord,
    NewConversation, NewMessage, RecordedModelCall, StartTurn, ToolCall, ToolCallRecord, Turn,
};

/// Durable record of conversations, turns, messages, calls, and payloads.
pub trait LedgerStore: Send + Sync {
    // ── Conversations ───────────────────────────────────────────────

    /// Create a conversation, or return the existing one with this id.
    fn create_conversation(
        &self,
        id: &ConversationId,
        opts: NewConversation,
    ) -> Result<Conversation>;

    fn get_conversation(&self, id: &ConversationId) -> Result<Conversation>;

    /// Conversations ordered by most recent activity first.
    fn list_conversations(&self, filter: &ConversationFilter) -> Result<Vec<Conversation>>;

    fn set_conversation_summary(&self, id: &ConversationId, summary: Option<&str>) -> Result<()>;

    fn archive_conversation(&self, id: &ConversationId, archived: bool) -> Result<()>;

    /// Mark deleted and archived; the rows stay until purged.
    fn soft_delete_conversation(&self, id: &ConversationId) -> Result<()>;

    /// Physically remove conversations whose `expires_at` is at or before
    /// `now`, with their turns, messages, and call rows. Returns the count.
    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    // ── Turns ───────────────────────────────────────────────────────

    /// Create a turn (`pending`) and move it to `running`.
    fn start_turn(&self, conversation_id: &ConversationId, opts: StartTurn) -> Result<Turn>;

    fn get_turn(&self, id: &TurnId) -> Result<Turn>;

    /// Turns of a conversation in creation order.
    fn list_turns(&self, conversation_id: &ConversationId) -> Result<Vec<Turn>>;

    /// Move a turn to `to`. `reason` replaces the stored reason when set.
    fn transition_turn(&self, id: &TurnId, to: TurnStatus, reason: Option<&str>) -> Result<Turn>;

    /// Number of turns started after this one in the same conversation.
    fn turn_age(&self, id: &TurnId) -> Result<u32>;

    /// Delete a turn. Its messages survive with `turn_id = NULL`; its call
    /// rows are removed.
    fn delete_turn(&self, id: &TurnId) -> Result<()>;

    // ── Messages ────────────────────────────────────────────────────

    /// Append to the turn log with the next sequence number.
    fn append_message(&self, turn_id: &TurnId, msg: NewMessage) -> Result<Message>;

    /// Append a derived message (e.g. a summary) linked to `parent`.
    ///
    /// Derived messages belong to the parent's conversation but not to any
    /// turn log: they carry no sequence and do not change the counters.
    fn append_derived_message(&self, parent: &MessageId, msg: NewMessage) -> Result<Message>;

    fn get_message(&self, id: &MessageId) -> Result<Message>;

    /// Messages of a turn in sequence order.
    fn list_turn_messages(&self, turn_id: &TurnId) -> Result<Vec<Message>>;

    /// Messages of a conversation in insertion order.
    fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>>;

    fn set_message_status(
        &self,
        id: &MessageId,
        status: Option<MessageStatus>,
        reason: Option<&str>,
    ) -> Result<Message>;

    /// Clear the interim flag, optionally replacing content and payload.
    fn finalize_message(
        &self,
        id: &MessageId,
        content: Option<&str>,
        payload_id: Option<&PayloadId>,
    ) -> Result<Message>;

    fn link_elicitation(&self, id: &MessageId, elicitation_id: &ElicitationId) -> Result<()>;

    fn set_superseded_by(&self, id: &MessageId, superseded_by: Option<&MessageId>) -> Result<()>;

    /// Delete a derived message. Messages in a turn log cannot be deleted.
    fn delete_message(&self, id: &MessageId) -> Result<()>;

    // ── Calls ───────────────────────────────────────────────────────

    /// Insert or update the tool call keyed by its message id.
    fn record_tool_call(&self, rec: ToolCallRecord) -> Result<ToolCall>;

    fn get_tool_call(&self, message_id: &MessageId) -> Result<ToolCall>;

    /// Tool calls of a turn ordered by `(op_id, attempt)`.
    fn list_tool_calls(&self, turn_id: &TurnId) -> Result<Vec<ToolCall>>;

    /// `1 + max(attempt)` for `(turn, op_id)`, or 1.
    fn next_attempt(&self, turn_id: &TurnId, op_id: &str) -> Result<u32>;

    /// Insert or update the model call keyed by its message id.
    fn record_model_call(&self, rec: ModelCallRecord) -> Result<RecordedModelCall>;

    fn get_model_call(&self, message_id: &MessageId) -> Result<ModelCall>;

    fn list_model_calls(&self, turn_id: &TurnId) -> Result<Vec<ModelCall>>;

    // ── Payloads ────────────────────────────────────────────────────

    /// Insert a payload row. When `(tenant, kind, digest)` already exists the
    /// stored row is returned instead.
    fn insert_payload(&self, payload: CallPayload) -> Result<CallPayload>;

    fn get_payload(&self, id: &PayloadId) -> Result<CallPayload>;

    fn find_payload(
        &self,
        tenant: &str,
        kind: PayloadKind,
        digest: &str,
    ) -> Result<Option<CallPayload>>;

    /// Read `[offset, offset + len)` of an inline body without loading the
    /// rest. Fails with `InvalidState` for object payloads.
    fn read_inline_range(&self, id: &PayloadId, offset: u64, len: u64) -> Result<Vec<u8>>;
}
