//! Ledger record types.
//!
//! Rows returned by [`LedgerStore`](crate::ledger::LedgerStore) plus the
//! input structs used to create or update them. Both ledger backends share
//! these types, along with the pure merge rules at the bottom of this file.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use convo_core::{
    CallStatus, ConversationId, ElicitationId, MessageId, MessageStatus, MessageType, ModelKind,
    PayloadId, PayloadKind, Role, StorageKind, TurnId, TurnStatus, UsageDelta, Visibility,
};

use crate::error::{Result, StoreError};

/// Format a timestamp the way every ledger column stores it.
///
/// Fixed-width UTC with millisecond precision, so lexical order is
/// chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in ledger format.
pub fn now_ts() -> String {
    format_ts(Utc::now())
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversation
// ─────────────────────────────────────────────────────────────────────────────

/// A conversation row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub summary: Option<String>,
    pub visibility: Visibility,
    pub archived: bool,
    pub message_count: i64,
    pub turn_count: i64,
    pub last_message_at: Option<String>,
    pub retention_ttl_secs: Option<i64>,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

/// Options for [`create_conversation`](crate::ledger::LedgerStore::create_conversation).
#[derive(Clone, Debug, Default)]
pub struct NewConversation {
    pub summary: Option<String>,
    pub visibility: Visibility,
    /// Seconds until the conversation may be purged.
    pub retention_ttl_secs: Option<i64>,
}

impl NewConversation {
    /// Build the row created at `now`.
    pub(crate) fn into_row(self, id: &ConversationId, now: DateTime<Utc>) -> Conversation {
        let ts = format_ts(now);
        let expires_at = self
            .retention_ttl_secs
            .map(|ttl| format_ts(now + chrono::Duration::seconds(ttl)));
        Conversation {
            id: id.clone(),
            summary: self.summary,
            visibility: self.visibility,
            archived: false,
            message_count: 0,
            turn_count: 0,
            last_message_at: None,
            retention_ttl_secs: self.retention_ttl_secs,
            expires_at,
            created_at: ts.clone(),
            updated_at: ts,
            deleted_at: None,
        }
    }
}

/// Filter for [`list_conversations`](crate::ledger::LedgerStore::list_conversations).
#[derive(Clone, Debug, Default)]
pub struct ConversationFilter {
    pub include_archived: bool,
    pub include_deleted: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ConversationFilter {
    pub(crate) fn admits(&self, c: &Conversation) -> bool {
        (self.include_archived || !c.archived) && (self.include_deleted || c.deleted_at.is_none())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn
// ─────────────────────────────────────────────────────────────────────────────

/// A turn row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub conversation_id: ConversationId,
    /// 1-based position of the turn within its conversation.
    pub index: i64,
    pub status: TurnStatus,
    pub status_reason: Option<String>,
    pub started_by_message_id: Option<MessageId>,
    pub retry_of: Option<TurnId>,
    pub model_override: Option<String>,
    pub agent_override: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Options for [`start_turn`](crate::ledger::LedgerStore::start_turn).
#[derive(Clone, Debug, Default)]
pub struct StartTurn {
    pub id: Option<TurnId>,
    pub started_by_message_id: Option<MessageId>,
    pub retry_of: Option<TurnId>,
    pub model_override: Option<String>,
    pub agent_override: Option<String>,
}

impl StartTurn {
    /// Start a turn with a caller-chosen id.
    pub fn with_id(id: impl Into<TurnId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

/// Check `turn.status → to` against the allowed transition set.
pub(crate) fn check_transition(turn: &Turn, to: TurnStatus) -> Result<()> {
    if turn.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidState(format!(
            "turn {} cannot move from {} to {to}",
            turn.id, turn.status
        )))
    }
}

/// Move a freshly created `pending` turn to `running`. Both backends start
/// turns through this.
pub(crate) fn activate_turn(turn: &mut Turn) -> Result<()> {
    check_transition(turn, TurnStatus::Running)?;
    turn.status = TurnStatus::Running;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Message
// ─────────────────────────────────────────────────────────────────────────────

/// A message row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// `None` once the owning turn is deleted, or for derived messages.
    pub turn_id: Option<TurnId>,
    /// Position in the turn log; `None` for derived messages outside it.
    pub sequence: Option<i64>,
    pub role: Role,
    pub message_type: MessageType,
    pub status: Option<MessageStatus>,
    pub status_reason: Option<String>,
    pub interim: bool,
    pub content: Option<String>,
    pub elicitation_id: Option<ElicitationId>,
    pub parent_message_id: Option<MessageId>,
    pub superseded_by: Option<MessageId>,
    pub payload_id: Option<PayloadId>,
    pub created_at: String,
}

/// Input for [`append_message`](crate::ledger::LedgerStore::append_message).
#[derive(Clone, Debug)]
pub struct NewMessage {
    /// Caller-supplied id; a fresh id is generated when `None`.
    pub id: Option<MessageId>,
    pub role: Role,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub interim: bool,
    pub elicitation_id: Option<ElicitationId>,
    pub parent_message_id: Option<MessageId>,
    pub payload_id: Option<PayloadId>,
}

impl NewMessage {
    /// A message with no content.
    pub fn new(role: Role, message_type: MessageType) -> Self {
        Self {
            id: None,
            role,
            message_type,
            content: None,
            status: None,
            interim: false,
            elicitation_id: None,
            parent_message_id: None,
            payload_id: None,
        }
    }

    /// A plain text message.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self::new(role, MessageType::Text).with_content(content)
    }

    /// An assistant `tool_op` message.
    pub fn tool_op() -> Self {
        Self::new(Role::Assistant, MessageType::ToolOp)
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: MessageId) -> Self {
        self.parent_message_id = Some(parent);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload_id: PayloadId) -> Self {
        self.payload_id = Some(payload_id);
        self
    }

    #[must_use]
    pub fn with_elicitation(mut self, elicitation_id: ElicitationId) -> Self {
        self.elicitation_id = Some(elicitation_id);
        self
    }

    #[must_use]
    pub fn interim(mut self) -> Self {
        self.interim = true;
        self
    }

    pub(crate) fn into_row(
        self,
        id: MessageId,
        conversation_id: ConversationId,
        turn_id: Option<TurnId>,
        sequence: Option<i64>,
        created_at: String,
    ) -> Message {
        Message {
            id,
            conversation_id,
            turn_id,
            sequence,
            role: self.role,
            message_type: self.message_type,
            status: self.status,
            status_reason: None,
            interim: self.interim,
            content: self.content,
            elicitation_id: self.elicitation_id,
            parent_message_id: self.parent_message_id,
            superseded_by: None,
            payload_id: self.payload_id,
            created_at,
        }
    }
}

/// Decide whether an append with `id` is a duplicate.
///
/// Returns the stored row when `id` already exists in `conversation_id`
/// (the idempotent no-op) and fails when it exists in another conversation.
pub(crate) fn check_duplicate(
    existing: Option<Message>,
    conversation_id: &ConversationId,
) -> Result<Option<Message>> {
    match existing {
        Some(m) if &m.conversation_id == conversation_id => Ok(Some(m)),
        Some(m) => Err(StoreError::InvalidState(format!(
            "message {} already belongs to conversation {}",
            m.id, m.conversation_id
        ))),
        None => Ok(None),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool call
// ─────────────────────────────────────────────────────────────────────────────

/// A tool call row, 1:1 with its `tool_op` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub message_id: MessageId,
    pub turn_id: TurnId,
    pub op_id: String,
    pub attempt: u32,
    pub tool_name: String,
    pub tool_kind: Option<String>,
    pub status: CallStatus,
    pub request_payload_id: Option<PayloadId>,
    pub request_hash: Option<String>,
    pub response_payload_id: Option<PayloadId>,
    pub response_hash: Option<String>,
    pub retriable: bool,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub cost: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

/// Upsert input for [`record_tool_call`](crate::ledger::LedgerStore::record_tool_call).
///
/// `None` fields leave the stored value unchanged on update.
#[derive(Clone, Debug)]
pub struct ToolCallRecord {
    pub message_id: MessageId,
    pub op_id: String,
    /// Assigned from [`next_attempt`](crate::ledger::LedgerStore::next_attempt)
    /// when `None` on insert.
    pub attempt: Option<u32>,
    pub tool_name: String,
    pub tool_kind: Option<String>,
    pub status: CallStatus,
    pub request_payload_id: Option<PayloadId>,
    pub request_hash: Option<String>,
    pub response_payload_id: Option<PayloadId>,
    pub response_hash: Option<String>,
    pub retriable: Option<bool>,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub cost: Option<f64>,
}

impl ToolCallRecord {
    /// A `queued` record for a freshly dispatched operation.
    pub fn queued(
        message_id: impl Into<MessageId>,
        op_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            op_id: op_id.into(),
            attempt: None,
            tool_name: tool_name.into(),
            tool_kind: None,
            status: CallStatus::Queued,
            request_payload_id: None,
            request_hash: None,
            response_payload_id: None,
            response_hash: None,
            retriable: None,
            error: None,
            latency_ms: None,
            cost: None,
        }
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: CallStatus) -> Self {
        self.status = status;
        self
    }
}

/// Apply a tool call upsert to the stored row (if any).
///
/// `attempt` is the attempt to use when inserting; it is ignored for updates.
/// Changing the op id or attempt of an existing row, or moving a terminal
/// call to another status, is an [`StoreError::InvalidState`].
pub(crate) fn merge_tool_call(
    existing: Option<ToolCall>,
    rec: ToolCallRecord,
    turn_id: TurnId,
    attempt: u32,
    now: &str,
) -> Result<ToolCall> {
    let completed_at = |status: CallStatus, prior: Option<String>| {
        prior.or_else(|| status.is_terminal().then(|| now.to_string()))
    };

    let Some(mut row) = existing else {
        if attempt == 0 {
            return Err(StoreError::InvalidState("attempt numbers start at 1".into()));
        }
        return Ok(ToolCall {
            message_id: rec.message_id,
            turn_id,
            op_id: rec.op_id,
            attempt,
            tool_name: rec.tool_name,
            tool_kind: rec.tool_kind,
            status: rec.status,
            request_payload_id: rec.request_payload_id,
            request_hash: rec.request_hash,
            response_payload_id: rec.response_payload_id,
            response_hash: rec.response_hash,
            retriable: rec.retriable.unwrap_or(false),
            error: rec.error,
            latency_ms: rec.latency_ms,
            cost: rec.cost,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            completed_at: completed_at(rec.status, None),
        });
    };

    if row.op_id != rec.op_id || rec.attempt.is_some_and(|a| a != row.attempt) {
        return Err(StoreError::InvalidState(format!(
            "tool call {} is ({}, attempt {}); a retry needs a new message",
            row.message_id, row.op_id, row.attempt
        )));
    }
    if !row.status.can_transition_to(rec.status) {
        return Err(StoreError::InvalidState(format!(
            "tool call {} cannot move from {} to {}",
            row.message_id, row.status, rec.status
        )));
    }

    row.status = rec.status;
    row.tool_kind = rec.tool_kind.or(row.tool_kind);
    row.request_payload_id = rec.request_payload_id.or(row.request_payload_id);
    row.request_hash = rec.request_hash.or(row.request_hash);
    row.response_payload_id = rec.response_payload_id.or(row.response_payload_id);
    row.response_hash = rec.response_hash.or(row.response_hash);
    row.retriable = rec.retriable.unwrap_or(row.retriable);
    row.error = rec.error.or(row.error);
    row.latency_ms = rec.latency_ms.or(row.latency_ms);
    row.cost = rec.cost.or(row.cost);
    row.updated_at = now.to_string();
    row.completed_at = completed_at(row.status, row.completed_at);
    Ok(row)
}

// ─────────────────────────────────────────────────────────────────────────────
// Model call
// ─────────────────────────────────────────────────────────────────────────────

/// Token counts reported for one model call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
    pub cached: i64,
    pub prompt_audio: i64,
    pub completion_audio: i64,
    pub reasoning: i64,
}

/// The five independent payload references of a model call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCallPayloads {
    pub request: Option<PayloadId>,
    pub response: Option<PayloadId>,
    pub provider_request: Option<PayloadId>,
    pub provider_response: Option<PayloadId>,
    pub stream: Option<PayloadId>,
}

impl ModelCallPayloads {
    /// Every reference slot, set or not.
    pub fn iter(&self) -> impl Iterator<Item = Option<&PayloadId>> {
        [
            self.request.as_ref(),
            self.response.as_ref(),
            self.provider_request.as_ref(),
            self.provider_response.as_ref(),
            self.stream.as_ref(),
        ]
        .into_iter()
    }

    fn or(self, prior: Self) -> Self {
        Self {
            request: self.request.or(prior.request),
            response: self.response.or(prior.response),
            provider_request: self.provider_request.or(prior.provider_request),
            provider_response: self.provider_response.or(prior.provider_response),
            stream: self.stream.or(prior.stream),
        }
    }
}

/// Stored row after a model call upsert, with the status it replaced.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedModelCall {
    pub call: ModelCall,
    /// `None` when the upsert created the row.
    pub previous_status: Option<CallStatus>,
}

impl RecordedModelCall {
    /// Whether this upsert is the one that moved the call into `completed`.
    #[must_use]
    pub fn newly_completed(&self) -> bool {
        self.call.status == CallStatus::Completed
            && self.previous_status != Some(CallStatus::Completed)
    }
}

/// Upsert input for [`record_model_call`](crate::ledger::LedgerStore::record_model_call).
#[derive(Clone, Debug)]
pub struct ModelCallRecord {
    pub message_id: MessageId,
    pub provider: String,
    pub model: String,
    pub model_kind: ModelKind,
    pub status: CallStatus,
    /// Replaces stored counts when set.
    pub tokens: Option<TokenCounts>,
    pub cache_hit: Option<bool>,
    pub cache_key: Option<String>,
    pub cost: Option<f64>,
    pub safety_blocked: Option<bool>,
    pub safety_reasons: Vec<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub payloads: ModelCallPayloads,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
}

impl ModelCallRecord {
    /// A `queued` record.
    pub fn queued(
        message_id: impl Into<MessageId>,
        provider: impl Into<String>,
        model: impl Into<String>,
        model_kind: ModelKind,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            provider: provider.into(),
            model: model.into(),
            model_kind,
            status: CallStatus::Queued,
            tokens: None,
            cache_hit: None,
            cache_key: None,
            cost: None,
            safety_blocked: None,
            safety_reasons: Vec::new(),
            trace_id: None,
            span_id: None,
            payloads: ModelCallPayloads::default(),
            error: None,
            latency_ms: None,
        }
    }
}

/// A model call row, 1:1 with its message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelCall {
    pub message_id: MessageId,
    pub turn_id: TurnId,
    pub provider: String,
    pub model: String,
    pub model_kind: ModelKind,
    pub status: CallStatus,
    pub tokens: TokenCounts,
    pub cache_hit: bool,
    pub cache_key: Option<String>,
    pub cost: Option<f64>,
    pub safety_blocked: bool,
    pub safety_reasons: Vec<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub payloads: ModelCallPayloads,
    pub error: Option<String>,
    pub latency_ms: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl ModelCall {
    /// Usage delta to report for this call. Negative counts clamp to zero.
    pub fn usage_delta(&self) -> UsageDelta {
        let n = |v: i64| u64::try_from(v).unwrap_or(0);
        let mut delta = UsageDelta {
            cached_tokens: n(self.tokens.cached),
            cost: self.cost.unwrap_or(0.0),
            ..UsageDelta::default()
        };
        if self.model_kind == ModelKind::Embedding {
            delta.embedding_tokens = n(self.tokens.prompt);
        } else {
            delta.prompt_tokens = n(self.tokens.prompt);
            delta.completion_tokens = n(self.tokens.completion);
        }
        delta
    }
}

/// Apply a model call upsert to the stored row (if any).
pub(crate) fn merge_model_call(
    existing: Option<ModelCall>,
    rec: ModelCallRecord,
    turn_id: TurnId,
    now: &str,
) -> Result<ModelCall> {
    let Some(mut row) = existing else {
        return Ok(ModelCall {
            message_id: rec.message_id,
            turn_id,
            provider: rec.provider,
            model: rec.model,
            model_kind: rec.model_kind,
            status: rec.status,
            tokens: rec.tokens.unwrap_or_default(),
            cache_hit: rec.cache_hit.unwrap_or(false),
            cache_key: rec.cache_key,
            cost: rec.cost,
            safety_blocked: rec.safety_blocked.unwrap_or(false),
            safety_reasons: rec.safety_reasons,
            trace_id: rec.trace_id,
            span_id: rec.span_id,
            payloads: rec.payloads,
            error: rec.error,
            latency_ms: rec.latency_ms,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            completed_at: rec.status.is_terminal().then(|| now.to_string()),
        });
    };

    if !row.status.can_transition_to(rec.status) {
        return Err(StoreError::InvalidState(format!(
            "model call {} cannot move from {} to {}",
            row.message_id, row.status, rec.status
        )));
    }

    row.provider = rec.provider;
    row.model = rec.model;
    row.model_kind = rec.model_kind;
    row.status = rec.status;
    row.tokens = rec.tokens.unwrap_or(row.tokens);
    row.cache_hit = rec.cache_hit.unwrap_or(row.cache_hit);
    row.cache_key = rec.cache_key.or(row.cache_key);
    row.cost = rec.cost.or(row.cost);
    row.safety_blocked = rec.safety_blocked.unwrap_or(row.safety_blocked);
    if !rec.safety_reasons.is_empty() {
        row.safety_reasons = rec.safety_reasons;
    }
    row.trace_id = rec.trace_id.or(row.trace_id);
    row.span_id = rec.span_id.or(row.span_id);
    row.payloads = rec.payloads.or(row.payloads);
    row.error = rec.error.or(row.error);
    row.latency_ms = rec.latency_ms.or(row.latency_ms);
    row.updated_at = now.to_string();
    if row.completed_at.is_none() && row.status.is_terminal() {
        row.completed_at = Some(now.to_string());
    }
    Ok(row)
}

/// Resolve the owning turn of a call's message.
pub(crate) fn call_turn(message: &Message) -> Result<TurnId> {
    message.turn_id.clone().ok_or_else(|| {
        StoreError::InvalidState(format!("message {} is not part of a turn", message.id))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────────────────

/// Where a payload body lives. Exactly one representation exists per row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum PayloadBody {
    /// Bytes stored in the row.
    Inline { bytes: Vec<u8> },
    /// Bytes stored externally at `uri`.
    Object { uri: String },
}

impl PayloadBody {
    pub fn storage(&self) -> StorageKind {
        match self {
            Self::Inline { .. } => StorageKind::Inline,
            Self::Object { .. } => StorageKind::Object,
        }
    }
}

/// A stored request/response body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub id: PayloadId,
    pub tenant_id: String,
    pub kind: PayloadKind,
    pub body: PayloadBody,
    /// SHA-256 hex of the persisted bytes.
    pub digest: String,
    pub compression: String,
    pub mime_type: Option<String>,
    pub redacted: bool,
    pub redaction_policy: Option<String>,
    pub size_bytes: i64,
    pub preview: Option<String>,
    pub created_at: String,
}

impl CallPayload {
    pub fn storage(&self) -> StorageKind {
        self.body.storage()
    }

    /// Total body size in bytes.
    pub fn size(&self) -> u64 {
        u64::try_from(self.size_bytes).unwrap_or(0)
    }
}

/// Byte range `[offset, offset + len)` clamped to `total`.
pub(crate) fn clamp_range(total: usize, offset: u64, len: u64) -> std::ops::Range<usize> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(total);
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    start..start.saturating_add(len).min(total)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
