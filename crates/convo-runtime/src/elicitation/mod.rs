//! Blocking a turn on structured user input.
//!
//! An [`Awaiter`] per conversation (lazily created by the
//! [`AwaiterRegistry`]) sends [`Prompt`]s to a [`Resolver`] and waits until
//! the reply validates against the requested JSON Schema, the user declines,
//! or the wait is canceled. [`ElicitationFlow`] records all of it in the
//! ledger.

pub mod awaiter;
pub mod flow;
pub mod registry;
pub mod resolver;
pub mod schema;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use convo_core::{ConversationId, ElicitationId};

pub use awaiter::{Awaiter, AwaiterState, InteractiveAwaiter};
pub use flow::{ElicitationFlow, ElicitationOutcome};
pub use registry::{AwaiterFactory, AwaiterRegistry};
pub use resolver::{ChannelResolver, Resolver};
pub use schema::SchemaValidator;

/// A request for structured input.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitationRequest {
    pub id: ElicitationId,
    /// Text shown to the user.
    pub message: String,
    /// JSON Schema the answer must satisfy.
    pub schema: Value,
    /// Overrides the configured default timeout.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl ElicitationRequest {
    pub fn new(message: impl Into<String>, schema: Value) -> Self {
        Self {
            id: ElicitationId::new(),
            message: message.into(),
            schema,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One prompt delivered to a resolver. Re-prompts carry the previous
/// validation error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub elicitation_id: ElicitationId,
    pub conversation_id: ConversationId,
    pub message: String,
    pub schema: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the user answered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Reply {
    Accept { content: Value },
    Decline { reason: Option<String> },
    Cancel,
}

/// Final result of a completed elicitation.
#[derive(Clone, Debug, PartialEq)]
pub enum ElicitationResult {
    /// Validated (and normalized) answer.
    Accept(Value),
    Decline { reason: Option<String> },
}
