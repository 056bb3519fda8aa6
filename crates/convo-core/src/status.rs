//! Status and classification enums shared by the ledger and runtime.
//!
//! Every enum has a stable snake_case wire string used both for serde and for
//! the `TEXT` columns of the persisted schema, where `CHECK` constraints list
//! the same values.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Returned when a wire string does not name any variant.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    /// Enum being parsed.
    pub kind: &'static str,
    /// Offending input.
    pub value: String,
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident as $kind:literal {
            $(
                $(#[$vmeta:meta])*
                $variant:ident => $wire:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $wire)]
                $variant,
            )*
        }

        impl $name {
            /// Every variant in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),*];

            /// Canonical wire string.
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)*
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($wire => Ok(Self::$variant),)*
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// Lifecycle state of a turn.
    TurnStatus as "turn status" {
        /// Created, not yet executing.
        Pending => "pending",
        /// Executing plan/act steps.
        Running => "running",
        /// Blocked on an elicitation.
        WaitingForUser => "waiting_for_user",
        /// Finished successfully.
        Succeeded => "succeeded",
        /// Finished with an error, decline, or cancellation reason.
        Failed => "failed",
        /// Stopped by the caller.
        Canceled => "canceled",
    }
}

impl TurnStatus {
    /// Whether no further transition is allowed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether `self → to` is in the allowed transition set.
    ///
    /// `waiting_for_user` is only reachable from `running` and may only
    /// leave to `running`, `failed` or `canceled`.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        match self {
            Self::Pending => matches!(to, Self::Running | Self::Failed | Self::Canceled),
            Self::Running => matches!(
                to,
                Self::WaitingForUser | Self::Succeeded | Self::Failed | Self::Canceled
            ),
            Self::WaitingForUser => matches!(to, Self::Running | Self::Failed | Self::Canceled),
            Self::Succeeded | Self::Failed | Self::Canceled => false,
        }
    }
}

wire_enum! {
    /// Author of a message.
    Role as "role" {
        /// System prompt or policy text.
        System => "system",
        /// Human input.
        User => "user",
        /// Model output.
        Assistant => "assistant",
        /// Tool result.
        Tool => "tool",
    }
}

wire_enum! {
    /// Shape of a message body.
    MessageType as "message type" {
        /// Plain text content.
        Text => "text",
        /// A tool or model operation; has a call row keyed by the message ID.
        ToolOp => "tool_op",
        /// Control signal (elicitation, cancellation notice, etc.).
        Control => "control",
    }
}

wire_enum! {
    /// Interactive sub-state of a message.
    MessageStatus as "message status" {
        /// Awaiting user resolution.
        Pending => "pending",
        /// Resolved with an accepted payload.
        Accepted => "accepted",
        /// Declined by the user (or timed out).
        Rejected => "rejected",
        /// Canceled before resolution.
        Cancel => "cancel",
        /// Open for streaming or edits.
        Open => "open",
        /// Derived summary of another message.
        Summary => "summary",
        /// Replaced in context by a summary.
        Summarized => "summarized",
    }
}

wire_enum! {
    /// Lifecycle state shared by tool and model calls.
    CallStatus as "call status" {
        /// Dispatched, waiting for a worker.
        Queued => "queued",
        /// In flight.
        Running => "running",
        /// Finished successfully.
        Completed => "completed",
        /// Finished with an error.
        Failed => "failed",
        /// Not executed (policy or dependency).
        Skipped => "skipped",
        /// Aborted by the caller.
        Canceled => "canceled",
    }
}

impl CallStatus {
    /// Whether the call has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Canceled
        )
    }

    /// Whether an upsert may move a call from `self` to `to`.
    ///
    /// Re-recording the same status is allowed so upserts stay idempotent.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self == to {
            return true;
        }
        match self {
            Self::Queued => true,
            Self::Running => to != Self::Queued,
            Self::Completed | Self::Failed | Self::Skipped | Self::Canceled => false,
        }
    }
}

wire_enum! {
    /// Kind of model invocation.
    ModelKind as "model kind" {
        /// Chat/messages API.
        Chat => "chat",
        /// Legacy completion API.
        Completion => "completion",
        /// Embedding API.
        Embedding => "embedding",
    }
}

wire_enum! {
    /// What a stored payload represents.
    PayloadKind as "payload kind" {
        /// Normalized model request.
        ModelRequest => "model_request",
        /// Normalized model response.
        ModelResponse => "model_response",
        /// Raw provider request body.
        ProviderRequest => "provider_request",
        /// Raw provider response body.
        ProviderResponse => "provider_response",
        /// Captured stream transcript.
        ModelStream => "model_stream",
        /// Tool invocation arguments.
        ToolRequest => "tool_request",
        /// Tool output.
        ToolResponse => "tool_response",
        /// Elicitation prompt and schema.
        ElicitationRequest => "elicitation_request",
        /// Elicitation answer.
        ElicitationResponse => "elicitation_response",
    }
}

wire_enum! {
    /// Where a payload body lives.
    StorageKind as "storage kind" {
        /// Body stored in the payload row.
        Inline => "inline",
        /// Body stored in the object store, row keeps a URI.
        Object => "object",
    }
}

wire_enum! {
    /// Who may see a conversation.
    Visibility as "visibility" {
        /// Owner only.
        Private => "private",
        /// Shared with collaborators.
        Shared => "shared",
        /// Anyone with the link.
        Public => "public",
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Self::Private
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn wire_strings_roundtrip() {
        for status in TurnStatus::ALL {
            assert_eq!(status.as_str().parse::<TurnStatus>().unwrap(), *status);
        }
        for kind in PayloadKind::ALL {
            assert_eq!(kind.as_str().parse::<PayloadKind>().unwrap(), *kind);
        }
    }

    #[test]
    fn serde_uses_wire_string() {
        let json = serde_json::to_string(&TurnStatus::WaitingForUser).unwrap();
        assert_eq!(json, "\"waiting_for_user\"");
        let json = serde_json::to_string(&MessageType::ToolOp).unwrap();
        assert_eq!(json, "\"tool_op\"");
    }

    #[test]
    fn unknown_variant_is_reported() {
        let err = "bogus".parse::<Role>().unwrap_err();
        assert_matches!(err, UnknownVariant { kind: "role", .. });
        assert_eq!(err.to_string(), "unknown role: bogus");
    }

    #[test]
    fn terminal_turn_states_are_final() {
        for from in [TurnStatus::Succeeded, TurnStatus::Failed, TurnStatus::Canceled] {
            for to in TurnStatus::ALL {
                assert!(!from.can_transition_to(*to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn waiting_for_user_only_from_running() {
        for from in TurnStatus::ALL {
            let allowed = from.can_transition_to(TurnStatus::WaitingForUser);
            assert_eq!(allowed, *from == TurnStatus::Running, "{from}");
        }
    }

    #[test]
    fn waiting_for_user_exits() {
        let from = TurnStatus::WaitingForUser;
        assert!(from.can_transition_to(TurnStatus::Running));
        assert!(from.can_transition_to(TurnStatus::Failed));
        assert!(from.can_transition_to(TurnStatus::Canceled));
        assert!(!from.can_transition_to(TurnStatus::Succeeded));
        assert!(!from.can_transition_to(TurnStatus::Pending));
    }

    #[test]
    fn self_transition_not_allowed() {
        assert!(!TurnStatus::Running.can_transition_to(TurnStatus::Running));
    }

    #[test]
    fn call_status_terminal_is_sticky() {
        assert!(CallStatus::Completed.can_transition_to(CallStatus::Completed));
        assert!(!CallStatus::Completed.can_transition_to(CallStatus::Failed));
        assert!(!CallStatus::Running.can_transition_to(CallStatus::Queued));
        assert!(CallStatus::Queued.can_transition_to(CallStatus::Completed));
    }

    #[test]
    fn visibility_defaults_private() {
        assert_eq!(Visibility::default(), Visibility::Private);
    }
}
