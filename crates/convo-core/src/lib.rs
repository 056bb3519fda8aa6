//! # convo-core
//!
//! Shared vocabulary for the conversation ledger runtime.
//!
//! - **Branded IDs**: `ConversationId`, `TurnId`, `MessageId`, `PayloadId`,
//!   `ElicitationId` as newtypes
//! - **Status enums**: turn, message, call, payload, and visibility states with
//!   stable wire strings and transition rules
//! - **Usage**: `UsageDelta` / `ModelUsage` token and cost counters and the
//!   `UsageSink` boundary trait
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod status;
pub mod usage;

pub use ids::{ConversationId, ElicitationId, MessageId, PayloadId, TurnId};
pub use status::{
    CallStatus, MessageStatus, MessageType, ModelKind, PayloadKind, Role, StorageKind,
    TurnStatus, UnknownVariant, Visibility,
};
pub use usage::{ModelUsage, UsageDelta, UsageError, UsageSink};
