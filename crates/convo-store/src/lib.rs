//! # convo-store
//!
//! Persistence for the conversation ledger.
//!
//! - [`LedgerStore`]: conversations, turns, messages, and call rows, with a
//!   SQLite backend ([`SqliteLedger`]) and an in-memory one ([`MemoryLedger`])
//! - [`PayloadStore`]: redacted, content-addressed request/response bodies,
//!   inline or in an [`ObjectStore`]
//! - [`CallRecorder`]: turns dispatcher [`CallEvent`]s into call rows and
//!   forwards model usage
//! - [`Database`]: shared SQLite connection with versioned migrations

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod migrations;
pub mod object_store;
pub mod payload_store;
pub mod recorder;
pub mod records;
pub mod redact;
pub mod row_helpers;
pub mod sqlite;

pub use database::Database;
pub use error::{Result, StoreError};
pub use ledger::LedgerStore;
pub use memory::MemoryLedger;
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use payload_store::{digest_hex, PayloadStore, PutOptions};
pub use recorder::{CallEvent, CallRecorder, ModelBodies};
pub use records::{
    CallPayload, Conversation, ConversationFilter, Message, ModelCall, ModelCallPayloads,
    ModelCallRecord, NewConversation, NewMessage, PayloadBody, RecordedModelCall, StartTurn,
    TokenCounts, ToolCall, ToolCallRecord, Turn,
};
pub use redact::Redactor;
pub use sqlite::SqliteLedger;
