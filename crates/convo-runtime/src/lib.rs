//! # convo-runtime
//!
//! Services that sit on top of the conversation ledger:
//!
//! - **Usage**: [`UsageAggregator`] keeps per-conversation, per-model token
//!   and cost totals and is the [`UsageSink`](convo_core::UsageSink) the call
//!   recorder reports into
//! - **Elicitation**: per-conversation awaiters that block a turn until the
//!   user answers a JSON-Schema-shaped request
//! - **Preview**: windowed reads, summaries, and pattern scans over large
//!   message bodies
//! - **Runtime**: wires all of the above from [`ConvoSettings`](convo_settings::ConvoSettings)

#![deny(unsafe_code)]

pub mod elicitation;
pub mod errors;
pub mod preview;
pub mod runtime;
pub mod usage;

pub use elicitation::{
    Awaiter, AwaiterFactory, AwaiterRegistry, AwaiterState, ChannelResolver, ElicitationFlow,
    ElicitationOutcome, ElicitationRequest, ElicitationResult, InteractiveAwaiter, Prompt, Reply,
    Resolver, SchemaValidator,
};
pub use errors::{CancelReason, ErrorKind, Result, RuntimeError};
pub use preview::{MatchHit, PreviewService, PreviewWindow, Summarizer};
pub use runtime::{init_logging, Runtime};
pub use usage::UsageAggregator;
