//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]`. Each type implements
//! [`Default`] with production values, and `#[serde(default)]` lets partial
//! JSON fill missing fields from those defaults.

mod runtime;
mod storage;

pub use runtime::*;
pub use storage::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// Loaded from `~/.convo/settings.json` with defaults applied for missing
/// fields. Environment variables override specific values. Example:
///
/// ```json
/// {
///   "payload": { "inlineThresholdBytes": 4096 },
///   "preview": { "agedAfterSteps": 4 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvoSettings {
    /// Ledger database location and connection tuning.
    pub database: DatabaseSettings,
    /// Payload storage thresholds and redaction.
    pub payload: PayloadSettings,
    /// Preview/summarization budgets.
    pub preview: PreviewSettings,
    /// Interactive elicitation limits.
    pub elicitation: ElicitationSettings,
    /// Conversation retention.
    pub retention: RetentionSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl ConvoSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let p = &self.preview;
        if p.summarize_chunk_bytes == 0 {
            return Err(SettingsError::invalid("preview.summarizeChunkBytes", "must be > 0"));
        }
        if p.match_chunk_bytes == 0 {
            return Err(SettingsError::invalid("preview.matchChunkBytes", "must be > 0"));
        }
        if p.match_overlap_bytes >= p.match_chunk_bytes {
            return Err(SettingsError::invalid(
                "preview.matchOverlapBytes",
                format!(
                    "{} is not smaller than matchChunkBytes ({})",
                    p.match_overlap_bytes, p.match_chunk_bytes
                ),
            ));
        }
        if p.aged_limit_bytes > p.preview_limit_bytes {
            return Err(SettingsError::invalid(
                "preview.agedLimitBytes",
                format!(
                    "{} exceeds previewLimitBytes ({})",
                    p.aged_limit_bytes, p.preview_limit_bytes
                ),
            ));
        }
        let payload = &self.payload;
        if payload.fallback_inline_max_bytes < payload.inline_threshold_bytes {
            return Err(SettingsError::invalid(
                "payload.fallbackInlineMaxBytes",
                format!(
                    "{} is below inlineThresholdBytes ({})",
                    payload.fallback_inline_max_bytes, payload.inline_threshold_bytes
                ),
            ));
        }
        if self.elicitation.max_attempts == 0 {
            return Err(SettingsError::invalid("elicitation.maxAttempts", "must be > 0"));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
