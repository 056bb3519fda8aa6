//! Database, payload, and retention settings.

use serde::{Deserialize, Serialize};

/// Ledger database settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    /// SQLite file path. `:memory:` opens a private in-memory database.
    pub path: String,
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            path: format!("{home}/.convo/ledger.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Payload store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PayloadSettings {
    /// Tenant namespace used for dedup lookups and object keys.
    pub tenant: String,
    /// Bodies at or below this size are stored inline.
    pub inline_threshold_bytes: u64,
    /// When the object store fails, bodies up to this size fall back to inline.
    pub fallback_inline_max_bytes: u64,
    /// Characters kept in the row preview of an externalized body.
    pub preview_chars: usize,
    /// Root directory of the filesystem object store.
    pub object_root: String,
    /// Redaction applied before any write.
    pub redaction: RedactionSettings,
}

impl Default for PayloadSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            tenant: "default".to_string(),
            inline_threshold_bytes: 8_192,
            fallback_inline_max_bytes: 65_536,
            preview_chars: 256,
            object_root: format!("{home}/.convo/objects"),
            redaction: RedactionSettings::default(),
        }
    }
}

/// Regex-based redaction policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedactionSettings {
    /// Whether redaction runs at all.
    pub enabled: bool,
    /// Patterns whose matches are replaced with `[REDACTED]`.
    pub patterns: Vec<String>,
    /// Version recorded on every redacted payload.
    pub policy_version: String,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            patterns: vec![
                r"sk-[A-Za-z0-9_\-]{16,}".to_string(),
                r"(?i)bearer\s+[A-Za-z0-9._\-]+".to_string(),
            ],
            policy_version: "v1".to_string(),
        }
    }
}

/// Conversation retention.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionSettings {
    /// TTL applied to new conversations that do not set their own.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_ttl_secs: Option<u64>,
}
