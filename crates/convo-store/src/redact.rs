//! Secret scrubbing applied to payload bodies before they are persisted.

use std::borrow::Cow;

use regex::bytes::Regex;

use convo_settings::RedactionSettings;

use crate::error::{Result, StoreError};

const REPLACEMENT: &[u8] = b"[REDACTED]";

/// Compiled redaction policy.
pub struct Redactor {
    patterns: Vec<Regex>,
    policy: String,
}

/// Outcome of [`Redactor::apply`].
pub struct Redacted<'a> {
    pub bytes: Cow<'a, [u8]>,
    /// Policy version when at least one match was replaced.
    pub policy: Option<&'a str>,
}

impl Redactor {
    /// Compile the configured patterns; `None` when redaction is disabled.
    pub fn from_settings(settings: &RedactionSettings) -> Result<Option<Self>> {
        if !settings.enabled {
            return Ok(None);
        }
        let patterns = settings
            .patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| StoreError::Config(format!("redaction pattern {p:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(Self {
            patterns,
            policy: settings.policy_version.clone(),
        }))
    }

    pub fn policy_version(&self) -> &str {
        &self.policy
    }

    /// Replace every match with `[REDACTED]`.
    pub fn apply<'a>(&'a self, bytes: &'a [u8]) -> Redacted<'a> {
        let mut out = Cow::Borrowed(bytes);
        for re in &self.patterns {
            let replaced = match re.replace_all(&out, REPLACEMENT) {
                Cow::Owned(v) => Some(v),
                Cow::Borrowed(_) => None,
            };
            if let Some(v) = replaced {
                out = Cow::Owned(v);
            }
        }
        let policy = matches!(out, Cow::Owned(_)).then_some(self.policy.as_str());
        Redacted { bytes: out, policy }
    }
}
