//! Token and cost accounting value types.
//!
//! Counters are unsigned so a delta can never decrease a total. Cost is the
//! one floating-point field; producers validate it with
//! [`UsageDelta::is_valid`] before merging.

use serde::{Deserialize, Serialize};

use crate::ids::ConversationId;

/// Rejected usage report.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum UsageError {
    /// Cost was negative, NaN, or infinite.
    #[error("invalid cost {0}: must be finite and non-negative")]
    InvalidCost(f64),
}

/// Receiver of per-call usage reports from model and embedding clients.
pub trait UsageSink: Send + Sync {
    /// Merge `delta` into the counters for `(conversation_id, model)`.
    fn on_usage(
        &self,
        conversation_id: &ConversationId,
        model: &str,
        delta: UsageDelta,
    ) -> Result<(), UsageError>;
}

/// Usage reported by a single model or embedding call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageDelta {
    /// Prompt (input) tokens.
    pub prompt_tokens: u64,
    /// Completion (output) tokens.
    pub completion_tokens: u64,
    /// Embedding input tokens.
    pub embedding_tokens: u64,
    /// Prompt tokens served from the provider cache.
    pub cached_tokens: u64,
    /// Cost in USD.
    pub cost: f64,
}

impl UsageDelta {
    /// Prompt-only delta.
    #[must_use]
    pub fn prompt(tokens: u64) -> Self {
        Self {
            prompt_tokens: tokens,
            ..Self::default()
        }
    }

    /// Prompt + completion delta.
    #[must_use]
    pub fn chat(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            ..Self::default()
        }
    }

    /// Embedding-only delta.
    #[must_use]
    pub fn embedding(tokens: u64) -> Self {
        Self {
            embedding_tokens: tokens,
            ..Self::default()
        }
    }

    /// Attach a cost.
    #[must_use]
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// A delta is valid when its cost is finite and non-negative.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.cost.is_finite() && self.cost >= 0.0
    }

    /// Return `self` if valid, else the reason it is not.
    pub fn validated(self) -> Result<Self, UsageError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(UsageError::InvalidCost(self.cost))
        }
    }
}

/// Accumulated counters for one (conversation, model) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelUsage {
    /// Prompt (input) tokens.
    pub prompt_tokens: u64,
    /// Completion (output) tokens.
    pub completion_tokens: u64,
    /// Embedding input tokens.
    pub embedding_tokens: u64,
    /// Cached prompt tokens.
    pub cached_tokens: u64,
    /// Number of merged deltas.
    pub calls: u64,
    /// Cost in USD.
    pub cost: f64,
}

impl ModelUsage {
    /// Merge a delta. Saturates instead of wrapping.
    pub fn add(&mut self, delta: &UsageDelta) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(delta.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(delta.completion_tokens);
        self.embedding_tokens = self.embedding_tokens.saturating_add(delta.embedding_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(delta.cached_tokens);
        self.calls = self.calls.saturating_add(1);
        self.cost += delta.cost;
    }

    /// Merge another accumulated entry.
    pub fn absorb(&mut self, other: &ModelUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.embedding_tokens = self.embedding_tokens.saturating_add(other.embedding_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
        self.calls = self.calls.saturating_add(other.calls);
        self.cost += other.cost;
    }

    /// Prompt + completion + embedding tokens.
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens
            .saturating_add(self.completion_tokens)
            .saturating_add(self.embedding_tokens)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_accumulates_and_counts_calls() {
        let mut usage = ModelUsage::default();
        usage.add(&UsageDelta::chat(10, 5).with_cost(0.01));
        usage.add(&UsageDelta::chat(3, 2));
        assert_eq!(usage.prompt_tokens, 13);
        assert_eq!(usage.completion_tokens, 7);
        assert_eq!(usage.calls, 2);
        assert!((usage.cost - 0.01).abs() < f64::EPSILON);
        assert_eq!(usage.total_tokens(), 20);
    }

    #[test]
    fn add_saturates() {
        let mut usage = ModelUsage {
            prompt_tokens: u64::MAX - 1,
            ..Default::default()
        };
        usage.add(&UsageDelta::prompt(10));
        assert_eq!(usage.prompt_tokens, u64::MAX);
    }

    #[test]
    fn negative_or_nan_cost_is_invalid() {
        assert!(UsageDelta::prompt(1).is_valid());
        assert!(!UsageDelta::prompt(1).with_cost(-0.5).is_valid());
        assert!(!UsageDelta::prompt(1).with_cost(f64::NAN).is_valid());
        assert_eq!(
            UsageDelta::prompt(1).with_cost(-1.0).validated(),
            Err(UsageError::InvalidCost(-1.0))
        );
    }

    #[test]
    fn absorb_merges_entries() {
        let mut a = ModelUsage::default();
        a.add(&UsageDelta::embedding(4));
        let mut b = ModelUsage::default();
        b.add(&UsageDelta::prompt(6));
        a.absorb(&b);
        assert_eq!(a.embedding_tokens, 4);
        assert_eq!(a.prompt_tokens, 6);
        assert_eq!(a.calls, 2);
    }

    #[test]
    fn serde_camel_case() {
        let json = serde_json::to_value(UsageDelta::chat(1, 2)).unwrap();
        assert_eq!(json["promptTokens"], 1);
        assert_eq!(json["completionTokens"], 2);
    }
}
