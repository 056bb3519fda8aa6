//! Per-conversation token and cost accounting.
//!
//! Two lock levels: the outer `RwLock` only guards entry creation and lookup,
//! and each conversation's counters sit behind their own `Mutex`. Concurrent
//! reports for different conversations never contend on counters.
//!
//! `remove` retires an entry under its own mutex, so a report that raced the
//! removal lands in a fresh entry instead of an unlinked one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use convo_core::{ConversationId, ModelUsage, UsageDelta, UsageError, UsageSink};

struct Entry {
    /// `None` once the entry has been removed.
    by_model: Mutex<Option<HashMap<String, ModelUsage>>>,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            by_model: Mutex::new(Some(HashMap::new())),
        }
    }
}

impl Entry {
    /// Returns false when the entry is retired.
    fn add(&self, model: &str, delta: &UsageDelta) -> bool {
        match self.by_model.lock().as_mut() {
            Some(by_model) => {
                by_model.entry(model.to_string()).or_default().add(delta);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> HashMap<String, ModelUsage> {
        self.by_model.lock().clone().unwrap_or_default()
    }
}

/// In-memory usage totals keyed by conversation and model.
#[derive(Default)]
pub struct UsageAggregator {
    entries: RwLock<HashMap<ConversationId, Arc<Entry>>>,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, conversation_id: &ConversationId) -> Arc<Entry> {
        if let Some(entry) = self.entries.read().get(conversation_id) {
            return Arc::clone(entry);
        }
        let mut entries = self.entries.write();
        Arc::clone(entries.entry(conversation_id.clone()).or_default())
    }

    /// Merge a delta. Fails without changing anything when the cost is
    /// negative or not finite.
    pub fn record(
        &self,
        conversation_id: &ConversationId,
        model: &str,
        delta: UsageDelta,
    ) -> Result<(), UsageError> {
        let delta = delta.validated()?;
        while !self.entry(conversation_id).add(model, &delta) {}
        debug!(conversation_id = %conversation_id, model, "usage recorded");
        Ok(())
    }

    /// Sum across models, taken from one snapshot of the entry.
    pub fn totals(&self, conversation_id: &ConversationId) -> ModelUsage {
        let Some(entry) = self.entries.read().get(conversation_id).cloned() else {
            return ModelUsage::default();
        };
        entry
            .snapshot()
            .values()
            .fold(ModelUsage::default(), |mut acc, u| {
                acc.absorb(u);
                acc
            })
    }

    /// Per-model counters for a conversation.
    pub fn by_model(&self, conversation_id: &ConversationId) -> HashMap<String, ModelUsage> {
        self.entries
            .read()
            .get(conversation_id)
            .map(|entry| entry.snapshot())
            .unwrap_or_default()
    }

    /// Conversations with any recorded usage.
    pub fn conversations(&self) -> Vec<ConversationId> {
        self.entries.read().keys().cloned().collect()
    }

    /// Drop a conversation's counters. Returns whether it existed.
    pub fn remove(&self, conversation_id: &ConversationId) -> bool {
        let Some(entry) = self.entries.write().remove(conversation_id) else {
            return false;
        };
        *entry.by_model.lock() = None;
        true
    }
}

impl UsageSink for UsageAggregator {
    fn on_usage(
        &self,
        conversation_id: &ConversationId,
        model: &str,
        delta: UsageDelta,
    ) -> Result<(), UsageError> {
        self.record(conversation_id, model, delta)
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_across_models() {
        let agg = UsageAggregator::new();
        let c = ConversationId::from("c1");
        agg.record(&c, "gpt", UsageDelta::chat(10, 5).with_cost(0.5)).unwrap();
        agg.record(&c, "gpt", UsageDelta::chat(1, 1)).unwrap();
        agg.record(&c, "embed", UsageDelta::embedding(7).with_cost(0.25)).unwrap();

        let totals = agg.totals(&c);
        assert_eq!(totals.prompt_tokens, 11);
        assert_eq!(totals.completion_tokens, 6);
        assert_eq!(totals.embedding_tokens, 7);
        assert_eq!(totals.calls, 3);
        assert!((totals.cost - 0.75).abs() < f64::EPSILON);

        let by_model = agg.by_model(&c);
        assert_eq!(by_model["gpt"].calls, 2);
        assert_eq!(by_model["embed"].embedding_tokens, 7);
    }

    #[test]
    fn invalid_cost_is_rejected_without_side_effects() {
        let agg = UsageAggregator::new();
        let c = ConversationId::from("c1");
        assert!(agg.record(&c, "gpt", UsageDelta::prompt(1).with_cost(-1.0)).is_err());
        assert!(agg.record(&c, "gpt", UsageDelta::prompt(1).with_cost(f64::NAN)).is_err());
        assert_eq!(agg.totals(&c), ModelUsage::default());
        assert!(agg.conversations().is_empty());
    }

    #[test]
    fn report_on_removed_entry_goes_to_a_fresh_one() {
        let agg = UsageAggregator::new();
        let c = ConversationId::from("c1");
        agg.record(&c, "gpt", UsageDelta::prompt(3)).unwrap();
        let stale = agg.entry(&c);

        assert!(agg.remove(&c));
        assert!(!stale.add("gpt", &UsageDelta::prompt(1)));
        assert_eq!(agg.totals(&c), ModelUsage::default());

        agg.record(&c, "gpt", UsageDelta::prompt(2)).unwrap();
        assert_eq!(agg.totals(&c).prompt_tokens, 2);
        assert!(!agg.remove(&ConversationId::from("nope")));
    }

    #[test]
    fn unknown_conversation_has_zero_totals() {
        let agg = UsageAggregator::new();
        assert_eq!(agg.totals(&ConversationId::from("nope")), ModelUsage::default());
        assert!(!agg.remove(&ConversationId::from("nope")));
    }

    #[test]
    fn remove_forgets_conversation() {
        let agg = UsageAggregator::new();
        let c = ConversationId::from("c1");
        agg.on_usage(&c, "gpt", UsageDelta::prompt(3)).unwrap();
        assert_eq!(agg.conversations(), vec![c.clone()]);
        assert!(agg.remove(&c));
        assert_eq!(agg.totals(&c).prompt_tokens, 0);
    }
}
