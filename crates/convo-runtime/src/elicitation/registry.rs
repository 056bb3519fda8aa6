//! Lazily created awaiters, one per conversation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use convo_core::ConversationId;

use super::Awaiter;

/// Builds the awaiter for a conversation on first use.
pub type AwaiterFactory = Arc<dyn Fn(&ConversationId) -> Arc<dyn Awaiter> + Send + Sync>;

/// Conversation id → awaiter. The factory runs at most once per id even
/// under concurrent `ensure` calls.
pub struct AwaiterRegistry {
    awaiters: RwLock<HashMap<ConversationId, Arc<dyn Awaiter>>>,
    factory: AwaiterFactory,
}

impl AwaiterRegistry {
    pub fn new(factory: AwaiterFactory) -> Self {
        Self {
            awaiters: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Return the conversation's awaiter, creating it if needed.
    pub fn ensure(&self, conversation_id: &ConversationId) -> Arc<dyn Awaiter> {
        if let Some(existing) = self.awaiters.read().get(conversation_id) {
            return Arc::clone(existing);
        }
        let mut awaiters = self.awaiters.write();
        if let Some(existing) = awaiters.get(conversation_id) {
            return Arc::clone(existing);
        }
        let created = (self.factory)(conversation_id);
        let _ = awaiters.insert(conversation_id.clone(), Arc::clone(&created));
        debug!(conversation_id = %conversation_id, "awaiter created");
        created
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<Arc<dyn Awaiter>> {
        self.awaiters.read().get(conversation_id).cloned()
    }

    /// Forget a conversation's awaiter. Returns whether one existed.
    pub fn remove(&self, conversation_id: &ConversationId) -> bool {
        self.awaiters.write().remove(conversation_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.awaiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.awaiters.read().is_empty()
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::elicitation::{ChannelResolver, InteractiveAwaiter};
    use convo_settings::ElicitationSettings;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_registry() -> (AwaiterRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let (resolver, _rx) = ChannelResolver::new();
        let resolver = Arc::new(resolver);
        let factory: AwaiterFactory = {
            let calls = Arc::clone(&calls);
            Arc::new(move |id: &ConversationId| {
                calls.fetch_add(1, Ordering::SeqCst);
                Arc::new(InteractiveAwaiter::new(
                    id.clone(),
                    resolver.clone(),
                    &ElicitationSettings::default(),
                )) as Arc<dyn Awaiter>
            })
        };
        (AwaiterRegistry::new(factory), calls)
    }

    #[test]
    fn ensure_reuses_awaiter() {
        let (registry, calls) = counting_registry();
        let c = ConversationId::from("c1");
        let a = registry.ensure(&c);
        let b = registry.ensure(&c);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_ensure_builds_once() {
        let (registry, calls) = counting_registry();
        let c = ConversationId::from("c1");
        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| registry.ensure(&c));
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_then_ensure_rebuilds() {
        let (registry, calls) = counting_registry();
        let c = ConversationId::from("c1");
        registry.ensure(&c);
        assert!(registry.remove(&c));
        assert!(registry.get(&c).is_none());
        registry.ensure(&c);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
