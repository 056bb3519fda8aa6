//! Delivery of prompts to whoever answers them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use convo_core::ElicitationId;

use super::{Prompt, Reply};
use crate::errors::{CancelReason, Result, RuntimeError};

/// Answers prompts, typically by asking a human.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Present `prompt` and wait for the reply. Dropping the future
    /// abandons the prompt.
    async fn resolve(&self, prompt: Prompt) -> Result<Reply>;
}

type Pending = Arc<Mutex<HashMap<ElicitationId, oneshot::Sender<Reply>>>>;

/// Removes the pending slot when a wait ends for any reason.
struct PendingGuard {
    pending: Pending,
    id: ElicitationId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let _ = self.pending.lock().remove(&self.id);
    }
}

/// Resolver for adapters: prompts arrive on a channel and answers come back
/// through [`respond`](ChannelResolver::respond).
pub struct ChannelResolver {
    prompts: mpsc::UnboundedSender<Prompt>,
    pending: Pending,
}

impl ChannelResolver {
    /// Create the resolver and the receiving end for the adapter.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Prompt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let resolver = Self {
            prompts: tx,
            pending: Arc::new(Mutex::new(HashMap::new())),
        };
        (resolver, rx)
    }

    /// Deliver a reply. Returns `false` when nothing waits on `id`.
    pub fn respond(&self, id: &ElicitationId, reply: Reply) -> bool {
        match self.pending.lock().remove(id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn is_pending(&self, id: &ElicitationId) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl Resolver for ChannelResolver {
    async fn resolve(&self, prompt: Prompt) -> Result<Reply> {
        let id = prompt.elicitation_id.clone();
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: id.clone(),
        };

        if self.prompts.send(prompt).is_err() {
            debug!(elicitation_id = %id, "prompt channel closed");
            return Err(RuntimeError::cancelled(CancelReason::Canceled));
        }
        rx.await
            .map_err(|_| RuntimeError::cancelled(CancelReason::Canceled))
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use convo_core::ConversationId;
    use serde_json::json;

    fn prompt(id: &ElicitationId) -> Prompt {
        Prompt {
            elicitation_id: id.clone(),
            conversation_id: ConversationId::from("c1"),
            message: "pick".into(),
            schema: json!({"type": "object"}),
            attempt: 1,
            error: None,
        }
    }

    #[tokio::test]
    async fn respond_delivers_reply() {
        let (resolver, mut rx) = ChannelResolver::new();
        let resolver = Arc::new(resolver);
        let id = ElicitationId::new();

        let waiter = {
            let resolver = Arc::clone(&resolver);
            let p = prompt(&id);
            tokio::spawn(async move { resolver.resolve(p).await })
        };
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.elicitation_id, id);
        assert!(resolver.respond(&id, Reply::Cancel));

        assert_eq!(waiter.await.unwrap().unwrap(), Reply::Cancel);
        assert_eq!(resolver.pending_count(), 0);
    }

    #[tokio::test]
    async fn respond_to_unknown_id_is_false() {
        let (resolver, _rx) = ChannelResolver::new();
        assert!(!resolver.respond(&ElicitationId::new(), Reply::Cancel));
    }

    #[tokio::test]
    async fn dropped_wait_clears_pending() {
        let (resolver, _rx) = ChannelResolver::new();
        let id = ElicitationId::new();
        let wait = resolver.resolve(prompt(&id));
        let timed_out =
            tokio::time::timeout(std::time::Duration::from_millis(10), wait).await;
        assert!(timed_out.is_err());
        assert!(!resolver.is_pending(&id));
    }

    #[tokio::test]
    async fn closed_channel_cancels() {
        let (resolver, rx) = ChannelResolver::new();
        drop(rx);
        let err = resolver.resolve(prompt(&ElicitationId::new())).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Cancelled { .. }));
    }
}
