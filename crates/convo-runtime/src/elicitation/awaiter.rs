//! Per-conversation rendezvous between a blocked turn and its resolver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use convo_core::{ConversationId, ElicitationId};
use convo_settings::ElicitationSettings;

use super::schema::SchemaValidator;
use super::{ElicitationRequest, ElicitationResult, Prompt, Reply, Resolver};
use crate::errors::{CancelReason, Result, RuntimeError};

/// Blocks until an elicitation is answered, declined, or canceled.
#[async_trait]
pub trait Awaiter: Send + Sync {
    async fn await_elicitation(
        &self,
        cancel: &CancellationToken,
        request: ElicitationRequest,
    ) -> Result<ElicitationResult>;

    fn state(&self) -> AwaiterState;
}

/// Observable awaiter state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AwaiterState {
    Idle,
    Blocked(ElicitationId),
}

/// Marks the awaiter idle again when a wait ends.
struct ActiveGuard<'a> {
    active: &'a Mutex<Option<ElicitationId>>,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Awaiter that prompts through a [`Resolver`] and re-prompts on invalid
/// answers, up to `max_attempts`.
pub struct InteractiveAwaiter {
    conversation_id: ConversationId,
    resolver: Arc<dyn Resolver>,
    max_attempts: u32,
    default_timeout: Option<Duration>,
    active: Mutex<Option<ElicitationId>>,
}

impl InteractiveAwaiter {
    pub fn new(
        conversation_id: ConversationId,
        resolver: Arc<dyn Resolver>,
        settings: &ElicitationSettings,
    ) -> Self {
        Self {
            conversation_id,
            resolver,
            max_attempts: settings.max_attempts.max(1),
            default_timeout: settings.default_timeout_ms.map(Duration::from_millis),
            active: Mutex::new(None),
        }
    }

    fn begin(&self, id: &ElicitationId) -> Result<ActiveGuard<'_>> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(RuntimeError::InvalidState(format!(
                "conversation {} is already waiting on elicitation {current}",
                self.conversation_id
            )));
        }
        *active = Some(id.clone());
        Ok(ActiveGuard {
            active: &self.active,
        })
    }
}

#[async_trait]
impl Awaiter for InteractiveAwaiter {
    #[instrument(skip_all, fields(conversation_id = %self.conversation_id, elicitation_id = %request.id))]
    async fn await_elicitation(
        &self,
        cancel: &CancellationToken,
        request: ElicitationRequest,
    ) -> Result<ElicitationResult> {
        let validator = SchemaValidator::new(&request.schema)?;
        let _active = self.begin(&request.id)?;
        let deadline = request
            .timeout
            .or(self.default_timeout)
            .map(|t| Instant::now() + t);

        let mut last_error: Option<String> = None;
        for attempt in 1..=self.max_attempts {
            let prompt = Prompt {
                elicitation_id: request.id.clone(),
                conversation_id: self.conversation_id.clone(),
                message: request.message.clone(),
                schema: request.schema.clone(),
                attempt,
                error: last_error.clone(),
            };
            let reply = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("elicitation canceled");
                    return Err(RuntimeError::cancelled(CancelReason::Canceled));
                }
                () = deadline_reached(deadline) => {
                    debug!("elicitation deadline exceeded");
                    return Err(RuntimeError::cancelled(CancelReason::DeadlineExceeded));
                }
                reply = self.resolver.resolve(prompt) => reply?,
            };

            match reply {
                Reply::Accept { content } => match validator.validate(content) {
                    Ok(value) => {
                        debug!(attempt, "elicitation accepted");
                        return Ok(ElicitationResult::Accept(value));
                    }
                    Err(message) => {
                        warn!(attempt, error = %message, "elicitation answer rejected");
                        last_error = Some(message);
                    }
                },
                Reply::Decline { reason } => {
                    debug!("elicitation declined");
                    return Ok(ElicitationResult::Decline { reason });
                }
                Reply::Cancel => return Err(RuntimeError::cancelled(CancelReason::Canceled)),
            }
        }

        Err(RuntimeError::Validation {
            message: last_error.unwrap_or_default(),
            attempts: self.max_attempts,
        })
    }

    fn state(&self) -> AwaiterState {
        match self.active.lock().as_ref() {
            Some(id) => AwaiterState::Blocked(id.clone()),
            None => AwaiterState::Idle,
        }
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    /// Replays scripted replies and records the prompts it saw.
    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        seen: Mutex<Vec<Prompt>>,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Resolver for Scripted {
        async fn resolve(&self, prompt: Prompt) -> Result<Reply> {
            self.seen.lock().push(prompt);
            let next = self.replies.lock().pop_front();
            match next {
                Some(reply) => Ok(reply),
                None => std::future::pending().await,
            }
        }
    }

    fn settings(max_attempts: u32) -> ElicitationSettings {
        ElicitationSettings {
            max_attempts,
            default_timeout_ms: None,
        }
    }

    fn size_request() -> ElicitationRequest {
        ElicitationRequest::new(
            "Which size?",
            json!({
                "type": "object",
                "properties": {"size": {"type": "string", "enum": ["S", "M", "L"]}},
                "required": ["size"]
            }),
        )
    }

    fn accept(v: Value) -> Reply {
        Reply::Accept { content: v }
    }

    #[tokio::test]
    async fn reprompts_with_error_then_accepts() {
        let resolver = Scripted::new(vec![
            accept(json!({"size": "XL"})),
            accept(json!({"size": "M"})),
        ]);
        let awaiter = InteractiveAwaiter::new("c1".into(), resolver.clone(), &settings(3));

        let result = awaiter
            .await_elicitation(&CancellationToken::new(), size_request())
            .await
            .unwrap();
        assert_eq!(result, ElicitationResult::Accept(json!({"size": "M"})));

        let seen = resolver.seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].error.is_none());
        assert_eq!(seen[1].attempt, 2);
        assert!(seen[1].error.is_some());
        assert_eq!(awaiter.state(), AwaiterState::Idle);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let resolver = Scripted::new(vec![
            accept(json!({"size": "XL"})),
            accept(json!({"size": "XXL"})),
        ]);
        let awaiter = InteractiveAwaiter::new("c1".into(), resolver, &settings(2));
        let err = awaiter
            .await_elicitation(&CancellationToken::new(), size_request())
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::Validation { attempts: 2, .. });
    }

    #[tokio::test]
    async fn decline_is_not_an_error() {
        let resolver = Scripted::new(vec![Reply::Decline {
            reason: Some("not now".into()),
        }]);
        let awaiter = InteractiveAwaiter::new("c1".into(), resolver, &settings(3));
        let result = awaiter
            .await_elicitation(&CancellationToken::new(), size_request())
            .await
            .unwrap();
        assert_eq!(
            result,
            ElicitationResult::Decline {
                reason: Some("not now".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels() {
        let awaiter = InteractiveAwaiter::new("c1".into(), Scripted::new(vec![]), &settings(3));
        let err = awaiter
            .await_elicitation(
                &CancellationToken::new(),
                size_request().with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_matches!(
            err,
            RuntimeError::Cancelled {
                reason: CancelReason::DeadlineExceeded
            }
        );
        assert_eq!(awaiter.state(), AwaiterState::Idle);
    }

    #[tokio::test]
    async fn token_cancels() {
        let awaiter = Arc::new(InteractiveAwaiter::new(
            "c1".into(),
            Scripted::new(vec![]),
            &settings(3),
        ));
        let token = CancellationToken::new();
        let task = {
            let awaiter = Arc::clone(&awaiter);
            let token = token.clone();
            tokio::spawn(async move { awaiter.await_elicitation(&token, size_request()).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_matches!(
            err,
            RuntimeError::Cancelled {
                reason: CancelReason::Canceled
            }
        );
    }

    #[tokio::test]
    async fn second_concurrent_wait_is_rejected() {
        let awaiter = Arc::new(InteractiveAwaiter::new(
            "c1".into(),
            Scripted::new(vec![]),
            &settings(3),
        ));
        let token = CancellationToken::new();
        let first = {
            let awaiter = Arc::clone(&awaiter);
            let token = token.clone();
            tokio::spawn(async move { awaiter.await_elicitation(&token, size_request()).await })
        };
        while awaiter.state() == AwaiterState::Idle {
            tokio::task::yield_now().await;
        }
        let err = awaiter
            .await_elicitation(&token, size_request())
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::InvalidState(_));
        token.cancel();
        let _ = first.await;
    }
}
