//! Ledger bookkeeping around one elicitation.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use convo_core::{MessageStatus, MessageType, PayloadKind, Role, TurnId, TurnStatus};
use convo_store::{LedgerStore, Message, NewMessage, PayloadStore};

use super::schema::SchemaValidator;
use super::{AwaiterRegistry, AwaiterState, ElicitationRequest, ElicitationResult};
use crate::errors::{CancelReason, Result, RuntimeError};

/// How an elicitation ended when it did not fail.
#[derive(Clone, Debug, PartialEq)]
pub enum ElicitationOutcome {
    /// The answer was recorded as a user message and the turn is running
    /// again.
    Accepted { value: Value, response: Message },
    /// The turn has been failed with the decline reason.
    Declined { reason: Option<String> },
}

/// Runs an elicitation for a turn and records every step in the ledger.
pub struct ElicitationFlow {
    ledger: Arc<dyn LedgerStore>,
    payloads: Arc<PayloadStore>,
    registry: Arc<AwaiterRegistry>,
}

impl ElicitationFlow {
    pub fn new(payloads: Arc<PayloadStore>, registry: Arc<AwaiterRegistry>) -> Self {
        Self {
            ledger: Arc::clone(payloads.ledger()),
            payloads,
            registry,
        }
    }

    /// Block `turn_id` on `request`.
    ///
    /// The schema and the conversation's awaiter are checked before anything
    /// is written, so a bad request leaves the turn untouched. After that the
    /// control message carrying the request is appended and the turn moves
    /// to `waiting_for_user`. A decline, timeout, cancellation or exhausted
    /// validation ends the turn `failed` with the reason on the control
    /// message; a timeout is recorded like a decline. Only the decline is
    /// returned as `Ok`.
    #[instrument(skip(self, cancel, request), fields(turn_id = %turn_id, elicitation_id = %request.id))]
    pub async fn elicit(
        &self,
        cancel: &CancellationToken,
        turn_id: &TurnId,
        request: ElicitationRequest,
    ) -> Result<ElicitationOutcome> {
        let turn = self.ledger.get_turn(turn_id)?;
        if turn.status != TurnStatus::Running {
            return Err(RuntimeError::InvalidState(format!(
                "turn {turn_id} is {} and cannot wait for user input",
                turn.status
            )));
        }
        let _ = SchemaValidator::new(&request.schema)?;
        let awaiter = self.registry.ensure(&turn.conversation_id);
        if let AwaiterState::Blocked(current) = awaiter.state() {
            return Err(RuntimeError::InvalidState(format!(
                "conversation {} is already waiting on elicitation {current}",
                turn.conversation_id
            )));
        }

        let request_payload = self
            .payloads
            .put_json(PayloadKind::ElicitationRequest, &request)?;
        let control = self.ledger.append_message(
            turn_id,
            NewMessage::new(Role::Assistant, MessageType::Control)
                .with_content(request.message.clone())
                .with_status(MessageStatus::Pending)
                .with_elicitation(request.id.clone())
                .with_payload(request_payload.id),
        )?;
        let _ = self
            .ledger
            .transition_turn(turn_id, TurnStatus::WaitingForUser, None)?;

        match awaiter.await_elicitation(cancel, request).await {
            Ok(ElicitationResult::Accept(value)) => {
                self.accepted(turn_id, &control, value).inspect_err(|err| {
                    self.record_failure(turn_id, &control, MessageStatus::Rejected, err);
                })
            }
            Ok(ElicitationResult::Decline { reason }) => {
                let text = reason.as_deref().unwrap_or("declined by user");
                self.close_failed(turn_id, &control, MessageStatus::Rejected, text)?;
                info!(reason = text, "elicitation declined");
                Ok(ElicitationOutcome::Declined { reason })
            }
            // Another elicitation claimed the awaiter after the idle check.
            Err(err @ RuntimeError::InvalidState(_)) => {
                let text = err.to_string();
                let restored = self
                    .ledger
                    .set_message_status(&control.id, Some(MessageStatus::Cancel), Some(&text))
                    .and_then(|_| {
                        self.ledger
                            .transition_turn(turn_id, TurnStatus::Running, None)
                    });
                if let Err(record_err) = restored {
                    warn!(error = %record_err, "failed to restore turn after elicitation conflict");
                }
                Err(err)
            }
            Err(err) => {
                let status = match err {
                    RuntimeError::Cancelled {
                        reason: CancelReason::Canceled,
                    } => MessageStatus::Cancel,
                    _ => MessageStatus::Rejected,
                };
                self.record_failure(turn_id, &control, status, &err);
                Err(err)
            }
        }
    }

    fn accepted(
        &self,
        turn_id: &TurnId,
        control: &Message,
        value: Value,
    ) -> Result<ElicitationOutcome> {
        let payload = self
            .payloads
            .put_json(PayloadKind::ElicitationResponse, &value)?;
        let _ = self
            .ledger
            .set_message_status(&control.id, Some(MessageStatus::Accepted), None)?;

        let mut response = NewMessage::text(Role::User, value.to_string())
            .with_parent(control.id.clone())
            .with_payload(payload.id);
        if let Some(elicitation_id) = &control.elicitation_id {
            response = response.with_elicitation(elicitation_id.clone());
        }
        let response = self.ledger.append_message(turn_id, response)?;
        let _ = self
            .ledger
            .transition_turn(turn_id, TurnStatus::Running, None)?;
        info!(message_id = %response.id, "elicitation accepted");
        Ok(ElicitationOutcome::Accepted { value, response })
    }

    /// Best effort: the original error is what the caller sees.
    fn record_failure(
        &self,
        turn_id: &TurnId,
        control: &Message,
        status: MessageStatus,
        err: &RuntimeError,
    ) {
        if let Err(record_err) = self.close_failed(turn_id, control, status, &err.to_string()) {
            warn!(error = %record_err, "failed to record elicitation failure");
        }
    }

    fn close_failed(
        &self,
        turn_id: &TurnId,
        control: &Message,
        status: MessageStatus,
        reason: &str,
    ) -> Result<()> {
        let _ = self
            .ledger
            .set_message_status(&control.id, Some(status), Some(reason))?;
        let _ = self
            .ledger
            .transition_turn(turn_id, TurnStatus::Failed, Some(reason))?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::elicitation::{
        Awaiter, AwaiterFactory, ChannelResolver, InteractiveAwaiter, Prompt, Reply,
    };
    use assert_matches::assert_matches;
    use convo_core::ConversationId;
    use convo_settings::{ElicitationSettings, PayloadSettings};
    use convo_store::{MemoryLedger, MemoryObjectStore, NewConversation, StartTurn};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        flow: ElicitationFlow,
        ledger: Arc<dyn LedgerStore>,
        resolver: Arc<ChannelResolver>,
        prompts: tokio::sync::mpsc::UnboundedReceiver<Prompt>,
        turn: TurnId,
    }

    fn fixture() -> Fixture {
        let ledger: Arc<dyn LedgerStore> = Arc::new(MemoryLedger::new());
        let payloads = Arc::new(
            PayloadStore::new(
                Arc::clone(&ledger),
                Arc::new(MemoryObjectStore::new()),
                PayloadSettings::default(),
            )
            .unwrap(),
        );
        let (resolver, prompts) = ChannelResolver::new();
        let resolver = Arc::new(resolver);
        let factory: AwaiterFactory = {
            let resolver = Arc::clone(&resolver);
            Arc::new(move |id: &ConversationId| {
                Arc::new(InteractiveAwaiter::new(
                    id.clone(),
                    resolver.clone(),
                    &ElicitationSettings::default(),
                )) as Arc<dyn Awaiter>
            })
        };
        let registry = Arc::new(AwaiterRegistry::new(factory));

        let c = ConversationId::from("c1");
        ledger.create_conversation(&c, NewConversation::default()).unwrap();
        let turn = ledger.start_turn(&c, StartTurn::with_id("t1")).unwrap();

        Fixture {
            flow: ElicitationFlow::new(payloads, registry),
            ledger,
            resolver,
            prompts,
            turn: turn.id,
        }
    }

    fn request() -> ElicitationRequest {
        ElicitationRequest::new(
            "Pick a size",
            json!({
                "type": "object",
                "properties": {"size": {"enum": ["S", "M", "L"]}},
                "required": ["size"]
            }),
        )
    }

    #[tokio::test]
    async fn accept_records_response_and_resumes_turn() {
        let Fixture {
            flow,
            ledger,
            resolver,
            mut prompts,
            turn,
        } = fixture();
        let answer = tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            resolver.respond(
                &prompt.elicitation_id,
                Reply::Accept {
                    content: json!({"size": "L"}),
                },
            );
        });

        let outcome = flow
            .elicit(&CancellationToken::new(), &turn, request())
            .await
            .unwrap();
        answer.await.unwrap();

        let ElicitationOutcome::Accepted { value, response } = outcome else {
            panic!("expected accept");
        };
        assert_eq!(value, json!({"size": "L"}));
        assert_eq!(response.sequence, Some(2));

        let log = ledger.list_turn_messages(&turn).unwrap();
        assert_eq!(log[0].status, Some(MessageStatus::Accepted));
        assert_eq!(log[1].parent_message_id.as_ref(), Some(&log[0].id));
        assert_eq!(log[1].elicitation_id, log[0].elicitation_id);
        assert_eq!(
            ledger.get_turn(&turn).unwrap().status,
            TurnStatus::Running
        );
    }

    #[tokio::test]
    async fn decline_fails_turn_with_reason() {
        let Fixture {
            flow,
            ledger,
            resolver,
            mut prompts,
            turn,
        } = fixture();
        tokio::spawn(async move {
            let prompt = prompts.recv().await.unwrap();
            resolver.respond(
                &prompt.elicitation_id,
                Reply::Decline {
                    reason: Some("not sure".into()),
                },
            );
        });

        let outcome = flow
            .elicit(&CancellationToken::new(), &turn, request())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ElicitationOutcome::Declined {
                reason: Some("not sure".into())
            }
        );

        let record = ledger.get_turn(&turn).unwrap();
        assert_eq!(record.status, TurnStatus::Failed);
        assert_eq!(record.status_reason.as_deref(), Some("not sure"));
        let control = &ledger.list_turn_messages(&turn).unwrap()[0];
        assert_eq!(control.status, Some(MessageStatus::Rejected));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_recorded_like_a_decline() {
        let fx = fixture();
        let err = fx
            .flow
            .elicit(
                &CancellationToken::new(),
                &fx.turn,
                request().with_timeout(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert_matches!(
            err,
            RuntimeError::Cancelled {
                reason: CancelReason::DeadlineExceeded
            }
        );

        let turn = fx.ledger.get_turn(&fx.turn).unwrap();
        assert_eq!(turn.status, TurnStatus::Failed);
        assert!(turn.status_reason.unwrap().contains("deadline_exceeded"));
        let control = &fx.ledger.list_turn_messages(&fx.turn).unwrap()[0];
        assert_eq!(control.status, Some(MessageStatus::Rejected));
    }

    #[tokio::test]
    async fn caller_cancel_marks_message_cancel() {
        let fx = fixture();
        let token = CancellationToken::new();
        token.cancel();
        let err = fx
            .flow
            .elicit(&token, &fx.turn, request())
            .await
            .unwrap_err();
        assert_matches!(
            err,
            RuntimeError::Cancelled {
                reason: CancelReason::Canceled
            }
        );
        let control = &fx.ledger.list_turn_messages(&fx.turn).unwrap()[0];
        assert_eq!(control.status, Some(MessageStatus::Cancel));
        assert_eq!(
            fx.ledger.get_turn(&fx.turn).unwrap().status,
            TurnStatus::Failed
        );
    }

    #[tokio::test]
    async fn turn_must_be_running() {
        let fx = fixture();
        fx.ledger
            .transition_turn(&fx.turn, TurnStatus::Succeeded, None)
            .unwrap();
        let err = fx
            .flow
            .elicit(&CancellationToken::new(), &fx.turn, request())
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::InvalidState(_));
        assert!(fx.ledger.list_turn_messages(&fx.turn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_schema_leaves_turn_untouched() {
        let fx = fixture();
        let err = fx
            .flow
            .elicit(
                &CancellationToken::new(),
                &fx.turn,
                ElicitationRequest::new("Pick", json!({"type": 12})),
            )
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::InvalidSchema(_));
        assert_eq!(
            fx.ledger.get_turn(&fx.turn).unwrap().status,
            TurnStatus::Running
        );
        assert!(fx.ledger.list_turn_messages(&fx.turn).unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_elicitation_in_conversation_leaves_turn_untouched() {
        let Fixture {
            flow,
            ledger,
            resolver: _resolver,
            mut prompts,
            turn,
        } = fixture();
        let flow = Arc::new(flow);
        let token = CancellationToken::new();
        let first = {
            let flow = Arc::clone(&flow);
            let token = token.clone();
            let turn = turn.clone();
            tokio::spawn(async move { flow.elicit(&token, &turn, request()).await })
        };
        prompts.recv().await.unwrap();

        let second = ledger
            .start_turn(&"c1".into(), StartTurn::with_id("t2"))
            .unwrap()
            .id;
        let err = flow
            .elicit(&CancellationToken::new(), &second, request())
            .await
            .unwrap_err();
        assert_matches!(err, RuntimeError::InvalidState(_));
        assert_eq!(ledger.get_turn(&second).unwrap().status, TurnStatus::Running);
        assert!(ledger.list_turn_messages(&second).unwrap().is_empty());

        token.cancel();
        let _ = first.await;
    }
}
