//! End-to-end scenarios through the [`Runtime`] facade.

#![allow(unused_results)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use convo_core::{
    CallStatus, ConversationId, MessageStatus, MessageType, ModelKind, PayloadKind, Role,
    StorageKind, TurnId, TurnStatus, UsageDelta, UsageSink,
};
use convo_runtime::{
    Awaiter, AwaiterFactory, AwaiterRegistry, CancelReason, ChannelResolver, ElicitationOutcome,
    ElicitationRequest, InteractiveAwaiter, Prompt, Reply, Runtime, RuntimeError, Summarizer,
};
use convo_settings::{ConvoSettings, ElicitationSettings};
use convo_store::{
    CallEvent, ModelBodies, ModelCallRecord, NewConversation, NewMessage, StartTurn, TokenCounts,
};

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    runtime: Runtime,
    resolver: Arc<ChannelResolver>,
    prompts: UnboundedReceiver<Prompt>,
}

fn harness() -> Harness {
    let (resolver, prompts) = ChannelResolver::new();
    let resolver = Arc::new(resolver);
    let runtime = Runtime::in_memory(ConvoSettings::default(), resolver.clone()).unwrap();
    Harness {
        runtime,
        resolver,
        prompts,
    }
}

fn start(runtime: &Runtime, conversation: &str, turn: &str) -> TurnId {
    let c = ConversationId::from(conversation);
    runtime
        .create_conversation(&c, NewConversation::default())
        .unwrap();
    runtime
        .ledger()
        .start_turn(&c, StartTurn::with_id(turn))
        .unwrap()
        .id
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

// ─────────────────────────────────────────────────────────────────────────────
// Usage
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_usage_reports_are_all_counted() {
    let h = harness();
    let c = ConversationId::from("c1");
    let usage = Arc::clone(h.runtime.usage());

    let tasks: Vec<_> = (0..200)
        .map(|_| {
            let usage = Arc::clone(&usage);
            let c = c.clone();
            tokio::spawn(async move { usage.on_usage(&c, "gpt", UsageDelta::prompt(1)) })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(usage.totals(&c).prompt_tokens, 200);
    assert_eq!(usage.totals(&c).calls, 200);
}

#[test]
fn completed_model_call_feeds_usage_totals() {
    let h = harness();
    let turn = start(&h.runtime, "c1", "t1");
    let msg = h
        .runtime
        .ledger()
        .append_message(&turn, NewMessage::tool_op().with_id("m1"))
        .unwrap();

    let mut rec = ModelCallRecord::queued(msg.id.clone(), "openai", "gpt", ModelKind::Chat);
    h.runtime
        .recorder()
        .record_model_call(rec.clone(), ModelBodies::default())
        .unwrap();
    rec.status = CallStatus::Completed;
    rec.tokens = Some(TokenCounts {
        prompt: 12,
        completion: 3,
        total: 15,
        ..TokenCounts::default()
    });
    rec.cost = Some(0.01);
    h.runtime
        .recorder()
        .record_model_call(
            rec,
            ModelBodies {
                response: Some(b"{\"ok\":true}"),
                ..ModelBodies::default()
            },
        )
        .unwrap();

    let totals = h.runtime.usage().totals(&"c1".into());
    assert_eq!(totals.prompt_tokens, 12);
    assert_eq!(totals.completion_tokens, 3);
    assert_eq!(totals.calls, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Tool calls
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn large_tool_response_goes_to_object_storage() {
    let h = harness();
    let turn = start(&h.runtime, "c1", "t1");
    let ledger = h.runtime.ledger();
    ledger
        .append_message(&turn, NewMessage::text(Role::User, "run it").with_id("m1"))
        .unwrap();
    ledger
        .append_message(&turn, NewMessage::tool_op().with_id("m2"))
        .unwrap();

    let recorder = h.runtime.recorder();
    recorder
        .apply_tool_event(CallEvent::Queued {
            message_id: "m2".into(),
            op_id: "op1".into(),
            tool_name: "search".into(),
            tool_kind: None,
            request: Some(br#"{"q":"rust"}"#.to_vec()),
        })
        .unwrap();
    recorder
        .apply_tool_event(CallEvent::Progress {
            message_id: "m2".into(),
        })
        .unwrap();
    let call = recorder
        .apply_tool_event(CallEvent::Completed {
            message_id: "m2".into(),
            response: Some(vec![b'r'; 20_000]),
            latency_ms: Some(42),
            cost: None,
        })
        .unwrap();

    assert_eq!(call.status, CallStatus::Completed);
    let response = h
        .runtime
        .payloads()
        .get(call.response_payload_id.as_ref().unwrap())
        .unwrap();
    assert_eq!(response.storage(), StorageKind::Object);
    assert_eq!(response.kind, PayloadKind::ToolResponse);
    assert_eq!(response.size(), 20_000);
}

#[test]
fn retried_operation_keeps_both_attempts() {
    let h = harness();
    let turn = start(&h.runtime, "c1", "t1");
    h.runtime
        .ledger()
        .append_message(&turn, NewMessage::tool_op().with_id("m1"))
        .unwrap();
    let recorder = h.runtime.recorder();
    recorder
        .apply_tool_event(CallEvent::Queued {
            message_id: "m1".into(),
            op_id: "op1".into(),
            tool_name: "fetch".into(),
            tool_kind: None,
            request: None,
        })
        .unwrap();
    recorder
        .apply_tool_event(CallEvent::Failed {
            message_id: "m1".into(),
            error: "timeout".into(),
            retriable: true,
            latency_ms: None,
        })
        .unwrap();

    let (message, second) = recorder.retry(&"m1".into()).unwrap();
    assert_eq!(second.attempt, 2);
    assert_eq!(message.parent_message_id, Some("m1".into()));

    let calls = h.runtime.ledger().list_tool_calls(&turn).unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].attempt, 1);
    assert_eq!(calls[0].status, CallStatus::Failed);
    assert_eq!(calls[1].attempt, 2);
    assert_eq!(calls[1].status, CallStatus::Queued);
}

// ─────────────────────────────────────────────────────────────────────────────
// Elicitation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_ensure_runs_factory_once() {
    let built = Arc::new(AtomicUsize::new(0));
    let (resolver, _rx) = ChannelResolver::new();
    let resolver = Arc::new(resolver);
    let factory: AwaiterFactory = {
        let built = Arc::clone(&built);
        Arc::new(move |id: &ConversationId| {
            built.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(1));
            Arc::new(InteractiveAwaiter::new(
                id.clone(),
                resolver.clone(),
                &ElicitationSettings::default(),
            )) as Arc<dyn Awaiter>
        })
    };
    let registry = AwaiterRegistry::new(factory);
    let c = ConversationId::from("c1");

    let handles: Vec<Arc<dyn Awaiter>> = std::thread::scope(|s| {
        let joins: Vec<_> = (0..32).map(|_| s.spawn(|| registry.ensure(&c))).collect();
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    });

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[tokio::test(start_paused = true)]
async fn deadline_returns_promptly() {
    let h = harness();
    let turn = start(&h.runtime, "c1", "t1");
    let began = tokio::time::Instant::now();

    let err = h
        .runtime
        .elicitation()
        .elicit(
            &CancellationToken::new(),
            &turn,
            size_request().with_timeout(Duration::from_millis(250)),
        )
        .await
        .unwrap_err();

    assert_matches!(
        err,
        RuntimeError::Cancelled {
            reason: CancelReason::DeadlineExceeded
        }
    );
    assert!(began.elapsed() < Duration::from_millis(300));
    assert_eq!(
        h.runtime.ledger().get_turn(&turn).unwrap().status,
        TurnStatus::Failed
    );
    let control = &h.runtime.ledger().list_turn_messages(&turn).unwrap()[0];
    assert_eq!(control.status, Some(MessageStatus::Rejected));
}

#[tokio::test]
async fn invalid_answer_is_reprompted_then_accepted() {
    let Harness {
        runtime,
        resolver,
        mut prompts,
    } = harness();
    let turn = start(&runtime, "c1", "t1");

    let ui = tokio::spawn(async move {
        let mut seen = Vec::new();
        for answer in ["XL", "M"] {
            let prompt = prompts.recv().await.unwrap();
            resolver.respond(
                &prompt.elicitation_id,
                Reply::Accept {
                    content: json!({"size": answer}),
                },
            );
            seen.push(prompt);
        }
        seen
    });

    let outcome = runtime
        .elicitation()
        .elicit(&CancellationToken::new(), &turn, size_request())
        .await
        .unwrap();
    let seen = ui.await.unwrap();

    assert_eq!(seen.len(), 2);
    assert!(seen[0].error.is_none());
    assert!(seen[1].error.as_deref().unwrap().contains("/size"));
    assert_matches!(
        outcome,
        ElicitationOutcome::Accepted { ref value, .. } if *value == json!({"size": "M"})
    );

    let log = runtime.ledger().list_turn_messages(&turn).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].message_type, MessageType::Control);
    assert_eq!(log[0].status, Some(MessageStatus::Accepted));
    assert_eq!(log[1].role, Role::User);
    assert_eq!(
        runtime.ledger().get_turn(&turn).unwrap().status,
        TurnStatus::Running
    );
}

#[tokio::test]
async fn decline_ends_turn_failed() {
    let Harness {
        runtime,
        resolver,
        mut prompts,
    } = harness();
    let turn = start(&runtime, "c1", "t1");

    tokio::spawn(async move {
        let prompt = prompts.recv().await.unwrap();
        resolver.respond(&prompt.elicitation_id, Reply::Decline { reason: None });
    });

    let outcome = runtime
        .elicitation()
        .elicit(&CancellationToken::new(), &turn, size_request())
        .await
        .unwrap();
    assert_eq!(outcome, ElicitationOutcome::Declined { reason: None });

    let turn = runtime.ledger().get_turn(&turn).unwrap();
    assert_eq!(turn.status, TurnStatus::Failed);
    assert_eq!(turn.status_reason.as_deref(), Some("declined by user"));
}

#[tokio::test]
async fn user_cancel_marks_message_cancel() {
    let Harness {
        runtime,
        resolver,
        mut prompts,
    } = harness();
    let turn = start(&runtime, "c1", "t1");

    tokio::spawn(async move {
        let prompt = prompts.recv().await.unwrap();
        resolver.respond(&prompt.elicitation_id, Reply::Cancel);
    });

    let err = runtime
        .elicitation()
        .elicit(&CancellationToken::new(), &turn, size_request())
        .await
        .unwrap_err();
    assert_matches!(err, RuntimeError::Cancelled { reason: CancelReason::Canceled });

    let control = &runtime.ledger().list_turn_messages(&turn).unwrap()[0];
    assert_eq!(control.status, Some(MessageStatus::Cancel));
    assert_eq!(
        runtime.ledger().get_turn(&turn).unwrap().status,
        TurnStatus::Failed
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Preview
// ─────────────────────────────────────────────────────────────────────────────

/// Keeps the first few characters of every chunk.
struct Heads;

#[async_trait]
impl Summarizer for Heads {
    async fn summarize(
        &self,
        previous: Option<&str>,
        chunk: &str,
    ) -> convo_runtime::Result<String> {
        let head: String = chunk.chars().take(4).collect();
        Ok(match previous {
            Some(prev) => format!("{prev}|{head}"),
            None => head,
        })
    }
}

#[tokio::test]
async fn summarized_tool_output_can_be_previewed_and_restored() {
    let (resolver, _rx) = ChannelResolver::new();
    let runtime = Runtime::in_memory(ConvoSettings::default(), Arc::new(resolver))
        .unwrap()
        .with_summarizer(Arc::new(Heads));
    let turn = start(&runtime, "c1", "t1");

    let body: String = (0..5_000).map(|i| format!("line {i:05}\n")).collect();
    let payload = runtime
        .payloads()
        .put(PayloadKind::ToolResponse, body.as_bytes(), Default::default())
        .unwrap();
    let msg = runtime
        .ledger()
        .append_message(
            &turn,
            NewMessage::new(Role::Tool, MessageType::Text).with_payload(payload.id),
        )
        .unwrap();

    let window = runtime.preview().show(&msg.id, 0, None).unwrap();
    assert_eq!(window.total_bytes, body.len() as u64);
    assert_eq!(window.text.len() as u64, window.budget);
    assert!(window.text.starts_with("line 00000"));

    let hits = runtime.preview().find_matches(&msg.id, r"line 0424\d").unwrap();
    assert_eq!(hits.len(), 10);
    assert_eq!(hits[0].offset, 4_240 * 11);

    let summary = runtime
        .preview()
        .summarize(&CancellationToken::new(), &msg.id)
        .await
        .unwrap()
        .unwrap();
    assert!(summary.content.unwrap().starts_with("line|"));

    runtime.preview().remove(&msg.id).unwrap();
    let restored = runtime.ledger().get_message(&msg.id).unwrap();
    assert_eq!(restored.status, None);
    assert_eq!(restored.superseded_by, None);
}
