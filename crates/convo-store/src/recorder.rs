//! Records dispatched tool and model calls into the ledger.
//!
//! The dispatcher reports [`CallEvent`]s; the recorder stores any bodies in
//! the [`PayloadStore`] and upserts the matching call row. Completed model
//! calls are forwarded to the configured [`UsageSink`].

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use convo_core::{CallStatus, MessageId, MessageType, PayloadKind, UsageSink};

use crate::error::{Result, StoreError};
use crate::ledger::LedgerStore;
use crate::payload_store::{PayloadStore, PutOptions};
use crate::records::{Message, ModelCall, ModelCallRecord, NewMessage, ToolCall, ToolCallRecord};

/// Lifecycle event for one tool operation, keyed by its `tool_op` message.
#[derive(Clone, Debug)]
pub enum CallEvent {
    Queued {
        message_id: MessageId,
        op_id: String,
        tool_name: String,
        tool_kind: Option<String>,
        request: Option<Vec<u8>>,
    },
    /// The tool started executing.
    Progress { message_id: MessageId },
    Completed {
        message_id: MessageId,
        response: Option<Vec<u8>>,
        latency_ms: Option<i64>,
        cost: Option<f64>,
    },
    Failed {
        message_id: MessageId,
        error: String,
        retriable: bool,
        latency_ms: Option<i64>,
    },
    Skipped {
        message_id: MessageId,
        reason: Option<String>,
    },
    Canceled { message_id: MessageId },
}

impl CallEvent {
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::Queued { message_id, .. }
            | Self::Progress { message_id }
            | Self::Completed { message_id, .. }
            | Self::Failed { message_id, .. }
            | Self::Skipped { message_id, .. }
            | Self::Canceled { message_id } => message_id,
        }
    }
}

/// Raw bodies of a model exchange; each becomes its own payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModelBodies<'a> {
    pub request: Option<&'a [u8]>,
    pub response: Option<&'a [u8]>,
    pub provider_request: Option<&'a [u8]>,
    pub provider_response: Option<&'a [u8]>,
    pub stream: Option<&'a [u8]>,
}

/// Writes call rows for a dispatcher.
pub struct CallRecorder {
    ledger: Arc<dyn LedgerStore>,
    payloads: Arc<PayloadStore>,
    usage: Option<Arc<dyn UsageSink>>,
}

impl CallRecorder {
    pub fn new(payloads: Arc<PayloadStore>) -> Self {
        Self {
            ledger: Arc::clone(payloads.ledger()),
            payloads,
            usage: None,
        }
    }

    #[must_use]
    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(sink);
        self
    }

    /// Apply one tool lifecycle event and return the updated row.
    #[instrument(skip(self, event), fields(message_id = %event.message_id()))]
    pub fn apply_tool_event(&self, event: CallEvent) -> Result<ToolCall> {
        let rec = match event {
            CallEvent::Queued {
                message_id,
                op_id,
                tool_name,
                tool_kind,
                request,
            } => {
                let mut rec = ToolCallRecord::queued(message_id, op_id, tool_name);
                rec.tool_kind = tool_kind;
                if let Some(body) = request {
                    let p = self
                        .payloads
                        .put(PayloadKind::ToolRequest, &body, PutOptions::default())?;
                    rec.request_hash = Some(p.digest);
                    rec.request_payload_id = Some(p.id);
                }
                rec
            }
            CallEvent::Progress { message_id } => self.update(&message_id, CallStatus::Running)?,
            CallEvent::Completed {
                message_id,
                response,
                latency_ms,
                cost,
            } => {
                let mut rec = self.update(&message_id, CallStatus::Completed)?;
                if let Some(body) = response {
                    let p = self
                        .payloads
                        .put(PayloadKind::ToolResponse, &body, PutOptions::default())?;
                    rec.response_hash = Some(p.digest);
                    rec.response_payload_id = Some(p.id);
                }
                rec.latency_ms = latency_ms;
                rec.cost = cost;
                rec
            }
            CallEvent::Failed {
                message_id,
                error,
                retriable,
                latency_ms,
            } => {
                let mut rec = self.update(&message_id, CallStatus::Failed)?;
                rec.error = Some(error);
                rec.retriable = Some(retriable);
                rec.latency_ms = latency_ms;
                rec
            }
            CallEvent::Skipped { message_id, reason } => {
                let mut rec = self.update(&message_id, CallStatus::Skipped)?;
                rec.error = reason;
                rec
            }
            CallEvent::Canceled { message_id } => {
                self.update(&message_id, CallStatus::Canceled)?
            }
        };
        self.ledger.record_tool_call(rec)
    }

    /// An update record for an existing call.
    fn update(&self, message_id: &MessageId, status: CallStatus) -> Result<ToolCallRecord> {
        let prior = self.ledger.get_tool_call(message_id)?;
        let mut rec = ToolCallRecord::queued(message_id.clone(), prior.op_id, prior.tool_name)
            .with_status(status);
        rec.attempt = Some(prior.attempt);
        Ok(rec)
    }

    /// Retry a failed or canceled tool call.
    ///
    /// Appends a new `tool_op` message to the same turn (parent = the prior
    /// message) and queues attempt `n + 1` of the same operation. The prior
    /// attempt is left untouched.
    #[instrument(skip(self), fields(prior = %prior_message_id))]
    pub fn retry(&self, prior_message_id: &MessageId) -> Result<(Message, ToolCall)> {
        let prior = self.ledger.get_tool_call(prior_message_id)?;
        if !matches!(prior.status, CallStatus::Failed | CallStatus::Canceled) {
            return Err(StoreError::InvalidState(format!(
                "tool call {prior_message_id} is {}; only failed or canceled calls can be retried",
                prior.status
            )));
        }
        let prior_message = self.ledger.get_message(prior_message_id)?;
        let msg = NewMessage::new(prior_message.role, MessageType::ToolOp)
            .with_parent(prior_message_id.clone());
        let msg = match prior_message.content {
            Some(content) => msg.with_content(content),
            None => msg,
        };
        let message = self.ledger.append_message(&prior.turn_id, msg)?;

        let attempt = self.ledger.next_attempt(&prior.turn_id, &prior.op_id)?;
        let mut rec = ToolCallRecord::queued(message.id.clone(), prior.op_id, prior.tool_name)
            .with_attempt(attempt);
        rec.tool_kind = prior.tool_kind;
        rec.request_payload_id = prior.request_payload_id;
        rec.request_hash = prior.request_hash;
        let call = self.ledger.record_tool_call(rec)?;
        debug!(attempt, message_id = %message.id, "tool call retried");
        Ok((message, call))
    }

    /// Upsert a model call, storing any raw bodies first.
    ///
    /// Usage is reported once, on the transition into `completed`.
    #[instrument(skip(self, rec, bodies), fields(message_id = %rec.message_id, model = %rec.model))]
    pub fn record_model_call(
        &self,
        mut rec: ModelCallRecord,
        bodies: ModelBodies<'_>,
    ) -> Result<ModelCall> {
        let slots = [
            (bodies.request, PayloadKind::ModelRequest, &mut rec.payloads.request),
            (bodies.response, PayloadKind::ModelResponse, &mut rec.payloads.response),
            (
                bodies.provider_request,
                PayloadKind::ProviderRequest,
                &mut rec.payloads.provider_request,
            ),
            (
                bodies.provider_response,
                PayloadKind::ProviderResponse,
                &mut rec.payloads.provider_response,
            ),
            (bodies.stream, PayloadKind::ModelStream, &mut rec.payloads.stream),
        ];
        for (body, kind, slot) in slots {
            if let Some(body) = body {
                *slot = Some(self.payloads.put(kind, body, PutOptions::default())?.id);
            }
        }

        let recorded = self.ledger.record_model_call(rec)?;
        if recorded.newly_completed() {
            self.report_usage(&recorded.call)?;
        }
        Ok(recorded.call)
    }

    fn report_usage(&self, call: &ModelCall) -> Result<()> {
        let Some(sink) = &self.usage else {
            return Ok(());
        };
        let conversation_id = self.ledger.get_message(&call.message_id)?.conversation_id;
        if let Err(e) = sink.on_usage(&conversation_id, &call.model, call.usage_delta()) {
            warn!(error = %e, model = %call.model, "usage report rejected");
        }
        Ok(())
    }
}
