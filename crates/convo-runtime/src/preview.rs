//! Windowed reads, summaries, and pattern scans over large message bodies.
//!
//! Bodies are read through [`PayloadStore::read_range`] (or the message's
//! inline text), never loaded whole. Messages from older turns get a smaller
//! window budget.

use std::sync::Arc;

use async_trait::async_trait;
use regex::bytes::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use convo_core::{MessageId, MessageStatus, MessageType, PayloadId, Role};
use convo_settings::PreviewSettings;
use convo_store::{LedgerStore, Message, NewMessage, PayloadStore};

use crate::errors::{CancelReason, Result, RuntimeError};

/// Produces summaries chunk by chunk.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Fold `chunk` into `previous` (the summary so far) and return the new
    /// summary.
    async fn summarize(&self, previous: Option<&str>, chunk: &str) -> Result<String>;
}

/// One window returned by [`PreviewService::show`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewWindow {
    pub message_id: MessageId,
    pub offset: u64,
    pub text: String,
    pub total_bytes: u64,
    /// Where the next window starts; `None` at the end of the body.
    pub next_offset: Option<u64>,
    /// Byte cap that applied to this window.
    pub budget: u64,
}

/// A pattern hit at an absolute byte offset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchHit {
    pub offset: u64,
    pub len: u64,
    pub text: String,
}

/// Where a message keeps its body.
enum Body<'a> {
    Payload(&'a PayloadId),
    Text(&'a [u8]),
}

fn body_of(message: &Message) -> Body<'_> {
    match &message.payload_id {
        Some(id) => Body::Payload(id),
        None => Body::Text(message.content.as_deref().unwrap_or_default().as_bytes()),
    }
}

fn slice(bytes: &[u8], offset: u64, len: u64) -> Vec<u8> {
    let total = bytes.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(total);
    let end = start
        .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
        .min(total);
    bytes[start..end].to_vec()
}

/// Decode as much valid UTF-8 as possible, keeping an incomplete trailing
/// sequence in `carry` for the next chunk.
fn decode_chunk(carry: &mut Vec<u8>, chunk: &[u8]) -> String {
    carry.extend_from_slice(chunk);
    let valid = match std::str::from_utf8(carry) {
        Ok(_) => carry.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => carry.len(),
    };
    let rest = carry.split_off(valid);
    let text = String::from_utf8_lossy(carry).into_owned();
    *carry = rest;
    text
}

/// Preview, summarize, and scan message bodies.
pub struct PreviewService {
    ledger: Arc<dyn LedgerStore>,
    payloads: Arc<PayloadStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    settings: PreviewSettings,
}

impl PreviewService {
    pub fn new(payloads: Arc<PayloadStore>, settings: PreviewSettings) -> Self {
        Self {
            ledger: Arc::clone(payloads.ledger()),
            payloads,
            summarizer: None,
            settings,
        }
    }

    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    fn total_bytes(&self, message: &Message) -> Result<u64> {
        Ok(match body_of(message) {
            Body::Payload(id) => self.payloads.size(id)?,
            Body::Text(bytes) => bytes.len() as u64,
        })
    }

    fn read(&self, message: &Message, offset: u64, len: u64) -> Result<Vec<u8>> {
        Ok(match body_of(message) {
            Body::Payload(id) => self.payloads.read_range(id, offset, len)?,
            Body::Text(bytes) => slice(bytes, offset, len),
        })
    }

    /// Window cap for a message: the aged limit once its turn is
    /// `aged_after_steps` turns old.
    pub fn budget(&self, message: &Message) -> Result<u64> {
        let age = match &message.turn_id {
            Some(turn_id) => self.ledger.turn_age(turn_id)?,
            None => 0,
        };
        Ok(if age >= self.settings.aged_after_steps {
            self.settings.aged_limit_bytes
        } else {
            self.settings.preview_limit_bytes
        })
    }

    /// Read one window of a message body. `length` is capped by the budget.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub fn show(
        &self,
        message_id: &MessageId,
        offset: u64,
        length: Option<u64>,
    ) -> Result<PreviewWindow> {
        let message = self.ledger.get_message(message_id)?;
        let budget = self.budget(&message)?;
        let total_bytes = self.total_bytes(&message)?;
        let len = length.map_or(budget, |l| l.min(budget));

        let bytes = self.read(&message, offset, len)?;
        let end = offset.saturating_add(bytes.len() as u64);
        Ok(PreviewWindow {
            message_id: message_id.clone(),
            offset,
            text: String::from_utf8_lossy(&bytes).into_owned(),
            total_bytes,
            next_offset: (end < total_bytes).then_some(end),
            budget,
        })
    }

    /// Replace a large message with a summary.
    ///
    /// Returns `None` unless the body exceeds the threshold, and the existing
    /// summary when one is live. Nothing is written if the summarizer fails
    /// or `cancel` fires.
    #[instrument(skip(self, cancel), fields(message_id = %message_id))]
    pub async fn summarize(
        &self,
        cancel: &CancellationToken,
        message_id: &MessageId,
    ) -> Result<Option<Message>> {
        let message = self.ledger.get_message(message_id)?;
        if let Some(existing) = &message.superseded_by {
            match self.ledger.get_message(existing) {
                Ok(summary) => return Ok(Some(summary)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        let total = self.total_bytes(&message)?;
        if total <= self.settings.summarize_threshold_bytes {
            debug!(total, "within summarize threshold");
            return Ok(None);
        }
        let summarizer = self.summarizer.as_ref().ok_or_else(|| {
            RuntimeError::InvalidState("no summarizer configured".to_string())
        })?;

        let chunk_len = self.settings.summarize_chunk_bytes.max(1);
        let mut summary: Option<String> = None;
        let mut carry = Vec::new();
        let mut offset = 0;
        while offset < total {
            let bytes = self.read(&message, offset, chunk_len)?;
            if bytes.is_empty() {
                break;
            }
            offset += bytes.len() as u64;
            let text = decode_chunk(&mut carry, &bytes);
            if text.is_empty() {
                continue;
            }
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RuntimeError::cancelled(CancelReason::Canceled));
                }
                next = summarizer.summarize(summary.as_deref(), &text) => next?,
            };
            summary = Some(next);
        }
        if !carry.is_empty() {
            let tail = String::from_utf8_lossy(&carry).into_owned();
            summary = Some(summarizer.summarize(summary.as_deref(), &tail).await?);
        }

        let derived = self.ledger.append_derived_message(
            message_id,
            NewMessage::new(Role::Assistant, MessageType::Text)
                .with_content(summary.unwrap_or_default())
                .with_status(MessageStatus::Summary),
        )?;
        let _ = self
            .ledger
            .set_message_status(message_id, Some(MessageStatus::Summarized), None)?;
        self.ledger.set_superseded_by(message_id, Some(&derived.id))?;
        info!(summary_id = %derived.id, total, "message summarized");
        Ok(Some(derived))
    }

    /// Byte-regex scan of a message body.
    ///
    /// The body is read in `match_chunk_bytes` chunks into a window that keeps
    /// the last `match_overlap_bytes` of what was already scanned. A hit that
    /// runs to the end of the window is held back and the window grows until
    /// the hit closes, so long matches come back whole. A match is only seen
    /// once some window holds enough of it to match at all. Capped at
    /// `max_matches`.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub fn find_matches(&self, message_id: &MessageId, pattern: &str) -> Result<Vec<MatchHit>> {
        let regex = Regex::new(pattern)?;
        let message = self.ledger.get_message(message_id)?;
        let total = self.total_bytes(&message)?;

        let chunk_len = self.settings.match_chunk_bytes.max(1);
        let overlap = usize::try_from(self.settings.match_overlap_bytes.min(chunk_len - 1))
            .unwrap_or(usize::MAX);
        let limit = self.settings.max_matches;

        let mut hits = Vec::new();
        let mut window: Vec<u8> = Vec::new();
        // Absolute offset of `window[0]`.
        let mut base = 0u64;
        // Next scan position inside `window`.
        let mut cursor = 0usize;
        let mut read_pos = 0u64;
        while hits.len() < limit {
            let chunk = if read_pos < total {
                self.read(&message, read_pos, chunk_len)?
            } else {
                Vec::new()
            };
            read_pos += chunk.len() as u64;
            let eof = chunk.is_empty() || read_pos >= total;
            window.extend_from_slice(&chunk);

            let mut open_hit = false;
            while cursor <= window.len() && hits.len() < limit {
                let Some(m) = regex.find_at(&window, cursor) else {
                    break;
                };
                if !eof && m.end() == window.len() {
                    cursor = m.start();
                    open_hit = true;
                    break;
                }
                hits.push(MatchHit {
                    offset: base + m.start() as u64,
                    len: m.len() as u64,
                    text: String::from_utf8_lossy(m.as_bytes()).into_owned(),
                });
                cursor = if m.is_empty() { m.end() + 1 } else { m.end() };
            }
            if eof {
                break;
            }

            let resume = if open_hit {
                cursor
            } else {
                cursor.max(window.len().saturating_sub(overlap))
            };
            // Keep `overlap` bytes ahead of the resume point as context.
            let drop = resume.saturating_sub(overlap).min(window.len());
            let _ = window.drain(..drop);
            base += drop as u64;
            cursor = resume - drop;
        }
        debug!(hits = hits.len(), "pattern scan finished");
        Ok(hits)
    }

    /// Drop a summary and restore its original. Accepts either id.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub fn remove(&self, message_id: &MessageId) -> Result<Message> {
        let message = self.ledger.get_message(message_id)?;
        let (original_id, summary_id) = match (&message.status, &message.parent_message_id) {
            (Some(MessageStatus::Summary), Some(parent)) => (parent.clone(), message.id.clone()),
            _ => match &message.superseded_by {
                Some(summary) => (message.id.clone(), summary.clone()),
                None => {
                    return Err(RuntimeError::InvalidState(format!(
                        "message {message_id} has no summary"
                    )))
                }
            },
        };

        self.ledger.set_superseded_by(&original_id, None)?;
        let restored = self.ledger.set_message_status(&original_id, None, None)?;
        match self.ledger.delete_message(&summary_id) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        info!(original_id = %original_id, "summary removed");
        Ok(restored)
    }
}
