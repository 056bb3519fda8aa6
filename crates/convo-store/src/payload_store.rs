//! Content-addressed storage of request/response bodies.
//!
//! Small bodies live inline in `call_payloads`; larger ones go to an
//! [`ObjectStore`] and the row keeps the URI plus a short preview. Bodies are
//! redacted before anything is written, and identical bodies for the same
//! tenant and kind share one row.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use convo_core::{PayloadId, PayloadKind};
use convo_settings::PayloadSettings;

use crate::error::{Result, StoreError};
use crate::ledger::LedgerStore;
use crate::object_store::{object_key, ObjectStore};
use crate::records::{now_ts, CallPayload, PayloadBody};
use crate::redact::Redactor;

/// Per-call options for [`PayloadStore::put`].
#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub mime_type: Option<String>,
    /// Overrides the configured tenant.
    pub tenant: Option<String>,
}

impl PutOptions {
    pub fn json() -> Self {
        Self {
            mime_type: Some("application/json".into()),
            tenant: None,
        }
    }
}

/// SHA-256 hex digest.
pub fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// First `chars` characters of `bytes` decoded as lossy UTF-8.
fn preview(bytes: &[u8], chars: usize) -> String {
    let window = &bytes[..bytes.len().min(chars.saturating_mul(4))];
    String::from_utf8_lossy(window).chars().take(chars).collect()
}

/// Payload storage over a ledger and an object store.
pub struct PayloadStore {
    ledger: Arc<dyn LedgerStore>,
    objects: Arc<dyn ObjectStore>,
    redactor: Option<Redactor>,
    settings: PayloadSettings,
}

impl PayloadStore {
    /// Fails with `Config` when a redaction pattern does not compile.
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        objects: Arc<dyn ObjectStore>,
        settings: PayloadSettings,
    ) -> Result<Self> {
        let redactor = Redactor::from_settings(&settings.redaction)?;
        Ok(Self {
            ledger,
            objects,
            redactor,
            settings,
        })
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    /// Store `bytes` and return the payload row, reusing an identical one.
    #[instrument(skip(self, bytes, opts), fields(kind = %kind, len = bytes.len()))]
    pub fn put(&self, kind: PayloadKind, bytes: &[u8], opts: PutOptions) -> Result<CallPayload> {
        let (body, policy) = match &self.redactor {
            Some(r) => {
                let out = r.apply(bytes);
                (out.bytes, out.policy.map(str::to_string))
            }
            None => (std::borrow::Cow::Borrowed(bytes), None),
        };
        let tenant = opts.tenant.unwrap_or_else(|| self.settings.tenant.clone());
        let digest = digest_hex(&body);

        if let Some(existing) = self.ledger.find_payload(&tenant, kind, &digest)? {
            debug!(payload_id = %existing.id, "reusing payload");
            return Ok(existing);
        }

        let size = body.len() as u64;
        let stored = if size <= self.settings.inline_threshold_bytes {
            PayloadBody::Inline {
                bytes: body.to_vec(),
            }
        } else {
            let key = object_key(&tenant, kind.as_str(), &digest);
            match self.objects.put(&key, &body) {
                Ok(uri) => PayloadBody::Object { uri },
                Err(e) if size <= self.settings.fallback_inline_max_bytes => {
                    warn!(error = %e, size, "object store write failed, storing inline");
                    PayloadBody::Inline {
                        bytes: body.to_vec(),
                    }
                }
                Err(e) => {
                    return Err(StoreError::Storage(format!(
                        "object write for {size}-byte {kind} payload failed: {e}"
                    )))
                }
            }
        };

        let row = CallPayload {
            id: PayloadId::new(),
            tenant_id: tenant,
            kind,
            body: stored,
            digest,
            compression: "none".into(),
            mime_type: opts.mime_type,
            redacted: policy.is_some(),
            redaction_policy: policy,
            size_bytes: i64::try_from(size).unwrap_or(i64::MAX),
            preview: Some(preview(&body, self.settings.preview_chars)),
            created_at: now_ts(),
        };
        let row = self.ledger.insert_payload(row)?;
        debug!(payload_id = %row.id, storage = %row.storage(), "payload stored");
        Ok(row)
    }

    /// Serialize `value` as JSON and store it.
    pub fn put_json<T: serde::Serialize>(&self, kind: PayloadKind, value: &T) -> Result<CallPayload> {
        let bytes = serde_json::to_vec(value)?;
        self.put(kind, &bytes, PutOptions::json())
    }

    pub fn get(&self, id: &PayloadId) -> Result<CallPayload> {
        self.ledger.get_payload(id)
    }

    /// Full body bytes.
    pub fn load(&self, id: &PayloadId) -> Result<Vec<u8>> {
        match self.ledger.get_payload(id)?.body {
            PayloadBody::Inline { bytes } => Ok(bytes),
            PayloadBody::Object { uri } => self.objects.get(&uri),
        }
    }

    /// `[offset, offset + len)` of the body, clamped to its size.
    pub fn read_range(&self, id: &PayloadId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let payload = self.ledger.get_payload(id)?;
        match &payload.body {
            PayloadBody::Inline { .. } => self.ledger.read_inline_range(id, offset, len),
            PayloadBody::Object { uri } => self.objects.read_range(uri, offset, len),
        }
    }

    pub fn size(&self, id: &PayloadId) -> Result<u64> {
        Ok(self.ledger.get_payload(id)?.size())
    }
}
