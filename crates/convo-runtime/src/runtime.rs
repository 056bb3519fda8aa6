//! Service wiring.
//!
//! [`Runtime`] builds every service once from [`ConvoSettings`] and hands out
//! shared handles. Nothing here is global: create one per process (or per
//! test) and pass it around.

use std::sync::Arc;

use tracing::info;

use convo_core::logging::init_subscriber;
use convo_core::{ConversationId, UsageSink};
use convo_settings::{ConvoSettings, LoggingSettings};
use convo_store::{
    CallRecorder, Conversation, Database, FsObjectStore, LedgerStore, MemoryLedger,
    MemoryObjectStore, NewConversation, ObjectStore, PayloadStore, SqliteLedger,
};

use crate::elicitation::{
    Awaiter, AwaiterFactory, AwaiterRegistry, ElicitationFlow, InteractiveAwaiter, Resolver,
};
use crate::errors::Result;
use crate::preview::{PreviewService, Summarizer};
use crate::usage::UsageAggregator;

/// Install the tracing subscriber described by `settings`.
pub fn init_logging(settings: &LoggingSettings) {
    init_subscriber(&settings.level, settings.format());
}

/// All runtime services over one ledger.
pub struct Runtime {
    settings: ConvoSettings,
    ledger: Arc<dyn LedgerStore>,
    payloads: Arc<PayloadStore>,
    recorder: Arc<CallRecorder>,
    usage: Arc<UsageAggregator>,
    registry: Arc<AwaiterRegistry>,
    flow: Arc<ElicitationFlow>,
    preview: Arc<PreviewService>,
}

impl Runtime {
    /// SQLite ledger at `database.path` and filesystem objects under
    /// `payload.objectRoot`.
    pub fn open(settings: ConvoSettings, resolver: Arc<dyn Resolver>) -> Result<Self> {
        let db = Database::from_settings(&settings.database)?;
        let ledger: Arc<dyn LedgerStore> = Arc::new(SqliteLedger::new(db));
        let objects: Arc<dyn ObjectStore> =
            Arc::new(FsObjectStore::new(&settings.payload.object_root)?);
        info!(
            database = %settings.database.path,
            objects = %settings.payload.object_root,
            "runtime opened"
        );
        Self::assemble(settings, ledger, objects, resolver)
    }

    /// Everything in memory. Nothing survives the process.
    pub fn in_memory(settings: ConvoSettings, resolver: Arc<dyn Resolver>) -> Result<Self> {
        Self::assemble(
            settings,
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryObjectStore::new()),
            resolver,
        )
    }

    /// Build the services over caller-supplied stores.
    pub fn assemble(
        settings: ConvoSettings,
        ledger: Arc<dyn LedgerStore>,
        objects: Arc<dyn ObjectStore>,
        resolver: Arc<dyn Resolver>,
    ) -> Result<Self> {
        let payloads = Arc::new(PayloadStore::new(
            Arc::clone(&ledger),
            objects,
            settings.payload.clone(),
        )?);
        let usage = Arc::new(UsageAggregator::new());
        let recorder = Arc::new(
            CallRecorder::new(Arc::clone(&payloads))
                .with_usage_sink(Arc::clone(&usage) as Arc<dyn UsageSink>),
        );

        let elicitation = settings.elicitation.clone();
        let factory: AwaiterFactory = Arc::new(move |id: &ConversationId| {
            Arc::new(InteractiveAwaiter::new(
                id.clone(),
                Arc::clone(&resolver),
                &elicitation,
            )) as Arc<dyn Awaiter>
        });
        let registry = Arc::new(AwaiterRegistry::new(factory));
        let flow = Arc::new(ElicitationFlow::new(
            Arc::clone(&payloads),
            Arc::clone(&registry),
        ));
        let preview = Arc::new(PreviewService::new(
            Arc::clone(&payloads),
            settings.preview.clone(),
        ));

        Ok(Self {
            settings,
            ledger,
            payloads,
            recorder,
            usage,
            registry,
            flow,
            preview,
        })
    }

    /// Enable [`PreviewService::summarize`].
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.preview = Arc::new(
            PreviewService::new(Arc::clone(&self.payloads), self.settings.preview.clone())
                .with_summarizer(summarizer),
        );
        self
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn settings(&self) -> &ConvoSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerStore> {
        &self.ledger
    }

    pub fn payloads(&self) -> &Arc<PayloadStore> {
        &self.payloads
    }

    pub fn recorder(&self) -> &Arc<CallRecorder> {
        &self.recorder
    }

    pub fn usage(&self) -> &Arc<UsageAggregator> {
        &self.usage
    }

    pub fn awaiters(&self) -> &Arc<AwaiterRegistry> {
        &self.registry
    }

    pub fn elicitation(&self) -> &Arc<ElicitationFlow> {
        &self.flow
    }

    pub fn preview(&self) -> &Arc<PreviewService> {
        &self.preview
    }

    // ── Conversation lifecycle ──────────────────────────────────────

    /// Create (or fetch) a conversation. The configured default TTL applies
    /// when `opts` carries none.
    pub fn create_conversation(
        &self,
        id: &ConversationId,
        mut opts: NewConversation,
    ) -> Result<Conversation> {
        if opts.retention_ttl_secs.is_none() {
            opts.retention_ttl_secs = self
                .settings
                .retention
                .default_ttl_secs
                .and_then(|ttl| i64::try_from(ttl).ok());
        }
        Ok(self.ledger.create_conversation(id, opts)?)
    }

    /// Soft-delete a conversation and evict its awaiter.
    pub fn close_conversation(&self, id: &ConversationId) -> Result<()> {
        self.ledger.soft_delete_conversation(id)?;
        let _ = self.registry.remove(id);
        info!(conversation_id = %id, "conversation closed");
        Ok(())
    }

    /// Purge expired conversations and forget in-memory state for ids that
    /// no longer exist.
    pub fn purge_expired(&self) -> Result<usize> {
        let purged = self.ledger.purge_expired(chrono::Utc::now())?;
        if purged > 0 {
            for id in self.usage.conversations() {
                let gone = matches!(
                    self.ledger.get_conversation(&id),
                    Err(ref e) if e.is_not_found()
                );
                if gone {
                    let _ = self.usage.remove(&id);
                    let _ = self.registry.remove(&id);
                }
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::elicitation::ChannelResolver;
    use convo_core::UsageDelta;

    fn runtime(settings: ConvoSettings) -> Runtime {
        let (resolver, _rx) = ChannelResolver::new();
        Runtime::in_memory(settings, Arc::new(resolver)).unwrap()
    }

    #[test]
    fn default_ttl_applies() {
        let mut settings = ConvoSettings::default();
        settings.retention.default_ttl_secs = Some(60);
        let rt = runtime(settings);
        let conv = rt
            .create_conversation(&"c1".into(), NewConversation::default())
            .unwrap();
        assert_eq!(conv.retention_ttl_secs, Some(60));
        assert!(conv.expires_at.is_some());
    }

    #[test]
    fn close_evicts_awaiter() {
        let rt = runtime(ConvoSettings::default());
        let id = ConversationId::from("c1");
        rt.create_conversation(&id, NewConversation::default()).unwrap();
        rt.awaiters().ensure(&id);
        rt.close_conversation(&id).unwrap();
        assert!(rt.awaiters().get(&id).is_none());
        assert!(rt.ledger().get_conversation(&id).unwrap().deleted_at.is_some());
    }

    #[test]
    fn purge_forgets_usage_of_removed_conversations() {
        let mut settings = ConvoSettings::default();
        settings.retention.default_ttl_secs = Some(0);
        let rt = runtime(settings);
        let id = ConversationId::from("c1");
        rt.create_conversation(&id, NewConversation::default()).unwrap();
        rt.usage().record(&id, "gpt", UsageDelta::prompt(1)).unwrap();

        assert_eq!(rt.purge_expired().unwrap(), 1);
        assert!(rt.usage().conversations().is_empty());
    }

    #[test]
    fn file_backed_runtime_opens() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = ConvoSettings::default();
        settings.database.path = dir.path().join("ledger.db").display().to_string();
        settings.payload.object_root = dir.path().join("objects").display().to_string();
        let (resolver, _rx) = ChannelResolver::new();
        let rt = Runtime::open(settings, Arc::new(resolver)).unwrap();
        rt.create_conversation(&"c1".into(), NewConversation::default())
            .unwrap();
        assert!(dir.path().join("objects").is_dir());
    }
}
