//! Persistence synchronizer
//!
//! Drains unsaved, finalized messages to the remote persistence endpoint.
//! The endpoint upserts by message id and answers with the set of committed
//! ids, so resending a batch is idempotent. Failures are logged and retried
//! on the next cycle; they never reach the assembler and never drop an
//! unsaved flag. At most one cycle is in flight at a time.

use crate::message::{Message, MessageId};
use crate::provider::HTTP_CLIENT;
use crate::store::ConversationStore;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Errors from the persistence endpoint
#[derive(Debug, thiserror::Error)]
pub enum SyncFailure {
    #[error("Persistence request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Persistence endpoint rejected batch: status {status}")]
    Rejected { status: u16 },
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Messages in the batch
    pub attempted: usize,
    /// Messages newly marked saved
    pub committed: usize,
    /// Whether the batch send failed
    pub failed: bool,
}

/// Remote persistence endpoint, upsert keyed by message id
#[async_trait::async_trait]
pub trait PersistenceApi: Send + Sync {
    /// Upsert a batch; returns the ids the endpoint committed
    async fn upsert_batch(
        &self,
        session_id: &str,
        batch: &[Message],
    ) -> Result<HashSet<MessageId>, SyncFailure>;
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    #[serde(rename = "sessionId")]
    session_id: &'a str,
    #[serde(rename = "unsavedMessages")]
    unsaved_messages: &'a [Message],
}

#[derive(Debug, serde::Deserialize)]
struct BatchResponse {
    #[serde(rename = "savedMessageIds", default)]
    saved_message_ids: Vec<MessageId>,
}

/// Persistence API backed by the session collaborator's HTTP endpoint
pub struct HttpPersistence {
    url: String,
}

impl HttpPersistence {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl PersistenceApi for HttpPersistence {
    async fn upsert_batch(
        &self,
        session_id: &str,
        batch: &[Message],
    ) -> Result<HashSet<MessageId>, SyncFailure> {
        let response = HTTP_CLIENT
            .post(&self.url)
            .json(&BatchRequest {
                session_id,
                unsaved_messages: batch,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncFailure::Rejected {
                status: status.as_u16(),
            });
        }

        let body: BatchResponse = response.json().await?;
        Ok(body.saved_message_ids.into_iter().collect())
    }
}

/// Drives periodic and on-demand persistence of the conversation store
pub struct Synchronizer {
    store: Arc<Mutex<ConversationStore>>,
    api: Arc<dyn PersistenceApi>,
    session_id: String,
    auto_enabled: AtomicBool,
    /// Serializes sync cycles: the timer and explicit flushes share it, so a
    /// flush waits for an in-flight send to complete
    cycle_lock: tokio::sync::Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<Mutex<ConversationStore>>,
        api: Arc<dyn PersistenceApi>,
        session_id: impl Into<String>,
        auto_enabled: bool,
    ) -> Self {
        Self {
            store,
            api,
            session_id: session_id.into(),
            auto_enabled: AtomicBool::new(auto_enabled),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Enable or disable the periodic timer trigger
    pub fn set_auto_enabled(&self, enabled: bool) {
        self.auto_enabled.store(enabled, Ordering::SeqCst);
    }

    fn lock_store(&self) -> MutexGuard<'_, ConversationStore> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Conversation store mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Run one full sync cycle: collect unsaved finalized messages, send the
    /// batch, and mark the committed ids saved.
    ///
    /// Waits for any in-flight cycle first, so this doubles as the explicit
    /// flush operation.
    pub async fn sync_now(&self) -> SyncReport {
        let _guard = self.cycle_lock.lock().await;

        // Collecting: snapshot the unsaved, non-partial set
        let batch = self.lock_store().unsaved();
        if batch.is_empty() {
            return SyncReport::default();
        }

        debug!("Syncing {} unsaved messages", batch.len());

        // Sending
        match self.api.upsert_batch(&self.session_id, &batch).await {
            Ok(committed_ids) => {
                let committed = self.lock_store().mark_saved(&committed_ids);
                if committed < batch.len() {
                    warn!(
                        "Persistence committed {} of {} messages; the rest retry next cycle",
                        committed,
                        batch.len()
                    );
                } else {
                    info!("Saved {} messages", committed);
                }
                SyncReport {
                    attempted: batch.len(),
                    committed,
                    failed: false,
                }
            }
            Err(e) => {
                // Unsaved flags stay as they are; the same set (plus anything
                // newly finalized) is retried on the next tick
                warn!("Sync failed, will retry: {}", e);
                SyncReport {
                    attempted: batch.len(),
                    committed: 0,
                    failed: true,
                }
            }
        }
    }

    /// Run the auto-sync timer loop until the task is aborted
    pub async fn run(self: Arc<Self>, interval_ms: u64) {
        let mut ticker = interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.auto_enabled.load(Ordering::SeqCst) {
                self.sync_now().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Channel, Message};
    use std::sync::atomic::AtomicUsize;

    /// Fake endpoint that commits a configurable number of messages per call
    struct FakePersistence {
        commit_limit: Option<usize>,
        fail: AtomicBool,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        last_batch: Mutex<Vec<Message>>,
    }

    impl FakePersistence {
        fn new(commit_limit: Option<usize>) -> Self {
            Self {
                commit_limit,
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                last_batch: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl PersistenceApi for FakePersistence {
        async fn upsert_batch(
            &self,
            _session_id: &str,
            batch: &[Message],
        ) -> Result<HashSet<MessageId>, SyncFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            // Yield so overlapping cycles would be observable
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            *self.last_batch.lock().unwrap() = batch.to_vec();

            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncFailure::Rejected { status: 500 });
            }

            let limit = self.commit_limit.unwrap_or(batch.len());
            Ok(batch.iter().take(limit).map(|m| m.id.clone()).collect())
        }
    }

    fn store_with(messages: Vec<Message>) -> Arc<Mutex<ConversationStore>> {
        let mut store = ConversationStore::new();
        for m in messages {
            store.append(m);
        }
        Arc::new(Mutex::new(store))
    }

    fn finalized(text: &str) -> Message {
        Message::new(Channel::Local, text, false)
    }

    #[tokio::test]
    async fn test_partial_commit_flips_only_returned_ids() {
        // 3 unsaved messages sent, the endpoint commits only 2
        let store = store_with(vec![finalized("a"), finalized("b"), finalized("c")]);
        let api = Arc::new(FakePersistence::new(Some(2)));
        let sync = Synchronizer::new(store.clone(), api.clone(), "s1", true);

        let report = sync.sync_now().await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.committed, 2);
        assert!(!report.failed);

        let stats = store.lock().unwrap().stats();
        assert_eq!(stats.saved, 2);
        assert_eq!(stats.unsaved, 1);

        // The straggler is included in the next cycle
        let report = sync.sync_now().await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.committed, 1);
        assert_eq!(store.lock().unwrap().stats().unsaved, 0);
    }

    #[tokio::test]
    async fn test_resending_a_batch_is_idempotent() {
        let store = store_with(vec![finalized("a"), finalized("b")]);
        let api = Arc::new(FakePersistence::new(None));
        let sync = Synchronizer::new(store.clone(), api.clone(), "s1", true);

        sync.sync_now().await;
        let stats_once = store.lock().unwrap().stats();

        // Everything is saved, so the second cycle sends nothing and the
        // stored state is unchanged
        let report = sync.sync_now().await;
        assert_eq!(report.attempted, 0);
        assert_eq!(store.lock().unwrap().stats(), stats_once);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_unsaved_set_for_retry() {
        let store = store_with(vec![finalized("a")]);
        let api = Arc::new(FakePersistence::new(None));
        api.fail.store(true, Ordering::SeqCst);
        let sync = Synchronizer::new(store.clone(), api.clone(), "s1", true);

        let report = sync.sync_now().await;
        assert!(report.failed);
        assert_eq!(store.lock().unwrap().stats().unsaved, 1);

        // Next cycle retries the same set, plus anything newly finalized
        store.lock().unwrap().append(finalized("b"));
        api.fail.store(false, Ordering::SeqCst);
        let report = sync.sync_now().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(store.lock().unwrap().stats().unsaved, 0);
    }

    #[tokio::test]
    async fn test_partial_messages_are_never_sent_or_mutated() {
        let open = Message::new(Channel::Remote, "still talking", true);
        let open_id = open.id.clone();
        let store = store_with(vec![finalized("done"), open]);
        let api = Arc::new(FakePersistence::new(None));
        let sync = Synchronizer::new(store.clone(), api.clone(), "s1", true);

        sync.sync_now().await;

        let sent = api.last_batch.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "done");

        let guard = store.lock().unwrap();
        let open = guard.get(&open_id).unwrap();
        assert_eq!(open.text, "still talking");
        assert!(open.is_partial);
        assert!(!open.is_saved);
    }

    #[tokio::test]
    async fn test_cycles_never_overlap() {
        let store = store_with(vec![finalized("a")]);
        let api = Arc::new(FakePersistence::new(Some(0)));
        let sync = Arc::new(Synchronizer::new(store.clone(), api.clone(), "s1", true));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let sync = sync.clone();
            tasks.push(tokio::spawn(async move { sync.sync_now().await }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_store_sends_nothing() {
        let store = store_with(vec![]);
        let api = Arc::new(FakePersistence::new(None));
        let sync = Synchronizer::new(store, api.clone(), "s1", true);

        let report = sync.sync_now().await;
        assert_eq!(report, SyncReport::default());
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
    }
}
