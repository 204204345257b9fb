//! Conversation engine
//!
//! Owns the conversation store and the per-channel connection links, runs
//! the single event loop that feeds adapter fragments through the segment
//! assembler, and drives the persistence synchronizer. All fragment handling
//! is serialized through one task, so assembler state never races.

use crate::assembler::{AssemblyOutcome, SegmentAssembler};
use crate::capture::{MediaSource, MicSource};
use crate::config::Config;
use crate::lifecycle::{ChannelLink, ConnectError, LifecycleState};
use crate::message::{Channel, Message, MessageId};
use crate::provider::{AdapterEvent, TokenIssuer};
use crate::store::{ConversationStats, ConversationStore, QueryFilter, StoreError};
use crate::sync::{PersistenceApi, SyncReport, Synchronizer};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Notifications for engine observers (UI, logging, tests)
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new segment was opened in the log
    MessageStarted { id: MessageId, channel: Channel },
    /// An open segment's text changed
    MessageUpdated { id: MessageId },
    /// A segment was finalized and is eligible for persistence
    MessageFinalized { id: MessageId },
    /// A channel's capture or socket ended
    ChannelClosed(Channel),
}

/// Top-level façade over capture, assembly, storage, and persistence
pub struct ConversationEngine {
    config: Config,
    session_id: String,
    store: Arc<Mutex<ConversationStore>>,
    assembler: Arc<Mutex<SegmentAssembler>>,
    links: Arc<tokio::sync::Mutex<HashMap<Channel, ChannelLink>>>,
    token_issuer: Arc<dyn TokenIssuer>,
    synchronizer: Arc<Synchronizer>,
    event_tx: mpsc::Sender<AdapterEvent>,
    events: broadcast::Sender<EngineEvent>,
    loop_task: tokio::task::JoinHandle<()>,
    sync_task: tokio::task::JoinHandle<()>,
}

impl ConversationEngine {
    pub fn new(
        config: Config,
        token_issuer: Arc<dyn TokenIssuer>,
        persistence: Arc<dyn PersistenceApi>,
        session_id: impl Into<String>,
    ) -> Self {
        let session_id = session_id.into();
        let store = Arc::new(Mutex::new(ConversationStore::new()));
        let assembler = Arc::new(Mutex::new(SegmentAssembler::new(
            config.conversation.max_message_length,
        )));
        let (event_tx, event_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(256);

        let synchronizer = Arc::new(Synchronizer::new(
            store.clone(),
            persistence,
            session_id.clone(),
            config.conversation.auto_save_enabled,
        ));
        let sync_task = tokio::spawn(
            synchronizer
                .clone()
                .run(config.conversation.auto_save_interval_ms),
        );

        let links = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let loop_task = tokio::spawn(run_event_loop(
            event_rx,
            assembler.clone(),
            store.clone(),
            links.clone(),
            events.clone(),
        ));

        info!(session_id = %session_id, "Conversation engine started");
        Self {
            config,
            session_id,
            store,
            assembler,
            links,
            token_issuer,
            synchronizer,
            event_tx,
            events,
            loop_task,
            sync_task,
        }
    }

    /// Subscribe to engine notifications
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Connect the local channel using the default microphone
    pub async fn connect_microphone(&self) -> Result<(), ConnectError> {
        let source = MicSource::new(
            self.config.provider.sample_rate,
            self.config.capture.chunk_duration_ms,
        );
        self.connect_source(Box::new(source)).await
    }

    /// Connect a channel with an already-acquired media source
    pub async fn connect_source(&self, media: Box<dyn MediaSource>) -> Result<(), ConnectError> {
        let channel = media.channel();
        let mut links = self.links.lock().await;
        let link = links
            .entry(channel)
            .or_insert_with(|| ChannelLink::new(channel, self.event_tx.clone()));
        link.connect(
            media,
            self.token_issuer.as_ref(),
            &self.config.provider,
            &self.session_id,
        )
        .await
    }

    /// Disconnect one channel; a no-op if it is not connected
    pub async fn disconnect(&self, channel: Channel) {
        let mut links = self.links.lock().await;
        if let Some(link) = links.get_mut(&channel) {
            link.disconnect().await;
        }
    }

    pub async fn disconnect_all(&self) {
        let mut links = self.links.lock().await;
        for link in links.values_mut() {
            link.disconnect().await;
        }
    }

    /// Current lifecycle state for a channel
    pub async fn channel_state(&self, channel: Channel) -> LifecycleState {
        let links = self.links.lock().await;
        links
            .get(&channel)
            .map(|l| l.state())
            .unwrap_or(LifecycleState::Disconnected)
    }

    /// Append a hand-typed message: finalized immediately, outside any open
    /// segment, persisted on the next sync cycle.
    pub fn add_manual_message(&self, channel: Channel, text: impl Into<String>) -> MessageId {
        let message = Message::manual(channel, text);
        let id = message.id.clone();
        self.lock_store().append(message);
        debug!(channel = %channel, "Manual message {} appended", id);
        let _ = self.events.send(EngineEvent::MessageFinalized { id: id.clone() });
        id
    }

    /// Toggle a message's visibility in filtered reads
    pub fn set_hidden(&self, id: &MessageId, hidden: bool) -> Result<(), StoreError> {
        self.lock_store().set_hidden(id, hidden)
    }

    /// Read the conversation log through the given filters
    pub fn transcript(&self, filter: QueryFilter) -> Vec<Message> {
        self.lock_store().query(filter)
    }

    /// The live open segment for a channel, if one exists
    pub fn open_partial(&self, channel: Channel) -> Option<Message> {
        let assembler = self.lock_assembler();
        let id = assembler.open_segment_id(channel)?.clone();
        drop(assembler);
        self.lock_store().get(&id).cloned()
    }

    pub fn stats(&self) -> ConversationStats {
        self.lock_store().stats()
    }

    /// Arm or disarm the periodic persistence timer
    pub fn set_auto_save(&self, enabled: bool) {
        self.synchronizer.set_auto_enabled(enabled);
    }

    /// Save-all: finalize every open segment, then run a sync cycle.
    ///
    /// Waits for any in-flight auto-sync cycle before sending.
    pub async fn flush(&self) -> SyncReport {
        let finalized = {
            let mut assembler = self.lock_assembler();
            let mut store = self.lock_store();
            assembler.flush_all(&mut store)
        };
        for id in finalized {
            let _ = self.events.send(EngineEvent::MessageFinalized { id });
        }
        self.synchronizer.sync_now().await
    }

    /// Session teardown: disconnect every channel, then save everything
    pub async fn shutdown(&self) -> SyncReport {
        // Disarm the timer so the final flush is the last cycle
        self.set_auto_save(false);
        self.disconnect_all().await;
        let report = self.flush().await;
        if report.failed {
            warn!("Final save failed; {} messages left unsaved", report.attempted);
        }
        report
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

    fn lock_assembler(&self) -> MutexGuard<'_, SegmentAssembler> {
        match self.assembler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Assembler mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        self.loop_task.abort();
        self.sync_task.abort();
    }
}

/// Single consumer of all adapter events.
///
/// Fragments from every channel pass through here in arrival order, which is
/// what makes segment creation order the log order.
async fn run_event_loop(
    mut event_rx: mpsc::Receiver<AdapterEvent>,
    assembler: Arc<Mutex<SegmentAssembler>>,
    store: Arc<Mutex<ConversationStore>>,
    links: Arc<tokio::sync::Mutex<HashMap<Channel, ChannelLink>>>,
    events: broadcast::Sender<EngineEvent>,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            AdapterEvent::Fragment(fragment) => {
                let outcome = {
                    let mut assembler = lock_or_recover(&assembler);
                    let mut store = lock_or_recover(&store);
                    assembler.handle_fragment(&mut store, &fragment)
                };
                emit_assembly_events(&events, fragment.channel, outcome);
            }
            AdapterEvent::SpeechFinal(channel) => {
                let finalized = {
                    let mut assembler = lock_or_recover(&assembler);
                    let mut store = lock_or_recover(&store);
                    assembler.speech_final(&mut store, channel)
                };
                if let Some(id) = finalized {
                    let _ = events.send(EngineEvent::MessageFinalized { id });
                }
            }
            AdapterEvent::ChannelClosed(channel) => {
                // A closing channel never leaves a dangling open segment
                let finalized = {
                    let mut assembler = lock_or_recover(&assembler);
                    let mut store = lock_or_recover(&store);
                    assembler.speech_final(&mut store, channel)
                };
                if let Some(id) = finalized {
                    let _ = events.send(EngineEvent::MessageFinalized { id });
                }
                // A provider-side close must release the link's capture
                // device and socket tasks, not just the open segment; the
                // link would otherwise sit in Streaming with the device hot.
                {
                    let mut links = links.lock().await;
                    if let Some(link) = links.get_mut(&channel) {
                        link.disconnect().await;
                    }
                }
                let _ = events.send(EngineEvent::ChannelClosed(channel));
            }
        }
    }
    debug!("Engine event loop ended");
}

fn emit_assembly_events(
    events: &broadcast::Sender<EngineEvent>,
    channel: Channel,
    outcome: AssemblyOutcome,
) {
    match outcome {
        AssemblyOutcome::Ignored => {}
        AssemblyOutcome::Started { id, finalized } => {
            let _ = events.send(EngineEvent::MessageStarted {
                id: id.clone(),
                channel,
            });
            if finalized {
                let _ = events.send(EngineEvent::MessageFinalized { id });
            }
        }
        AssemblyOutcome::Extended { id, finalized } => {
            if finalized {
                let _ = events.send(EngineEvent::MessageFinalized { id });
            } else {
                let _ = events.send(EngineEvent::MessageUpdated { id });
            }
        }
        AssemblyOutcome::Split {
            finalized_id,
            new_id,
            new_finalized,
        } => {
            let _ = events.send(EngineEvent::MessageFinalized { id: finalized_id });
            let _ = events.send(EngineEvent::MessageStarted {
                id: new_id.clone(),
                channel,
            });
            if new_finalized {
                let _ = events.send(EngineEvent::MessageFinalized { id: new_id });
            }
        }
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Engine state mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
