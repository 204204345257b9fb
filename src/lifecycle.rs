//! Connection lifecycle management
//!
//! One `ChannelLink` per adapter walks Disconnected → Acquiring → TokenFetch
//! → SocketConnecting → Streaming → Closing → Disconnected. Any failure goes
//! through Failed, runs full resource teardown, and lands back in
//! Disconnected; a link is never left half-open. Open-segment tracking lives
//! in the engine, not here; this module owns devices, sockets, and tasks.

use crate::capture::{
    validate_remote_source, AcquisitionError, ControllerSupport, FocusBehavior, MediaSource,
};
use crate::capture::surface::SurfaceController;
use crate::config::ProviderConfig;
use crate::message::Channel;
use crate::provider::connection::{open_socket, send_configure, spawn_receive_task, spawn_send_task};
use crate::provider::{AdapterEvent, SocketError, TokenFetchError, TokenIssuer};
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Connection state for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Acquiring,
    TokenFetch,
    SocketConnecting,
    Streaming,
    Closing,
    /// Terminal per attempt; always followed by teardown and Disconnected
    Failed,
}

/// Errors from a connection attempt
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Token(#[from] TokenFetchError),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

/// Lifecycle manager for one adapter's device + socket + tasks
pub struct ChannelLink {
    channel: Channel,
    state: LifecycleState,
    media: Option<Box<dyn MediaSource>>,
    controller: Option<Box<dyn SurfaceController>>,
    close_tx: Option<mpsc::Sender<()>>,
    send_task: Option<tokio::task::JoinHandle<()>>,
    recv_task: Option<tokio::task::JoinHandle<()>>,
    event_tx: mpsc::Sender<AdapterEvent>,
}

impl ChannelLink {
    pub fn new(channel: Channel, event_tx: mpsc::Sender<AdapterEvent>) -> Self {
        Self {
            channel,
            state: LifecycleState::Disconnected,
            media: None,
            controller: None,
            close_tx: None,
            send_task: None,
            recv_task: None,
            event_tx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Run the full connect sequence for this channel.
    ///
    /// Remote sources are surface-validated before anything else; a token
    /// fetch failure aborts without a socket attempt. On any error the link
    /// tears down completely and returns to Disconnected.
    pub async fn connect(
        &mut self,
        mut media: Box<dyn MediaSource>,
        token_issuer: &dyn TokenIssuer,
        provider_config: &ProviderConfig,
        session_id: &str,
    ) -> Result<(), ConnectError> {
        if self.state != LifecycleState::Disconnected {
            debug!(channel = %self.channel, "connect ignored, link is {:?}", self.state);
            media.stop();
            return Ok(());
        }

        self.state = LifecycleState::Acquiring;
        if self.channel == Channel::Remote {
            if let Err(e) = validate_remote_source(media.as_mut()) {
                // The validator already stopped the acquired tracks
                return Err(self.fail(e.into()).await);
            }
        }

        match media.take_controller() {
            ControllerSupport::Supported(mut controller) => {
                controller.set_focus_behavior(FocusBehavior::NoFocusChange);
                self.controller = Some(controller);
            }
            ControllerSupport::Unsupported => {
                debug!(channel = %self.channel, "No surface controller available");
            }
        }
        self.media = Some(media);

        self.state = LifecycleState::TokenFetch;
        let token = match token_issuer.issue(session_id, self.channel).await {
            Ok(token) => token,
            Err(e) => return Err(self.fail(e.into()).await),
        };

        self.state = LifecycleState::SocketConnecting;
        let ws_stream = match open_socket(provider_config, &token).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(e.into()).await),
        };

        let (mut ws_sink, ws_stream) = ws_stream.split();
        if let Err(e) = send_configure(&mut ws_sink, provider_config, &token).await {
            return Err(self.fail(e.into()).await);
        }

        let audio_rx = match self.media.as_mut().map(|m| m.start()) {
            Some(Ok(rx)) => rx,
            Some(Err(e)) => return Err(self.fail(e.into()).await),
            None => {
                let e = SocketError::ConnectionError("media source released mid-connect".into());
                return Err(self.fail(e.into()).await);
            }
        };

        let (close_tx, close_rx) = mpsc::channel(1);
        self.close_tx = Some(close_tx);
        self.recv_task = Some(spawn_receive_task(
            ws_stream,
            self.channel,
            self.event_tx.clone(),
        ));
        self.send_task = Some(spawn_send_task(
            ws_sink,
            audio_rx,
            close_rx,
            self.channel,
            provider_config.keep_alive_interval_secs,
        ));

        self.state = LifecycleState::Streaming;
        info!(channel = %self.channel, "Channel streaming");
        Ok(())
    }

    /// User-initiated disconnect. Idempotent: disconnecting a link that is
    /// already down is a no-op.
    pub async fn disconnect(&mut self) {
        if self.state == LifecycleState::Disconnected {
            self.teardown().await;
            return;
        }
        self.state = LifecycleState::Closing;
        self.teardown().await;
        self.state = LifecycleState::Disconnected;
        info!(channel = %self.channel, "Channel disconnected");
    }

    async fn fail(&mut self, error: ConnectError) -> ConnectError {
        warn!(channel = %self.channel, "Connection attempt failed: {}", error);
        self.state = LifecycleState::Failed;
        self.teardown().await;
        self.state = LifecycleState::Disconnected;
        error
    }

    /// Release everything this link holds, in order: media tracks, then the
    /// socket (which retires the keep-alive timer with the send task), then
    /// the controller handle. Every step runs regardless of earlier ones.
    async fn teardown(&mut self) {
        if let Some(mut media) = self.media.take() {
            media.stop();
        }

        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(()).await;
        }
        if let Some(task) = self.send_task.take() {
            let _ = task.await;
        }
        if let Some(mut task) = self.recv_task.take() {
            // The receive task ends when the socket closes and emits the
            // channel-closed event; abort if the peer never answers the close.
            if timeout(Duration::from_secs(5), &mut task).await.is_err() {
                warn!(channel = %self.channel, "Receive task did not close in time, aborting");
                task.abort();
                let _ = self
                    .event_tx
                    .send(AdapterEvent::ChannelClosed(self.channel))
                    .await;
            }
        }

        self.controller = None;
    }
}
