//! Provider WebSocket connection handling
//!
//! Opens the streaming recognition socket, sends the Configure control frame,
//! and runs the send/receive tasks for one channel. The send task owns the
//! keep-alive heartbeat; the receive task turns provider frames into adapter
//! events for the assembler.

use super::error::{SocketError, WS_CONNECT_TIMEOUT_SECS};
use super::messages::{ClientMessage, ProviderEvent, ServerFrame};
use super::AdapterEvent;
use crate::capture::AudioChunk;
use crate::config::ProviderConfig;
use crate::message::{Channel, Fragment};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Generate a random WebSocket key
fn generate_ws_key() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut key = [0u8; 16];
    rng.fill(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// Build the provider WebSocket URL with recognition query parameters
pub(crate) fn build_ws_url(config: &ProviderConfig) -> Result<url::Url, SocketError> {
    let mut url = url::Url::parse(&config.ws_url)
        .map_err(|e| SocketError::ConnectionError(e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("model", &config.model)
        .append_pair("language", &config.language)
        .append_pair("smart_format", "true")
        .append_pair("punctuate", "true")
        .append_pair("interim_results", "true")
        .append_pair("keep_alive", "true")
        .append_pair("timeout", &config.timeout_ms.to_string())
        .append_pair("endpointing", &config.endpointing_ms.to_string());
    Ok(url)
}

/// Build the WebSocket handshake request with token subprotocol auth
pub(crate) fn build_ws_request(
    ws_url: &url::Url,
    token: &str,
) -> Result<http::Request<()>, SocketError> {
    let host = ws_url
        .host_str()
        .ok_or_else(|| SocketError::ConnectionError("Invalid URL: no host".to_string()))?;

    http::Request::builder()
        .uri(ws_url.as_str())
        .header("Host", host)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", generate_ws_key())
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Protocol", format!("token, {}", token))
        .body(())
        .map_err(|e| SocketError::ConnectionError(e.to_string()))
}

/// Open the provider socket for one channel, with a handshake timeout
pub(crate) async fn open_socket(
    config: &ProviderConfig,
    token: &str,
) -> Result<WsStream, SocketError> {
    let ws_url = build_ws_url(config)?;
    let request = build_ws_request(&ws_url, token)?;

    info!(ws_url = %ws_url, "Connecting to recognition provider");

    let ws_result = timeout(
        Duration::from_secs(WS_CONNECT_TIMEOUT_SECS),
        connect_async(request),
    )
    .await;

    match ws_result {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(SocketError::ConnectionError(e.to_string())),
        Err(_) => Err(SocketError::ConnectionTimeout),
    }
}

/// Send the Configure control frame after the socket opens
pub(crate) async fn send_configure<S>(
    ws_sink: &mut S,
    config: &ProviderConfig,
    token: &str,
) -> Result<(), SocketError>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let msg = ClientMessage::Configure {
        token: token.to_string(),
        encoding: config.encoding.clone(),
        sample_rate: config.sample_rate,
        interim_results: true,
        keep_alive: true,
        timeout: config.timeout_ms,
        endpointing: config.endpointing_ms,
    };
    let json = serde_json::to_string(&msg).map_err(|e| SocketError::ConnectionError(e.to_string()))?;
    debug!("Sending Configure frame");
    ws_sink
        .send(Message::Text(json))
        .await
        .map_err(|e| SocketError::ConnectionError(e.to_string()))
}

/// Spawn the receive task: provider frames in, adapter events out.
///
/// Malformed frames are logged and skipped; they must never stall the loop.
/// Exactly one `ChannelClosed` event is emitted when the socket ends, for
/// any reason.
pub(crate) fn spawn_receive_task(
    mut ws_stream: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
    channel: Channel,
    event_tx: mpsc::Sender<AdapterEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg_result) = ws_stream.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    trace!(channel = %channel, "Provider frame: {}", text);
                    let frame: ServerFrame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(channel = %channel, "Failed to parse provider frame: {}", e);
                            continue;
                        }
                    };
                    let event = match frame.classify() {
                        ProviderEvent::Transcript { text, is_final } => {
                            AdapterEvent::Fragment(Fragment::new(channel, text, is_final))
                        }
                        ProviderEvent::SpeechFinal => {
                            debug!(channel = %channel, "Received SpeechFinal");
                            AdapterEvent::SpeechFinal(channel)
                        }
                        ProviderEvent::Metadata => {
                            debug!(channel = %channel, "Received provider metadata");
                            continue;
                        }
                        ProviderEvent::Other => continue,
                    };
                    if event_tx.send(event).await.is_err() {
                        // Engine loop is gone; nothing left to feed
                        break;
                    }
                }
                Ok(Message::Close(_)) => {
                    info!(channel = %channel, "Provider closed the socket");
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!(channel = %channel, "WebSocket ping/pong");
                }
                Err(e) => {
                    error!(channel = %channel, "WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        let _ = event_tx.send(AdapterEvent::ChannelClosed(channel)).await;
    })
}

/// Spawn the send task: forwards audio as binary frames and owns the
/// keep-alive heartbeat.
///
/// When the socket dies the task exits; the capture side uses `try_send`
/// into a bounded channel, so further chunks are dropped rather than
/// buffered. Closing via `close_rx` is idempotent from the caller's side.
pub(crate) fn spawn_send_task<S>(
    mut ws_sink: S,
    mut audio_rx: mpsc::Receiver<AudioChunk>,
    mut close_rx: mpsc::Receiver<()>,
    channel: Channel,
    keep_alive_interval_secs: u64,
) -> tokio::task::JoinHandle<()>
where
    S: SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut keep_alive = interval(Duration::from_secs(keep_alive_interval_secs));
        keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the heartbeat starts
        // one interval after the Configure frame.
        keep_alive.tick().await;

        let mut chunks_sent = 0u64;

        loop {
            tokio::select! {
                biased;

                _ = close_rx.recv() => {
                    debug!(channel = %channel, "Send task received close signal");
                    if let Ok(json) = serde_json::to_string(&ClientMessage::CloseStream) {
                        let _ = ws_sink.send(Message::Text(json)).await;
                    }
                    let _ = ws_sink.close().await;
                    break;
                }
                _ = keep_alive.tick() => {
                    let json = match serde_json::to_string(&ClientMessage::KeepAlive) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if ws_sink.send(Message::Text(json)).await.is_err() {
                        warn!(channel = %channel, "Failed to send keep-alive frame");
                        break;
                    }
                    trace!(channel = %channel, "Sent keep-alive frame");
                }
                chunk = audio_rx.recv() => {
                    match chunk {
                        Some(audio_chunk) => {
                            chunks_sent += 1;
                            if chunks_sent == 1 || chunks_sent % 100 == 0 {
                                debug!(
                                    channel = %channel,
                                    "Sending audio chunk #{}, {} samples",
                                    chunks_sent,
                                    audio_chunk.samples.len()
                                );
                            }
                            let bytes: Vec<u8> = audio_chunk
                                .samples
                                .iter()
                                .flat_map(|&s| s.to_le_bytes())
                                .collect();
                            if ws_sink.send(Message::Binary(bytes)).await.is_err() {
                                error!(channel = %channel, "Failed to send audio chunk, closing send task");
                                break;
                            }
                        }
                        None => {
                            info!(
                                channel = %channel,
                                "Audio capture ended after {} chunks", chunks_sent
                            );
                            if let Ok(json) = serde_json::to_string(&ClientMessage::CloseStream) {
                                let _ = ws_sink.send(Message::Text(json)).await;
                            }
                            let _ = ws_sink.close().await;
                            break;
                        }
                    }
                }
            }
        }

        debug!(channel = %channel, "Send task exiting after {} chunks", chunks_sent);
    })
}
