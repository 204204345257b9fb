//! Recognition provider wire messages
//!
//! Defines the control frames sent to the streaming recognition socket and
//! the JSON frames it sends back. Result frames carry the transcript under
//! `channel.alternatives[0].transcript` plus an `is_final` flag; control
//! frames are tagged `Metadata` or `SpeechFinal`.

use serde::{Deserialize, Serialize};

/// Messages sent to the provider socket
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum ClientMessage {
    /// Session configuration sent after the socket opens
    Configure {
        token: String,
        encoding: String,
        sample_rate: u32,
        interim_results: bool,
        keep_alive: bool,
        timeout: u64,
        endpointing: u64,
    },
    /// Periodic heartbeat preventing provider-side idle disconnect
    KeepAlive,
    /// Graceful end of the audio stream
    CloseStream,
}

/// One JSON frame from the provider
#[derive(Debug, Deserialize)]
pub(crate) struct ServerFrame {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub channel: Option<FrameChannel>,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FrameChannel {
    #[serde(default)]
    pub alternatives: Vec<FrameAlternative>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FrameAlternative {
    pub transcript: Option<String>,
}

/// Interpreted provider frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProviderEvent {
    /// A recognition result, partial or final
    Transcript { text: String, is_final: bool },
    /// End-of-utterance marker, distinct from per-result finality
    SpeechFinal,
    /// Connection metadata, logged and ignored
    Metadata,
    /// Anything else
    Other,
}

impl ServerFrame {
    /// Interpret the frame for the adapter
    pub fn classify(&self) -> ProviderEvent {
        match self.kind.as_deref() {
            Some("SpeechFinal") => return ProviderEvent::SpeechFinal,
            Some("Metadata") => return ProviderEvent::Metadata,
            _ => {}
        }

        let transcript = self
            .channel
            .as_ref()
            .and_then(|c| c.alternatives.first())
            .and_then(|a| a.transcript.as_ref());

        match transcript {
            Some(text) if !text.trim().is_empty() => ProviderEvent::Transcript {
                text: text.clone(),
                is_final: self.is_final,
            },
            _ => ProviderEvent::Other,
        }
    }
}
