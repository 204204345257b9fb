//! Recognition provider integration
//!
//! Wraps the streaming socket to the external transcription provider: wire
//! messages, token issuance, and the per-channel send/receive tasks that turn
//! provider frames into adapter events.

pub(crate) mod connection;
mod error;
mod messages;
mod token;

pub use error::SocketError;
pub use token::{HttpTokenIssuer, TokenFetchError, TokenIssuer};

pub(crate) use token::HTTP_CLIENT;

use crate::message::{Channel, Fragment};

/// Event emitted by a transcript source adapter toward the engine loop
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// One incremental recognition result
    Fragment(Fragment),
    /// End-of-utterance signal for the channel
    SpeechFinal(Channel),
    /// The channel's capture or socket ended; resources are being released
    ChannelClosed(Channel),
}
