//! Conversation data model
//!
//! Defines the persisted `Message` unit, the transient `Fragment` emitted by
//! transcript source adapters, and message id generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Speech source for a fragment or message.
///
/// `Local` is the microphone ("user" in the merged transcript), `Remote` is
/// the captured tab/application audio ("other").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Local,
    Remote,
}

impl Channel {
    /// Prefix used in generated message ids
    pub fn id_prefix(self) -> &'static str {
        match self {
            Channel::Local => "mic",
            Channel::Remote => "screen",
        }
    }

    /// Channel kind string sent to the token-issuance endpoint
    pub fn kind(self) -> &'static str {
        match self {
            Channel::Local => "microphone",
            Channel::Remote => "capturescreen",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Local => write!(f, "local"),
            Channel::Remote => write!(f, "remote"),
        }
    }
}

/// Unique, stable identifier for a conversation message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a fresh id: `<prefix>_<unix-millis>_<random-suffix>`
    pub fn generate(channel: Channel) -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let suffix: String = (0..9)
            .map(|_| {
                let idx = rng.gen_range(0..36);
                char::from_digit(idx, 36).unwrap_or('0')
            })
            .collect();
        MessageId(format!(
            "{}_{}_{}",
            channel.id_prefix(),
            Utc::now().timestamp_millis(),
            suffix
        ))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One incremental recognition result from the provider.
///
/// Fragments are produced continuously by adapters and consumed immediately
/// by the assembler; they are never stored.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub text: String,
    pub is_final: bool,
    pub channel: Channel,
    pub received_at: DateTime<Utc>,
}

impl Fragment {
    pub fn new(channel: Channel, text: impl Into<String>, is_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            channel,
            received_at: Utc::now(),
        }
    }
}

/// Persisted unit of conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel: Channel,
    pub text: String,
    /// Timestamp of the most recent mutation
    #[serde(rename = "time")]
    pub last_updated_at: DateTime<Utc>,
    /// Still receiving fragments, not yet finalized
    #[serde(rename = "isPartial")]
    pub is_partial: bool,
    /// Acknowledged by the persistence layer
    #[serde(rename = "saved")]
    pub is_saved: bool,
    /// User-controlled visibility, independent of save/partial state
    #[serde(rename = "hidden")]
    pub is_hidden: bool,
}

impl Message {
    /// Create a new unsaved, visible message
    pub fn new(channel: Channel, text: impl Into<String>, is_partial: bool) -> Self {
        Self {
            id: MessageId::generate(channel),
            channel,
            text: text.into(),
            last_updated_at: Utc::now(),
            is_partial,
            is_saved: false,
            is_hidden: false,
        }
    }

    /// Create a manual message: finalized immediately, never an open segment
    pub fn manual(channel: Channel, text: impl Into<String>) -> Self {
        Self::new(channel, text, false)
    }
}
