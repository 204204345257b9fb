//! Engine configuration
//!
//! Loaded from the embedded `config.toml`, with endpoint overrides taken
//! from the environment (via `.env` in development). The segmentation and
//! sync knobs that were hardcoded in earlier revisions live here with their
//! documented defaults.

use serde::Deserialize;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Segmentation and persistence cadence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Maximum finalized message length in characters
    pub max_message_length: usize,
    /// Auto-sync timer interval in milliseconds
    pub auto_save_interval_ms: u64,
    /// Whether the auto-sync timer is armed at startup
    pub auto_save_enabled: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_message_length: 200,
            auto_save_interval_ms: 5000,
            auto_save_enabled: true,
        }
    }
}

/// Recognition provider socket parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// WebSocket endpoint of the streaming recognition provider
    pub ws_url: String,
    /// Recognition model requested from the provider
    pub model: String,
    /// Language hint for recognition
    pub language: String,
    /// Audio encoding advertised in the Configure frame
    pub encoding: String,
    /// Sample rate the provider expects, in Hz
    pub sample_rate: u32,
    /// Provider-side idle timeout, in milliseconds
    pub timeout_ms: u64,
    /// Endpointing window for utterance detection, in milliseconds
    pub endpointing_ms: u64,
    /// Keep-alive control frame interval, in seconds
    pub keep_alive_interval_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            ws_url: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-3".to_string(),
            language: "en".to_string(),
            encoding: "linear16".to_string(),
            sample_rate: 16000,
            timeout_ms: 120_000,
            endpointing_ms: 500,
            keep_alive_interval_secs: 30,
        }
    }
}

/// External collaborator endpoints
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Token-issuance endpoint (POST {session_id, channel_kind})
    pub token_url: String,
    /// Persistence endpoint (POST message batch, upsert by id)
    pub persistence_url: String,
}

/// Audio capture parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Duration of one audio chunk sent to the provider, in milliseconds
    pub chunk_duration_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_duration_ms: 100,
        }
    }
}

impl Config {
    /// Load configuration from the embedded config.toml, then apply
    /// environment overrides for the collaborator endpoints.
    pub fn load() -> Result<Self, toml::de::Error> {
        const CONFIG_TOML: &str = include_str!("../config.toml");
        let mut config: Config = toml::from_str(CONFIG_TOML)?;

        if let Ok(url) = std::env::var("COLLOQUY_TOKEN_URL") {
            config.endpoints.token_url = url;
        }
        if let Ok(url) = std::env::var("COLLOQUY_PERSISTENCE_URL") {
            config.endpoints.persistence_url = url;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let conv = ConversationConfig::default();
        assert_eq!(conv.max_message_length, 200);
        assert_eq!(conv.auto_save_interval_ms, 5000);
        assert!(conv.auto_save_enabled);

        let provider = ProviderConfig::default();
        assert_eq!(provider.keep_alive_interval_secs, 30);
        assert_eq!(provider.endpointing_ms, 500);
        assert_eq!(provider.timeout_ms, 120_000);

        assert_eq!(CaptureConfig::default().chunk_duration_ms, 100);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config: Config = toml::from_str(
            r#"
            [conversation]
            max_message_length = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.conversation.max_message_length, 120);
        assert_eq!(config.conversation.auto_save_interval_ms, 5000);
        assert_eq!(config.provider.encoding, "linear16");
    }

    #[test]
    fn test_embedded_config_parses() {
        let config = Config::load().expect("embedded config.toml must parse");
        assert!(config.provider.ws_url.starts_with("wss://"));
    }
}
