//! Engine Configuration
//!
//! Process-level configuration loaded from environment variables: AI service
//! credentials, recording storage location, and default call limits. The SIP
//! trunk has its own configuration in `sip::config`.

use serde::{Deserialize, Serialize};

/// Engine-level configuration consumed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deepgram API key for streaming transcription.
    pub deepgram_api_key: String,

    /// OpenAI-compatible API key for chat completions.
    pub openai_api_key: String,

    /// ElevenLabs API key for streaming synthesis.
    pub elevenlabs_api_key: String,

    /// Directory for recording storage. Recording is disabled when unset.
    pub recordings_dir: Option<String>,

    /// Default silence timeout applied when the agent config leaves it unset.
    pub default_silence_timeout_secs: u64,

    /// Default maximum call duration.
    pub default_max_duration_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deepgram_api_key: String::new(),
            openai_api_key: String::new(),
            elevenlabs_api_key: String::new(),
            recordings_dir: None,
            default_silence_timeout_secs: 30,
            default_max_duration_secs: 600,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self {
            deepgram_api_key: std::env::var("DEEPGRAM_API_KEY").unwrap_or_default(),
            openai_api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            elevenlabs_api_key: std::env::var("ELEVENLABS_API_KEY").unwrap_or_default(),
            recordings_dir: std::env::var("RECORDINGS_DIR").ok(),
            default_silence_timeout_secs: std::env::var("SILENCE_TIMEOUT_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            default_max_duration_secs: std::env::var("MAX_DURATION_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(600),
        }
    }
}
