//! Agent Configuration
//!
//! Immutable per-call configuration describing the AI pipeline: which model
//! answers, which voice speaks, and how the transcriber listens. Loaded once
//! when a call starts and never mutated afterwards.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentConfigError {
    #[error("missing model configuration")]
    MissingModel,

    #[error("missing voice configuration")]
    MissingVoice,

    #[error("missing transcriber configuration")]
    MissingTranscriber,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Who speaks first once the call is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FirstMessageMode {
    #[default]
    #[serde(rename = "assistant-speaks-first")]
    AssistantSpeaksFirst,
    #[serde(rename = "user-speaks-first")]
    UserSpeaksFirst,
}

/// LLM settings for a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: String,
    pub model_name: String,
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// TTS voice settings for a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub provider: String,
    pub voice_id: String,
    pub tts_model_id: String,
    pub stability: f64,
    pub similarity_boost: f64,
    pub speed: f64,
    pub language: String,
    /// Must stay μ-law at 8 kHz so the transport needs no resampling.
    pub output_format: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            provider: "elevenlabs".to_string(),
            voice_id: String::new(),
            tts_model_id: "eleven_turbo_v2_5".to_string(),
            stability: 0.5,
            similarity_boost: 0.75,
            speed: 1.0,
            language: "en".to_string(),
            output_format: "ulaw_8000".to_string(),
        }
    }
}

/// STT settings for a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriberConfig {
    pub provider: String,
    pub model_name: String,
    pub language: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub endpointing_ms: u32,
    pub utterance_end_ms: u32,
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            provider: "deepgram".to_string(),
            model_name: "nova-2".to_string(),
            language: "en".to_string(),
            encoding: "mulaw".to_string(),
            sample_rate: 8000,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
        }
    }
}

/// Complete per-call agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub model: ModelConfig,
    pub voice: VoiceConfig,
    pub transcriber: TranscriberConfig,
    pub first_message: String,
    pub first_message_mode: FirstMessageMode,
    pub max_duration_seconds: u64,
    pub silence_timeout_seconds: u64,
    pub response_delay_seconds: f64,
}

impl AgentConfig {
    /// Reject a call before dialing when the pipeline cannot be assembled.
    pub fn validate(&self) -> Result<(), AgentConfigError> {
        if self.model.model_name.is_empty() {
            return Err(AgentConfigError::MissingModel);
        }
        if self.voice.voice_id.is_empty() {
            return Err(AgentConfigError::MissingVoice);
        }
        if self.transcriber.model_name.is_empty() {
            return Err(AgentConfigError::MissingTranscriber);
        }
        if self.transcriber.sample_rate != 8000 {
            return Err(AgentConfigError::Invalid(format!(
                "transcriber sample rate must be 8000, got {}",
                self.transcriber.sample_rate
            )));
        }
        if self.max_duration_seconds == 0 {
            return Err(AgentConfigError::Invalid(
                "max duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                provider: "openai".to_string(),
                model_name: "gpt-4o-mini".to_string(),
                system_prompt: "You are a helpful phone assistant. Keep responses short and conversational.".to_string(),
                temperature: 0.7,
                max_tokens: 150,
            },
            voice: VoiceConfig::default(),
            transcriber: TranscriberConfig::default(),
            first_message: "Hello!".to_string(),
            first_message_mode: FirstMessageMode::AssistantSpeaksFirst,
            max_duration_seconds: 600,
            silence_timeout_seconds: 30,
            response_delay_seconds: 0.0,
        }
    }
}
