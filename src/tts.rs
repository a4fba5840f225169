//! Streaming Text-to-Speech
//!
//! Streams synthesized audio from an ElevenLabs-style endpoint in μ-law at
//! 8 kHz, so chunks go to the transport without resampling. Synthesis is
//! cancellable between chunks via an abort flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::agent::VoiceConfig;

/// Model identifiers that reject per-request voice settings.
const SETTINGS_UNSUPPORTED_MODELS: &[&str] = &["eleven_v3", "eleven_ttv_v3"];

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("synthesis aborted")]
    Aborted,
}

/// Streaming synthesizer surface the orchestrator drives. Audio chunks are
/// pushed to `sink` as they arrive; the abort flag is honored between
/// chunks.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize_stream(
        &self,
        text: &str,
        voice: &VoiceConfig,
        abort: &AtomicBool,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<(), TtsError>;
}

/// Whether per-request voice settings may be sent for this model.
fn supports_voice_settings(model_id: &str) -> bool {
    !SETTINGS_UNSUPPORTED_MODELS
        .iter()
        .any(|m| model_id.starts_with(m))
}

/// Whether the language code should be forwarded with the request.
fn forward_language_code(language: &str) -> bool {
    let lang = language.to_ascii_lowercase();
    !lang.is_empty() && lang != "en" && lang != "en-us" || lang == "hinglish"
}

/// Build the synthesis request body for a voice configuration.
fn request_body(text: &str, voice: &VoiceConfig) -> serde_json::Value {
    let mut body = serde_json::json!({
        "text": text,
        "model_id": voice.tts_model_id,
    });

    if supports_voice_settings(&voice.tts_model_id) {
        body["voice_settings"] = serde_json::json!({
            "stability": voice.stability,
            "similarity_boost": voice.similarity_boost,
            "speed": voice.speed,
            "use_speaker_boost": true,
            "style": 0,
        });
    }

    if forward_language_code(&voice.language) {
        body["language_code"] = serde_json::json!(voice.language);
    }

    body
}

/// ElevenLabs streaming synthesis client.
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ElevenLabsTts {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.elevenlabs.io/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsTts {
    async fn synthesize_stream(
        &self,
        text: &str,
        voice: &VoiceConfig,
        abort: &AtomicBool,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<(), TtsError> {
        if abort.load(Ordering::SeqCst) {
            return Err(TtsError::Aborted);
        }

        let url = format!(
            "{}/text-to-speech/{}/stream?output_format={}",
            self.base_url, voice.voice_id, voice.output_format
        );

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request_body(text, voice))
            .send()
            .await
            .map_err(|e| TtsError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TtsError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            // the abort flag is the cancellation point between chunks
            if abort.load(Ordering::SeqCst) {
                tracing::debug!("TTS stream aborted");
                return Err(TtsError::Aborted);
            }

            let chunk = chunk.map_err(|e| TtsError::Network(e.to_string()))?;
            if chunk.is_empty() {
                continue;
            }
            if sink.send(chunk).await.is_err() {
                return Err(TtsError::Aborted);
            }
        }

        Ok(())
    }
}

/// Handle that lets the orchestrator stop an in-flight synthesis.
#[derive(Clone, Default)]
pub struct TtsAbort(Arc<AtomicBool>);

impl TtsAbort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn flag(&self) -> &AtomicBool {
        &self.0
    }
}
