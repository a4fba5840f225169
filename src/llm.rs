//! Streaming LLM Chat
//!
//! Holds the per-call conversation history and streams assistant replies
//! token-by-token from an OpenAI-style chat-completions endpoint. Long
//! histories are folded into a summary note so the context stays bounded.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use crate::agent::ModelConfig;

/// History beyond this many messages is compacted.
const HISTORY_LIMIT: usize = 20;

/// Turns kept verbatim when the history is compacted.
const HISTORY_KEEP: usize = 5;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("stream parse error: {0}")]
    Parse(String),
}

/// One turn of the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Streaming chat-completion backend. Chunks go out on `chunk_tx` as they
/// arrive; the full reply is the return value.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn stream_completion(
        &self,
        cfg: &ModelConfig,
        messages: &[ChatMessage],
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError>;
}

/// Map OpenAI-style model names onto backend identifiers.
pub fn resolve_model_name(name: &str) -> &str {
    match name {
        "gpt-4o" => "gpt-4o",
        "gpt-4o-mini" | "gpt-4-mini" => "gpt-4o-mini",
        "gpt-4" | "gpt-4-turbo" => "gpt-4-turbo",
        "gpt-3.5-turbo" | "gpt-3.5" => "gpt-3.5-turbo",
        other => other,
    }
}

/// OpenAI-compatible streaming backend.
pub struct OpenAiChat {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiChat {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn stream_completion(
        &self,
        cfg: &ModelConfig,
        messages: &[ChatMessage],
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let payload = serde_json::json!({
            "model": resolve_model_name(&cfg.model_name),
            "messages": messages,
            "temperature": cfg.temperature,
            "max_tokens": cfg.max_tokens,
            "stream": true,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut reply = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Network(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are newline-delimited "data: {...}" lines
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data == "[DONE]" {
                    return Ok(reply);
                }

                let value: serde_json::Value = serde_json::from_str(data)
                    .map_err(|e| LlmError::Parse(e.to_string()))?;
                if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                    reply.push_str(delta);
                    let _ = chunk_tx.send(delta.to_string()).await;
                }
            }
        }

        Ok(reply)
    }
}

/// Per-call chat session: history plus a streaming backend.
pub struct ChatClient {
    backend: std::sync::Arc<dyn ChatBackend>,
    cfg: ModelConfig,
    history: Vec<ChatMessage>,
}

impl ChatClient {
    pub fn new(backend: std::sync::Arc<dyn ChatBackend>, cfg: ModelConfig) -> Self {
        let history = vec![ChatMessage::system(cfg.system_prompt.clone())];
        Self {
            backend,
            cfg,
            history,
        }
    }

    /// Record an assistant turn that was produced outside the model, such
    /// as the configured first message.
    pub fn push_assistant(&mut self, content: &str) {
        self.history.push(ChatMessage::assistant(content));
    }

    /// Send the user turn, stream the reply through `chunk_tx`, append both
    /// sides to history, and return the full reply.
    pub async fn get_response(
        &mut self,
        user_text: &str,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        self.history.push(ChatMessage::user(user_text));

        let reply = self
            .backend
            .stream_completion(&self.cfg, &self.history, chunk_tx)
            .await;

        match reply {
            Ok(reply) => {
                self.history.push(ChatMessage::assistant(reply.clone()));
                self.compact_history();
                Ok(reply)
            }
            Err(e) => {
                // drop the unanswered user turn so a retry starts clean
                self.history.pop();
                Err(e)
            }
        }
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Fold older turns into a single assistant note, keeping the system
    /// prompt and the last few turns verbatim.
    fn compact_history(&mut self) {
        if self.history.len() <= HISTORY_LIMIT {
            return;
        }

        let system = self.history[0].clone();
        let keep_from = self.history.len() - HISTORY_KEEP;
        let older = &self.history[1..keep_from];

        let mut summary = String::from("Earlier in this call: ");
        for message in older {
            summary.push_str(&format!("[{}] {} ", message.role, message.content));
        }

        let mut compacted = vec![system, ChatMessage::assistant(summary.trim_end())];
        compacted.extend_from_slice(&self.history[keep_from..]);
        self.history = compacted;

        tracing::debug!("Compacted chat history to {} messages", self.history.len());
    }
}
