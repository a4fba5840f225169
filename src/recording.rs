//! Call Recording
//!
//! Accumulates per-direction μ-law audio for each call, mixes both channels
//! on stop, wraps the result in a μ-law WAV container and hands it to the
//! storage collaborator. Without storage configuration the sink is a silent
//! no-op.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

use crate::codec::{mix_mulaw, mulaw_to_wav};

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage operation failed: {0}")]
    OperationFailed(String),
}

pub type RecordingResult<T> = Result<T, RecordingError>;

/// Which leg of the call a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Caller,
    Agent,
}

/// Metadata attached to a recording when it starts.
#[derive(Debug, Clone, Default)]
pub struct RecordingMeta {
    pub agent_id: String,
    pub customer_number: String,
}

struct CallRecording {
    caller: Vec<u8>,
    agent: Vec<u8>,
    started_at: DateTime<Utc>,
    meta: RecordingMeta,
}

/// Storage backend a finished recording is handed to.
#[async_trait::async_trait]
pub trait RecordingStorage: Send + Sync {
    /// Store the WAV bytes and return a retrievable URL or path.
    async fn store_recording(
        &self,
        call_id: &str,
        data: Vec<u8>,
    ) -> RecordingResult<String>;
}

/// Local filesystem storage, organized as `base/YYYY/MM/DD/<call>_<ts>.wav`.
pub struct LocalFileStorage {
    base_path: PathBuf,
}

impl LocalFileStorage {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl RecordingStorage for LocalFileStorage {
    async fn store_recording(
        &self,
        call_id: &str,
        data: Vec<u8>,
    ) -> RecordingResult<String> {
        let now = Utc::now();
        let dir = self.base_path.join(now.format("%Y/%m/%d").to_string());
        fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}_{}.wav", call_id, now.timestamp()));
        fs::write(&path, data).await?;

        tracing::info!("Stored recording at {:?}", path);
        Ok(path.to_string_lossy().to_string())
    }
}

/// Process-wide registry of in-progress recordings, keyed by call id.
pub struct RecordingSink {
    recordings: Mutex<HashMap<String, CallRecording>>,
    storage: Option<std::sync::Arc<dyn RecordingStorage>>,
}

impl RecordingSink {
    pub fn new(storage: Option<std::sync::Arc<dyn RecordingStorage>>) -> Self {
        Self {
            recordings: Mutex::new(HashMap::new()),
            storage,
        }
    }

    /// Whether a storage backend is configured.
    pub fn is_enabled(&self) -> bool {
        self.storage.is_some()
    }

    /// Begin accumulating audio for a call.
    pub async fn start(&self, call_id: &str, meta: RecordingMeta) {
        if !self.is_enabled() {
            return;
        }

        let mut recordings = self.recordings.lock().await;
        recordings.insert(
            call_id.to_string(),
            CallRecording {
                caller: Vec::new(),
                agent: Vec::new(),
                started_at: Utc::now(),
                meta,
            },
        );
        tracing::debug!("Recording started for call {}", call_id);
    }

    /// Append a μ-law chunk for one direction.
    pub async fn add_chunk(&self, call_id: &str, bytes: &[u8], direction: Direction) {
        if !self.is_enabled() {
            return;
        }

        let mut recordings = self.recordings.lock().await;
        if let Some(recording) = recordings.get_mut(call_id) {
            match direction {
                Direction::Caller => recording.caller.extend_from_slice(bytes),
                Direction::Agent => recording.agent.extend_from_slice(bytes),
            }
        }
    }

    /// Mix, wrap and upload the recording. Returns the stored URL, or None
    /// when recording was disabled or produced no audio.
    pub async fn stop_and_upload(&self, call_id: &str) -> Option<String> {
        let storage = self.storage.as_ref()?;
        let recording = self.recordings.lock().await.remove(call_id)?;

        if recording.caller.is_empty() && recording.agent.is_empty() {
            tracing::debug!("No audio captured for call {}", call_id);
            return None;
        }

        let mixed = mix_mulaw(&recording.caller, &recording.agent);
        let wav = mulaw_to_wav(&mixed);

        let duration = Utc::now() - recording.started_at;
        tracing::info!(
            "Uploading recording for call {} ({} bytes, {}s, agent {}, customer {})",
            call_id,
            wav.len(),
            duration.num_seconds(),
            recording.meta.agent_id,
            recording.meta.customer_number,
        );

        match storage.store_recording(call_id, wav).await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::error!("Recording upload failed for call {}: {}", call_id, e);
                None
            }
        }
    }
}
