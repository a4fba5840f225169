//! Call Records
//!
//! The only externally visible state the engine produces: one record per
//! call, kept current through the call's lifecycle and finalized on end.
//! Persistence is a collaborator boundary; the in-memory store backs tests
//! and single-process deployments.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Externally visible call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
}

/// One conversation turn in the persisted transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// The per-call record written to the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_reason: Option<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub recording_url: Option<String>,
    pub duration_seconds: u64,
    pub agent_id: String,
    pub customer_number: String,
}

impl CallRecord {
    pub fn new(id: String, agent_id: String, customer_number: String) -> Self {
        Self {
            id,
            status: CallStatus::Initiated,
            started_at: Utc::now(),
            ended_at: None,
            ended_reason: None,
            transcript: Vec::new(),
            recording_url: None,
            duration_seconds: 0,
            agent_id,
            customer_number,
        }
    }
}

/// Store interface the media bridge writes through.
#[async_trait::async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create(&self, record: CallRecord);
    async fn update_status(&self, call_id: &str, status: CallStatus);
    async fn append_transcript(&self, call_id: &str, entry: TranscriptEntry);
    async fn set_recording_url(&self, call_id: &str, url: String);
    async fn finalize(&self, call_id: &str, status: CallStatus, reason: &str);
    async fn get(&self, call_id: &str) -> Option<CallRecord>;
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryCallStore {
    records: RwLock<HashMap<String, CallRecord>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, for inspection and diagnostics.
    pub async fn list(&self) -> Vec<CallRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create(&self, record: CallRecord) {
        self.records
            .write()
            .await
            .insert(record.id.clone(), record);
    }

    async fn update_status(&self, call_id: &str, status: CallStatus) {
        if let Some(record) = self.records.write().await.get_mut(call_id) {
            // never regress a finalized record
            if !matches!(record.status, CallStatus::Completed | CallStatus::Failed) {
                record.status = status;
            }
        }
    }

    async fn append_transcript(&self, call_id: &str, entry: TranscriptEntry) {
        if let Some(record) = self.records.write().await.get_mut(call_id) {
            record.transcript.push(entry);
        }
    }

    async fn set_recording_url(&self, call_id: &str, url: String) {
        if let Some(record) = self.records.write().await.get_mut(call_id) {
            record.recording_url = Some(url);
        }
    }

    async fn finalize(&self, call_id: &str, status: CallStatus, reason: &str) {
        if let Some(record) = self.records.write().await.get_mut(call_id) {
            if record.ended_at.is_some() {
                return;
            }
            let now = Utc::now();
            record.status = status;
            record.ended_at = Some(now);
            record.ended_reason = Some(reason.to_string());
            record.duration_seconds = (now - record.started_at).num_seconds().max(0) as u64;
        }
    }

    async fn get(&self, call_id: &str) -> Option<CallRecord> {
        self.records.read().await.get(call_id).cloned()
    }
}
