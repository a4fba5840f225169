//! Streaming Speech-to-Text
//!
//! Live transcription over the recognizer's streaming WebSocket, wrapped in
//! an utterance finalizer that turns the noisy interim/final event stream
//! into exactly one committed utterance per user speech turn.
//!
//! Recognizers occasionally deliver an empty final after a non-empty
//! interim, or never deliver a final at all for the last phrase. The
//! finalizer keeps the last interim and salvages it on an empty final, an
//! UtteranceEnd event, or a 1500 ms fallback timer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::agent::TranscriberConfig;

/// Interim fallback: a lone interim becomes the committed utterance after
/// this long without a final.
const INTERIM_FALLBACK: Duration = Duration::from_millis(1500);

/// Transcripts are dropped for this long after a buffer clear.
const CLEAR_WINDOW: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SttError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("stream error: {0}")]
    Stream(String),
}

/// Events surfaced to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Interim transcript; resets the silence timer.
    Interim(String),
    /// One committed user utterance.
    Utterance(String),
    /// Recognizer stream error.
    Error(String),
}

/// The recognizer surface the orchestrator drives.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Ship caller audio to the recognizer.
    async fn send_audio(&self, audio: Bytes);

    /// Drop pending transcripts and ignore events for the next 500 ms.
    fn clear_buffer(&self);

    /// Suppress transcripts while the agent is speaking or thinking.
    fn set_ignore(&self, ignore: bool);

    /// Close the stream. No event is emitted afterwards.
    fn close(&self);
}

struct FinalizerState {
    last_interim: Option<String>,
    /// Transcripts dropped until this instant after a clear_buffer call.
    ignore_until: Option<tokio::time::Instant>,
}

/// Turns raw recognizer events into committed utterances.
pub struct UtteranceFinalizer {
    state: Mutex<FinalizerState>,
    /// True while the agent is thinking or speaking.
    ignore: AtomicBool,
    /// Bumped whenever the pending fallback timer becomes stale.
    fallback_gen: AtomicU64,
    events: mpsc::Sender<SttEvent>,
    closed: AtomicBool,
}

impl UtteranceFinalizer {
    pub fn new(events: mpsc::Sender<SttEvent>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FinalizerState {
                last_interim: None,
                ignore_until: None,
            }),
            ignore: AtomicBool::new(false),
            fallback_gen: AtomicU64::new(0),
            events,
            closed: AtomicBool::new(false),
        })
    }

    fn is_ignoring(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.ignore.load(Ordering::SeqCst) {
            return true;
        }
        let state = self.state.lock().unwrap();
        state
            .ignore_until
            .map_or(false, |until| tokio::time::Instant::now() < until)
    }

    pub fn set_ignore(&self, ignore: bool) {
        self.ignore.store(ignore, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.fallback_gen.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop buffered state and ignore everything for the clear window.
    pub fn clear_buffer(&self) {
        self.fallback_gen.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.last_interim = None;
        state.ignore_until = Some(tokio::time::Instant::now() + CLEAR_WINDOW);
    }

    /// Feed one transcript event from the recognizer.
    pub fn on_transcript(self: &Arc<Self>, text: &str, is_final: bool) {
        if self.is_ignoring() {
            return;
        }

        let text = text.trim();

        if is_final {
            self.fallback_gen.fetch_add(1, Ordering::SeqCst);
            let salvage = {
                let mut state = self.state.lock().unwrap();
                let pending = state.last_interim.take();
                if text.is_empty() {
                    pending
                } else {
                    None
                }
            };

            if !text.is_empty() {
                self.emit(SttEvent::Utterance(text.to_string()));
            } else if let Some(pending) = salvage {
                // empty final after a non-empty interim: salvage the interim
                self.emit(SttEvent::Utterance(pending));
            }
            return;
        }

        if text.is_empty() {
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            state.last_interim = Some(text.to_string());
        }
        self.emit(SttEvent::Interim(text.to_string()));
        self.arm_fallback();
    }

    /// Recognizer signalled the end of a speech segment.
    pub fn on_utterance_end(self: &Arc<Self>) {
        if self.is_ignoring() {
            return;
        }

        self.fallback_gen.fetch_add(1, Ordering::SeqCst);
        let pending = self.state.lock().unwrap().last_interim.take();
        if let Some(pending) = pending {
            self.emit(SttEvent::Utterance(pending));
        }
    }

    /// (Re)arm the fallback timer that commits a dangling interim.
    fn arm_fallback(self: &Arc<Self>) {
        let gen = self.fallback_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let finalizer = self.clone();

        tokio::spawn(async move {
            tokio::time::sleep(INTERIM_FALLBACK).await;

            if finalizer.fallback_gen.load(Ordering::SeqCst) != gen {
                return;
            }
            if finalizer.closed.load(Ordering::SeqCst) || finalizer.ignore.load(Ordering::SeqCst) {
                return;
            }

            let pending = finalizer.state.lock().unwrap().last_interim.take();
            if let Some(pending) = pending {
                finalizer.emit(SttEvent::Utterance(pending));
            }
        });
    }

    fn emit(&self, event: SttEvent) {
        if self.events.try_send(event).is_err() {
            tracing::warn!("STT event channel full, dropping event");
        }
    }

    fn emit_error(&self, message: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.try_send(SttEvent::Error(message));
    }
}

/// Deepgram live-transcription client.
pub struct DeepgramStt {
    audio_tx: mpsc::Sender<Bytes>,
    finalizer: Arc<UtteranceFinalizer>,
    cancel: CancellationToken,
}

impl DeepgramStt {
    fn listen_url(cfg: &TranscriberConfig) -> String {
        format!(
            "wss://api.deepgram.com/v1/listen?model={}&language={}&encoding={}&sample_rate={}&channels=1&interim_results=true&endpointing={}&utterance_end_ms={}&vad_events=true&punctuate=true",
            cfg.model_name,
            cfg.language,
            cfg.encoding,
            cfg.sample_rate,
            cfg.endpointing_ms,
            cfg.utterance_end_ms,
        )
    }

    /// Open the live socket and start the reader/writer tasks.
    pub async fn connect(
        api_key: &str,
        cfg: &TranscriberConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Arc<Self>, SttError> {
        let url = Self::listen_url(cfg);

        let mut request = url
            .into_client_request()
            .map_err(|e| SttError::Connect(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", api_key)
                .parse()
                .map_err(|_| SttError::Connect("invalid API key header".to_string()))?,
        );

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| SttError::Connect(e.to_string()))?;
        let (mut writer, mut reader) = stream.split();

        let finalizer = UtteranceFinalizer::new(events);
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(256);
        let cancel = CancellationToken::new();

        // writer: caller audio out, CloseStream on shutdown
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let close = serde_json::json!({"type": "CloseStream"}).to_string();
                        let _ = writer.send(Message::Text(close.into())).await;
                        let _ = writer.close().await;
                        break;
                    }
                    audio = audio_rx.recv() => match audio {
                        Some(audio) => {
                            if writer.send(Message::Binary(audio.to_vec().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // reader: recognizer events into the finalizer
        let reader_finalizer = finalizer.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    message = reader.next() => message,
                };

                match message {
                    Some(Ok(Message::Text(text))) => {
                        Self::handle_message(&reader_finalizer, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("Recognizer stream closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("Recognizer stream error: {}", e);
                        reader_finalizer.emit_error(e.to_string());
                        break;
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            audio_tx,
            finalizer,
            cancel,
        }))
    }

    fn handle_message(finalizer: &Arc<UtteranceFinalizer>, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => return,
        };

        match value["type"].as_str() {
            Some("Results") => {
                let transcript = value["channel"]["alternatives"][0]["transcript"]
                    .as_str()
                    .unwrap_or("");
                let is_final = value["is_final"].as_bool().unwrap_or(false);
                finalizer.on_transcript(transcript, is_final);
            }
            Some("UtteranceEnd") => finalizer.on_utterance_end(),
            Some("SpeechStarted") | Some("Metadata") => {}
            Some("Error") => {
                let message = value["description"]
                    .as_str()
                    .or_else(|| value["message"].as_str())
                    .unwrap_or("recognizer error")
                    .to_string();
                finalizer.emit_error(message);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl SpeechRecognizer for DeepgramStt {
    async fn send_audio(&self, audio: Bytes) {
        // audio keeps flowing even while transcripts are suppressed so the
        // recognizer session stays alive
        if self.audio_tx.send(audio).await.is_err() {
            tracing::debug!("Recognizer audio channel closed");
        }
    }

    fn clear_buffer(&self) {
        self.finalizer.clear_buffer();
    }

    fn set_ignore(&self, ignore: bool) {
        self.finalizer.set_ignore(ignore);
    }

    fn close(&self) {
        self.finalizer.close();
        self.cancel.cancel();
    }
}
