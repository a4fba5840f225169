//! Media Bridge and Call Engine
//!
//! Wires a call's bidirectional audio to its AI pipeline. For SIP calls the
//! bridge pumps RTP payloads into the orchestrator's recognizer and paces
//! agent audio back out through the RTP session; for hosted media streams
//! the same wiring runs over WebSocket JSON frames. Orchestrator lifecycle
//! events keep the call record current and drive the final hangup.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::agent::{AgentConfig, TranscriberConfig};
use crate::config::EngineConfig;
use crate::llm::{ChatBackend, OpenAiChat};
use crate::orchestrator::{Conversation, EndReason, SessionEvent};
use crate::recording::{Direction, LocalFileStorage, RecordingMeta, RecordingSink};
use crate::sip::{SipConfig, SipError, SipEvent, SipUserAgent};
use crate::store::{CallRecord, CallRecordStore, CallStatus, MemoryCallStore};
use crate::stt::{DeepgramStt, SpeechRecognizer, SttError, SttEvent};
use crate::tts::{ElevenLabsTts, SpeechSynthesizer};

/// Media frames buffered between stream start and session readiness.
const START_BUFFER_LIMIT: usize = 500;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid agent configuration: {0}")]
    Config(#[from] crate::agent::AgentConfigError),

    #[error("SIP error: {0}")]
    Sip(#[from] SipError),

    #[error("SIP trunk not configured")]
    NoTrunk,

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("recognizer error: {0}")]
    Stt(#[from] SttError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the per-call AI pipeline. Swapped for fakes in tests.
#[async_trait::async_trait]
pub trait PipelineFactory: Send + Sync {
    async fn recognizer(
        &self,
        cfg: &TranscriberConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Arc<dyn SpeechRecognizer>, SttError>;

    fn chat_backend(&self) -> Arc<dyn ChatBackend>;

    fn synthesizer(&self) -> Arc<dyn SpeechSynthesizer>;
}

/// Production pipeline: Deepgram, OpenAI-compatible chat, ElevenLabs.
pub struct DefaultPipeline {
    deepgram_api_key: String,
    chat: Arc<dyn ChatBackend>,
    tts: Arc<dyn SpeechSynthesizer>,
}

impl DefaultPipeline {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            deepgram_api_key: cfg.deepgram_api_key.clone(),
            chat: Arc::new(OpenAiChat::new(cfg.openai_api_key.clone())),
            tts: Arc::new(ElevenLabsTts::new(cfg.elevenlabs_api_key.clone())),
        }
    }
}

#[async_trait::async_trait]
impl PipelineFactory for DefaultPipeline {
    async fn recognizer(
        &self,
        cfg: &TranscriberConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Arc<dyn SpeechRecognizer>, SttError> {
        let stt = DeepgramStt::connect(&self.deepgram_api_key, cfg, events).await?;
        Ok(stt as Arc<dyn SpeechRecognizer>)
    }

    fn chat_backend(&self) -> Arc<dyn ChatBackend> {
        self.chat.clone()
    }

    fn synthesizer(&self) -> Arc<dyn SpeechSynthesizer> {
        self.tts.clone()
    }
}

/// One live call session.
pub struct CallSession {
    pub call_id: String,
    pub conversation: Arc<Conversation>,
}

/// The engine: owns the transports, the pipeline factory, the recording
/// sink, the call-record store and the per-call session map.
pub struct CallEngine {
    sip: Option<Arc<SipUserAgent>>,
    pipeline: Arc<dyn PipelineFactory>,
    sink: Arc<RecordingSink>,
    store: Arc<dyn CallRecordStore>,
    sessions: Arc<RwLock<HashMap<String, Arc<CallSession>>>>,
    agents: RwLock<HashMap<String, AgentConfig>>,
    defaults: EngineConfig,
}

impl CallEngine {
    /// Assemble an engine from configuration, with the production pipeline.
    pub async fn from_config(
        engine_cfg: EngineConfig,
        sip_cfg: Option<SipConfig>,
    ) -> Result<Arc<Self>, EngineError> {
        let pipeline = Arc::new(DefaultPipeline::new(&engine_cfg));
        let storage = engine_cfg
            .recordings_dir
            .as_ref()
            .map(|dir| Arc::new(LocalFileStorage::new(dir)) as Arc<dyn crate::recording::RecordingStorage>);
        let sink = Arc::new(RecordingSink::new(storage));
        let store = Arc::new(MemoryCallStore::new());

        Self::new(engine_cfg, sip_cfg, pipeline, sink, store).await
    }

    /// Assemble an engine from explicit collaborators.
    pub async fn new(
        defaults: EngineConfig,
        sip_cfg: Option<SipConfig>,
        pipeline: Arc<dyn PipelineFactory>,
        sink: Arc<RecordingSink>,
        store: Arc<dyn CallRecordStore>,
    ) -> Result<Arc<Self>, EngineError> {
        let (sip, sip_events) = match sip_cfg {
            Some(cfg) => {
                let (agent, events) = SipUserAgent::new(cfg).await?;
                (Some(agent), Some(events))
            }
            None => (None, None),
        };

        let engine = Arc::new(Self {
            sip,
            pipeline,
            sink,
            store,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            agents: RwLock::new(HashMap::new()),
            defaults,
        });

        if let Some(events) = sip_events {
            let dispatcher = engine.clone();
            tokio::spawn(async move { dispatcher.dispatch_sip_events(events).await });
        }

        Ok(engine)
    }

    /// Register an agent configuration for lookup by id.
    pub async fn register_agent(&self, agent_id: &str, cfg: AgentConfig) {
        self.agents.write().await.insert(agent_id.to_string(), cfg);
    }

    pub async fn agent_config(&self, agent_id: &str) -> Option<AgentConfig> {
        self.agents.read().await.get(agent_id).cloned()
    }

    /// Register with the SIP trunk.
    pub async fn register(&self) -> Result<(), EngineError> {
        let sip = self.sip.as_ref().ok_or(EngineError::NoTrunk)?;
        sip.register().await?;
        Ok(())
    }

    /// Dial an outbound SIP call for the given agent.
    pub async fn start_outbound_call(
        &self,
        agent_id: &str,
        number: &str,
    ) -> Result<String, EngineError> {
        let sip = self.sip.as_ref().ok_or(EngineError::NoTrunk)?;
        let agent_cfg = self
            .agent_config(agent_id)
            .await
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        let agent_cfg = self.apply_defaults(agent_cfg);
        agent_cfg.validate()?;

        // record and agent binding exist before the INVITE leaves, so the
        // answer can never outrun them
        let call_id = Uuid::new_v4().to_string();
        self.store
            .create(CallRecord::new(
                call_id.clone(),
                agent_id.to_string(),
                sip.config().canonicalize_number(number),
            ))
            .await;
        self.agents
            .write()
            .await
            .insert(format!("call:{}", call_id), agent_cfg);

        if let Err(e) = sip.dial(number, &call_id).await {
            self.agents.write().await.remove(&format!("call:{}", call_id));
            self.store
                .finalize(
                    &call_id,
                    CallStatus::Failed,
                    EndReason::TransportError.as_str(),
                )
                .await;
            return Err(e.into());
        }

        Ok(call_id)
    }

    /// End a call at the user's request.
    pub async fn hangup(&self, call_id: &str) -> Result<(), EngineError> {
        let session = self.sessions.read().await.get(call_id).cloned();
        match session {
            Some(session) => {
                session.conversation.end(EndReason::UserHangup).await;
                Ok(())
            }
            None => {
                // not answered yet: tear the dialog down directly
                if let Some(sip) = &self.sip {
                    sip.hangup(call_id).await?;
                    self.store
                        .finalize(call_id, CallStatus::Completed, EndReason::UserHangup.as_str())
                        .await;
                }
                Ok(())
            }
        }
    }

    /// End every call and shut the transports down.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<CallSession>> =
            self.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.conversation.end(EndReason::UserHangup).await;
        }
        if let Some(sip) = &self.sip {
            sip.shutdown().await;
        }
    }

    pub async fn call_record(&self, call_id: &str) -> Option<CallRecord> {
        self.store.get(call_id).await
    }

    pub async fn active_call_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    fn apply_defaults(&self, mut cfg: AgentConfig) -> AgentConfig {
        if cfg.silence_timeout_seconds == 0 {
            cfg.silence_timeout_seconds = self.defaults.default_silence_timeout_secs;
        }
        if cfg.max_duration_seconds == 0 {
            cfg.max_duration_seconds = self.defaults.default_max_duration_secs;
        }
        cfg
    }

    async fn dispatch_sip_events(self: Arc<Self>, mut events: mpsc::Receiver<SipEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SipEvent::Ringing { call_id } => {
                    self.store.update_status(&call_id, CallStatus::Ringing).await;
                }
                SipEvent::Answered { call_id } => {
                    if let Err(e) = self.wire_sip_call(&call_id).await {
                        tracing::error!("Failed to wire call {}: {}", call_id, e);
                        if let Some(sip) = &self.sip {
                            let _ = sip.hangup(&call_id).await;
                        }
                        self.store
                            .finalize(&call_id, CallStatus::Failed, EndReason::Error.as_str())
                            .await;
                    }
                }
                SipEvent::Failed { call_id, status } => {
                    tracing::warn!("Call {} setup failed with {}", call_id, status);
                    self.store
                        .finalize(
                            &call_id,
                            CallStatus::Failed,
                            EndReason::TransportError.as_str(),
                        )
                        .await;
                    self.agents.write().await.remove(&format!("call:{}", call_id));
                }
                SipEvent::RemoteBye { call_id } => {
                    let session = self.sessions.read().await.get(&call_id).cloned();
                    if let Some(session) = session {
                        session.conversation.end(EndReason::RemoteHangup).await;
                    } else {
                        self.store
                            .finalize(
                                &call_id,
                                CallStatus::Completed,
                                EndReason::RemoteHangup.as_str(),
                            )
                            .await;
                    }
                }
            }
        }
    }

    /// Build the AI pipeline for an answered SIP call and wire both audio
    /// directions.
    async fn wire_sip_call(self: &Arc<Self>, call_id: &str) -> Result<(), EngineError> {
        let sip = self.sip.as_ref().ok_or(EngineError::NoTrunk)?;
        let call = sip
            .get_call(call_id)
            .await
            .ok_or_else(|| EngineError::Sip(SipError::CallNotFound(call_id.to_string())))?;

        let agent_cfg = self
            .agents
            .read()
            .await
            .get(&format!("call:{}", call_id))
            .cloned()
            .ok_or_else(|| EngineError::UnknownAgent(call_id.to_string()))?;

        self.store
            .update_status(call_id, CallStatus::InProgress)
            .await;

        let (stt_tx, stt_rx) = mpsc::channel(64);
        let recognizer = self
            .pipeline
            .recognizer(&agent_cfg.transcriber, stt_tx)
            .await?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(256);
        let (event_tx, mut event_rx) = mpsc::channel(256);

        let conversation = Conversation::new(
            agent_cfg.clone(),
            recognizer,
            self.pipeline.chat_backend(),
            self.pipeline.synthesizer(),
            audio_tx,
            event_tx,
        );

        self.sink
            .start(
                call_id,
                RecordingMeta {
                    agent_id: String::new(),
                    customer_number: call.remote_number.clone(),
                },
            )
            .await;

        // caller leg: RTP payload -> recognizer + recording
        let mut rtp_audio = call
            .rtp
            .take_audio_receiver()
            .await
            .ok_or_else(|| EngineError::Sip(SipError::InvalidState("RTP receiver taken".to_string())))?;
        {
            let conversation = conversation.clone();
            let sink = self.sink.clone();
            let call_id = call_id.to_string();
            tokio::spawn(async move {
                while let Some(payload) = rtp_audio.recv().await {
                    sink.add_chunk(&call_id, &payload, Direction::Caller).await;
                    conversation.process_incoming_audio(payload).await;
                }
            });
        }

        // agent leg: synthesized audio -> RTP pacer + recording
        {
            let rtp = call.rtp.clone();
            let sink = self.sink.clone();
            let call_id = call_id.to_string();
            tokio::spawn(async move {
                while let Some(chunk) = audio_rx.recv().await {
                    sink.add_chunk(&call_id, &chunk, Direction::Agent).await;
                    rtp.send_audio(&chunk).await;
                }
            });
        }

        // lifecycle: transcript persistence, final hangup, upload
        {
            let engine = self.clone();
            let call_id = call_id.to_string();
            tokio::spawn(async move {
                while let Some(event) = event_rx.recv().await {
                    match event {
                        SessionEvent::Started => {}
                        SessionEvent::Transcript(entry) => {
                            engine.store.append_transcript(&call_id, entry).await;
                        }
                        SessionEvent::Ended { reason } => {
                            engine.finish_call(&call_id, reason).await;
                            break;
                        }
                    }
                }
            });
        }

        let session = Arc::new(CallSession {
            call_id: call_id.to_string(),
            conversation: conversation.clone(),
        });
        self.sessions
            .write()
            .await
            .insert(call_id.to_string(), session);

        conversation.start(stt_rx);
        tracing::info!("Media bridge wired for call {}", call_id);
        Ok(())
    }

    /// Common teardown once a session reports `ended`.
    async fn finish_call(self: &Arc<Self>, call_id: &str, reason: EndReason) {
        let status = match reason {
            EndReason::TransportError | EndReason::Error => CallStatus::Failed,
            _ => CallStatus::Completed,
        };
        self.store.finalize(call_id, status, reason.as_str()).await;

        if let Some(url) = self.sink.stop_and_upload(call_id).await {
            self.store.set_recording_url(call_id, url).await;
        }

        if let Some(sip) = &self.sip {
            if let Err(e) = sip.hangup(call_id).await {
                tracing::debug!("Hangup after end: {}", e);
            }
        }

        self.sessions.write().await.remove(call_id);
        self.agents.write().await.remove(&format!("call:{}", call_id));
        tracing::info!("Call {} finished: {}", call_id, reason.as_str());
    }
}

// ---------------------------------------------------------------------------
// Hosted media-stream transport
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum InboundFrame {
    Start { start: StartInfo },
    Media { media: MediaPayload },
    Stop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartInfo {
    stream_sid: String,
    #[serde(default)]
    call_sid: String,
    #[serde(default)]
    custom_parameters: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Serialize)]
struct OutboundMedia<'a> {
    event: &'a str,
    #[serde(rename = "streamSid")]
    stream_sid: &'a str,
    media: OutboundPayload,
}

#[derive(Debug, Serialize)]
struct OutboundPayload {
    payload: String,
}

fn encode_media_frame(stream_sid: &str, audio: &[u8]) -> String {
    serde_json::to_string(&OutboundMedia {
        event: "media",
        stream_sid,
        media: OutboundPayload {
            payload: general_purpose::STANDARD.encode(audio),
        },
    })
    .expect("media frame serialization cannot fail")
}

/// Bounded buffer for media frames that arrive before the session is ready.
struct StartBuffer {
    frames: VecDeque<Bytes>,
    dropped: usize,
}

impl StartBuffer {
    fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            dropped: 0,
        }
    }

    fn push(&mut self, frame: Bytes) {
        if self.frames.len() >= START_BUFFER_LIMIT {
            self.frames.pop_front();
            self.dropped += 1;
        }
        self.frames.push_back(frame);
    }

    fn drain(&mut self) -> Vec<Bytes> {
        if self.dropped > 0 {
            tracing::warn!("Start buffer overflowed, dropped {} frames", self.dropped);
        }
        self.frames.drain(..).collect()
    }
}

/// WebSocket server speaking the hosted media-stream framing.
pub struct MediaStreamServer {
    engine: Arc<CallEngine>,
    listener: TcpListener,
}

impl MediaStreamServer {
    pub async fn bind(engine: Arc<CallEngine>, addr: &str) -> Result<Self, EngineError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Media-stream server on {}", listener.local_addr()?);
        Ok(Self { engine, listener })
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accept loop; one task per media stream.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("Media-stream accept failed: {}", e);
                    continue;
                }
            };

            tracing::debug!("Media stream connected from {}", peer);
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_media_stream(engine, stream).await {
                    tracing::warn!("Media stream from {} ended with error: {}", peer, e);
                }
            });
        }
    }
}

async fn handle_media_stream(
    engine: Arc<CallEngine>,
    stream: TcpStream,
) -> Result<(), EngineError> {
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut buffer = StartBuffer::new();
    let mut session: Option<(Arc<Conversation>, String)> = None;
    let mut outbound_task: Option<tokio::task::JoinHandle<()>> = None;
    let call_id = Uuid::new_v4().to_string();

    // outbound frames funnel through one channel so the sink half stays here
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(256);

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                if let Some(frame) = frame {
                    if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
            }
            message = ws_rx.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        tracing::warn!("Media stream error: {}", e);
                        break;
                    }
                    None => break,
                };

                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };

                let frame: InboundFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                };

                match frame {
                    InboundFrame::Start { start } => {
                        let agent_id = start
                            .custom_parameters
                            .get("agentId")
                            .cloned()
                            .unwrap_or_default();
                        tracing::info!(
                            "Media stream start: sid={} call={} agent={}",
                            start.stream_sid,
                            start.call_sid,
                            agent_id
                        );

                        match wire_media_stream(
                            &engine,
                            &call_id,
                            &agent_id,
                            &start.stream_sid,
                            frame_tx.clone(),
                        )
                        .await
                        {
                            Ok((conversation, task, stt_rx)) => {
                                // replay everything buffered during setup, in order
                                for frame in buffer.drain() {
                                    engine
                                        .sink
                                        .add_chunk(&call_id, &frame, Direction::Caller)
                                        .await;
                                    conversation.process_incoming_audio(frame).await;
                                }
                                conversation.start(stt_rx);
                                session = Some((conversation, start.stream_sid));
                                outbound_task = Some(task);
                            }
                            Err(e) => {
                                tracing::error!("Media stream setup failed: {}", e);
                                break;
                            }
                        }
                    }
                    InboundFrame::Media { media } => {
                        let audio = match general_purpose::STANDARD.decode(&media.payload) {
                            Ok(audio) => Bytes::from(audio),
                            Err(_) => continue,
                        };
                        match &session {
                            Some((conversation, _)) => {
                                engine
                                    .sink
                                    .add_chunk(&call_id, &audio, Direction::Caller)
                                    .await;
                                conversation.process_incoming_audio(audio).await;
                            }
                            None => buffer.push(audio),
                        }
                    }
                    InboundFrame::Stop => {
                        tracing::info!("Media stream stop for call {}", call_id);
                        break;
                    }
                    InboundFrame::Other => {}
                }
            }
        }
    }

    if let Some((conversation, _)) = session {
        conversation.end(EndReason::RemoteHangup).await;
    }
    if let Some(task) = outbound_task {
        task.abort();
    }
    Ok(())
}

/// Assemble the pipeline for a hosted media stream and start the outbound
/// pump. Returns the conversation, the pump task and the recognizer events.
async fn wire_media_stream(
    engine: &Arc<CallEngine>,
    call_id: &str,
    agent_id: &str,
    stream_sid: &str,
    frame_tx: mpsc::Sender<String>,
) -> Result<
    (
        Arc<Conversation>,
        tokio::task::JoinHandle<()>,
        mpsc::Receiver<SttEvent>,
    ),
    EngineError,
> {
    let agent_cfg = engine
        .agent_config(agent_id)
        .await
        .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
    let agent_cfg = engine.apply_defaults(agent_cfg);
    agent_cfg.validate()?;

    engine
        .store
        .create(CallRecord::new(
            call_id.to_string(),
            agent_id.to_string(),
            String::new(),
        ))
        .await;
    engine
        .store
        .update_status(call_id, CallStatus::InProgress)
        .await;

    let (stt_tx, stt_rx) = mpsc::channel(64);
    let recognizer = engine
        .pipeline
        .recognizer(&agent_cfg.transcriber, stt_tx)
        .await?;

    let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(256);
    let (event_tx, mut event_rx) = mpsc::channel(256);

    let conversation = Conversation::new(
        agent_cfg,
        recognizer,
        engine.pipeline.chat_backend(),
        engine.pipeline.synthesizer(),
        audio_tx,
        event_tx,
    );

    engine
        .sink
        .start(
            call_id,
            RecordingMeta {
                agent_id: agent_id.to_string(),
                customer_number: String::new(),
            },
        )
        .await;

    // agent leg: synthesized audio -> base64 media frames + recording
    let outbound = {
        let sink = engine.sink.clone();
        let call_id = call_id.to_string();
        let stream_sid = stream_sid.to_string();
        tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                sink.add_chunk(&call_id, &chunk, Direction::Agent).await;
                let frame = encode_media_frame(&stream_sid, &chunk);
                if frame_tx.send(frame).await.is_err() {
                    break;
                }
            }
        })
    };

    // lifecycle persistence
    {
        let engine = engine.clone();
        let call_id = call_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    SessionEvent::Started => {}
                    SessionEvent::Transcript(entry) => {
                        engine.store.append_transcript(&call_id, entry).await;
                    }
                    SessionEvent::Ended { reason } => {
                        engine.finish_call(&call_id, reason).await;
                        break;
                    }
                }
            }
        });
    }

    let session = Arc::new(CallSession {
        call_id: call_id.to_string(),
        conversation: conversation.clone(),
    });
    engine
        .sessions
        .write()
        .await
        .insert(call_id.to_string(), session);

    Ok((conversation, outbound, stt_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_frame_parsing() {
        let start: InboundFrame = serde_json::from_str(
            r#"{"event":"start","start":{"streamSid":"MZ1","callSid":"CA1","customParameters":{"agentId":"a-1"}}}"#,
        )
        .unwrap();
        match start {
            InboundFrame::Start { start } => {
                assert_eq!(start.stream_sid, "MZ1");
                assert_eq!(start.call_sid, "CA1");
                assert_eq!(start.custom_parameters.get("agentId").unwrap(), "a-1");
            }
            other => panic!("expected start frame, got {:?}", other),
        }

        let media: InboundFrame =
            serde_json::from_str(r#"{"event":"media","media":{"payload":"f39/"}}"#).unwrap();
        match media {
            InboundFrame::Media { media } => {
                let audio = general_purpose::STANDARD.decode(media.payload).unwrap();
                assert_eq!(audio, vec![0x7F, 0x7F, 0x7F]);
            }
            other => panic!("expected media frame, got {:?}", other),
        }

        let stop: InboundFrame = serde_json::from_str(r#"{"event":"stop"}"#).unwrap();
        assert!(matches!(stop, InboundFrame::Stop));

        let other: InboundFrame = serde_json::from_str(r#"{"event":"mark"}"#).unwrap();
        assert!(matches!(other, InboundFrame::Other));
    }

    #[test]
    fn test_outbound_media_frame_shape() {
        let frame = encode_media_frame("MZ9", &[0x7F, 0x00]);
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ9");

        let payload = value["media"]["payload"].as_str().unwrap();
        assert_eq!(
            general_purpose::STANDARD.decode(payload).unwrap(),
            vec![0x7F, 0x00]
        );
    }

    #[test]
    fn test_start_buffer_bounded_and_ordered() {
        let mut buffer = StartBuffer::new();
        for i in 0..(START_BUFFER_LIMIT + 20) {
            buffer.push(Bytes::from(vec![(i % 256) as u8]));
        }

        let drained = buffer.drain();
        assert_eq!(drained.len(), START_BUFFER_LIMIT);
        // oldest frames were dropped, order preserved
        assert_eq!(drained[0][0], (20 % 256) as u8);
        assert_eq!(drained[drained.len() - 1][0], ((START_BUFFER_LIMIT + 19) % 256) as u8);
        assert_eq!(buffer.dropped, 20);
    }
}
