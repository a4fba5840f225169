//! End-to-end call-flow tests
//!
//! Exercise the full engine against a scripted SIP trunk and a hosted
//! media-stream client, with the AI pipeline replaced by fakes. No network
//! beyond loopback sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::agent::{AgentConfig, TranscriberConfig, VoiceConfig};
use crate::bridge::{CallEngine, MediaStreamServer, PipelineFactory};
use crate::config::EngineConfig;
use crate::llm::{ChatBackend, ChatMessage, LlmError, ModelConfig};
use crate::recording::{RecordingResult, RecordingSink, RecordingStorage};
use crate::sip::{RtpHeader, SipConfig};
use crate::store::{CallRecordStore, CallStatus, MemoryCallStore};
use crate::stt::{SpeechRecognizer, SttError, SttEvent};
use crate::tts::{SpeechSynthesizer, TtsError};

// ---------------------------------------------------------------------------
// Pipeline fakes
// ---------------------------------------------------------------------------

struct FakeRecognizer {
    shared: Arc<PipelineProbe>,
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn send_audio(&self, audio: Bytes) {
        self.shared
            .audio_bytes
            .fetch_add(audio.len(), Ordering::SeqCst);
    }
    fn clear_buffer(&self) {}
    fn set_ignore(&self, _ignore: bool) {}
    fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

struct FakeChat {
    reply: String,
}

#[async_trait]
impl ChatBackend for FakeChat {
    async fn stream_completion(
        &self,
        _cfg: &ModelConfig,
        _messages: &[ChatMessage],
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let _ = chunk_tx.send(self.reply.clone()).await;
        Ok(self.reply.clone())
    }
}

struct FakeTts;

#[async_trait]
impl SpeechSynthesizer for FakeTts {
    async fn synthesize_stream(
        &self,
        _text: &str,
        _voice: &VoiceConfig,
        abort: &std::sync::atomic::AtomicBool,
        sink: mpsc::Sender<Bytes>,
    ) -> Result<(), TtsError> {
        // two packets worth of μ-law
        for _ in 0..2 {
            if abort.load(Ordering::SeqCst) {
                return Err(TtsError::Aborted);
            }
            let _ = sink.send(Bytes::from(vec![0x7Fu8; 160])).await;
        }
        Ok(())
    }
}

/// Observability shared between the fakes and the test body.
struct PipelineProbe {
    audio_bytes: AtomicUsize,
    closed: AtomicBool,
    /// Recognizer event sender captured at connect time so the test can
    /// inject utterances.
    events: Mutex<Option<mpsc::Sender<SttEvent>>>,
}

struct FakePipeline {
    probe: Arc<PipelineProbe>,
    reply: String,
}

impl FakePipeline {
    fn new(reply: &str) -> (Arc<Self>, Arc<PipelineProbe>) {
        let probe = Arc::new(PipelineProbe {
            audio_bytes: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            events: Mutex::new(None),
        });
        (
            Arc::new(Self {
                probe: probe.clone(),
                reply: reply.to_string(),
            }),
            probe,
        )
    }
}

#[async_trait]
impl PipelineFactory for FakePipeline {
    async fn recognizer(
        &self,
        _cfg: &TranscriberConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Arc<dyn SpeechRecognizer>, SttError> {
        *self.probe.events.lock().await = Some(events);
        Ok(Arc::new(FakeRecognizer {
            shared: self.probe.clone(),
        }))
    }

    fn chat_backend(&self) -> Arc<dyn ChatBackend> {
        Arc::new(FakeChat {
            reply: self.reply.clone(),
        })
    }

    fn synthesizer(&self) -> Arc<dyn SpeechSynthesizer> {
        Arc::new(FakeTts)
    }
}

struct CapturingStorage {
    stored: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl RecordingStorage for CapturingStorage {
    async fn store_recording(&self, call_id: &str, data: Vec<u8>) -> RecordingResult<String> {
        self.stored.lock().await.push((call_id.to_string(), data));
        Ok(format!("mem://{}", call_id))
    }
}

// ---------------------------------------------------------------------------
// Scripted trunk helpers
// ---------------------------------------------------------------------------

fn trunk_sip_config(trunk_port: u16) -> SipConfig {
    SipConfig {
        trunk_host: "127.0.0.1".to_string(),
        trunk_port,
        username: "alice".to_string(),
        password: "secret".to_string(),
        caller_id: "+15551230000".to_string(),
        domain: "127.0.0.1".to_string(),
        local_sip_port: 0,
        public_ip_endpoint: String::new(),
        ..SipConfig::default()
    }
}

fn agent_config() -> AgentConfig {
    AgentConfig {
        voice: VoiceConfig {
            voice_id: "v".to_string(),
            ..VoiceConfig::default()
        },
        first_message: "Hello.".to_string(),
        ..AgentConfig::default()
    }
}

async fn recv_sip(socket: &UdpSocket) -> (String, SocketAddr) {
    let mut buf = [0u8; 65535];
    let (len, src) = tokio::time::timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
        .await
        .expect("trunk timed out")
        .unwrap();
    (String::from_utf8_lossy(&buf[..len]).to_string(), src)
}

fn header_of<'a>(raw: &'a str, name: &str) -> &'a str {
    raw.lines()
        .find_map(|line| {
            line.split_once(':').and_then(|(n, v)| {
                if n.trim().eq_ignore_ascii_case(name) {
                    Some(v.trim())
                } else {
                    None
                }
            })
        })
        .unwrap_or("")
}

fn echo_response(raw_request: &str, status_line: &str, body: Option<&str>) -> String {
    let mut msg = format!("SIP/2.0 {}\r\n", status_line);
    for name in ["Via", "From", "Call-ID", "CSeq"] {
        msg.push_str(&format!("{}: {}\r\n", name, header_of(raw_request, name)));
    }
    let to = header_of(raw_request, "To");
    if to.contains("tag=") {
        msg.push_str(&format!("To: {}\r\n", to));
    } else {
        msg.push_str(&format!("To: {};tag=trunk1\r\n", to));
    }
    match body {
        Some(body) => {
            msg.push_str("Content-Type: application/sdp\r\n");
            msg.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
        }
        None => msg.push_str("Content-Length: 0\r\n\r\n"),
    }
    msg
}

/// The engine's advertised RTP port from its SDP offer.
fn offered_rtp_port(invite: &str) -> u16 {
    invite
        .lines()
        .find_map(|line| line.strip_prefix("m=audio "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|p| p.parse().ok())
        .expect("INVITE without audio m-line")
}

macro_rules! wait_until {
    ($what:expr, $cond:expr) => {{
        let mut satisfied = false;
        for _ in 0..150 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(satisfied, "timed out waiting for {}", $what);
    }};
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sip_call_end_to_end() {
    let trunk = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let trunk_port = trunk.local_addr().unwrap().port();

    let (pipeline, probe) = FakePipeline::new("It is noon.");
    let storage = Arc::new(CapturingStorage {
        stored: Mutex::new(Vec::new()),
    });
    let sink = Arc::new(RecordingSink::new(Some(storage.clone() as Arc<dyn RecordingStorage>)));
    let store = Arc::new(MemoryCallStore::new());

    let engine = CallEngine::new(
        EngineConfig::default(),
        Some(trunk_sip_config(trunk_port)),
        pipeline,
        sink,
        store.clone(),
    )
    .await
    .unwrap();
    engine.register_agent("agent-1", agent_config()).await;

    // registration without a challenge
    let register_task = tokio::spawn(async move {
        let (req, src) = recv_sip(&trunk).await;
        let ok = echo_response(&req, "200 OK", None);
        trunk.send_to(ok.as_bytes(), src).await.unwrap();
        trunk
    });
    engine.register().await.unwrap();
    let trunk = register_task.await.unwrap();

    let call_id = engine
        .start_outbound_call("agent-1", "+15559876543")
        .await
        .unwrap();

    // trunk answers the INVITE, pointing media at its own socket
    let media = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let media_port = media.local_addr().unwrap().port();

    let (invite, src) = recv_sip(&trunk).await;
    assert!(invite.starts_with("INVITE "));
    let engine_rtp_port = offered_rtp_port(&invite);

    let trying = echo_response(&invite, "100 Trying", None);
    trunk.send_to(trying.as_bytes(), src).await.unwrap();

    let sdp = format!(
        "v=0\r\nc=IN IP4 127.0.0.1\r\nm=audio {} RTP/AVP 0\r\n",
        media_port
    );
    let ok = echo_response(&invite, "200 OK", Some(&sdp));
    trunk.send_to(ok.as_bytes(), src).await.unwrap();

    let (ack, _) = recv_sip(&trunk).await;
    assert!(ack.starts_with("ACK "));

    // the session comes up and the greeting is paced out as RTP
    wait_until!("session wired", engine.active_call_count().await == 1);

    let mut buf = [0u8; 2048];
    let mut audio_packets = 0;
    let mut last_seq: Option<u16> = None;
    while audio_packets < 2 {
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), media.recv_from(&mut buf))
            .await
            .expect("no RTP from engine")
            .unwrap();
        let (header, header_len) = RtpHeader::from_bytes(&buf[..len]).unwrap();
        assert_eq!(header.payload_type, 0);
        assert_eq!(len - header_len, 160);
        if let Some(seq) = last_seq {
            assert_eq!(header.sequence, seq.wrapping_add(1));
        }
        last_seq = Some(header.sequence);
        // greeting audio is μ-law 0x7F, keep-alives are 0xFF
        if buf[header_len] == 0x7F {
            audio_packets += 1;
        }
    }

    // caller audio flows into the recognizer
    let rtp_header = RtpHeader::new(0, 1, 160, 0x1234);
    let mut packet = rtp_header.to_bytes().to_vec();
    packet.extend_from_slice(&[0x55u8; 160]);
    media
        .send_to(&packet, format!("127.0.0.1:{}", engine_rtp_port))
        .await
        .unwrap();

    wait_until!(
        "caller audio reaching STT",
        probe.audio_bytes.load(Ordering::SeqCst) >= 160
    );

    // one committed utterance drives the LLM and the reply is logged
    let events = probe.events.lock().await.clone().expect("recognizer not connected");
    events
        .send(SttEvent::Utterance("what time is it".to_string()))
        .await
        .unwrap();

    wait_until!(
        "assistant reply in record",
        store
            .get(&call_id)
            .await
            .map(|r| r.transcript.len() >= 3)
            .unwrap_or(false)
    );

    // remote hangup tears everything down
    let bye = format!(
        "BYE sip:alice@127.0.0.1 SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1:{}\r\nFrom: {};tag=trunk1\r\nTo: {}\r\nCall-ID: {}\r\nCSeq: 1 BYE\r\nContent-Length: 0\r\n\r\n",
        trunk.local_addr().unwrap().port(),
        header_of(&invite, "To"),
        header_of(&invite, "From"),
        header_of(&invite, "Call-ID"),
    );
    trunk.send_to(bye.as_bytes(), src).await.unwrap();

    wait_until!("session removed", engine.active_call_count().await == 0);

    let record = store.get(&call_id).await.unwrap();
    assert_eq!(record.status, CallStatus::Completed);
    assert_eq!(record.ended_reason.as_deref(), Some("remote_hangup"));
    assert!(record.ended_at.is_some());

    let contents: Vec<&str> = record
        .transcript
        .iter()
        .map(|t| t.content.as_str())
        .collect();
    assert_eq!(contents, vec!["Hello.", "what time is it", "It is noon."]);

    // the mixed recording was uploaded and linked
    assert_eq!(record.recording_url.as_deref(), Some(format!("mem://{}", call_id).as_str()));
    let stored = storage.stored.lock().await;
    assert_eq!(stored.len(), 1);
    assert!(stored[0].1.len() > 44);

    // the recognizer was shut down with the session
    assert!(probe.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_media_stream_session() {
    let (pipeline, probe) = FakePipeline::new("Sure thing.");
    let storage = Arc::new(CapturingStorage {
        stored: Mutex::new(Vec::new()),
    });
    let sink = Arc::new(RecordingSink::new(Some(storage as Arc<dyn RecordingStorage>)));
    let store = Arc::new(MemoryCallStore::new());

    let engine = CallEngine::new(
        EngineConfig::default(),
        None,
        pipeline,
        sink,
        store.clone(),
    )
    .await
    .unwrap();
    engine.register_agent("a-1", agent_config()).await;

    let server = MediaStreamServer::bind(engine.clone(), "127.0.0.1:0")
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
        .await
        .unwrap();
    let (mut ws_tx, mut ws_rx) = ws.split();

    // a media frame before start lands in the start buffer
    let early = serde_json::json!({
        "event": "media",
        "media": { "payload": general_purpose::STANDARD.encode([0x11u8; 160]) }
    });
    ws_tx
        .send(tokio_tungstenite::tungstenite::Message::Text(
            early.to_string().into(),
        ))
        .await
        .unwrap();

    let start = serde_json::json!({
        "event": "start",
        "start": {
            "streamSid": "MZ42",
            "callSid": "CA42",
            "customParameters": { "agentId": "a-1" }
        }
    });
    ws_tx
        .send(tokio_tungstenite::tungstenite::Message::Text(
            start.to_string().into(),
        ))
        .await
        .unwrap();

    // the greeting comes back as base64 media frames with our stream sid
    let mut greeting_bytes = 0usize;
    while greeting_bytes < 320 {
        let message = tokio::time::timeout(Duration::from_secs(3), ws_rx.next())
            .await
            .expect("no outbound media frame")
            .expect("stream closed")
            .unwrap();
        let text = match message {
            tokio_tungstenite::tungstenite::Message::Text(text) => text,
            _ => continue,
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["event"], "media");
        assert_eq!(value["streamSid"], "MZ42");
        let audio = general_purpose::STANDARD
            .decode(value["media"]["payload"].as_str().unwrap())
            .unwrap();
        assert!(audio.iter().all(|&b| b == 0x7F));
        greeting_bytes += audio.len();
    }

    // the buffered early frame was drained into the recognizer
    wait_until!(
        "buffered frame reaching STT",
        probe.audio_bytes.load(Ordering::SeqCst) >= 160
    );

    // live media flows straight through
    let live = serde_json::json!({
        "event": "media",
        "media": { "payload": general_purpose::STANDARD.encode([0x22u8; 160]) }
    });
    ws_tx
        .send(tokio_tungstenite::tungstenite::Message::Text(
            live.to_string().into(),
        ))
        .await
        .unwrap();
    wait_until!(
        "live frame reaching STT",
        probe.audio_bytes.load(Ordering::SeqCst) >= 320
    );

    // stop ends the session as a remote hangup
    let stop = serde_json::json!({ "event": "stop" });
    ws_tx
        .send(tokio_tungstenite::tungstenite::Message::Text(
            stop.to_string().into(),
        ))
        .await
        .unwrap();

    wait_until!("session finalized", engine.active_call_count().await == 0);

    // exactly one record, finalized with remote_hangup
    wait_until!(
        "finalized record",
        store.list().await.iter().any(|r| r.ended_at.is_some())
    );
    let records = store.list().await;
    assert_eq!(records.len(), 1);
    let record = records.into_iter().next().unwrap();
    assert_eq!(record.status, CallStatus::Completed);
    assert_eq!(record.ended_reason.as_deref(), Some("remote_hangup"));
    assert!(record
        .transcript
        .iter()
        .any(|t| t.content == "Hello."));
}
