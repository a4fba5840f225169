//! Conversation Orchestrator
//!
//! Per-call state machine coordinating STT, LLM and TTS: listen until an
//! utterance commits, think, speak the reply, listen again. Barge-in echo
//! suppression keeps the agent from transcribing its own voice, and a
//! single aborted flag checked at every await boundary makes teardown
//! immediate and idempotent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentConfig, FirstMessageMode};
use crate::llm::{ChatBackend, ChatClient};
use crate::store::{Role, TranscriptEntry};
use crate::stt::{SpeechRecognizer, SttEvent};
use crate::tts::{SpeechSynthesizer, TtsAbort, TtsError};

/// Spoken when the LLM or TTS fails mid-call.
const APOLOGY: &str = "Sorry, I encountered an issue. Could you please repeat that?";

/// A second recognizer error within this window ends the call.
const STT_ERROR_WINDOW: Duration = Duration::from_secs(5);

/// Conversation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Ended,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    UserHangup,
    RemoteHangup,
    SilenceTimeout,
    MaxDuration,
    TransportError,
    Error,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserHangup => "user_hangup",
            EndReason::RemoteHangup => "remote_hangup",
            EndReason::SilenceTimeout => "silence_timeout",
            EndReason::MaxDuration => "max_duration",
            EndReason::TransportError => "transport_error",
            EndReason::Error => "error",
        }
    }
}

/// Lifecycle events surfaced to the media bridge.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started,
    Transcript(TranscriptEntry),
    Ended { reason: EndReason },
}

/// Per-call conversation orchestrator.
pub struct Conversation {
    cfg: AgentConfig,
    state: Mutex<SessionState>,
    aborted: AtomicBool,
    ended_once: AtomicBool,
    stt: Arc<dyn SpeechRecognizer>,
    llm: Mutex<ChatClient>,
    tts: Arc<dyn SpeechSynthesizer>,
    tts_abort: TtsAbort,
    /// Outbound agent audio toward the transport.
    audio_tx: mpsc::Sender<Bytes>,
    event_tx: mpsc::Sender<SessionEvent>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    /// Bumped whenever the silence timer is re-armed or disarmed.
    silence_gen: AtomicU64,
    last_stt_error: std::sync::Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl Conversation {
    pub fn new(
        cfg: AgentConfig,
        stt: Arc<dyn SpeechRecognizer>,
        llm_backend: Arc<dyn ChatBackend>,
        tts: Arc<dyn SpeechSynthesizer>,
        audio_tx: mpsc::Sender<Bytes>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Arc<Self> {
        let llm = ChatClient::new(llm_backend, cfg.model.clone());
        Arc::new(Self {
            cfg,
            state: Mutex::new(SessionState::Idle),
            aborted: AtomicBool::new(false),
            ended_once: AtomicBool::new(false),
            stt,
            llm: Mutex::new(llm),
            tts,
            tts_abort: TtsAbort::new(),
            audio_tx,
            event_tx,
            transcript: Mutex::new(Vec::new()),
            silence_gen: AtomicU64::new(0),
            last_stt_error: std::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub async fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().await.clone()
    }

    /// Start the session: arm the max-duration timer, consume recognizer
    /// events, and speak the first message when the agent opens the call.
    pub fn start(self: &Arc<Self>, mut stt_events: mpsc::Receiver<SttEvent>) {
        let _ = self.event_tx.try_send(SessionEvent::Started);

        // max-duration timer, armed once per call
        let session = self.clone();
        let max_duration = Duration::from_secs(session.cfg.max_duration_seconds);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => {}
                _ = tokio::time::sleep(max_duration) => {
                    session.end(EndReason::MaxDuration).await;
                }
            }
        });

        // recognizer event loop
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    event = stt_events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                match event {
                    SttEvent::Interim(_) => {
                        if session.state().await == SessionState::Listening {
                            session.arm_silence_timer();
                        }
                    }
                    SttEvent::Utterance(text) => {
                        session.handle_utterance(text).await;
                    }
                    SttEvent::Error(message) => {
                        session.handle_stt_error(message).await;
                    }
                }
            }
        });

        let session = self.clone();
        tokio::spawn(async move {
            match session.cfg.first_message_mode {
                FirstMessageMode::AssistantSpeaksFirst => {
                    session.speak_first_message().await;
                }
                FirstMessageMode::UserSpeaksFirst => {
                    session.enter_listening().await;
                }
            }
        });
    }

    /// Caller audio from the transport. Keeps flowing to the recognizer
    /// even while transcripts are suppressed.
    pub async fn process_incoming_audio(&self, audio: Bytes) {
        if self.is_aborted() {
            return;
        }
        self.stt.send_audio(audio).await;
    }

    /// End the session. Idempotent: the first reason wins, later calls are
    /// no-ops, and every in-flight continuation observes `aborted`.
    pub async fn end(self: &Arc<Self>, reason: EndReason) {
        if self.ended_once.swap(true, Ordering::SeqCst) {
            return;
        }

        self.aborted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.tts_abort.stop();
        self.stt.close();
        *self.state.lock().await = SessionState::Ended;

        tracing::info!("Session ended: {}", reason.as_str());
        let _ = self.event_tx.send(SessionEvent::Ended { reason }).await;
    }

    async fn speak_first_message(self: &Arc<Self>) {
        if self.is_aborted() {
            return;
        }
        if self.cfg.first_message.is_empty() {
            self.enter_listening().await;
            return;
        }

        let first_message = self.cfg.first_message.clone();
        self.llm.lock().await.push_assistant(&first_message);
        self.record_turn(Role::Assistant, &first_message).await;

        // response delay is deliberately not applied to the first message
        if let Err(e) = self.speak(&first_message).await {
            if !self.is_aborted() {
                tracing::error!("First message synthesis failed: {}", e);
                self.apologize().await;
            }
        }
    }

    async fn enter_listening(self: &Arc<Self>) {
        if self.is_aborted() {
            return;
        }
        *self.state.lock().await = SessionState::Listening;
        self.stt.set_ignore(false);
        self.arm_silence_timer();
    }

    /// Arm (or re-arm) the silence timer; a newer generation invalidates
    /// any pending expiry.
    fn arm_silence_timer(self: &Arc<Self>) {
        let gen = self.silence_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let session = self.clone();
        let timeout = Duration::from_secs(session.cfg.silence_timeout_seconds);

        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }

            if session.silence_gen.load(Ordering::SeqCst) != gen {
                return;
            }
            if session.state().await != SessionState::Listening {
                return;
            }
            session.end(EndReason::SilenceTimeout).await;
        });
    }

    /// One committed user utterance: think, then speak.
    async fn handle_utterance(self: &Arc<Self>, text: String) {
        if self.is_aborted() {
            return;
        }

        {
            let mut state = self.state.lock().await;
            // a turn already in flight never accepts a second utterance
            if *state != SessionState::Listening {
                tracing::debug!("Dropping utterance outside listening: {:?}", *state);
                return;
            }
            *state = SessionState::Thinking;
        }

        self.silence_gen.fetch_add(1, Ordering::SeqCst);
        self.stt.set_ignore(true);
        self.record_turn(Role::User, &text).await;

        // echo suppression before the model runs
        self.stt.clear_buffer();

        if self.cfg.response_delay_seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(self.cfg.response_delay_seconds)).await;
            if self.is_aborted() {
                return;
            }
        }

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut chunks = 0usize;
            while chunk_rx.recv().await.is_some() {
                chunks += 1;
            }
            tracing::debug!("LLM streamed {} chunks", chunks);
        });

        let reply = self.llm.lock().await.get_response(&text, chunk_tx).await;
        if self.is_aborted() {
            return;
        }

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("LLM error: {}", e);
                self.apologize().await;
                return;
            }
        };

        self.record_turn(Role::Assistant, &reply).await;
        if let Err(e) = self.speak(&reply).await {
            if !self.is_aborted() {
                tracing::error!("TTS error: {}", e);
                self.apologize().await;
            }
        }
    }

    /// Synthesize and stream one reply, then return to listening.
    async fn speak(self: &Arc<Self>, text: &str) -> Result<(), TtsError> {
        if self.is_aborted() {
            return Err(TtsError::Aborted);
        }

        *self.state.lock().await = SessionState::Speaking;
        self.stt.set_ignore(true);
        // drop anything the recognizer already heard of our own voice
        self.stt.clear_buffer();
        self.tts_abort.reset();

        let result = self
            .tts
            .synthesize_stream(
                text,
                &self.cfg.voice,
                self.tts_abort.flag(),
                self.audio_tx.clone(),
            )
            .await;

        match result {
            Ok(()) => {
                if !self.is_aborted() {
                    self.enter_listening().await;
                }
                Ok(())
            }
            Err(TtsError::Aborted) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fixed recovery phrase after an LLM or TTS failure. A failure to
    /// speak it ends the session.
    async fn apologize(self: &Arc<Self>) {
        if self.is_aborted() {
            return;
        }

        self.record_turn(Role::Assistant, APOLOGY).await;
        if let Err(e) = self.speak(APOLOGY).await {
            tracing::error!("Apology synthesis failed: {}", e);
            self.end(EndReason::Error).await;
        }
    }

    async fn handle_stt_error(self: &Arc<Self>, message: String) {
        tracing::warn!("Recognizer error: {}", message);

        let repeat = {
            let mut last = self.last_stt_error.lock().unwrap();
            let now = Instant::now();
            let repeat = last.map_or(false, |t| now.duration_since(t) < STT_ERROR_WINDOW);
            *last = Some(now);
            repeat
        };

        if repeat {
            self.end(EndReason::Error).await;
        }
    }

    async fn record_turn(&self, role: Role, content: &str) {
        let entry = TranscriptEntry {
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        self.transcript.lock().await.push(entry.clone());
        let _ = self.event_tx.send(SessionEvent::Transcript(entry)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::VoiceConfig;
    use crate::llm::{ChatMessage, LlmError, ModelConfig};
    use crate::stt::SttError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeRecognizer {
        clear_calls: AtomicUsize,
        closed: AtomicBool,
    }

    impl FakeRecognizer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                clear_calls: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl SpeechRecognizer for FakeRecognizer {
        async fn send_audio(&self, _audio: Bytes) {}
        fn clear_buffer(&self) {
            self.clear_calls.fetch_add(1, Ordering::SeqCst);
        }
        fn set_ignore(&self, _ignore: bool) {}
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeChat {
        reply: String,
        fail: bool,
        /// When set, the completion blocks until the gate is notified.
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl FakeChat {
        fn ok(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                fail: false,
                gate: None,
            }
        }

        fn failing() -> Self {
            Self {
                reply: String::new(),
                fail: true,
                gate: None,
            }
        }

        fn gated(reply: &str, gate: Arc<tokio::sync::Notify>) -> Self {
            Self {
                reply: reply.to_string(),
                fail: false,
                gate: Some(gate),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for FakeChat {
        async fn stream_completion(
            &self,
            _cfg: &ModelConfig,
            _messages: &[ChatMessage],
            chunk_tx: mpsc::Sender<String>,
        ) -> Result<String, LlmError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(LlmError::Network("down".to_string()));
            }
            let _ = chunk_tx.send(self.reply.clone()).await;
            Ok(self.reply.clone())
        }
    }

    struct FakeTts {
        fail: AtomicBool,
        spoken: std::sync::Mutex<Vec<String>>,
    }

    impl FakeTts {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
                spoken: std::sync::Mutex::new(Vec::new()),
            })
        }

        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeTts {
        async fn synthesize_stream(
            &self,
            text: &str,
            _voice: &VoiceConfig,
            abort: &AtomicBool,
            sink: mpsc::Sender<Bytes>,
        ) -> Result<(), TtsError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TtsError::Network("tts down".to_string()));
            }
            self.spoken.lock().unwrap().push(text.to_string());
            for _ in 0..3 {
                if abort.load(Ordering::SeqCst) {
                    return Err(TtsError::Aborted);
                }
                let _ = sink.send(Bytes::from(vec![0x7Fu8; 160])).await;
            }
            Ok(())
        }
    }

    struct Fixture {
        conversation: Arc<Conversation>,
        tts: Arc<FakeTts>,
        stt: Arc<FakeRecognizer>,
        stt_tx: mpsc::Sender<SttEvent>,
        audio_rx: mpsc::Receiver<Bytes>,
        event_rx: mpsc::Receiver<SessionEvent>,
    }

    fn fixture_with(cfg: AgentConfig, chat: FakeChat) -> Fixture {
        let stt = FakeRecognizer::new();
        let tts = FakeTts::new();
        let (audio_tx, audio_rx) = mpsc::channel(1024);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (stt_tx, stt_rx) = mpsc::channel(64);

        let conversation = Conversation::new(
            cfg,
            stt.clone(),
            Arc::new(chat),
            tts.clone(),
            audio_tx,
            event_tx,
        );
        conversation.start(stt_rx);

        Fixture {
            conversation,
            tts,
            stt,
            stt_tx,
            audio_rx,
            event_rx,
        }
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            voice: VoiceConfig {
                voice_id: "v".to_string(),
                ..VoiceConfig::default()
            },
            first_message: "Hello.".to_string(),
            silence_timeout_seconds: 30,
            max_duration_seconds: 600,
            response_delay_seconds: 0.0,
            ..AgentConfig::default()
        }
    }

    async fn wait_for_ended(rx: &mut mpsc::Receiver<SessionEvent>) -> EndReason {
        loop {
            match rx.recv().await.expect("event channel closed") {
                SessionEvent::Ended { reason } => return reason,
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_caller_times_out() {
        // S1: assistant speaks first, then nothing but silence
        let mut fx = fixture_with(agent_config(), FakeChat::ok(""));

        let reason = wait_for_ended(&mut fx.event_rx).await;
        assert_eq!(reason, EndReason::SilenceTimeout);

        // log holds only the first message
        let transcript = fx.conversation.transcript().await;
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, Role::Assistant);
        assert_eq!(transcript[0].content, "Hello.");
        assert_eq!(fx.conversation.state().await, SessionState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_turn_call() {
        // S2: greeting, one user turn, one reply
        let mut fx = fixture_with(agent_config(), FakeChat::ok("It is noon."));

        // wait until the greeting is done and we are listening
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.conversation.state().await, SessionState::Listening);

        fx.stt_tx
            .send(SttEvent::Utterance("what time is it".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let transcript = fx.conversation.transcript().await;
        let contents: Vec<&str> = transcript.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello.", "what time is it", "It is noon."]);

        // both the greeting and the reply produced paced-out audio
        let mut packets = 0;
        while fx.audio_rx.try_recv().is_ok() {
            packets += 1;
        }
        assert!(packets >= 6, "expected audio for two utterances, got {}", packets);

        assert_eq!(fx.tts.spoken(), vec!["Hello.", "It is noon."]);
        assert_eq!(fx.conversation.state().await, SessionState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interim_resets_silence_timer() {
        let mut cfg = agent_config();
        cfg.first_message_mode = FirstMessageMode::UserSpeaksFirst;
        let mut fx = fixture_with(cfg, FakeChat::ok("ok"));

        tokio::time::sleep(Duration::from_millis(10)).await;

        // keep feeding interims for longer than the silence timeout
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            fx.stt_tx
                .send(SttEvent::Interim("still talking".to_string()))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(!fx.conversation.is_aborted());
        }

        // now stay silent past the timeout
        tokio::time::sleep(Duration::from_secs(31)).await;
        let reason = wait_for_ended(&mut fx.event_rx).await;
        assert_eq!(reason, EndReason::SilenceTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_ends_call() {
        let mut cfg = agent_config();
        cfg.first_message_mode = FirstMessageMode::UserSpeaksFirst;
        cfg.max_duration_seconds = 10;
        cfg.silence_timeout_seconds = 3600;
        let mut fx = fixture_with(cfg, FakeChat::ok("ok"));

        let reason = wait_for_ended(&mut fx.event_rx).await;
        assert_eq!(reason, EndReason::MaxDuration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_is_idempotent() {
        let mut fx = fixture_with(agent_config(), FakeChat::ok(""));

        fx.conversation.end(EndReason::UserHangup).await;
        fx.conversation.end(EndReason::RemoteHangup).await;
        fx.conversation.end(EndReason::Error).await;

        let reason = wait_for_ended(&mut fx.event_rx).await;
        assert_eq!(reason, EndReason::UserHangup);

        // only one Ended event ever surfaces
        tokio::time::sleep(Duration::from_secs(700)).await;
        while let Ok(event) = fx.event_rx.try_recv() {
            assert!(!matches!(event, SessionEvent::Ended { .. }));
        }

        assert!(fx.stt.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterance_dropped_while_not_listening() {
        let mut cfg = agent_config();
        cfg.first_message_mode = FirstMessageMode::UserSpeaksFirst;
        let gate = Arc::new(tokio::sync::Notify::new());
        let fx = fixture_with(cfg, FakeChat::gated("first reply", gate.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;

        // first utterance blocks inside the LLM turn
        fx.stt_tx
            .send(SttEvent::Utterance("first".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.conversation.state().await, SessionState::Thinking);

        // a second utterance while the turn is in flight must be dropped
        fx.conversation
            .handle_utterance("second".to_string())
            .await;

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let transcript = fx.conversation.transcript().await;
        let users: Vec<&str> = transcript
            .iter()
            .filter(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .collect();
        assert_eq!(users, vec!["first"]);
        assert_eq!(fx.conversation.state().await, SessionState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_llm_error_speaks_apology() {
        let mut cfg = agent_config();
        cfg.first_message_mode = FirstMessageMode::UserSpeaksFirst;
        let fx = fixture_with(cfg, FakeChat::failing());

        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.stt_tx
            .send(SttEvent::Utterance("hello?".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(fx.tts.spoken(), vec![APOLOGY.to_string()]);
        assert_eq!(fx.conversation.state().await, SessionState::Listening);
        assert!(!fx.conversation.is_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_apology_failure_ends_with_error() {
        let mut cfg = agent_config();
        cfg.first_message_mode = FirstMessageMode::UserSpeaksFirst;
        let mut fx = fixture_with(cfg, FakeChat::failing());
        fx.tts.fail.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.stt_tx
            .send(SttEvent::Utterance("hello?".to_string()))
            .await
            .unwrap();

        let reason = wait_for_ended(&mut fx.event_rx).await;
        assert_eq!(reason, EndReason::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_during_speaking_aborts_tts() {
        // S4: remote hangup while the agent is mid-reply
        let mut fx = fixture_with(agent_config(), FakeChat::ok(""));

        fx.conversation.end(EndReason::RemoteHangup).await;

        assert!(fx.conversation.tts_abort.is_stopped());
        let reason = wait_for_ended(&mut fx.event_rx).await;
        assert_eq!(reason, EndReason::RemoteHangup);
        assert_eq!(fx.conversation.state().await, SessionState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_buffer_called_before_llm_and_tts() {
        let mut cfg = agent_config();
        cfg.first_message_mode = FirstMessageMode::UserSpeaksFirst;
        let fx = fixture_with(cfg, FakeChat::ok("reply"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.stt_tx
            .send(SttEvent::Utterance("question".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // once before the LLM turn, once before TTS
        assert!(fx.stt.clear_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_stt_errors_end_call() {
        let mut cfg = agent_config();
        cfg.first_message_mode = FirstMessageMode::UserSpeaksFirst;
        let mut fx = fixture_with(cfg, FakeChat::ok(""));

        tokio::time::sleep(Duration::from_millis(10)).await;

        // single error: session survives
        fx.stt_tx
            .send(SttEvent::Error(SttError::Stream("blip".to_string()).to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fx.conversation.is_aborted());

        // second error inside the window: session ends
        fx.stt_tx
            .send(SttEvent::Error("blip again".to_string()))
            .await
            .unwrap();

        let reason = wait_for_ended(&mut fx.event_rx).await;
        assert_eq!(reason, EndReason::Error);
    }
}
