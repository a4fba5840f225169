//! voicebridge: real-time voice-agent call engine
//!
//! Bridges telephony audio (a self-driven SIP/RTP client or a hosted
//! media-stream WebSocket) to a streaming AI pipeline: speech-to-text,
//! LLM chat, and text-to-speech. Caller audio is transcribed, utterances
//! are answered, and replies stream back as phone-quality μ-law audio with
//! conversational turn-taking preserved.

pub mod agent;
pub mod bridge;
pub mod codec;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod recording;
pub mod sip;
pub mod store;
pub mod stt;
pub mod tts;

#[cfg(test)]
mod call_flow_tests;

pub use agent::AgentConfig;
pub use bridge::{CallEngine, MediaStreamServer};
pub use config::EngineConfig;
pub use orchestrator::{Conversation, EndReason, SessionEvent, SessionState};
pub use sip::SipConfig;
