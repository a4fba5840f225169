//! Minimal SIP/RTP Stack
//!
//! Direct SIP trunk integration without an external dialog layer:
//! - REGISTER with MD5 digest authentication
//! - Outbound INVITE / ACK / BYE dialogs
//! - RTP media with paced 20 ms output, keep-alive and symmetric-RTP handling
//! - G.711 PCMU/PCMA negotiation

mod config;
mod message;
mod rtp;
mod sdp;
mod user_agent;

pub use config::SipConfig;
pub use rtp::{RtpHeader, RtpPortAllocator, RtpSession};
pub use user_agent::{SipCall, SipCallStatus, SipEvent, SipUserAgent};

use thiserror::Error;

/// SIP-related errors
#[derive(Error, Debug)]
pub enum SipError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RTP error: {0}")]
    Rtp(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not registered")]
    NotRegistered,

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
