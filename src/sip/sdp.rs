//! SDP Offer/Answer
//!
//! Builds the audio offer for outbound INVITEs and parses the answer the
//! trunk returns. Only G.711 is negotiated: PCMU (0) preferred, PCMA (8)
//! accepted.

use std::net::{IpAddr, SocketAddr};

/// Payload type for G.711 μ-law.
pub const PT_PCMU: u8 = 0;

/// Payload type for G.711 A-law.
pub const PT_PCMA: u8 = 8;

/// Build the SDP offer for an outbound call.
pub fn build_offer(session_id: u32, public_ip: &str, rtp_port: u16) -> String {
    format!(
        "v=0\r\n\
         o=- {} 1 IN IP4 {}\r\n\
         s=voicebridge call\r\n\
         c=IN IP4 {}\r\n\
         t=0 0\r\n\
         m=audio {} RTP/AVP 0 8\r\n\
         a=rtpmap:0 PCMU/8000\r\n\
         a=rtpmap:8 PCMA/8000\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n",
        session_id, public_ip, public_ip, rtp_port
    )
}

/// The media endpoint and codec selected by the remote answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpAnswer {
    pub endpoint: SocketAddr,
    pub payload_type: u8,
}

/// Parse the remote SDP answer: connection address, audio port, and the
/// first G.711 codec in the m-line.
pub fn parse_answer(sdp: &str) -> Option<SdpAnswer> {
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    let mut payload_type: Option<u8> = None;

    for line in sdp.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("c=") {
            // c=IN IP4 203.0.113.9
            let mut parts = rest.split_whitespace();
            if parts.next() == Some("IN") && parts.next() == Some("IP4") {
                ip = parts.next().and_then(|a| a.parse().ok());
            }
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            // m=audio 30000 RTP/AVP 8 0 101
            let mut parts = rest.split_whitespace();
            port = parts.next().and_then(|p| p.parse().ok());
            let _profile = parts.next();
            payload_type = parts
                .filter_map(|pt| pt.parse::<u8>().ok())
                .find(|&pt| pt == PT_PCMU || pt == PT_PCMA);
        }
    }

    Some(SdpAnswer {
        endpoint: SocketAddr::new(ip?, port?),
        payload_type: payload_type?,
    })
}
