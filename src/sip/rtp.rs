//! RTP Session Handler
//!
//! Per-call RTP over UDP, RFC 3550 framing. Outbound audio is queued and
//! paced at 20 ms per packet; when the queue runs dry a keep-alive silence
//! stream keeps the peer's jitter buffer and NAT bindings alive. Inbound
//! packets are stripped of their header and surfaced as raw payload.
//!
//! Symmetric RTP: the send endpoint follows the source address of received
//! packets, except while the post-SDP-update lockout is active or after a
//! mid-call SDP re-route, when the SDP stays authoritative.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::{transcode_mulaw_to_alaw, ALAW_KEEPALIVE, MULAW_KEEPALIVE};

use super::sdp::PT_PCMA;
use super::SipError;

/// Samples (and payload bytes) per 20 ms packet at 8 kHz.
pub const SAMPLES_PER_PACKET: usize = 160;

/// Pacer tick interval.
pub const PACKET_INTERVAL: Duration = Duration::from_millis(20);

/// Keep-alive kicks in when no real audio went out for this long.
const KEEPALIVE_IDLE: Duration = Duration::from_millis(40);

/// Symmetric RTP is suppressed for this long after an SDP endpoint update.
const SDP_LOCKOUT: Duration = Duration::from_secs(5);

/// RTP packet header (12 bytes, no CSRC)
#[derive(Debug, Clone)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(12);

        let first_byte = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | self.csrc_count;
        buf.put_u8(first_byte);

        let second_byte = ((self.marker as u8) << 7) | self.payload_type;
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);

        buf
    }

    /// Parse header from bytes, returning the header and its length.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), SipError> {
        if data.len() < 12 {
            return Err(SipError::Rtp("RTP packet too short".to_string()));
        }

        let first_byte = data[0];
        let version = first_byte >> 6;
        if version != 2 {
            return Err(SipError::Rtp(format!("Invalid RTP version: {}", version)));
        }

        let padding = (first_byte >> 5) & 1 == 1;
        let extension = (first_byte >> 4) & 1 == 1;
        let csrc_count = first_byte & 0x0F;

        let second_byte = data[1];
        let marker = (second_byte >> 7) & 1 == 1;
        let payload_type = second_byte & 0x7F;

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let header_len = 12 + (csrc_count as usize * 4);
        if data.len() < header_len {
            return Err(SipError::Rtp("RTP packet shorter than CSRC list".to_string()));
        }

        Ok((
            Self {
                version,
                padding,
                extension,
                csrc_count,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
            },
            header_len,
        ))
    }
}

/// Sequence and timestamp state advanced once per outbound packet,
/// keep-alives included.
#[derive(Debug, Clone, Copy)]
struct RtpClock {
    sequence: u16,
    timestamp: u32,
}

impl RtpClock {
    /// Current values, then advance: sequence +1 mod 2^16, timestamp +160.
    fn tick(&mut self) -> (u16, u32) {
        let current = (self.sequence, self.timestamp);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_PACKET as u32);
        current
    }
}

/// Whether a packet from an unexpected tuple may retarget the send endpoint.
fn symmetric_update_allowed(
    reroute_occurred: bool,
    lockout_until: Option<Instant>,
    now: Instant,
) -> bool {
    if reroute_occurred {
        return false;
    }
    match lockout_until {
        Some(until) => now >= until,
        None => true,
    }
}

/// RTP session for one call.
pub struct RtpSession {
    socket: Arc<UdpSocket>,
    ssrc: u32,
    payload_type: AtomicU8,
    remote: Mutex<Option<SocketAddr>>,
    clock: Mutex<RtpClock>,
    queue: Mutex<VecDeque<Vec<u8>>>,
    is_sending_audio: AtomicBool,
    last_audio_sent: Mutex<Option<Instant>>,
    lockout_until: Mutex<Option<Instant>>,
    sdp_reroute_occurred: AtomicBool,
    cancel: CancellationToken,
    audio_tx: mpsc::Sender<Bytes>,
    audio_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl RtpSession {
    /// Bind a session near the suggested port, trying further even ports
    /// when the first choice is taken.
    pub async fn bind(suggested_port: u16) -> Result<Arc<Self>, SipError> {
        let socket = Self::try_bind_port(suggested_port, 50).await?;
        let (audio_tx, audio_rx) = mpsc::channel(256);

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            ssrc: rand::random::<u32>(),
            payload_type: AtomicU8::new(0),
            remote: Mutex::new(None),
            clock: Mutex::new(RtpClock {
                sequence: rand::random::<u16>(),
                timestamp: rand::random::<u32>(),
            }),
            queue: Mutex::new(VecDeque::new()),
            is_sending_audio: AtomicBool::new(false),
            last_audio_sent: Mutex::new(None),
            lockout_until: Mutex::new(None),
            sdp_reroute_occurred: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            audio_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
        }))
    }

    async fn try_bind_port(start_port: u16, max_attempts: u16) -> Result<UdpSocket, SipError> {
        let mut port = start_port;
        for attempt in 0..max_attempts {
            match UdpSocket::bind(format!("0.0.0.0:{}", port)).await {
                Ok(socket) => {
                    if attempt > 0 {
                        tracing::debug!("RTP bound to port {} after {} attempts", port, attempt + 1);
                    }
                    return Ok(socket);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    port = port.wrapping_add(2);
                    if port < 1024 {
                        port = 10000;
                    }
                }
                Err(e) => {
                    return Err(SipError::Rtp(format!("Failed to bind RTP socket: {}", e)));
                }
            }
        }
        Err(SipError::Rtp(format!(
            "No free RTP port after {} attempts from {}",
            max_attempts, start_port
        )))
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn is_sending_audio(&self) -> bool {
        self.is_sending_audio.load(Ordering::SeqCst)
    }

    /// Record the media endpoint and codec from the first SDP answer.
    pub async fn set_remote(&self, addr: SocketAddr, payload_type: u8) {
        *self.remote.lock().await = Some(addr);
        self.payload_type.store(payload_type, Ordering::SeqCst);
    }

    /// Apply a mid-call SDP endpoint change. Arms the symmetric-RTP lockout
    /// and permanently hands authority back to the SDP.
    pub async fn apply_sdp_update(&self, addr: SocketAddr, payload_type: u8) -> bool {
        let mut remote = self.remote.lock().await;
        if *remote == Some(addr) {
            return false;
        }
        tracing::info!(
            "RTP endpoint re-routed by SDP: {:?} -> {}",
            *remote,
            addr
        );
        *remote = Some(addr);
        drop(remote);

        self.payload_type.store(payload_type, Ordering::SeqCst);
        *self.lockout_until.lock().await = Some(Instant::now() + SDP_LOCKOUT);
        self.sdp_reroute_occurred.store(true, Ordering::SeqCst);
        true
    }

    /// Take the inbound-audio receiver (once).
    pub async fn take_audio_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.audio_rx.lock().await.take()
    }

    /// Queue μ-law audio for paced transmission, split into 160-byte chunks.
    pub async fn send_audio(&self, payload: &[u8]) {
        if payload.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        let mut queue = self.queue.lock().await;
        for chunk in payload.chunks(SAMPLES_PER_PACKET) {
            queue.push_back(chunk.to_vec());
        }
        self.is_sending_audio.store(true, Ordering::SeqCst);
    }

    /// Start the receive loop and the 20 ms pacer.
    pub fn start(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move { session.recv_loop().await });

        let session = self.clone();
        tokio::spawn(async move { session.pacer_loop().await });
    }

    /// Stop the session. No packet leaves the socket afterwards.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = [0u8; 2048];

        loop {
            let (len, src) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!("RTP receive error: {}", e);
                        break;
                    }
                },
            };

            if len <= 12 {
                continue;
            }

            let (_, header_len) = match RtpHeader::from_bytes(&buf[..len]) {
                Ok(parsed) => parsed,
                Err(_) => continue,
            };

            self.maybe_follow_source(src).await;

            let payload = Bytes::copy_from_slice(&buf[header_len..len]);
            if self.audio_tx.send(payload).await.is_err() {
                break;
            }
        }
    }

    /// Symmetric RTP: follow the observed source tuple unless SDP holds
    /// authority.
    async fn maybe_follow_source(&self, src: SocketAddr) {
        let mut remote = self.remote.lock().await;
        if *remote == Some(src) {
            return;
        }

        let lockout = *self.lockout_until.lock().await;
        let reroute = self.sdp_reroute_occurred.load(Ordering::SeqCst);
        if !symmetric_update_allowed(reroute, lockout, Instant::now()) {
            return;
        }

        tracing::info!("Symmetric RTP: retargeting {:?} -> {}", *remote, src);
        *remote = Some(src);
    }

    async fn pacer_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PACKET_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let remote = match *self.remote.lock().await {
                Some(addr) => addr,
                None => continue,
            };

            let chunk = self.queue.lock().await.pop_front();

            match chunk {
                Some(chunk) => {
                    self.emit_packet(&chunk, remote).await;
                    *self.last_audio_sent.lock().await = Some(Instant::now());
                }
                None => {
                    self.is_sending_audio.store(false, Ordering::SeqCst);

                    let idle = self
                        .last_audio_sent
                        .lock()
                        .await
                        .map_or(true, |t| t.elapsed() >= KEEPALIVE_IDLE);
                    if idle {
                        let pt = self.payload_type.load(Ordering::SeqCst);
                        let silence_byte = if pt == PT_PCMA { ALAW_KEEPALIVE } else { MULAW_KEEPALIVE };
                        let silence = [silence_byte; SAMPLES_PER_PACKET];
                        self.emit_raw(&silence, pt, remote).await;
                    }
                }
            }
        }
    }

    /// Send one queued μ-law chunk, transcoding when the trunk took PCMA.
    async fn emit_packet(&self, mulaw: &[u8], remote: SocketAddr) {
        let pt = self.payload_type.load(Ordering::SeqCst);
        if pt == PT_PCMA {
            let alaw = transcode_mulaw_to_alaw(mulaw);
            self.emit_raw(&alaw, pt, remote).await;
        } else {
            self.emit_raw(mulaw, pt, remote).await;
        }
    }

    async fn emit_raw(&self, payload: &[u8], payload_type: u8, remote: SocketAddr) {
        if self.cancel.is_cancelled() {
            return;
        }

        let (sequence, timestamp) = self.clock.lock().await.tick();
        let header = RtpHeader::new(payload_type, sequence, timestamp, self.ssrc);

        let mut packet = header.to_bytes();
        packet.extend_from_slice(payload);

        if let Err(e) = self.socket.send_to(&packet, remote).await {
            tracing::warn!("RTP send error to {}: {}", remote, e);
        }
    }
}

/// Cyclic allocator handing out even RTP ports from the configured range.
pub struct RtpPortAllocator {
    start: u16,
    end: u16,
    current: Mutex<u16>,
}

impl RtpPortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            current: Mutex::new(start),
        }
    }

    /// Allocate the next port (even for RTP, odd reserved for RTCP).
    pub async fn allocate(&self) -> u16 {
        let mut current = self.current.lock().await;
        let port = *current;

        *current = if *current + 2 >= self.end {
            self.start
        } else {
            *current + 2
        };

        if port % 2 != 0 {
            port + 1
        } else {
            port
        }
    }
}
