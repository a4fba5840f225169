//! SIP User Agent
//!
//! Minimal UA for outbound trunk calls over UDP: REGISTER with MD5 digest
//! authentication, INVITE/ACK dialog setup, in-dialog BYE handling, and
//! hangup. One socket serves registration and every dialog so the trunk
//! sees a stable source port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::config::SipConfig;
use super::message::{
    authorization_header, build_request, new_branch, new_call_id, new_tag, parse_digest_challenge,
    RequestParams, SipRequest, SipResponse,
};
use super::rtp::{RtpPortAllocator, RtpSession};
use super::sdp;
use super::SipError;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const INVITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Progress of an outbound call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipCallStatus {
    Initiating,
    Trying,
    Ringing,
    Active,
    Ended,
    Failed,
}

/// Events surfaced to the media bridge.
#[derive(Debug, Clone)]
pub enum SipEvent {
    Ringing { call_id: String },
    Answered { call_id: String },
    Failed { call_id: String, status: u16 },
    RemoteBye { call_id: String },
}

/// Outgoing dialog bookkeeping.
struct Dialog {
    from_tag: String,
    to_tag: Mutex<Option<String>>,
    cseq: AtomicU32,
    /// CSeq number the (last) INVITE went out with; the ACK reuses it.
    invite_cseq: AtomicU32,
    auth_sent: AtomicBool,
    answered: AtomicBool,
    bye_received: AtomicBool,
}

/// An active outbound SIP call.
pub struct SipCall {
    /// Engine-level call id.
    pub id: String,
    /// SIP Call-ID header value.
    pub sip_call_id: String,
    /// Dialed (canonicalized) number.
    pub remote_number: String,
    pub rtp: Arc<RtpSession>,
    pub started_at: DateTime<Utc>,
    status: RwLock<SipCallStatus>,
    dialog: Dialog,
}

impl SipCall {
    pub async fn status(&self) -> SipCallStatus {
        *self.status.read().await
    }

    async fn set_status(&self, status: SipCallStatus) {
        *self.status.write().await = status;
    }
}

/// SIP User Agent for outbound trunk calls.
pub struct SipUserAgent {
    config: SipConfig,
    socket: Arc<UdpSocket>,
    trunk_addr: RwLock<Option<SocketAddr>>,
    public_ip: RwLock<Option<String>>,
    registered: AtomicBool,
    register_expires: AtomicU32,
    calls: RwLock<HashMap<String, Arc<SipCall>>>,
    rtp_ports: RtpPortAllocator,
    /// In-flight client transactions keyed by SIP Call-ID.
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<SipResponse>>>,
    event_tx: mpsc::Sender<SipEvent>,
    cancel: CancellationToken,
    http: reqwest::Client,
}

impl SipUserAgent {
    /// Bind the SIP socket and start the receive loop.
    pub async fn new(
        config: SipConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<SipEvent>), SipError> {
        config.validate().map_err(SipError::RegistrationFailed)?;

        let socket = match UdpSocket::bind(("0.0.0.0", config.local_sip_port)).await {
            Ok(socket) => socket,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(
                    "SIP port {} in use, falling back to an ephemeral port",
                    config.local_sip_port
                );
                UdpSocket::bind("0.0.0.0:0").await?
            }
            Err(e) => return Err(e.into()),
        };

        let (event_tx, event_rx) = mpsc::channel(64);

        let agent = Arc::new(Self {
            rtp_ports: RtpPortAllocator::new(config.rtp_port_start, config.rtp_port_end),
            config,
            socket: Arc::new(socket),
            trunk_addr: RwLock::new(None),
            public_ip: RwLock::new(None),
            registered: AtomicBool::new(false),
            register_expires: AtomicU32::new(0),
            calls: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            event_tx,
            cancel: CancellationToken::new(),
            http: reqwest::Client::new(),
        });

        let serve = agent.clone();
        tokio::spawn(async move { serve.serve_loop().await });

        Ok((agent, event_rx))
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    pub fn config(&self) -> &SipConfig {
        &self.config
    }

    /// Expiry granted by the registrar, in seconds.
    pub fn registration_expires(&self) -> u32 {
        self.register_expires.load(Ordering::SeqCst)
    }

    /// Shut the agent down: hang up every call and stop the receive loop.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.calls.read().await.keys().cloned().collect();
        for sip_call_id in ids {
            let _ = self.hangup_by_sip_id(&sip_call_id).await;
        }
        self.cancel.cancel();
    }

    async fn trunk_addr(&self) -> Result<SocketAddr, SipError> {
        if let Some(addr) = *self.trunk_addr.read().await {
            return Ok(addr);
        }

        let target = format!("{}:{}", self.config.trunk_host, self.config.trunk_port);
        let addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| SipError::Transport(format!("DNS resolution failed: {}", e)))?
            .next()
            .ok_or_else(|| SipError::Transport(format!("no address for {}", target)))?;

        tracing::info!("SIP trunk {} resolved to {}", target, addr);
        *self.trunk_addr.write().await = Some(addr);
        Ok(addr)
    }

    /// Public IPv4 used in Via, Contact and SDP. Discovered over HTTPS on
    /// first use, with the local egress address as fallback.
    async fn public_ip(&self) -> String {
        if let Some(ip) = self.public_ip.read().await.clone() {
            return ip;
        }

        let discovered = self.discover_public_ip().await;
        let ip = match discovered {
            Some(ip) => ip,
            None => Self::local_egress_ip().await.unwrap_or_else(|| "127.0.0.1".to_string()),
        };

        *self.public_ip.write().await = Some(ip.clone());
        ip
    }

    async fn discover_public_ip(&self) -> Option<String> {
        let endpoint = &self.config.public_ip_endpoint;
        if endpoint.is_empty() {
            return None;
        }

        let response = self
            .http
            .get(endpoint)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .ok()?;
        let text = response.text().await.ok()?;
        let candidate = text.trim();
        candidate.parse::<std::net::Ipv4Addr>().ok()?;

        tracing::info!("Discovered public IP: {}", candidate);
        Some(candidate.to_string())
    }

    /// Local address of the default route, found by opening a UDP socket
    /// toward a public endpoint. No packet is sent.
    async fn local_egress_ip() -> Option<String> {
        let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
        socket.connect("8.8.8.8:80").await.ok()?;
        Some(socket.local_addr().ok()?.ip().to_string())
    }

    async fn send_to_trunk(&self, message: &str) -> Result<(), SipError> {
        let addr = self.trunk_addr().await?;
        self.socket
            .send_to(message.as_bytes(), addr)
            .await
            .map_err(|e| SipError::Transport(format!("SIP send failed: {}", e)))?;
        Ok(())
    }

    /// Register a client transaction and return its response stream.
    async fn open_transaction(&self, sip_call_id: &str) -> mpsc::UnboundedReceiver<SipResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().await.insert(sip_call_id.to_string(), tx);
        rx
    }

    async fn close_transaction(&self, sip_call_id: &str) {
        self.pending.lock().await.remove(sip_call_id);
    }

    /// Receive loop: responses route to their transaction, requests are
    /// handled in-dialog.
    async fn serve_loop(self: Arc<Self>) {
        let mut buf = [0u8; 65535];

        loop {
            let (len, src) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!("SIP socket error: {}", e);
                        break;
                    }
                },
            };

            let raw = match std::str::from_utf8(&buf[..len]) {
                Ok(raw) => raw,
                Err(_) => continue,
            };

            if raw.starts_with("SIP/2.0") {
                if let Some(response) = SipResponse::parse(raw) {
                    self.route_response(response).await;
                }
            } else if let Some(request) = SipRequest::parse(raw) {
                self.handle_request(request, src).await;
            }
        }
    }

    async fn route_response(&self, response: SipResponse) {
        let call_id = match response.call_id() {
            Some(id) => id.to_string(),
            None => return,
        };

        let sender = self.pending.lock().await.get(&call_id).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                tracing::debug!(
                    "Unmatched SIP response {} for dialog {}",
                    response.status,
                    call_id
                );
            }
        }
    }

    async fn handle_request(&self, request: SipRequest, src: SocketAddr) {
        match request.method.as_str() {
            "BYE" => self.handle_bye(request, src).await,
            "ACK" => {
                tracing::debug!("Received in-dialog ACK");
            }
            "INVITE" => {
                tracing::info!("Ignoring re-INVITE from {}", src);
            }
            other => {
                tracing::debug!("Ignoring in-dialog {} from {}", other, src);
            }
        }
    }

    async fn handle_bye(&self, request: SipRequest, src: SocketAddr) {
        let sip_call_id = match request.call_id() {
            Some(id) => id.to_string(),
            None => return,
        };

        let call = self.calls.read().await.get(&sip_call_id).cloned();
        let call = match call {
            Some(call) => call,
            None => {
                tracing::debug!("BYE for unknown dialog {}", sip_call_id);
                return;
            }
        };

        if call.dialog.bye_received.swap(true, Ordering::SeqCst) {
            return;
        }

        let ok = request.ok_response();
        if let Err(e) = self.socket.send_to(ok.as_bytes(), src).await {
            tracing::warn!("Failed to answer BYE: {}", e);
        }

        call.rtp.stop();
        call.set_status(SipCallStatus::Ended).await;
        self.calls.write().await.remove(&sip_call_id);
        self.close_transaction(&sip_call_id).await;

        tracing::info!("Remote hangup for call {}", call.id);
        let _ = self
            .event_tx
            .send(SipEvent::RemoteBye {
                call_id: call.id.clone(),
            })
            .await;
    }

    /// Register with the trunk. On a digest challenge the request is resent
    /// once with an Authorization header and an incremented CSeq.
    pub async fn register(self: &Arc<Self>) -> Result<(), SipError> {
        let public_ip = self.public_ip().await;
        let via_addr = format!("{}:{}", public_ip, self.local_port());

        let sip_call_id = new_call_id(&self.config.domain);
        let from_tag = new_tag();
        let uri = self.config.registrar_uri();
        let contact = self.config.contact_uri(&public_ip, self.local_port());

        let mut rx = self.open_transaction(&sip_call_id).await;

        let mut cseq: u32 = 1;
        let request = build_request(&RequestParams {
            method: "REGISTER",
            uri: &uri,
            via_addr: &via_addr,
            branch: &new_branch(),
            from_uri: &self.config.caller_uri(),
            from_tag: &from_tag,
            to_uri: &self.config.caller_uri(),
            to_tag: None,
            call_id: &sip_call_id,
            cseq,
            contact: Some(&contact),
            authorization: None,
            expires: Some(self.config.register_expires),
            user_agent: &self.config.user_agent,
            body: None,
        });

        tracing::info!("Sending REGISTER to {}", uri);
        self.send_to_trunk(&request).await?;

        let deadline = Instant::now() + REGISTER_TIMEOUT;
        let mut challenged = false;

        let result = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(SipError::Timeout("REGISTER timed out".to_string()));
            }

            let response = match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => break Err(SipError::Transport("SIP socket closed".to_string())),
                Err(_) => break Err(SipError::Timeout("REGISTER timed out".to_string())),
            };

            match response.status {
                100..=199 => continue,
                200 => {
                    let granted = response
                        .header("Expires")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(self.config.register_expires);
                    self.register_expires.store(granted, Ordering::SeqCst);
                    self.registered.store(true, Ordering::SeqCst);
                    tracing::info!("SIP registration successful, expires in {}s", granted);
                    break Ok(());
                }
                401 | 407 if !challenged => {
                    challenged = true;
                    let header = response
                        .header("WWW-Authenticate")
                        .or_else(|| response.header("Proxy-Authenticate"));
                    let challenge = header.and_then(parse_digest_challenge).ok_or_else(|| {
                        SipError::RegistrationFailed("unparseable digest challenge".to_string())
                    })?;

                    let auth = authorization_header(
                        &self.config.username,
                        &challenge,
                        &self.config.password,
                        "REGISTER",
                        &uri,
                    );

                    cseq += 1;
                    let request = build_request(&RequestParams {
                        method: "REGISTER",
                        uri: &uri,
                        via_addr: &via_addr,
                        branch: &new_branch(),
                        from_uri: &self.config.caller_uri(),
                        from_tag: &from_tag,
                        to_uri: &self.config.caller_uri(),
                        to_tag: None,
                        call_id: &sip_call_id,
                        cseq,
                        contact: Some(&contact),
                        authorization: Some(&auth),
                        expires: Some(self.config.register_expires),
                        user_agent: &self.config.user_agent,
                        body: None,
                    });

                    tracing::debug!("Resending REGISTER with digest credentials");
                    self.send_to_trunk(&request).await?;
                }
                status => {
                    break Err(SipError::RegistrationFailed(format!(
                        "REGISTER rejected with {}",
                        status
                    )));
                }
            }
        };

        self.close_transaction(&sip_call_id).await;
        result
    }

    /// Start an outbound call under the given engine call id. Returns the
    /// call handle as soon as the INVITE is on the wire; progress arrives
    /// as [`SipEvent`]s.
    pub async fn dial(self: &Arc<Self>, to: &str, call_id: &str) -> Result<Arc<SipCall>, SipError> {
        if !self.is_registered() {
            return Err(SipError::NotRegistered);
        }

        let number = self.config.canonicalize_number(to);
        let public_ip = self.public_ip().await;

        let rtp = RtpSession::bind(self.rtp_ports.allocate().await).await?;
        let rtp_port = rtp.local_port();

        let call = Arc::new(SipCall {
            id: call_id.to_string(),
            sip_call_id: new_call_id(&self.config.domain),
            remote_number: number.clone(),
            rtp,
            started_at: Utc::now(),
            status: RwLock::new(SipCallStatus::Initiating),
            dialog: Dialog {
                from_tag: new_tag(),
                to_tag: Mutex::new(None),
                cseq: AtomicU32::new(1),
                invite_cseq: AtomicU32::new(1),
                auth_sent: AtomicBool::new(false),
                answered: AtomicBool::new(false),
                bye_received: AtomicBool::new(false),
            },
        });

        let sdp_offer = sdp::build_offer(rand::random::<u32>(), &public_ip, rtp_port);
        let uri = format!("sip:{}@{}", number, self.config.trunk_host);

        let rx = self.open_transaction(&call.sip_call_id).await;
        self.calls
            .write()
            .await
            .insert(call.sip_call_id.clone(), call.clone());

        if let Err(e) = self
            .send_invite(&call, &uri, &sdp_offer, &public_ip, None)
            .await
        {
            self.calls.write().await.remove(&call.sip_call_id);
            self.close_transaction(&call.sip_call_id).await;
            call.rtp.stop();
            return Err(e);
        }

        tracing::info!(
            "SIP call {} initiated: {} -> {}",
            call.id,
            self.config.caller_id,
            number
        );

        let agent = self.clone();
        let transaction_call = call.clone();
        let invite_uri = uri;
        tokio::spawn(async move {
            agent
                .run_invite_transaction(transaction_call, invite_uri, sdp_offer, public_ip, rx)
                .await;
        });

        Ok(call)
    }

    async fn send_invite(
        &self,
        call: &SipCall,
        uri: &str,
        sdp_offer: &str,
        public_ip: &str,
        authorization: Option<&str>,
    ) -> Result<(), SipError> {
        let via_addr = format!("{}:{}", public_ip, self.local_port());
        let contact = self.config.contact_uri(public_ip, self.local_port());
        let cseq = call.dialog.cseq.load(Ordering::SeqCst);
        call.dialog.invite_cseq.store(cseq, Ordering::SeqCst);

        let request = build_request(&RequestParams {
            method: "INVITE",
            uri,
            via_addr: &via_addr,
            branch: &new_branch(),
            from_uri: &self.config.caller_uri(),
            from_tag: &call.dialog.from_tag,
            to_uri: uri,
            to_tag: None,
            call_id: &call.sip_call_id,
            cseq,
            contact: Some(&contact),
            authorization,
            expires: None,
            user_agent: &self.config.user_agent,
            body: Some(("application/sdp", sdp_offer)),
        });

        self.send_to_trunk(&request).await
    }

    async fn send_ack(&self, call: &SipCall, uri: &str, public_ip: &str) -> Result<(), SipError> {
        let via_addr = format!("{}:{}", public_ip, self.local_port());
        let to_tag = call.dialog.to_tag.lock().await.clone();

        let request = build_request(&RequestParams {
            method: "ACK",
            uri,
            via_addr: &via_addr,
            branch: &new_branch(),
            from_uri: &self.config.caller_uri(),
            from_tag: &call.dialog.from_tag,
            to_uri: uri,
            to_tag: to_tag.as_deref(),
            call_id: &call.sip_call_id,
            cseq: call.dialog.invite_cseq.load(Ordering::SeqCst),
            contact: None,
            authorization: None,
            expires: None,
            user_agent: &self.config.user_agent,
            body: None,
        });

        self.send_to_trunk(&request).await
    }

    async fn run_invite_transaction(
        self: Arc<Self>,
        call: Arc<SipCall>,
        uri: String,
        sdp_offer: String,
        public_ip: String,
        mut rx: mpsc::UnboundedReceiver<SipResponse>,
    ) {
        // Watchdog applies while no provisional progress beyond 100 has
        // been seen; ringing disarms it.
        let mut deadline = Some(Instant::now() + INVITE_TIMEOUT);

        loop {
            let response = if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(response) => response,
                    Err(_) => {
                        tracing::warn!("Call {} setup timed out", call.id);
                        self.fail_call(&call, 408).await;
                        return;
                    }
                }
            } else {
                rx.recv().await
            };

            let response = match response {
                Some(response) => response,
                None => {
                    self.fail_call(&call, 0).await;
                    return;
                }
            };

            match response.status {
                100 => {
                    call.set_status(SipCallStatus::Trying).await;
                }
                180 | 183 => {
                    deadline = None;
                    call.set_status(SipCallStatus::Ringing).await;
                    let _ = self
                        .event_tx
                        .send(SipEvent::Ringing {
                            call_id: call.id.clone(),
                        })
                        .await;
                }
                status if response.is_provisional() => {
                    tracing::debug!("Call {}: provisional {}", call.id, status);
                }
                401 | 407 => {
                    if call.dialog.auth_sent.swap(true, Ordering::SeqCst) {
                        tracing::warn!("Call {}: repeated auth challenge", call.id);
                        self.fail_call(&call, response.status).await;
                        return;
                    }

                    let header = response
                        .header("WWW-Authenticate")
                        .or_else(|| response.header("Proxy-Authenticate"));
                    let challenge = match header.and_then(parse_digest_challenge) {
                        Some(challenge) => challenge,
                        None => {
                            self.fail_call(&call, response.status).await;
                            return;
                        }
                    };

                    // The challenged INVITE needs its own ACK before retrying.
                    if let Some(tag) = response.to_tag() {
                        *call.dialog.to_tag.lock().await = Some(tag.to_string());
                    }
                    let _ = self.send_ack(&call, &uri, &public_ip).await;
                    *call.dialog.to_tag.lock().await = None;

                    let auth = authorization_header(
                        &self.config.username,
                        &challenge,
                        &self.config.password,
                        "INVITE",
                        &uri,
                    );

                    call.dialog.cseq.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = self
                        .send_invite(&call, &uri, &sdp_offer, &public_ip, Some(&auth))
                        .await
                    {
                        tracing::error!("Call {}: auth resend failed: {}", call.id, e);
                        self.fail_call(&call, response.status).await;
                        return;
                    }
                    tracing::debug!("Call {}: resent INVITE with digest credentials", call.id);
                }
                200 => {
                    if let Some((_, method)) = response.cseq() {
                        if method != "INVITE" {
                            continue;
                        }
                    }

                    if let Some(tag) = response.to_tag() {
                        *call.dialog.to_tag.lock().await = Some(tag.to_string());
                    }

                    let answer = sdp::parse_answer(&response.body);
                    let _ = self.send_ack(&call, &uri, &public_ip).await;

                    let answer = match answer {
                        Some(answer) => answer,
                        None => {
                            tracing::error!("Call {}: 200 OK without usable SDP", call.id);
                            self.fail_call(&call, 488).await;
                            return;
                        }
                    };

                    if !call.dialog.answered.swap(true, Ordering::SeqCst) {
                        call.rtp
                            .set_remote(answer.endpoint, answer.payload_type)
                            .await;
                        call.rtp.start();
                        call.set_status(SipCallStatus::Active).await;

                        tracing::info!(
                            "Call {} answered, media to {} (pt {})",
                            call.id,
                            answer.endpoint,
                            answer.payload_type
                        );
                        let _ = self
                            .event_tx
                            .send(SipEvent::Answered {
                                call_id: call.id.clone(),
                            })
                            .await;
                    } else {
                        // Retransmitted or re-routed 200: only a changed
                        // endpoint matters.
                        call.rtp
                            .apply_sdp_update(answer.endpoint, answer.payload_type)
                            .await;
                    }
                }
                status => {
                    tracing::warn!("Call {} failed with {}", call.id, status);
                    self.fail_call(&call, status).await;
                    return;
                }
            }
        }
    }

    async fn fail_call(&self, call: &Arc<SipCall>, status: u16) {
        call.rtp.stop();
        call.set_status(SipCallStatus::Failed).await;
        self.calls.write().await.remove(&call.sip_call_id);
        self.close_transaction(&call.sip_call_id).await;

        let _ = self
            .event_tx
            .send(SipEvent::Failed {
                call_id: call.id.clone(),
                status,
            })
            .await;
    }

    /// Look up a call by engine call id.
    pub async fn get_call(&self, call_id: &str) -> Option<Arc<SipCall>> {
        self.calls
            .read()
            .await
            .values()
            .find(|call| call.id == call_id)
            .cloned()
    }

    /// Hang up a call by engine call id.
    pub async fn hangup(&self, call_id: &str) -> Result<(), SipError> {
        let call = self
            .get_call(call_id)
            .await
            .ok_or_else(|| SipError::CallNotFound(call_id.to_string()))?;
        self.hangup_by_sip_id(&call.sip_call_id).await
    }

    async fn hangup_by_sip_id(&self, sip_call_id: &str) -> Result<(), SipError> {
        let call = self.calls.write().await.remove(sip_call_id);
        let call = match call {
            Some(call) => call,
            None => return Ok(()),
        };
        self.close_transaction(sip_call_id).await;

        if call.dialog.bye_received.load(Ordering::SeqCst) {
            return Ok(());
        }

        let public_ip = self.public_ip().await;
        let via_addr = format!("{}:{}", public_ip, self.local_port());
        let uri = format!("sip:{}@{}", call.remote_number, self.config.trunk_host);
        let to_tag = call.dialog.to_tag.lock().await.clone();
        let cseq = call.dialog.cseq.fetch_add(1, Ordering::SeqCst) + 1;

        let request = build_request(&RequestParams {
            method: "BYE",
            uri: &uri,
            via_addr: &via_addr,
            branch: &new_branch(),
            from_uri: &self.config.caller_uri(),
            from_tag: &call.dialog.from_tag,
            to_uri: &uri,
            to_tag: to_tag.as_deref(),
            call_id: &call.sip_call_id,
            cseq,
            contact: None,
            authorization: None,
            expires: None,
            user_agent: &self.config.user_agent,
            body: None,
        });

        let _ = self.send_to_trunk(&request).await;
        call.rtp.stop();
        call.set_status(SipCallStatus::Ended).await;

        tracing::info!("SIP call ended: {}", call.id);
        Ok(())
    }
}

impl Drop for SipUserAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
