//! SIP Trunk Configuration
//!
//! Connection settings for the trunk provider plus the dialing policy used
//! to canonicalize destination numbers.

use serde::{Deserialize, Serialize};

/// SIP trunk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// SIP trunk hostname (e.g. "sip.provider.net")
    pub trunk_host: String,

    /// SIP trunk port (default 5060)
    pub trunk_port: u16,

    /// SIP username for authentication
    pub username: String,

    /// SIP password for authentication
    pub password: String,

    /// Caller ID / DID number
    pub caller_id: String,

    /// SIP domain (usually same as trunk_host)
    pub domain: String,

    /// Local SIP port; 0 binds an ephemeral port
    pub local_sip_port: u16,

    /// Local RTP port range start
    pub rtp_port_start: u16,

    /// Local RTP port range end
    pub rtp_port_end: u16,

    /// Registration expiry in seconds
    pub register_expires: u32,

    /// Country-code prefix dropped during canonicalization when the
    /// remainder still has at least ten digits.
    pub strip_country_prefix: Option<String>,

    /// HTTPS endpoint returning this host's public IPv4 as plain text.
    /// Empty disables discovery and falls back to the local egress address.
    pub public_ip_endpoint: String,

    /// User agent string
    pub user_agent: String,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            trunk_host: String::new(),
            trunk_port: 5060,
            username: String::new(),
            password: String::new(),
            caller_id: String::new(),
            domain: String::new(),
            local_sip_port: 5060,
            rtp_port_start: 10000,
            rtp_port_end: 20000,
            register_expires: 3600,
            strip_country_prefix: Some("91".to_string()),
            public_ip_endpoint: "https://api.ipify.org".to_string(),
            user_agent: "voicebridge/0.1".to_string(),
        }
    }
}

impl SipConfig {
    /// Create config from environment variables
    pub fn from_env() -> Option<Self> {
        let trunk_host = std::env::var("SIP_TRUNK_HOST").ok()?;
        let username = std::env::var("SIP_USERNAME").ok()?;
        let password = std::env::var("SIP_PASSWORD").ok()?;
        let caller_id = std::env::var("SIP_CALLER_ID").ok()?;

        let domain = std::env::var("SIP_DOMAIN").unwrap_or_else(|_| trunk_host.clone());

        Some(Self {
            trunk_host,
            trunk_port: std::env::var("SIP_TRUNK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5060),
            username,
            password,
            caller_id,
            domain,
            local_sip_port: std::env::var("SIP_LOCAL_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5060),
            rtp_port_start: std::env::var("RTP_PORT_START")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(10000),
            rtp_port_end: std::env::var("RTP_PORT_END")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(20000),
            register_expires: std::env::var("SIP_REGISTER_EXPIRES")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3600),
            strip_country_prefix: match std::env::var("SIP_STRIP_COUNTRY_PREFIX") {
                Ok(v) if v.is_empty() => None,
                Ok(v) => Some(v),
                Err(_) => Some("91".to_string()),
            },
            public_ip_endpoint: std::env::var("PUBLIC_IP_ENDPOINT")
                .unwrap_or_else(|_| "https://api.ipify.org".to_string()),
            user_agent: "voicebridge/0.1".to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.trunk_host.is_empty() {
            return Err("SIP trunk host is required".to_string());
        }
        if self.username.is_empty() {
            return Err("SIP username is required".to_string());
        }
        if self.password.is_empty() {
            return Err("SIP password is required".to_string());
        }
        if self.caller_id.is_empty() {
            return Err("SIP caller ID is required".to_string());
        }
        if self.rtp_port_start >= self.rtp_port_end {
            return Err("RTP port range is invalid".to_string());
        }
        Ok(())
    }

    /// Canonicalize a destination number for the trunk.
    ///
    /// Strips a leading `+`, then drops the configured country-code prefix
    /// when the remaining number still has at least ten digits.
    pub fn canonicalize_number(&self, number: &str) -> String {
        let number = number.trim().trim_start_matches('+');

        if let Some(prefix) = &self.strip_country_prefix {
            if !prefix.is_empty() && number.starts_with(prefix.as_str()) {
                let rest = &number[prefix.len()..];
                if rest.len() >= 10 {
                    return rest.to_string();
                }
            }
        }

        number.to_string()
    }

    /// The URI of the registrar / trunk.
    pub fn registrar_uri(&self) -> String {
        format!("sip:{}", self.domain)
    }

    /// The From URI for outgoing requests.
    pub fn caller_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// The Contact URI advertised to the trunk.
    pub fn contact_uri(&self, local_ip: &str, local_port: u16) -> String {
        format!("sip:{}@{}:{}", self.username, local_ip, local_port)
    }
}
