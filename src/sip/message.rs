//! SIP Message Handling
//!
//! Text-level building and parsing of the SIP subset the engine speaks:
//! REGISTER, INVITE, ACK and BYE requests, response parsing, and RFC 2617
//! MD5 digest authentication.

use rand::Rng;

/// A parsed SIP response.
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: String,
}

/// A parsed in-dialog SIP request (BYE, ACK, re-INVITE).
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: String,
    pub uri: String,
    headers: Vec<(String, String)>,
    pub body: String,
}

fn parse_headers_and_body(lines: &mut std::str::Lines<'_>) -> (Vec<(String, String)>, String) {
    let mut headers = Vec::new();
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    let body: String = lines.collect::<Vec<_>>().join("\r\n");
    (headers, body)
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl SipResponse {
    /// Parse a SIP response. Returns None for anything that is not a
    /// well-formed status line.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines();
        let status_line = lines.next()?;
        let mut parts = status_line.splitn(3, ' ');

        if parts.next()? != "SIP/2.0" {
            return None;
        }
        let status: u16 = parts.next()?.parse().ok()?;
        let reason = parts.next().unwrap_or("").to_string();

        let (headers, body) = parse_headers_and_body(&mut lines);

        Some(Self {
            status,
            reason,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// CSeq number and method, e.g. `(2, "INVITE")`.
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let value = self.header("CSeq")?;
        let (num, method) = value.split_once(' ')?;
        Some((num.trim().parse().ok()?, method.trim()))
    }

    /// The `tag` parameter of the To header.
    pub fn to_tag(&self) -> Option<&str> {
        tag_param(self.header("To")?)
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }
}

impl SipRequest {
    pub fn parse(raw: &str) -> Option<Self> {
        let mut lines = raw.lines();
        let request_line = lines.next()?;
        let mut parts = request_line.splitn(3, ' ');

        let method = parts.next()?.to_string();
        let uri = parts.next()?.to_string();
        if parts.next()? != "SIP/2.0" {
            return None;
        }

        let (headers, body) = parse_headers_and_body(&mut lines);

        Some(Self {
            method,
            uri,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// Build the 200 OK reply for an in-dialog request, echoing the
    /// dialog-identifying headers.
    pub fn ok_response(&self) -> String {
        let mut msg = String::from("SIP/2.0 200 OK\r\n");
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = self.header(name) {
                msg.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        msg.push_str("Content-Length: 0\r\n\r\n");
        msg
    }
}

fn tag_param(header_value: &str) -> Option<&str> {
    header_value.split(';').find_map(|param| {
        let param = param.trim();
        param.strip_prefix("tag=")
    })
}

/// Digest challenge fields from a WWW-Authenticate / Proxy-Authenticate header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

/// Parse `Digest realm="...", nonce="..."` style challenge headers.
pub fn parse_digest_challenge(header: &str) -> Option<DigestChallenge> {
    let rest = header.trim().strip_prefix("Digest")?.trim();

    let mut realm = None;
    let mut nonce = None;

    for part in rest.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "nonce" => nonce = Some(value.to_string()),
                _ => {}
            }
        }
    }

    Some(DigestChallenge {
        realm: realm?,
        nonce: nonce?,
    })
}

/// RFC 2617 digest response without qop:
/// `md5(md5(user:realm:pass):nonce:md5(method:uri))`.
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

/// Build the Authorization header for a challenged request.
pub fn authorization_header(
    username: &str,
    challenge: &DigestChallenge,
    password: &str,
    method: &str,
    uri: &str,
) -> String {
    let response = digest_response(
        username,
        &challenge.realm,
        password,
        method,
        uri,
        &challenge.nonce,
    );
    format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm=MD5",
        username, challenge.realm, challenge.nonce, uri, response
    )
}

/// Random branch parameter with the mandatory RFC 3261 magic cookie.
pub fn new_branch() -> String {
    format!("z9hG4bK{:016x}", rand::thread_rng().gen::<u64>())
}

/// Random dialog tag.
pub fn new_tag() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

/// Random Call-ID scoped to the given host.
pub fn new_call_id(host: &str) -> String {
    format!("{:016x}@{}", rand::thread_rng().gen::<u64>(), host)
}

/// Parameters shared by every request the UA builds.
pub struct RequestParams<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub via_addr: &'a str,
    pub branch: &'a str,
    pub from_uri: &'a str,
    pub from_tag: &'a str,
    pub to_uri: &'a str,
    pub to_tag: Option<&'a str>,
    pub call_id: &'a str,
    pub cseq: u32,
    pub contact: Option<&'a str>,
    pub authorization: Option<&'a str>,
    pub expires: Option<u32>,
    pub user_agent: &'a str,
    pub body: Option<(&'a str, &'a str)>,
}

/// Build a SIP request in wire form.
pub fn build_request(p: &RequestParams<'_>) -> String {
    let mut msg = format!("{} {} SIP/2.0\r\n", p.method, p.uri);
    msg.push_str(&format!(
        "Via: SIP/2.0/UDP {};branch={};rport\r\n",
        p.via_addr, p.branch
    ));
    msg.push_str("Max-Forwards: 70\r\n");
    msg.push_str(&format!("From: <{}>;tag={}\r\n", p.from_uri, p.from_tag));
    match p.to_tag {
        Some(tag) => msg.push_str(&format!("To: <{}>;tag={}\r\n", p.to_uri, tag)),
        None => msg.push_str(&format!("To: <{}>\r\n", p.to_uri)),
    }
    msg.push_str(&format!("Call-ID: {}\r\n", p.call_id));
    msg.push_str(&format!("CSeq: {} {}\r\n", p.cseq, p.method));
    if let Some(contact) = p.contact {
        msg.push_str(&format!("Contact: <{}>\r\n", contact));
    }
    if let Some(auth) = p.authorization {
        msg.push_str(&format!("Authorization: {}\r\n", auth));
    }
    if let Some(expires) = p.expires {
        msg.push_str(&format!("Expires: {}\r\n", expires));
    }
    msg.push_str(&format!("User-Agent: {}\r\n", p.user_agent));

    match p.body {
        Some((content_type, body)) => {
            msg.push_str(&format!("Content-Type: {}\r\n", content_type));
            msg.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            msg.push_str(body);
        }
        None => msg.push_str("Content-Length: 0\r\n\r\n"),
    }

    msg
}
