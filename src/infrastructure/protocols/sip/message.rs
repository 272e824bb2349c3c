//! SIP message types and the text codec
//!
//! Encoding always renders headers in a fixed order and computes
//! Content-Length from the body. Decoding never fails: a datagram that is not
//! SIP still produces a [`SipMessage`], with an empty method and status code
//! 0, so the receive path can skip it and keep listening.

use crate::domain::shared::error::DomainError;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Protocol version token
pub const SIP_VERSION: &str = "SIP/2.0";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Call rejected: {status} {reason}")]
    CallRejected { status: u16, reason: String },

    #[error("Registration rejected: {status} {reason}")]
    RegistrationRejected { status: u16, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<DomainError> for SipError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::ValidationError(msg) => SipError::Config(msg),
            DomainError::InvalidStateTransition(msg) => SipError::InvalidState(msg),
        }
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::Transport(err.to_string())
    }
}

/// SIP method types used by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "REGISTER" => Some(SipMethod::Register),
            "INVITE" => Some(SipMethod::Invite),
            "ACK" => Some(SipMethod::Ack),
            "BYE" => Some(SipMethod::Bye),
            "CANCEL" => Some(SipMethod::Cancel),
            "OPTIONS" => Some(SipMethod::Options),
            _ => None,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ordered header map
///
/// Lookups are case-insensitive. Setting a name that is already present
/// replaces its value in place, so the last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// First line of a SIP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { status_code: u16, reason: String },
    /// Anything that did not look like SIP
    Unknown(String),
}

/// A decoded or to-be-encoded SIP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start: StartLine,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Canonical spellings, in the order they are rendered
const LEADING_HEADERS: [&str; 10] = [
    "Via",
    "From",
    "To",
    "Call-ID",
    "CSeq",
    "Contact",
    "Max-Forwards",
    "User-Agent",
    "Authorization",
    "Proxy-Authorization",
];

const CONTENT_TYPE: &str = "Content-Type";
const CONTENT_LENGTH: &str = "Content-Length";

/// Expand RFC 3261 compact header forms
fn canonical_name(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => CONTENT_LENGTH,
        "c" | "C" => CONTENT_TYPE,
        "k" | "K" => "Supported",
        _ => name,
    }
}

impl SipMessage {
    pub fn request(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method: method.as_str().to_string(),
                uri: uri.into(),
            },
            version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn response(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Response {
                status_code,
                reason: reason.into(),
            },
            version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set(CONTENT_TYPE, content_type);
        self.body = body.into();
        self
    }

    /// Request method, or an empty string for responses and non-SIP input
    pub fn method(&self) -> &str {
        match &self.start {
            StartLine::Request { method, .. } => method,
            _ => "",
        }
    }

    pub fn sip_method(&self) -> Option<SipMethod> {
        SipMethod::from_token(self.method())
    }

    /// Request-URI, or an empty string for responses
    pub fn uri(&self) -> &str {
        match &self.start {
            StartLine::Request { uri, .. } => uri,
            _ => "",
        }
    }

    /// Status code, or 0 for requests and non-SIP input
    pub fn status_code(&self) -> u16 {
        match &self.start {
            StartLine::Response { status_code, .. } => *status_code,
            _ => 0,
        }
    }

    pub fn reason(&self) -> &str {
        match &self.start {
            StartLine::Response { reason, .. } => reason,
            _ => "",
        }
    }

    pub fn is_request(&self) -> bool {
        !self.method().is_empty()
    }

    pub fn is_response(&self) -> bool {
        self.status_code() > 0
    }

    /// Whether a caller can do anything with this message
    pub fn is_actionable(&self) -> bool {
        self.is_request() || self.is_response()
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// CSeq number and method
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq = parts.next()?.parse().ok()?;
        let method = parts.next()?;
        Some((seq, method))
    }

    pub fn from_tag(&self) -> Option<&str> {
        self.header("From").and_then(|v| header_param(v, "tag"))
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.header("To").and_then(|v| header_param(v, "tag"))
    }

    /// Branch parameter of the top Via
    pub fn via_branch(&self) -> Option<&str> {
        self.header("Via").and_then(|v| header_param(v, "branch"))
    }

    /// URI of the first Contact, without angle brackets or parameters
    pub fn contact_uri(&self) -> Option<&str> {
        let value = self.header("Contact")?.trim();
        let uri = match (value.find('<'), value.find('>')) {
            (Some(start), Some(end)) if start < end => &value[start + 1..end],
            _ => {
                let first = first_value(value);
                first.split(';').next().unwrap_or(first)
            }
        };
        let uri = uri.trim();
        (!uri.is_empty() && uri != "*").then_some(uri)
    }

    /// Summary used in log lines, e.g. `INVITE sip:bob@host` or `180 Ringing`
    pub fn summary(&self) -> String {
        match &self.start {
            StartLine::Request { method, uri } => format!("{} {}", method, uri),
            StartLine::Response {
                status_code,
                reason,
            } => format!("{} {}", status_code, reason),
            StartLine::Unknown(line) => format!("<non-SIP: {:.40}>", line),
        }
    }

    /// Render to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(512 + self.body.len());

        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(&format!("{} {} {}\r\n", method, uri, self.version));
            }
            StartLine::Response {
                status_code,
                reason,
            } => {
                out.push_str(&format!("{} {} {}\r\n", self.version, status_code, reason));
            }
            StartLine::Unknown(line) => {
                out.push_str(line);
                out.push_str("\r\n");
            }
        }

        for name in LEADING_HEADERS {
            if let Some(value) = self.headers.get(name) {
                out.push_str(&format!("{}: {}\r\n", name, value));
            }
        }

        for (name, value) in self.headers.iter() {
            let leading = LEADING_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name));
            if leading
                || name.eq_ignore_ascii_case(CONTENT_TYPE)
                || name.eq_ignore_ascii_case(CONTENT_LENGTH)
            {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }

        if let Some(content_type) = self.headers.get(CONTENT_TYPE) {
            out.push_str(&format!("{}: {}\r\n", CONTENT_TYPE, content_type));
        }
        out.push_str(&format!("{}: {}\r\n\r\n", CONTENT_LENGTH, self.body.len()));

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        Bytes::from(bytes)
    }

    /// Parse wire bytes; never fails
    pub fn decode(raw: &[u8]) -> Self {
        let (head, body) = split_head_body(raw);
        let head = String::from_utf8_lossy(head);

        let mut lines = head
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .skip_while(|line| line.trim().is_empty());

        let first = lines.next().unwrap_or_default();
        let (start, version) = parse_start_line(first);

        let mut headers = Headers::new();
        let mut last_name: Option<String> = None;
        for line in lines {
            if line.trim().is_empty() {
                break;
            }
            // Folded continuation of the previous header
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(name) = &last_name {
                    let joined = format!("{} {}", headers.get(name).unwrap_or_default(), line.trim());
                    headers.set(name.clone(), joined);
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                let name = canonical_name(name.trim()).to_string();
                headers.set(name.clone(), value.trim());
                last_name = Some(name);
            }
        }

        Self {
            start,
            version,
            headers,
            body: Bytes::copy_from_slice(body),
        }
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.encode()))
    }
}

/// Split at the first blank line, accepting CRLF or bare LF
fn split_head_body(raw: &[u8]) -> (&[u8], &[u8]) {
    let crlf = raw.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    let lf = raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));

    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };

    match split {
        Some((idx, len)) => (&raw[..idx], &raw[idx + len..]),
        None => (raw, &raw[raw.len()..]),
    }
}

fn parse_start_line(line: &str) -> (StartLine, String) {
    let unknown = || (StartLine::Unknown(line.to_string()), String::new());
    let line_trimmed = line.trim();

    if line_trimmed.starts_with("SIP/") {
        let mut parts = line_trimmed.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status_code = match parts.next().and_then(|c| c.parse::<u16>().ok()) {
            Some(code) if (100..700).contains(&code) => code,
            _ => return unknown(),
        };
        let reason = parts.next().unwrap_or_default().trim().to_string();
        return (
            StartLine::Response {
                status_code,
                reason,
            },
            version.to_string(),
        );
    }

    let parts: Vec<&str> = line_trimmed.split_whitespace().collect();
    match parts.as_slice() {
        [method, uri, version]
            if version.starts_with("SIP/")
                && method.chars().all(|c| c.is_ascii_alphabetic())
                && !method.is_empty() =>
        {
            (
                StartLine::Request {
                    method: method.to_string(),
                    uri: uri.to_string(),
                },
                version.to_string(),
            )
        }
        _ => unknown(),
    }
}

/// First entry of a comma-joined header value
///
/// Commas inside quotes or `<...>` do not split.
pub fn first_value(value: &str) -> &str {
    let mut quoted = false;
    let mut depth = 0usize;
    for (idx, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => return &value[..idx],
            _ => {}
        }
    }
    value
}

/// Value of a `;name=value` parameter in a header
///
/// Only the first entry of a comma-joined value is read. Parameters inside
/// `<...>` belong to the URI and are skipped.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let value = first_value(value);
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    params.split(';').find_map(|segment| {
        let (key, val) = segment.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| val.trim().trim_matches('"'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> SipMessage {
        SipMessage::request(SipMethod::Invite, "sip:bob@example.com")
            .with_header("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKabc")
            .with_header("From", "<sip:alice@example.com>;tag=1928301774")
            .with_header("To", "<sip:bob@example.com>")
            .with_header("Call-ID", "a84b4c76e66710@example.com")
            .with_header("CSeq", "1 INVITE")
            .with_header("Max-Forwards", "70")
            .with_body("application/sdp", "v=0\r\ns=-\r\n")
    }

    #[test]
    fn test_parse_register_request() {
        let data = b"REGISTER sip:registrar.example.com SIP/2.0\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     From: Alice <sip:alice@example.com>;tag=1928301774\r\n\
                     To: Alice <sip:alice@example.com>\r\n\
                     Call-ID: a84b4c76e66710@pc33.example.com\r\n\
                     CSeq: 314159 REGISTER\r\n\
                     Contact: <sip:alice@192.168.1.100:5060>\r\n\
                     Expires: 3600\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::decode(data);
        assert!(msg.is_request());
        assert_eq!(msg.sip_method(), Some(SipMethod::Register));
        assert_eq!(msg.uri(), "sip:registrar.example.com");
        assert_eq!(msg.call_id(), Some("a84b4c76e66710@pc33.example.com"));
        assert_eq!(msg.cseq(), Some((314159, "REGISTER")));
        assert_eq!(msg.from_tag(), Some("1928301774"));
        assert_eq!(msg.via_branch(), Some("z9hG4bK776asdhds"));
        assert_eq!(msg.header("expires"), Some("3600"));
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_parse_response() {
        let data = b"SIP/2.0 200 OK\r\n\
                     Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
                     To: Bob <sip:bob@example.com>;tag=a6c85cf\r\n\
                     Contact: <sip:bob@192.0.2.4:5070;transport=udp>;expires=60\r\n\
                     Content-Length: 0\r\n\r\n";

        let msg = SipMessage::decode(data);
        assert!(msg.is_response());
        assert_eq!(msg.status_code(), 200);
        assert_eq!(msg.reason(), "OK");
        assert_eq!(msg.to_tag(), Some("a6c85cf"));
        assert_eq!(msg.contact_uri(), Some("sip:bob@192.0.2.4:5070;transport=udp"));
    }

    #[test]
    fn test_round_trip() {
        let original = invite();
        let decoded = SipMessage::decode(&original.encode());

        assert_eq!(decoded.method(), "INVITE");
        assert_eq!(decoded.uri(), "sip:bob@example.com");
        assert_eq!(decoded.body, original.body);
        for (name, value) in original.headers.iter() {
            assert_eq!(decoded.header(name), Some(value), "header {}", name);
        }

        let response = SipMessage::response(486, "Busy Here").with_header("Call-ID", "x@y");
        let decoded = SipMessage::decode(&response.encode());
        assert_eq!(decoded.status_code(), 486);
        assert_eq!(decoded.reason(), "Busy Here");
        assert_eq!(decoded.call_id(), Some("x@y"));
    }

    #[test]
    fn test_content_length_is_computed() {
        let msg = invite().with_header("Content-Length", "9999");
        let decoded = SipMessage::decode(&msg.encode());
        let length: usize = decoded.header("Content-Length").unwrap().parse().unwrap();
        assert_eq!(length, msg.body.len());

        let empty = SipMessage::request(SipMethod::Bye, "sip:example.com");
        let decoded = SipMessage::decode(&empty.encode());
        assert_eq!(decoded.header("Content-Length"), Some("0"));
    }

    #[test]
    fn test_fixed_header_order() {
        let msg = SipMessage::request(SipMethod::Register, "sip:example.com")
            .with_header("Expires", "3600")
            .with_header("Authorization", "Digest x")
            .with_header("CSeq", "2 REGISTER")
            .with_header("Via", "SIP/2.0/UDP h;branch=z9hG4bK1")
            .with_header("User-Agent", "usip")
            .with_header("Call-ID", "c@d");
        let text = String::from_utf8(msg.encode().to_vec()).unwrap();
        let pos = |name: &str| text.find(&format!("\r\n{}:", name)).unwrap();

        assert!(pos("Via") < pos("Call-ID"));
        assert!(pos("Call-ID") < pos("CSeq"));
        assert!(pos("CSeq") < pos("User-Agent"));
        assert!(pos("User-Agent") < pos("Authorization"));
        assert!(pos("Authorization") < pos("Expires"));
        assert!(pos("Expires") < pos("Content-Length"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_bare_lf_and_compact_forms() {
        let data = b"SIP/2.0 180 Ringing\ni: abc@host\nt: <sip:bob@host>;tag=xyz\nl: 0\n\n";
        let msg = SipMessage::decode(data);
        assert_eq!(msg.status_code(), 180);
        assert!(msg.is_provisional());
        assert_eq!(msg.call_id(), Some("abc@host"));
        assert_eq!(msg.to_tag(), Some("xyz"));
    }

    #[test]
    fn test_duplicate_header_last_wins() {
        let data = b"SIP/2.0 200 OK\r\nContact: <sip:a@one>\r\ncontact: <sip:a@two>\r\n\r\n";
        let msg = SipMessage::decode(data);
        assert_eq!(msg.contact_uri(), Some("sip:a@two"));
        assert_eq!(msg.headers.len(), 1);
    }

    #[test]
    fn test_body_kept_raw() {
        let data = b"SIP/2.0 200 OK\r\nContent-Type: application/sdp\r\n\r\nv=0\r\n\r\nm=audio 4000 RTP/AVP 0\r\n";
        let msg = SipMessage::decode(data);
        assert_eq!(&msg.body[..], b"v=0\r\n\r\nm=audio 4000 RTP/AVP 0\r\n");
    }

    #[test]
    fn test_garbage_is_not_actionable() {
        let cases: [&[u8]; 5] = [
            b"\x00\x01\x02binary junk",
            b"",
            b"HELLO WORLD",
            b"SIP/2.0 abc Nope\r\n\r\n",
            b"SIP/2.0 999 Too Big\r\n\r\n",
        ];
        for raw in cases {
            let msg = SipMessage::decode(raw);
            assert_eq!(msg.method(), "");
            assert_eq!(msg.status_code(), 0);
            assert!(!msg.is_actionable());
        }
    }

    #[test]
    fn test_header_param() {
        assert_eq!(
            header_param("<sip:a@b;tag=inside>;tag=outside", "tag"),
            Some("outside")
        );
        assert_eq!(
            header_param("SIP/2.0/UDP h:5060;rport;branch=z9hG4bKx", "branch"),
            Some("z9hG4bKx")
        );
        assert_eq!(header_param("<sip:a@b>", "tag"), None);
    }

    #[test]
    fn test_params_come_from_first_entry_only() {
        let msg = SipMessage::response(200, "OK")
            .with_header(
                "Via",
                "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKtop, SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKnext",
            )
            .with_header("To", "\"Doe, Bob\" <sip:bob@example.com>;tag=b1, <sip:x@y>;tag=other");

        assert_eq!(msg.via_branch(), Some("z9hG4bKtop"));
        assert_eq!(msg.to_tag(), Some("b1"));
        assert_eq!(first_value("<sip:a@b;x=1,2>;p=q, <sip:c@d>"), "<sip:a@b;x=1,2>;p=q");
        assert_eq!(header_param("SIP/2.0/UDP h;rport, SIP/2.0/UDP g;branch=z9hG4bKg", "branch"), None);
    }
}
