//! SIP message builder utilities
//!
//! [`RequestBuilder`] renders the requests this client sends from an
//! [`Account`] and a [`Dialog`]. [`ResponseBuilder`] answers a request the
//! way a registrar or far end would and is what the test servers use.

use super::auth::DigestCredentials;
use super::dialog::{Dialog, TransactionContext};
use super::message::{SipMessage, SipMethod};
use super::sdp::SdpSession;
use super::transport::TransportProtocol;
use crate::domain::account::Account;
use bytes::Bytes;
use std::net::SocketAddr;

pub const MAX_FORWARDS: u32 = 70;
pub const DEFAULT_USER_AGENT: &str = concat!("usip/", env!("CARGO_PKG_VERSION"));

/// Builds outgoing requests for one account on one local socket
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    account: Account,
    local_addr: SocketAddr,
    local_rtp_port: u16,
    protocol: TransportProtocol,
    user_agent: String,
}

impl RequestBuilder {
    pub fn new(account: Account, local_addr: SocketAddr, local_rtp_port: u16) -> Self {
        Self {
            account,
            local_addr,
            local_rtp_port,
            protocol: TransportProtocol::Udp,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn local_rtp_port(&self) -> u16 {
        self.local_rtp_port
    }

    /// Our Contact URI, `sip:user@ip:port`
    pub fn contact_uri(&self) -> String {
        format!(
            "sip:{}@{}",
            self.account.username(),
            self.local_addr
        )
    }

    /// Request-URI for REGISTER
    pub fn registrar_uri(&self) -> String {
        self.account.registrar_uri().to_string()
    }

    fn via(&self, tx: &TransactionContext) -> String {
        format!(
            "SIP/2.0/{} {};branch={};rport",
            self.protocol.as_str(),
            self.local_addr,
            tx.branch
        )
    }

    /// Headers every request carries, in the codec's leading order
    fn base(&self, uri: &str, dialog: &Dialog, tx: &TransactionContext) -> SipMessage {
        SipMessage::request(tx.method, uri)
            .with_header("Via", self.via(tx))
            .with_header("From", dialog.from_header())
            .with_header("To", dialog.to_header())
            .with_header("Call-ID", dialog.call_id().as_str())
            .with_header("CSeq", tx.cseq_header())
    }

    fn finish(&self, request: SipMessage) -> SipMessage {
        request
            .with_header("Max-Forwards", MAX_FORWARDS.to_string())
            .with_header("User-Agent", self.user_agent.clone())
    }

    fn with_contact(&self, request: SipMessage, dialog: &Dialog) -> SipMessage {
        request.with_header("Contact", format!("<{}>", dialog.contact_uri()))
    }

    fn with_credentials(request: SipMessage, credentials: Option<&DigestCredentials>) -> SipMessage {
        match credentials {
            Some(creds) => request.with_header(creds.header_name(), creds.to_header_value()),
            None => request,
        }
    }

    /// REGISTER; `expires == 0` removes the binding
    pub fn register(
        &self,
        dialog: &Dialog,
        tx: &TransactionContext,
        expires: u32,
        credentials: Option<&DigestCredentials>,
    ) -> SipMessage {
        debug_assert_eq!(tx.method, SipMethod::Register);
        let request = self.base(&self.registrar_uri(), dialog, tx);
        let request = self.finish(self.with_contact(request, dialog));
        Self::with_credentials(request, credentials).with_header("Expires", expires.to_string())
    }

    /// Initial INVITE carrying the audio offer
    pub fn invite(
        &self,
        dialog: &Dialog,
        tx: &TransactionContext,
        target_uri: &str,
        credentials: Option<&DigestCredentials>,
    ) -> SipMessage {
        debug_assert_eq!(tx.method, SipMethod::Invite);
        let request = self.base(target_uri, dialog, tx);
        let request = self.finish(self.with_contact(request, dialog));
        Self::with_credentials(request, credentials)
            .with_body("application/sdp", Bytes::from(self.sdp_offer()))
    }

    /// In-dialog re-INVITE refreshing the session
    pub fn keepalive(&self, dialog: &Dialog, tx: &TransactionContext, fallback_uri: &str) -> SipMessage {
        self.invite(dialog, tx, &dialog.remote_target(fallback_uri), None)
    }

    /// ACK for a 2xx, sent to the remote target
    pub fn ack(&self, dialog: &Dialog, tx: &TransactionContext, fallback_uri: &str) -> SipMessage {
        debug_assert_eq!(tx.method, SipMethod::Ack);
        self.finish(self.base(&dialog.remote_target(fallback_uri), dialog, tx))
    }

    pub fn bye(&self, dialog: &Dialog, tx: &TransactionContext, fallback_uri: &str) -> SipMessage {
        debug_assert_eq!(tx.method, SipMethod::Bye);
        self.finish(self.base(&dialog.remote_target(fallback_uri), dialog, tx))
    }

    /// SDP offer for our media port
    pub fn sdp_offer(&self) -> String {
        SdpSession::create_audio_offer(
            self.account.username(),
            self.local_addr.ip(),
            self.local_rtp_port,
        )
        .to_sdp_string()
    }
}

/// Default reason phrase for the status codes this stack deals with
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        183 => "Session Progress",
        200 => "OK",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

/// Build a simple SIP response from a request
pub struct ResponseBuilder {
    status_code: u16,
    reason: String,
    to_tag: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<(String, Bytes)>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            reason: reason_phrase(status_code).to_string(),
            to_tag: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    /// Tag added to the copied To header unless it already has one
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        self.body = Some((content_type.into(), body.into()));
        self
    }

    pub fn build_for_request(self, request: &SipMessage) -> SipMessage {
        let mut response = SipMessage::response(self.status_code, self.reason);

        // Copy essential headers from request
        for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
            if let Some(value) = request.header(name) {
                let value = match (name, &self.to_tag) {
                    ("To", Some(tag)) if request.to_tag().is_none() => format!("{};tag={}", value, tag),
                    _ => value.to_string(),
                };
                response = response.with_header(name, value);
            }
        }

        for (name, value) in self.headers {
            response = response.with_header(name, value);
        }

        match self.body {
            Some((content_type, body)) => response.with_body(&content_type, body),
            None => response,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::shared::value_objects::CallId;
    use crate::infrastructure::protocols::sip::auth::{AuthChallenge, ChallengeKind};

    fn builder() -> RequestBuilder {
        let account = Account::new("alice", "secret", "example.com", 5060).unwrap();
        RequestBuilder::new(account, "192.0.2.10:40000".parse().unwrap(), 10000)
    }

    fn dialog(builder: &RequestBuilder) -> Dialog {
        Dialog::new(
            CallId::from_string("c1@example.com"),
            builder.account().name_addr(),
            "<sip:+15550100@example.com>",
            builder.contact_uri(),
        )
    }

    #[test]
    fn test_register_request() {
        let builder = builder();
        let mut dialog = dialog(&builder);
        let tx = dialog.new_transaction(SipMethod::Register).unwrap();

        let request = builder.register(&dialog, &tx, 3600, None);
        assert_eq!(request.method(), "REGISTER");
        assert_eq!(request.uri(), "sip:example.com");
        assert_eq!(request.header("CSeq"), Some("1 REGISTER"));
        assert_eq!(request.header("Expires"), Some("3600"));
        assert_eq!(request.header("Contact"), Some("<sip:alice@192.0.2.10:40000>"));
        assert_eq!(request.header("Max-Forwards"), Some("70"));
        assert_eq!(request.via_branch(), Some(tx.branch.as_str()));
        assert!(request.header("Via").unwrap().starts_with("SIP/2.0/UDP 192.0.2.10:40000;"));
        assert!(request.from_tag().is_some());
        assert!(request.header("Authorization").is_none());
    }

    #[test]
    fn test_register_with_credentials() {
        let builder = builder();
        let mut dialog = dialog(&builder);
        let challenge =
            AuthChallenge::parse(r#"Digest realm="example.com", nonce="abc123""#, ChallengeKind::Www)
                .unwrap();
        let creds =
            DigestCredentials::compute(builder.account(), &challenge, "REGISTER", "sip:example.com");
        let tx = dialog.new_transaction(SipMethod::Register).unwrap();

        let request = builder.register(&dialog, &tx, 0, Some(&creds));
        assert_eq!(request.header("Expires"), Some("0"));
        assert!(request
            .header("Authorization")
            .unwrap()
            .contains(r#"response="d1d211daa2e0d7f43de25792410f5057""#));
    }

    #[test]
    fn test_invite_carries_offer() {
        let builder = builder();
        let mut dialog = dialog(&builder);
        let tx = dialog.new_transaction(SipMethod::Invite).unwrap();

        let request = builder.invite(&dialog, &tx, "sip:+15550100@example.com", None);
        assert_eq!(request.uri(), "sip:+15550100@example.com");
        assert_eq!(request.header("Content-Type"), Some("application/sdp"));
        assert_eq!(request.header("To"), Some("<sip:+15550100@example.com>"));
        let body = String::from_utf8_lossy(&request.body).to_string();
        assert!(body.contains("m=audio 10000 RTP/AVP 0 8 18 101"));
    }

    #[test]
    fn test_ack_and_bye_follow_remote_target() {
        let builder = builder();
        let mut dialog = dialog(&builder);
        let invite = dialog.new_transaction(SipMethod::Invite).unwrap();
        let request = builder.invite(&dialog, &invite, "sip:+15550100@example.com", None);

        let ok = ResponseBuilder::ok()
            .to_tag("remote1")
            .header("Contact", "<sip:gw@198.51.100.5:5060>")
            .build_for_request(&request);
        dialog.record_response(&ok);

        let ack_tx = dialog.new_transaction(SipMethod::Ack).unwrap();
        let ack = builder.ack(&dialog, &ack_tx, "sip:example.com");
        assert_eq!(ack.uri(), "sip:gw@198.51.100.5:5060");
        assert_eq!(ack.header("CSeq"), Some("1 ACK"));
        assert_eq!(ack.to_tag(), Some("remote1"));
        assert!(ack.body.is_empty());

        let bye_tx = dialog.new_transaction(SipMethod::Bye).unwrap();
        let bye = builder.bye(&dialog, &bye_tx, "sip:example.com");
        assert_eq!(bye.header("CSeq"), Some("2 BYE"));
        assert_eq!(bye.call_id(), Some("c1@example.com"));
    }

    #[test]
    fn test_response_builder_copies_dialog_headers() {
        let builder = builder();
        let mut dialog = dialog(&builder);
        let tx = dialog.new_transaction(SipMethod::Register).unwrap();
        let request = builder.register(&dialog, &tx, 3600, None);

        let response = ResponseBuilder::new(486).build_for_request(&request);
        assert_eq!(response.status_code(), 486);
        assert_eq!(response.reason(), "Busy Here");
        assert_eq!(response.cseq(), Some((1, "REGISTER")));
        assert_eq!(response.via_branch(), Some(tx.branch.as_str()));
        assert_eq!(response.to_tag(), None);
    }
}
