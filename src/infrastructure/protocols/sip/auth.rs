//! SIP Digest Authentication, client side (RFC 2617, RFC 3261)
//!
//! Only the plain MD5 scheme without `qop` is answered. A server that
//! insists on `qop=auth` will reject the credentials and the caller sees
//! [`SipError::AuthRejected`].

use super::message::{SipError, SipMessage};
use crate::domain::account::Account;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Which header carried the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// 401 + WWW-Authenticate, answered with Authorization
    Www,
    /// 407 + Proxy-Authenticate, answered with Proxy-Authorization
    Proxy,
}

impl ChallengeKind {
    /// Header name the answer goes into
    pub fn authorization_header(&self) -> &'static str {
        match self {
            ChallengeKind::Www => "Authorization",
            ChallengeKind::Proxy => "Proxy-Authorization",
        }
    }
}

/// Authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: String,
    pub qop: Option<String>,
    pub kind: ChallengeKind,
}

impl AuthChallenge {
    /// Extract the challenge from a 401/407 response
    pub fn from_response(response: &SipMessage) -> Result<Self, SipError> {
        let (value, kind) = response
            .header("WWW-Authenticate")
            .map(|v| (v, ChallengeKind::Www))
            .or_else(|| {
                response
                    .header("Proxy-Authenticate")
                    .map(|v| (v, ChallengeKind::Proxy))
            })
            .ok_or_else(|| {
                SipError::Protocol(format!(
                    "{} without WWW-Authenticate or Proxy-Authenticate",
                    response.status_code()
                ))
            })?;

        Self::parse(value, kind)
    }

    /// Parse a `Digest realm="...", nonce="..."` header value
    pub fn parse(value: &str, kind: ChallengeKind) -> Result<Self, SipError> {
        let value = value.trim();
        let (scheme, rest) = value.split_once(' ').unwrap_or((value, ""));
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(SipError::Protocol(format!(
                "Unsupported authentication scheme: {}",
                scheme
            )));
        }

        let mut params = parse_digest_params(rest);
        debug!("Parsed digest challenge params: {:?}", params.keys());

        let realm = params
            .remove("realm")
            .ok_or_else(|| SipError::Protocol("Challenge is missing realm".to_string()))?;
        let nonce = params
            .remove("nonce")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SipError::Protocol("Challenge is missing nonce".to_string()))?;

        let algorithm = params
            .remove("algorithm")
            .unwrap_or_else(|| "MD5".to_string());
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(SipError::Protocol(format!(
                "Unsupported digest algorithm: {}",
                algorithm
            )));
        }

        let qop = params.remove("qop");
        if let Some(qop) = &qop {
            warn!(
                "Server offers qop=\"{}\"; answering without qop, expect rejection if it is mandatory",
                qop
            );
        }

        Ok(Self {
            realm,
            nonce,
            opaque: params.remove("opaque"),
            algorithm,
            qop,
            kind,
        })
    }
}

/// Split `key=value` pairs on commas outside quoted strings
fn parse_digest_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut parts = Vec::new();

    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);

    for part in parts {
        if let Some((key, value)) = part.trim().split_once('=') {
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim().trim_matches('"');
            params.insert(key, value.to_string());
        }
    }

    params
}

/// Credentials computed for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub opaque: Option<String>,
    pub kind: ChallengeKind,
}

impl DigestCredentials {
    /// Compute the digest answer for `method uri` under a challenge
    pub fn compute(account: &Account, challenge: &AuthChallenge, method: &str, uri: &str) -> Self {
        let response = calculate_response(
            account.username(),
            account.password(),
            &challenge.realm,
            &challenge.nonce,
            method,
            uri,
        );

        debug!(
            "Computed digest for {} {} in realm {}",
            method, uri, challenge.realm
        );

        Self {
            username: account.username().to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
            opaque: challenge.opaque.clone(),
            kind: challenge.kind,
        }
    }

    pub fn header_name(&self) -> &'static str {
        self.kind.authorization_header()
    }

    /// Format as Authorization header value
    pub fn to_header_value(&self) -> String {
        let mut value = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm=MD5"#,
            self.username, self.realm, self.nonce, self.uri, self.response
        );
        if let Some(opaque) = &self.opaque {
            value.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        value
    }
}

/// Calculate digest response
///
/// `MD5(HA1:nonce:HA2)` with `HA1 = MD5(user:realm:password)` and
/// `HA2 = MD5(method:uri)`, all lower-case hex.
pub fn calculate_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{}:{}:{}", username, realm, password)));
    let ha2 = format!("{:x}", md5::compute(format!("{}:{}", method, uri)));
    format!("{:x}", md5::compute(format!("{}:{}:{}", ha1, nonce, ha2)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("alice", "secret", "example.com", 5060).unwrap()
    }

    #[test]
    fn test_calculate_response_known_vector() {
        let response = calculate_response(
            "alice",
            "secret",
            "example.com",
            "abc123",
            "REGISTER",
            "sip:example.com",
        );
        assert_eq!(response, "d1d211daa2e0d7f43de25792410f5057");
    }

    #[test]
    fn test_parse_challenge() {
        let challenge = AuthChallenge::parse(
            r#"Digest realm="example.com", nonce="abc123", opaque="5ccc", algorithm=MD5"#,
            ChallengeKind::Www,
        )
        .unwrap();
        assert_eq!(challenge.realm, "example.com");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.opaque.as_deref(), Some("5ccc"));
        assert_eq!(challenge.qop, None);
    }

    #[test]
    fn test_parse_challenge_with_comma_in_quotes() {
        let challenge = AuthChallenge::parse(
            r#"Digest realm="Acme, Inc", nonce="n1", qop="auth,auth-int""#,
            ChallengeKind::Proxy,
        )
        .unwrap();
        assert_eq!(challenge.realm, "Acme, Inc");
        assert_eq!(challenge.qop.as_deref(), Some("auth,auth-int"));
        assert_eq!(challenge.kind.authorization_header(), "Proxy-Authorization");
    }

    #[test]
    fn test_challenge_missing_fields() {
        let err = AuthChallenge::parse(r#"Digest nonce="abc""#, ChallengeKind::Www).unwrap_err();
        assert!(matches!(err, SipError::Protocol(_)));

        let err = AuthChallenge::parse(r#"Digest realm="x""#, ChallengeKind::Www).unwrap_err();
        assert!(matches!(err, SipError::Protocol(_)));

        let err = AuthChallenge::parse(r#"Basic realm="x""#, ChallengeKind::Www).unwrap_err();
        assert!(matches!(err, SipError::Protocol(_)));
    }

    #[test]
    fn test_challenge_from_407() {
        let response = SipMessage::response(407, "Proxy Authentication Required")
            .with_header("Proxy-Authenticate", r#"Digest realm="example.com", nonce="abc123""#);
        let challenge = AuthChallenge::from_response(&response).unwrap();
        assert_eq!(challenge.kind, ChallengeKind::Proxy);

        let bare = SipMessage::response(401, "Unauthorized");
        assert!(AuthChallenge::from_response(&bare).is_err());
    }

    #[test]
    fn test_authorization_header_value() {
        let challenge = AuthChallenge::parse(
            r#"Digest realm="example.com", nonce="abc123""#,
            ChallengeKind::Www,
        )
        .unwrap();
        let creds = DigestCredentials::compute(&account(), &challenge, "REGISTER", "sip:example.com");

        assert_eq!(creds.header_name(), "Authorization");
        assert_eq!(
            creds.to_header_value(),
            r#"Digest username="alice", realm="example.com", nonce="abc123", uri="sip:example.com", response="d1d211daa2e0d7f43de25792410f5057", algorithm=MD5"#
        );
    }

    #[test]
    fn test_invite_digest_uses_request_uri() {
        let challenge = AuthChallenge::parse(
            r#"Digest realm="example.com", nonce="abc123""#,
            ChallengeKind::Www,
        )
        .unwrap();
        let creds = DigestCredentials::compute(
            &account(),
            &challenge,
            "INVITE",
            "sip:+15550100@example.com",
        );
        assert_eq!(creds.response, "7f07daca8a1465c91e26fd55b908b075");
    }
}
