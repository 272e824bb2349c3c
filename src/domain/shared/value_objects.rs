//! Shared value objects used across the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// SIP Call-ID
///
/// Stable for the whole life of a dialog. Generated values take the form
/// `<uuid>@<domain>`; values learned from the wire are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    /// Generate a fresh Call-ID scoped to a domain
    pub fn generate(domain: &str) -> Self {
        Self(format!("{}@{}", Uuid::new_v4().simple(), domain))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SIP URI value object
///
/// Covers the `sip:[user@]host[:port][;params]` shapes this client sends and
/// receives. Parsing accepts a bare URI or one wrapped in a name-addr
/// (`"Bob" <sip:bob@host>;tag=x`); anything outside the angle brackets is
/// ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipUri {
    user: Option<String>,
    host: String,
    port: Option<u16>,
    params: Vec<(String, Option<String>)>,
}

impl SipUri {
    pub fn new(user: Option<String>, host: String, port: Option<u16>) -> Self {
        Self {
            user,
            host,
            port,
            params: Vec::new(),
        }
    }

    /// URI for a user at a host, e.g. `sip:alice@example.com`
    pub fn user_at(user: &str, host: &str) -> Self {
        Self::new(Some(user.to_string()), host.to_string(), None)
    }

    /// URI for a bare host, e.g. `sip:example.com`
    pub fn host_only(host: &str) -> Self {
        Self::new(None, host.to_string(), None)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn parse(uri: &str) -> Result<Self, String> {
        let uri = uri.trim();
        let uri = match (uri.find('<'), uri.find('>')) {
            (Some(start), Some(end)) if start < end => &uri[start + 1..end],
            _ => uri,
        };

        let rest = uri
            .get(..4)
            .filter(|scheme| scheme.eq_ignore_ascii_case("sip:"))
            .and_then(|_| uri.get(4..))
            .ok_or_else(|| "URI must start with 'sip:'".to_string())?;

        // Headers after '?' are not used by this client
        let rest = rest.split('?').next().unwrap_or(rest);

        let mut sections = rest.split(';');
        let address = sections.next().unwrap_or_default();
        let params = sections
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(v.to_string())),
                None => (p.to_string(), None),
            })
            .collect();

        let (user, host_port) = match address.rsplit_once('@') {
            Some((user, host_port)) => (Some(user.to_string()), host_port),
            None => (None, address),
        };

        if matches!(user.as_deref(), Some("")) {
            return Err("Empty user part in SIP URI".to_string());
        }

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("Invalid port in SIP URI: {}", port))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };

        if host.is_empty() {
            return Err("Missing host in SIP URI".to_string());
        }

        Ok(Self {
            user,
            host: host.to_string(),
            port,
            params,
        })
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Look up a URI parameter such as `transport` or `lr`
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (key, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", key, value)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}
