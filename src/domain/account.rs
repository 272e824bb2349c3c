//! SIP account - the single identity this engine registers and calls as

use crate::domain::shared::error::{DomainError, Result};
use crate::domain::shared::value_objects::SipUri;
use std::fmt;

/// Default SIP signalling port
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Account credentials and registrar location
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    username: String,
    password: String,
    domain: String,
    port: u16,
    display_name: Option<String>,
}

impl Account {
    /// Create a validated account
    ///
    /// Username, password and domain must be non-empty and the port must be
    /// in `1..=65535`.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
        port: u32,
    ) -> Result<Self> {
        let username = username.into();
        let password = password.into();
        let domain = domain.into();

        if username.trim().is_empty() {
            return Err(DomainError::ValidationError("Username is required".to_string()));
        }
        if password.is_empty() {
            return Err(DomainError::ValidationError("Password is required".to_string()));
        }
        if domain.trim().is_empty() {
            return Err(DomainError::ValidationError("Domain is required".to_string()));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| {
                DomainError::ValidationError(format!(
                    "Port must be between 1 and 65535, got {}",
                    port
                ))
            })?;

        Ok(Self {
            username,
            password,
            domain,
            port,
            display_name: None,
        })
    }

    pub fn with_display_name(mut self, display_name: Option<String>) -> Self {
        self.display_name = display_name.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Address of record, `sip:user@domain`
    pub fn aor(&self) -> SipUri {
        SipUri::user_at(&self.username, &self.domain)
    }

    /// Registrar URI, `sip:domain`
    pub fn registrar_uri(&self) -> SipUri {
        SipUri::host_only(&self.domain)
    }

    /// From/To value for this account, with display name when set
    pub fn name_addr(&self) -> String {
        match &self.display_name {
            Some(name) => format!("\"{}\" <{}>", name, self.aor()),
            None => format!("<{}>", self.aor()),
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("password", &"********")
            .field("domain", &self.domain)
            .field("port", &self.port)
            .field("display_name", &self.display_name)
            .finish()
    }
}
