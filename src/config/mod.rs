//! Configuration management
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. a TOML file (`usip.toml` in the working directory unless given)
//! 3. `SIP_`-prefixed environment variables, e.g. `SIP_DOMAIN`,
//!    `SIP_PASSWORD` or `SIP_TIMERS__KEEPALIVE_INTERVAL_SECS`

use crate::domain::account::{Account, DEFAULT_SIP_PORT};
use crate::infrastructure::protocols::sip::call_controller::{
    SessionSettings, DEFAULT_DIAL_PREFIX, DEFAULT_REGISTER_EXPIRES, DEFAULT_RTP_PORT,
};
use crate::infrastructure::protocols::sip::message::SipError;
use crate::infrastructure::protocols::sip::transaction::TimeoutPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "usip.toml";
pub const ENV_PREFIX: &str = "SIP";

const MASK: &str = "********";

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Wider than u16 so that out-of-range values reach validation
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Log raw SIP datagrams
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_dial_prefix")]
    pub dial_prefix: String,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default = "default_rtp_port")]
    pub local_rtp_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    #[serde(default = "default_call_setup_timeout")]
    pub call_setup_timeout_secs: u64,
    /// 0 disables the in-call keepalive
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_register_expires")]
    pub register_expires: u32,
}

fn default_port() -> u32 {
    DEFAULT_SIP_PORT as u32
}

fn default_dial_prefix() -> String {
    DEFAULT_DIAL_PREFIX.to_string()
}

fn default_rtp_port() -> u16 {
    DEFAULT_RTP_PORT
}

fn default_response_timeout() -> u64 {
    10
}

fn default_call_setup_timeout() -> u64 {
    60
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_register_expires() -> u32 {
    DEFAULT_REGISTER_EXPIRES
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            local_rtp_port: default_rtp_port(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            response_timeout_secs: default_response_timeout(),
            call_setup_timeout_secs: default_call_setup_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            register_expires: default_register_expires(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            username: String::new(),
            password: String::new(),
            port: default_port(),
            display_name: None,
            verbose: false,
            dial_prefix: default_dial_prefix(),
            media: MediaConfig::default(),
            timers: TimerConfig::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &MASK)
            .field("port", &self.port)
            .field("display_name", &self.display_name)
            .field("verbose", &self.verbose)
            .field("dial_prefix", &self.dial_prefix)
            .field("media", &self.media)
            .field("timers", &self.timers)
            .finish()
    }
}

impl Config {
    /// Load from `usip.toml` (if present) and the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, SipError> {
        Self::load_from(path, None)
    }

    /// Load with an explicit environment instead of the process one
    pub fn load_from(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, SipError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .source(env);

        config::Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| SipError::Config(e.to_string()))
    }

    /// Validated account
    pub fn account(&self) -> Result<Account, SipError> {
        Ok(Account::new(
            self.username.clone(),
            self.password.clone(),
            self.domain.clone(),
            self.port,
        )?
        .with_display_name(self.display_name.clone()))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            local_rtp_port: self.media.local_rtp_port,
            register_expires: self.timers.register_expires,
            keepalive_interval: Duration::from_secs(self.timers.keepalive_interval_secs),
            dial_prefix: self.dial_prefix.clone(),
            timeouts: TimeoutPolicy {
                response_timeout: Duration::from_secs(self.timers.response_timeout_secs),
                call_setup_timeout: Duration::from_secs(self.timers.call_setup_timeout_secs),
            },
            verbose: self.verbose,
        }
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.password.is_empty() {
            copy.password = MASK.to_string();
        }
        copy
    }

    /// Render as TOML with the password masked
    pub fn to_toml(&self) -> Result<String, SipError> {
        toml::to_string_pretty(&self.redacted()).map_err(|e| SipError::Config(e.to_string()))
    }
}
