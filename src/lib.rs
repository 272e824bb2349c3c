//! usip - a single-account SIP calling engine
//!
//! Registers one account with a SIP registrar over UDP, places one outbound
//! call, keeps it alive and hangs it up. Audio is left to a pluggable
//! [`MediaEngine`](infrastructure::media::MediaEngine).

pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::error::Result;
pub use infrastructure::protocols::sip::{CallController, SipError};
