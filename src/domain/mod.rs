//! Domain layer - Core rules of the calling engine
//!
//! This layer contains:
//! - Account: the identity we register and call as
//! - Call aggregate: state progression and bookkeeping of one call
//! - Value Objects: Call-ID, SIP URI

pub mod account;
pub mod call;
pub mod shared;

// Re-export commonly used types
pub use account::Account;
pub use shared::{DomainError, Result};
