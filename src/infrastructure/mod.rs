//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP over UDP)
//! - The media engine boundary

pub mod media;
pub mod protocols;
