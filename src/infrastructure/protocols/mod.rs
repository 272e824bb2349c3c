//! Signalling protocols

pub mod sip;
