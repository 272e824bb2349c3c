//! SIP protocol implementation
//!
//! A user-agent client for one account, after RFC 3261 but without its
//! retransmission timers.
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │    Call Controller      │
//! │ (REGISTER, INVITE, BYE) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │ Dialog / Builder / Auth │
//! │  (CSeq, tags, digest)   │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transaction Runner    │
//! │ (send once, one timeout)│
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP, in-memory)       │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod call_controller;
pub mod dialog;
pub mod message;
pub mod sdp;
pub mod transaction;
pub mod transport;

pub use auth::{AuthChallenge, ChallengeKind, DigestCredentials};
pub use builder::{RequestBuilder, ResponseBuilder};
pub use call_controller::{CallController, SessionSettings};
pub use dialog::{Dialog, TransactionContext};
pub use message::{SipError, SipMessage, SipMethod};
pub use sdp::SdpSession;
pub use transaction::{TimeoutPolicy, TransactionRunner};
pub use transport::{ChannelPeer, ChannelTransport, Transport, TransportProtocol, UdpTransport};
