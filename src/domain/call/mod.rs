//! Call bounded context - state and bookkeeping for the outbound call

pub mod aggregate;
pub mod value_object;

pub use aggregate::CallInfo;
pub use value_object::{CallState, RegistrationState};
