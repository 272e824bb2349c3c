//! Shared kernel - Common types used by the account, call and protocol layers

pub mod error;
pub mod value_objects;

pub use error::{DomainError, Result};
pub use value_objects::*;
