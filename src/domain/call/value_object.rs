//! Call and registration state value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call state
///
/// Declared in lifecycle order. A call only ever moves forward through this
/// ordering and stops at `Disconnected` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// No INVITE sent yet
    Idle,
    /// INVITE sent, 100 Trying at most
    Calling,
    /// 180 Ringing received
    Ringing,
    /// 183 Session Progress received
    Connecting,
    /// 2xx received and acknowledged
    Connected,
    /// Hangup in progress
    Disconnecting,
    /// Call ended normally
    Disconnected,
    /// Call attempt failed
    Failed,
}

impl CallState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match new_state {
            CallState::Failed => true,
            _ => new_state > self,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Disconnected | CallState::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Calling => "Calling",
            CallState::Ringing => "Ringing",
            CallState::Connecting => "Connecting",
            CallState::Connected => "Connected",
            CallState::Disconnecting => "Disconnecting",
            CallState::Disconnected => "Disconnected",
            CallState::Failed => "Failed",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
    Unregistering,
    Failed,
}

impl RegistrationState {
    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: &RegistrationState) -> bool {
        use RegistrationState::*;

        match (self, new_state) {
            (Unregistered, Registering) => true,
            (Failed, Registering) => true,
            // Refreshing an existing binding
            (Registered, Registering) => true,

            (Registering, Registered) => true,
            (Registering, Failed) => true,

            (Registered, Unregistering) => true,
            (Unregistering, Unregistered) => true,
            (Unregistering, Failed) => true,

            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RegistrationState::Unregistered => "Unregistered",
            RegistrationState::Registering => "Registering",
            RegistrationState::Registered => "Registered",
            RegistrationState::Unregistering => "Unregistering",
            RegistrationState::Failed => "Failed",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_state_moves_forward() {
        assert!(CallState::Idle.can_transition_to(&CallState::Calling));
        assert!(CallState::Calling.can_transition_to(&CallState::Ringing));
        assert!(CallState::Calling.can_transition_to(&CallState::Connected));
        assert!(CallState::Ringing.can_transition_to(&CallState::Connecting));
        assert!(CallState::Connected.can_transition_to(&CallState::Disconnecting));
        assert!(CallState::Disconnecting.can_transition_to(&CallState::Disconnected));
    }

    #[test]
    fn test_call_state_never_moves_backwards() {
        assert!(!CallState::Connecting.can_transition_to(&CallState::Ringing));
        assert!(!CallState::Ringing.can_transition_to(&CallState::Ringing));
        assert!(!CallState::Connected.can_transition_to(&CallState::Calling));
        assert!(!CallState::Calling.can_transition_to(&CallState::Idle));
    }

    #[test]
    fn test_call_state_terminal() {
        assert!(CallState::Ringing.can_transition_to(&CallState::Failed));
        assert!(CallState::Idle.can_transition_to(&CallState::Failed));
        assert!(!CallState::Failed.can_transition_to(&CallState::Disconnected));
        assert!(!CallState::Disconnected.can_transition_to(&CallState::Failed));
        assert!(!CallState::Disconnected.can_transition_to(&CallState::Idle));
    }

    #[test]
    fn test_registration_transitions() {
        use RegistrationState::*;
        assert!(Unregistered.can_transition_to(&Registering));
        assert!(Registering.can_transition_to(&Registered));
        assert!(Registering.can_transition_to(&Failed));
        assert!(Registered.can_transition_to(&Unregistering));
        assert!(Unregistering.can_transition_to(&Unregistered));
        assert!(Failed.can_transition_to(&Registering));

        assert!(!Unregistered.can_transition_to(&Registered));
        assert!(!Registered.can_transition_to(&Unregistered));
        assert!(!Failed.can_transition_to(&Registered));
    }
}
