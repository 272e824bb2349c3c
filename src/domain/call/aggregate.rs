//! Call aggregate - the bookkeeping for the one call an engine drives

use crate::domain::call::value_object::CallState;
use crate::domain::shared::error::{DomainError, Result};
use crate::domain::shared::value_objects::{CallId, SipUri};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Call aggregate root
///
/// Enforces the forward-only state progression and records the timestamps
/// and media endpoints learned while the call is set up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallInfo {
    call_id: CallId,
    target: SipUri,
    state: CallState,
    local_tag: String,
    remote_tag: Option<String>,
    local_rtp_port: u16,
    remote_rtp_address: Option<String>,
    remote_rtp_port: Option<u16>,
    /// When the INVITE was first sent
    started_at: DateTime<Utc>,
    /// When the 2xx arrived
    answered_at: Option<DateTime<Utc>>,
    /// When the call reached a terminal state
    ended_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

impl CallInfo {
    pub fn new(call_id: CallId, target: SipUri, local_tag: String, local_rtp_port: u16) -> Self {
        Self {
            call_id,
            target,
            state: CallState::Idle,
            local_tag,
            remote_tag: None,
            local_rtp_port,
            remote_rtp_address: None,
            remote_rtp_port: None,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            failure_reason: None,
        }
    }

    /// Transition to a new state
    pub fn transition_to(&mut self, new_state: CallState) -> Result<()> {
        if !self.state.can_transition_to(&new_state) {
            return Err(DomainError::InvalidStateTransition(format!(
                "Cannot transition call from {} to {}",
                self.state, new_state
            )));
        }

        match new_state {
            CallState::Calling => self.started_at = Utc::now(),
            CallState::Connected => self.answered_at = Some(Utc::now()),
            CallState::Disconnected | CallState::Failed => self.ended_at = Some(Utc::now()),
            _ => {}
        }

        self.state = new_state;
        Ok(())
    }

    /// Move forward if the ordering allows it, otherwise stay put
    ///
    /// Provisional responses may arrive out of order (180 after 183); those
    /// must not drag the call backwards. Returns whether the state changed.
    pub fn advance(&mut self, new_state: CallState) -> bool {
        self.transition_to(new_state).is_ok()
    }

    /// Mark the call failed with a reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition_to(CallState::Failed)?;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn set_remote_tag(&mut self, tag: Option<String>) {
        if self.remote_tag.is_none() {
            self.remote_tag = tag;
        }
    }

    pub fn set_remote_media(&mut self, address: String, port: u16) {
        self.remote_rtp_address = Some(address);
        self.remote_rtp_port = Some(port);
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn target(&self) -> &SipUri {
        &self.target
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn local_rtp_port(&self) -> u16 {
        self.local_rtp_port
    }

    pub fn remote_rtp_address(&self) -> Option<&str> {
        self.remote_rtp_address.as_deref()
    }

    pub fn remote_rtp_port(&self) -> Option<u16> {
        self.remote_rtp_port
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn answered_at(&self) -> Option<DateTime<Utc>> {
        self.answered_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Time since the INVITE went out, up to the end of the call
    pub fn duration(&self) -> Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }

    /// Talk time, from answer to hangup
    pub fn talk_duration(&self) -> Option<Duration> {
        self.answered_at
            .map(|answered| self.ended_at.unwrap_or_else(Utc::now) - answered)
    }
}
