//! Call control for a single account
//!
//! [`CallController`] owns the transport, the registration and call dialogs
//! and the keepalive task. All dialog state sits behind one mutex which is
//! held for every CSeq bump together with the send that uses it; waiting for
//! responses happens outside the lock so that `hangup` can always get in.
//!
//! ## Failure rules
//! - A timeout leaves the attempt where it was (Registering / Calling) until
//!   the caller gives up with `fail_registration` / `fail_call`.
//! - Any other error ends the attempt in `Failed`.
//! - `hangup` always ends in `Disconnected`; errors on the way are logged.

use super::auth::{AuthChallenge, DigestCredentials};
use super::builder::RequestBuilder;
use super::dialog::{Dialog, TransactionContext};
use super::message::{SipError, SipMessage, SipMethod};
use super::sdp::SdpSession;
use super::transaction::{PendingTransaction, TimeoutPolicy, TransactionRunner};
use super::transport::{Transport, UdpTransport};
use crate::domain::account::Account;
use crate::domain::call::{CallInfo, CallState, RegistrationState};
use crate::domain::shared::value_objects::{CallId, SipUri};
use crate::infrastructure::media::MediaEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const DEFAULT_REGISTER_EXPIRES: u32 = 3600;
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_RTP_PORT: u16 = 10000;
pub const DEFAULT_DIAL_PREFIX: &str = "+1";

/// Tunables for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub local_rtp_port: u16,
    pub register_expires: u32,
    /// Zero disables the keepalive re-INVITE
    pub keepalive_interval: Duration,
    /// Prepended to bare numbers that do not start with `+`
    pub dial_prefix: String,
    pub timeouts: TimeoutPolicy,
    /// Log raw datagrams
    pub verbose: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            local_rtp_port: DEFAULT_RTP_PORT,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            dial_prefix: DEFAULT_DIAL_PREFIX.to_string(),
            timeouts: TimeoutPolicy::default(),
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialogSlot {
    Registration,
    Call,
}

/// Everything guarded by the session mutex
struct SessionState {
    registration: RegistrationState,
    registration_dialog: Option<Dialog>,
    call: Option<CallInfo>,
    call_dialog: Option<Dialog>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            registration: RegistrationState::Unregistered,
            registration_dialog: None,
            call: None,
            call_dialog: None,
        }
    }

    fn dialog_mut(&mut self, slot: DialogSlot) -> Option<&mut Dialog> {
        match slot {
            DialogSlot::Registration => self.registration_dialog.as_mut(),
            DialogSlot::Call => self.call_dialog.as_mut(),
        }
    }

    fn set_registration(&mut self, next: RegistrationState) -> Result<(), SipError> {
        if !self.registration.can_transition_to(&next) {
            return Err(SipError::InvalidState(format!(
                "Cannot move registration from {} to {}",
                self.registration, next
            )));
        }
        self.registration = next;
        Ok(())
    }

    /// Registration attempt is over without success
    fn fail_registration(&mut self) -> bool {
        if self.set_registration(RegistrationState::Failed).is_err() {
            return false;
        }
        self.registration_dialog = None;
        true
    }

    /// Call attempt is over without success; returns the prior state
    fn fail_call(&mut self, reason: &str) -> Option<CallState> {
        let call = self.call.as_mut()?;
        let previous = call.state();
        call.fail(reason).ok()?;
        self.call_dialog = None;
        Some(previous)
    }
}

/// Turn user input into the request-URI of a call
///
/// Full `sip:` URIs and `user@host` are taken as they are. Phone numbers
/// lose their separators and get `dial_prefix` unless they start with `+`.
/// Anything else is a user name at `domain`.
pub fn normalize_target(target: &str, dial_prefix: &str, domain: &str) -> Result<SipUri, SipError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(SipError::Config("Nothing to call".to_string()));
    }

    if target.get(..4).is_some_and(|scheme| scheme.eq_ignore_ascii_case("sip:")) {
        return SipUri::parse(target).map_err(SipError::Config);
    }
    if target.contains('@') {
        return SipUri::parse(&format!("sip:{}", target)).map_err(SipError::Config);
    }

    let compact: String = target
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);
    let is_number = !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit());

    let user = match (is_number, compact.starts_with('+')) {
        (true, true) => compact,
        (true, false) => format!("{}{}", dial_prefix, compact),
        (false, _) => target.to_string(),
    };

    Ok(SipUri::user_at(&user, domain))
}

/// SIP user agent for one account and at most one call
pub struct CallController {
    account: Account,
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    runner: TransactionRunner,
    builder: RequestBuilder,
    media: Arc<dyn MediaEngine>,
    state: Arc<Mutex<SessionState>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl CallController {
    pub fn new(
        account: Account,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaEngine>,
        settings: SessionSettings,
    ) -> Self {
        let runner =
            TransactionRunner::new(transport.clone(), settings.timeouts).with_verbose(settings.verbose);
        let builder =
            RequestBuilder::new(account.clone(), transport.local_addr(), settings.local_rtp_port);

        Self {
            account,
            settings,
            transport,
            runner,
            builder,
            media,
            state: Arc::new(Mutex::new(SessionState::new())),
            keepalive: Mutex::new(None),
        }
    }

    /// Open a UDP transport to the account's registrar and wrap it
    pub async fn connect(
        account: Account,
        media: Arc<dyn MediaEngine>,
        settings: SessionSettings,
    ) -> Result<Self, SipError> {
        let transport = UdpTransport::connect(account.domain(), account.port()).await?;
        Ok(Self::new(account, Arc::new(transport), media, settings))
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub async fn registration_state(&self) -> RegistrationState {
        self.state.lock().await.registration
    }

    /// State of the current or last call, `Idle` before the first one
    pub async fn call_state(&self) -> CallState {
        self.state
            .lock()
            .await
            .call
            .as_ref()
            .map(|c| c.state())
            .unwrap_or(CallState::Idle)
    }

    pub async fn call_info(&self) -> Option<CallInfo> {
        self.state.lock().await.call.clone()
    }

    pub fn resolve_target(&self, target: &str) -> Result<SipUri, SipError> {
        normalize_target(target, &self.settings.dial_prefix, self.account.domain())
    }

    /// Bump CSeq, build and send under the session lock
    async fn start_transaction<F>(
        &self,
        slot: DialogSlot,
        method: SipMethod,
        build: F,
    ) -> Result<(PendingTransaction, Dialog, TransactionContext), SipError>
    where
        F: FnOnce(&Dialog, &TransactionContext) -> SipMessage,
    {
        let mut state = self.state.lock().await;
        let dialog = state
            .dialog_mut(slot)
            .ok_or_else(|| SipError::InvalidState(format!("No {:?} dialog", slot)))?;
        let tx = dialog.new_transaction(method)?;
        let request = build(dialog, &tx);
        let pending = self.runner.begin(&request).await?;
        Ok((pending, dialog.clone(), tx))
    }

    async fn await_final(
        &self,
        pending: &mut PendingTransaction,
        dialog: &Dialog,
        tx: &TransactionContext,
    ) -> Result<SipMessage, SipError> {
        loop {
            let response = self
                .runner
                .next_response(pending, |m| dialog.matches(m, tx))
                .await?;
            if !response.is_provisional() {
                return Ok(response);
            }
            debug!("{} for {} {}", response.summary(), tx.method, dialog.call_id());
        }
    }

    /// Register the account with its registrar
    pub async fn register(&self) -> Result<(), SipError> {
        self.run_registration(self.settings.register_expires).await
    }

    /// Remove the binding created by `register`
    pub async fn unregister(&self) -> Result<(), SipError> {
        self.run_registration(0).await
    }

    async fn run_registration(&self, expires: u32) -> Result<(), SipError> {
        let (pending_state, done_state) = if expires == 0 {
            (RegistrationState::Unregistering, RegistrationState::Unregistered)
        } else {
            (RegistrationState::Registering, RegistrationState::Registered)
        };

        {
            let mut state = self.state.lock().await;
            state.set_registration(pending_state)?;
            if state.registration_dialog.is_none() {
                let aor = self.account.name_addr();
                state.registration_dialog = Some(Dialog::new(
                    CallId::generate(self.account.domain()),
                    aor.clone(),
                    aor,
                    self.builder.contact_uri(),
                ));
            }
        }
        info!(
            "{} {} (expires {})",
            pending_state,
            self.account.aor(),
            expires
        );

        let result = self.exchange_register(expires).await;

        let mut state = self.state.lock().await;
        match &result {
            Ok(()) => {
                state.set_registration(done_state)?;
                if done_state == RegistrationState::Unregistered {
                    state.registration_dialog = None;
                }
                info!("{} is {}", self.account.aor(), done_state);
            }
            Err(e @ SipError::Timeout(_)) => {
                warn!("Registration still {}: {}", state.registration, e);
            }
            Err(e) => {
                error!("Registration of {} failed: {}", self.account.aor(), e);
                state.fail_registration();
            }
        }
        result
    }

    async fn exchange_register(&self, expires: u32) -> Result<(), SipError> {
        let uri = self.builder.registrar_uri();
        let mut credentials: Option<DigestCredentials> = None;

        loop {
            let (mut pending, dialog, tx) = self
                .start_transaction(DialogSlot::Registration, SipMethod::Register, |d, tx| {
                    self.builder.register(d, tx, expires, credentials.as_ref())
                })
                .await?;
            let response = self.await_final(&mut pending, &dialog, &tx).await?;

            match response.status_code() {
                200..=299 => {
                    if let Some(dialog) = self.state.lock().await.registration_dialog.as_mut() {
                        dialog.record_response(&response);
                    }
                    return Ok(());
                }
                401 | 407 => {
                    if credentials.is_some() {
                        return Err(SipError::AuthRejected(format!(
                            "REGISTER challenged again ({})",
                            response.summary()
                        )));
                    }
                    let challenge = AuthChallenge::from_response(&response)?;
                    info!(
                        "REGISTER challenged by realm {}, retrying with credentials",
                        challenge.realm
                    );
                    credentials = Some(DigestCredentials::compute(
                        &self.account,
                        &challenge,
                        SipMethod::Register.as_str(),
                        &uri,
                    ));
                }
                status => {
                    return Err(SipError::RegistrationRejected {
                        status,
                        reason: response.reason().to_string(),
                    })
                }
            }
        }
    }

    /// Give up on a registration left pending by a timeout
    pub async fn fail_registration(&self, reason: &str) -> Result<(), SipError> {
        let mut state = self.state.lock().await;
        if !state.fail_registration() {
            return Err(SipError::InvalidState(format!(
                "Registration is {}, nothing to fail",
                state.registration
            )));
        }
        warn!("Registration of {} given up: {}", self.account.aor(), reason);
        Ok(())
    }

    /// Place a call and wait until it is answered or has failed
    ///
    /// `target` is a `sip:` URI or anything [`normalize_target`] accepts.
    pub async fn make_call(&self, target: &str) -> Result<CallId, SipError> {
        let target = self.resolve_target(target)?;

        let call_id = {
            let mut state = self.state.lock().await;
            if let Some(call) = state.call.as_ref().filter(|c| !c.state().is_terminal()) {
                return Err(SipError::InvalidState(format!(
                    "Call {} is still {}",
                    call.call_id(),
                    call.state()
                )));
            }
            if state.registration != RegistrationState::Registered {
                warn!("Calling {} while {}", target, state.registration);
            }

            let call_id = CallId::generate(self.account.domain());
            let dialog = Dialog::new(
                call_id.clone(),
                self.account.name_addr(),
                format!("<{}>", target),
                self.builder.contact_uri(),
            );
            let mut call = CallInfo::new(
                call_id.clone(),
                target.clone(),
                dialog.local_tag().to_string(),
                self.settings.local_rtp_port,
            );
            call.transition_to(CallState::Calling)?;

            state.call = Some(call);
            state.call_dialog = Some(dialog);
            call_id
        };
        info!("Calling {} (Call-ID {})", target, call_id);

        match self.run_invite(&target.to_string()).await {
            Ok(()) => Ok(call_id),
            Err(e @ SipError::Timeout(_)) => {
                warn!("Call {} still {}: {}", call_id, self.call_state().await, e);
                Err(e)
            }
            Err(e) => {
                error!("Call {} failed: {}", call_id, e);
                self.state.lock().await.fail_call(&e.to_string());
                Err(e)
            }
        }
    }

    async fn run_invite(&self, target_uri: &str) -> Result<(), SipError> {
        let mut credentials: Option<DigestCredentials> = None;

        loop {
            let (mut pending, dialog, tx) = self
                .start_transaction(DialogSlot::Call, SipMethod::Invite, |d, tx| {
                    self.builder.invite(d, tx, target_uri, credentials.as_ref())
                })
                .await?;

            let response = loop {
                let response = self
                    .runner
                    .next_response(&mut pending, |m| dialog.matches(m, &tx))
                    .await?;
                if !response.is_provisional() {
                    break response;
                }
                self.on_provisional(&response).await;
            };

            match response.status_code() {
                200..=299 => return self.on_answered(&response).await,
                401 | 407 => {
                    if credentials.is_some() {
                        return Err(SipError::AuthRejected(format!(
                            "INVITE challenged again ({})",
                            response.summary()
                        )));
                    }
                    let challenge = AuthChallenge::from_response(&response)?;
                    info!(
                        "INVITE challenged by realm {}, retrying with credentials",
                        challenge.realm
                    );
                    credentials = Some(DigestCredentials::compute(
                        &self.account,
                        &challenge,
                        SipMethod::Invite.as_str(),
                        target_uri,
                    ));
                }
                status => {
                    return Err(SipError::CallRejected {
                        status,
                        reason: response.reason().to_string(),
                    })
                }
            }
        }
    }

    async fn on_provisional(&self, response: &SipMessage) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Some(dialog) = state.call_dialog.as_mut() {
            dialog.record_response(response);
        }
        let Some(call) = state.call.as_mut() else {
            return;
        };
        call.set_remote_tag(
            response
                .to_tag()
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        );

        let next = match response.status_code() {
            180 => CallState::Ringing,
            183 => CallState::Connecting,
            _ => CallState::Calling,
        };
        if call.advance(next) {
            info!("Call {}: {}", call.call_id(), next);
        } else {
            debug!(
                "Call {} stays {} on {}",
                call.call_id(),
                call.state(),
                response.summary()
            );
        }
    }

    /// 2xx: Connected, ACK, media, keepalive
    async fn on_answered(&self, response: &SipMessage) -> Result<(), SipError> {
        let fallback = self.builder.registrar_uri();
        let (remote_address, remote_port) =
            SdpSession::parse(&String::from_utf8_lossy(&response.body))
                .and_then(|sdp| sdp.audio_endpoint())
                .unwrap_or_else(|| {
                    debug!("No usable SDP answer, sending media towards the registrar");
                    (self.account.domain().to_string(), self.settings.local_rtp_port)
                });

        let call_id = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let dialog = state
                .call_dialog
                .as_mut()
                .ok_or_else(|| SipError::InvalidState("Call dialog is gone".to_string()))?;
            let call = state
                .call
                .as_mut()
                .ok_or_else(|| SipError::InvalidState("Call is gone".to_string()))?;

            dialog.record_response(response);
            call.set_remote_tag(dialog.remote_tag().map(str::to_string));
            call.set_remote_media(remote_address.clone(), remote_port);
            call.transition_to(CallState::Connected)?;

            let tx = dialog.new_transaction(SipMethod::Ack)?;
            let ack = self.builder.ack(dialog, &tx, &fallback);
            self.runner.fire(&ack).await?;
            call.call_id().clone()
        };
        info!(
            "Call {} connected, media to {}:{}",
            call_id, remote_address, remote_port
        );

        if !self
            .media
            .start_streaming(
                call_id.as_str(),
                self.settings.local_rtp_port,
                &remote_address,
                remote_port,
            )
            .await
        {
            warn!("Media engine did not start streaming for call {}", call_id);
        }

        // A hangup may have run while the stream was starting
        let still_connected = self
            .state
            .lock()
            .await
            .call
            .as_ref()
            .is_some_and(|c| c.call_id() == &call_id && c.state() == CallState::Connected);
        if !still_connected {
            debug!("Call {} ended while media was starting", call_id);
            self.media.stop_streaming(call_id.as_str()).await;
            return Ok(());
        }

        self.start_keepalive().await;
        Ok(())
    }

    async fn start_keepalive(&self) {
        let interval = self.settings.keepalive_interval;
        if interval.is_zero() {
            debug!("Keepalive disabled");
            return;
        }

        let state = self.state.clone();
        let runner = self.runner.clone();
        let builder = self.builder.clone();
        let fallback = builder.registrar_uri();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let mut guard = state.lock().await;
                let session = &mut *guard;
                let connected = session
                    .call
                    .as_ref()
                    .is_some_and(|c| c.state() == CallState::Connected);
                let Some(dialog) = session.call_dialog.as_mut().filter(|_| connected) else {
                    debug!("Keepalive stopped, call no longer connected");
                    break;
                };

                match dialog.new_transaction(SipMethod::Invite) {
                    Ok(tx) => {
                        let request = builder.keepalive(dialog, &tx, &fallback);
                        match runner.fire(&request).await {
                            Ok(()) => debug!(
                                "Keepalive re-INVITE for {} (CSeq {})",
                                dialog.call_id(),
                                tx.cseq
                            ),
                            Err(e) => warn!("Keepalive for {} failed: {}", dialog.call_id(), e),
                        }
                    }
                    Err(e) => warn!("Keepalive for {} not built: {}", dialog.call_id(), e),
                }
            }
        });

        if let Some(previous) = self.keepalive.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Give up on a call left pending by a timeout
    pub async fn fail_call(&self, reason: &str) -> Result<(), SipError> {
        let previous = {
            let mut state = self.state.lock().await;
            let current = state
                .call
                .as_ref()
                .map(|c| c.state())
                .ok_or_else(|| SipError::InvalidState("No call to fail".to_string()))?;
            state.fail_call(reason).ok_or_else(|| {
                SipError::InvalidState(format!("Call is {}, nothing to fail", current))
            })?
        };
        warn!("Call given up: {}", reason);

        if previous == CallState::Connected {
            self.stop_media().await;
        }
        Ok(())
    }

    async fn stop_media(&self) {
        let Some(call_id) = self.state.lock().await.call.as_ref().map(|c| c.call_id().clone()) else {
            return;
        };
        if !self.media.stop_streaming(call_id.as_str()).await {
            warn!("Media engine had nothing to stop for call {}", call_id);
        }
    }

    /// End the call, if any, and close the transport
    ///
    /// Sends BYE when a call dialog exists, without waiting for an answer.
    /// The call ends up `Disconnected` whatever happens on the wire.
    pub async fn hangup(&self) {
        if let Some(handle) = self.keepalive.lock().await.take() {
            handle.abort();
            debug!("Keepalive task cancelled");
        }

        let fallback = self.builder.registrar_uri();
        let was_connected = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let mut was_connected = false;

            if let Some(call) = state.call.as_mut() {
                let previous = call.state();
                if previous.is_terminal() {
                    debug!("Call {} already {}", call.call_id(), previous);
                } else {
                    call.advance(CallState::Disconnecting);
                    if let Some(dialog) = state.call_dialog.as_mut() {
                        match dialog.new_transaction(SipMethod::Bye) {
                            Ok(tx) => {
                                let bye = self.builder.bye(dialog, &tx, &fallback);
                                if let Err(e) = self.runner.fire(&bye).await {
                                    warn!("BYE for {} not sent: {}", call.call_id(), e);
                                }
                            }
                            Err(e) => warn!("BYE for {} not built: {}", call.call_id(), e),
                        }
                    }
                    call.advance(CallState::Disconnected);
                    was_connected = previous == CallState::Connected;
                    info!(
                        "Call {} disconnected after {}s",
                        call.call_id(),
                        call.duration().num_seconds()
                    );
                }
            }

            state.call_dialog = None;
            self.transport.close();
            was_connected
        };

        if was_connected {
            self.stop_media().await;
        }
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Ok(mut keepalive) = self.keepalive.try_lock() {
            if let Some(handle) = keepalive.take() {
                handle.abort();
            }
        }
    }
}
