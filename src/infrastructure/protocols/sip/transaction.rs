//! SIP Transaction Layer
//!
//! One request out, its response(s) back. There is no retransmission: a
//! request is sent once and the runner waits under a [`TimeoutPolicy`].
//!
//! ## Waiting rules
//! - Non-INVITE: the final response must arrive within `response_timeout`.
//! - INVITE: every 1xx restarts the `response_timeout` wait, but the whole
//!   exchange is capped by `call_setup_timeout`.
//! - Datagrams that are not SIP, or that belong to another exchange, are
//!   skipped and do not reset any timer.

use super::message::{SipError, SipMessage, SipMethod};
use super::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Response deadlines for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// How long to wait for the next response (default 10s)
    pub response_timeout: Duration,
    /// Cap on a whole INVITE exchange including provisionals (default 60s)
    pub call_setup_timeout: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            call_setup_timeout: Duration::from_secs(60),
        }
    }
}

/// A request that has been sent and is waiting for responses
#[derive(Debug)]
pub struct PendingTransaction {
    method: SipMethod,
    summary: String,
    wait_until: Instant,
    overall_deadline: Instant,
    provisionals: usize,
}

impl PendingTransaction {
    /// Number of 1xx responses seen so far
    pub fn provisionals(&self) -> usize {
        self.provisionals
    }
}

/// Sends requests and collects their responses
#[derive(Clone)]
pub struct TransactionRunner {
    transport: Arc<dyn Transport>,
    policy: TimeoutPolicy,
    verbose: bool,
}

impl TransactionRunner {
    pub fn new(transport: Arc<dyn Transport>, policy: TimeoutPolicy) -> Self {
        Self {
            transport,
            policy,
            verbose: false,
        }
    }

    /// Log raw datagrams in both directions
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Send a request without waiting for anything back (ACK, BYE, keepalive)
    pub async fn fire(&self, request: &SipMessage) -> Result<(), SipError> {
        let data = request.encode();
        if self.verbose {
            debug!(">>> {}\n{}", request.summary(), String::from_utf8_lossy(&data));
        } else {
            debug!(">>> {}", request.summary());
        }
        self.transport.send(data).await
    }

    /// Send a request and start waiting for its responses
    pub async fn begin(&self, request: &SipMessage) -> Result<PendingTransaction, SipError> {
        let method = request.sip_method().ok_or_else(|| {
            SipError::InvalidState(format!("Not a request: {}", request.summary()))
        })?;

        self.fire(request).await?;

        let now = Instant::now();
        let overall = match method {
            SipMethod::Invite => self.policy.call_setup_timeout,
            _ => self.policy.response_timeout,
        };

        Ok(PendingTransaction {
            method,
            summary: request.summary(),
            wait_until: now + self.policy.response_timeout,
            overall_deadline: now + overall,
            provisionals: 0,
        })
    }

    /// Wait for the next response accepted by `matches`
    ///
    /// Returns provisional and final responses alike; the caller decides
    /// when the exchange is over.
    pub async fn next_response<F>(
        &self,
        pending: &mut PendingTransaction,
        matches: F,
    ) -> Result<SipMessage, SipError>
    where
        F: Fn(&SipMessage) -> bool,
    {
        loop {
            // A queued datagram would win the race against an expired timer
            if Instant::now() >= pending.overall_deadline {
                return Err(Self::timed_out(pending));
            }

            let until = pending.wait_until.min(pending.overall_deadline);
            let raw = match tokio::time::timeout_at(until, self.transport.recv()).await {
                Ok(result) => result?,
                Err(_) => return Err(Self::timed_out(pending)),
            };

            let response = SipMessage::decode(&raw);
            if self.verbose {
                debug!("<<< {}\n{}", response.summary(), String::from_utf8_lossy(&raw));
            } else {
                debug!("<<< {}", response.summary());
            }

            if !response.is_response() {
                debug!("Skipping {} byte datagram that is not a response", raw.len());
                continue;
            }
            if !matches(&response) {
                debug!(
                    "Ignoring {} for another exchange (Call-ID {:?}, CSeq {:?})",
                    response.status_code(),
                    response.call_id(),
                    response.cseq()
                );
                continue;
            }

            if response.is_provisional() {
                pending.provisionals += 1;
                if pending.method == SipMethod::Invite {
                    pending.wait_until = Instant::now() + self.policy.response_timeout;
                }
            }

            return Ok(response);
        }
    }

    fn timed_out(pending: &PendingTransaction) -> SipError {
        warn!("No response to {}", pending.summary);
        SipError::Timeout(format!(
            "No response to {} after {} provisional(s)",
            pending.summary, pending.provisionals
        ))
    }

    /// Send a request and wait for its final response
    ///
    /// Every 1xx seen on the way is handed to `on_provisional`.
    pub async fn send<F, P>(
        &self,
        request: &SipMessage,
        matches: F,
        mut on_provisional: P,
    ) -> Result<SipMessage, SipError>
    where
        F: Fn(&SipMessage) -> bool,
        P: FnMut(&SipMessage),
    {
        let mut pending = self.begin(request).await?;
        loop {
            let response = self.next_response(&mut pending, &matches).await?;
            if response.is_provisional() {
                on_provisional(&response);
                continue;
            }
            return Ok(response);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::transport::{ChannelPeer, ChannelTransport};

    fn runner(policy: TimeoutPolicy) -> (TransactionRunner, ChannelPeer) {
        let (transport, peer) = ChannelTransport::pair("127.0.0.1:5060".parse().unwrap());
        (TransactionRunner::new(Arc::new(transport), policy), peer)
    }

    fn short_policy() -> TimeoutPolicy {
        TimeoutPolicy {
            response_timeout: Duration::from_millis(100),
            call_setup_timeout: Duration::from_millis(400),
        }
    }

    fn request(method: SipMethod) -> SipMessage {
        SipMessage::request(method, "sip:example.com")
            .with_header("Call-ID", "tx-test")
            .with_header("CSeq", format!("1 {}", method))
    }

    fn response(code: u16, method: SipMethod) -> SipMessage {
        SipMessage::response(code, "x")
            .with_header("Call-ID", "tx-test")
            .with_header("CSeq", format!("1 {}", method))
    }

    fn same_call(m: &SipMessage) -> bool {
        m.call_id() == Some("tx-test")
    }

    #[tokio::test]
    async fn test_send_collects_provisionals() {
        let (runner, mut peer) = runner(short_policy());
        peer.reply(&response(100, SipMethod::Invite));
        peer.reply(&response(180, SipMethod::Invite));
        peer.reply(&response(200, SipMethod::Invite));

        let mut seen = Vec::new();
        let final_response = runner
            .send(&request(SipMethod::Invite), same_call, |r| seen.push(r.status_code()))
            .await
            .unwrap();

        assert_eq!(final_response.status_code(), 200);
        assert_eq!(seen, vec![100, 180]);
        assert_eq!(peer.next_message().await.unwrap().method(), "INVITE");
    }

    #[tokio::test]
    async fn test_skips_garbage_and_foreign_responses() {
        let (runner, peer) = runner(short_policy());
        peer.inject_raw(&b"\x00\x01 not sip"[..]);
        peer.reply(&response(200, SipMethod::Register).with_header("Call-ID", "other"));
        peer.reply(&SipMessage::request(SipMethod::Options, "sip:x").with_header("Call-ID", "tx-test"));
        peer.reply(&response(401, SipMethod::Register));

        let final_response = runner
            .send(&request(SipMethod::Register), same_call, |_| {})
            .await
            .unwrap();
        assert_eq!(final_response.status_code(), 401);
    }

    #[tokio::test]
    async fn test_timeout_without_response() {
        let (runner, _peer) = runner(short_policy());
        let started = Instant::now();
        let err = runner
            .send(&request(SipMethod::Register), same_call, |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, SipError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_invite_provisionals_extend_wait() {
        let (runner, peer) = runner(short_policy());
        let mut pending = runner.begin(&request(SipMethod::Invite)).await.unwrap();

        // Three 1xx spaced 70ms apart keep the exchange alive past one response timeout
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(70)).await;
            peer.reply(&response(183, SipMethod::Invite));
            let r = runner.next_response(&mut pending, same_call).await.unwrap();
            assert_eq!(r.status_code(), 183);
        }
        assert_eq!(pending.provisionals(), 3);

        // Nothing else arrives: the per-wait timer fires
        let err = runner.next_response(&mut pending, same_call).await.unwrap_err();
        assert!(matches!(err, SipError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_endless_provisionals_hit_setup_cap() {
        let (runner, peer) = runner(short_policy());
        let ringing = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(60)).await;
                peer.reply(&response(180, SipMethod::Invite));
            }
        });

        let started = Instant::now();
        let mut pending = runner.begin(&request(SipMethod::Invite)).await.unwrap();
        let err = loop {
            match runner.next_response(&mut pending, same_call).await {
                Ok(r) => assert_eq!(r.status_code(), 180),
                Err(e) => break e,
            }
        };
        ringing.abort();

        // Each 180 came well inside the 100ms response timeout, so only the cap can end this
        assert!(matches!(err, SipError::Timeout(_)));
        assert!(pending.provisionals() >= 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_setup_cap_wins_over_queued_provisional() {
        let (runner, peer) = runner(TimeoutPolicy {
            response_timeout: Duration::from_secs(5),
            call_setup_timeout: Duration::from_millis(50),
        });
        let mut pending = runner.begin(&request(SipMethod::Invite)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        peer.reply(&response(180, SipMethod::Invite));

        let err = runner.next_response(&mut pending, same_call).await.unwrap_err();
        assert!(matches!(err, SipError::Timeout(_)));
        assert_eq!(pending.provisionals(), 0);
    }

    #[tokio::test]
    async fn test_fire_does_not_wait() {
        let (runner, mut peer) = runner(short_policy());
        runner.fire(&request(SipMethod::Bye)).await.unwrap();
        assert_eq!(peer.try_next_message().unwrap().method(), "BYE");
    }

    #[tokio::test]
    async fn test_closed_transport_fails_fast() {
        let (runner, _peer) = runner(TimeoutPolicy::default());
        let mut pending = runner.begin(&request(SipMethod::Invite)).await.unwrap();
        runner.transport().close();

        let err = runner.next_response(&mut pending, same_call).await.unwrap_err();
        assert_eq!(err, SipError::Transport("closed".to_string()));
    }
}
