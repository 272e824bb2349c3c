//! Dialog state for one registration or call
//!
//! A dialog owns the identifiers that tie a run of requests together:
//! Call-ID and tags stay fixed, the branch changes per transaction and the
//! CSeq grows for everything except ACK.

use super::message::{SipError, SipMessage, SipMethod};
use crate::domain::shared::value_objects::CallId;
use rand::Rng;
use tracing::debug;

/// Magic cookie every RFC 3261 branch starts with
pub const BRANCH_COOKIE: &str = "z9hG4bK";

/// Generate a random tag for From/To
pub fn generate_tag() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Generate a new Via branch parameter
pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{}{:x}", BRANCH_COOKIE, random)
}

/// Identifiers for one outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    pub method: SipMethod,
    pub cseq: u32,
    pub branch: String,
}

impl TransactionContext {
    /// CSeq header value, e.g. `2 INVITE`
    pub fn cseq_header(&self) -> String {
        format!("{} {}", self.cseq, self.method)
    }
}

/// SIP dialog (or registration pseudo-dialog)
#[derive(Debug, Clone)]
pub struct Dialog {
    call_id: CallId,
    local_tag: String,
    remote_tag: Option<String>,
    branch: String,
    local_cseq: u32,
    invite_cseq: Option<u32>,
    /// Our name-addr for From
    local_party: String,
    /// Their name-addr for To, without tag
    remote_party: String,
    contact_uri: String,
    remote_contact_uri: Option<String>,
}

impl Dialog {
    pub fn new(
        call_id: CallId,
        local_party: impl Into<String>,
        remote_party: impl Into<String>,
        contact_uri: impl Into<String>,
    ) -> Self {
        Self {
            call_id,
            local_tag: generate_tag(),
            remote_tag: None,
            branch: generate_branch(),
            local_cseq: 0,
            invite_cseq: None,
            local_party: local_party.into(),
            remote_party: remote_party.into(),
            contact_uri: contact_uri.into(),
            remote_contact_uri: None,
        }
    }

    /// Start a new transaction in this dialog
    ///
    /// Every method except ACK takes the next CSeq. ACK reuses the CSeq of
    /// the INVITE it acknowledges.
    pub fn new_transaction(&mut self, method: SipMethod) -> Result<TransactionContext, SipError> {
        self.branch = generate_branch();

        let cseq = match method {
            SipMethod::Ack => self.invite_cseq.ok_or_else(|| {
                SipError::InvalidState("ACK without a preceding INVITE".to_string())
            })?,
            _ => {
                self.local_cseq += 1;
                if method == SipMethod::Invite {
                    self.invite_cseq = Some(self.local_cseq);
                }
                self.local_cseq
            }
        };

        debug!(
            "New {} transaction in dialog {}: cseq={} branch={}",
            method, self.call_id, cseq, self.branch
        );

        Ok(TransactionContext {
            method,
            cseq,
            branch: self.branch.clone(),
        })
    }

    /// Learn remote identifiers from a response
    ///
    /// The first non-empty To tag is kept for the life of the dialog; the
    /// Contact is replaced by whatever the latest response carried.
    pub fn record_response(&mut self, response: &SipMessage) {
        if self.remote_tag.is_none() {
            if let Some(tag) = response.to_tag().filter(|t| !t.is_empty()) {
                debug!("Learned remote tag {} for dialog {}", tag, self.call_id);
                self.remote_tag = Some(tag.to_string());
            }
        }

        if let Some(contact) = response.contact_uri() {
            self.remote_contact_uri = Some(contact.to_string());
        }
    }

    /// Whether a response belongs to the given outstanding transaction
    pub fn matches(&self, response: &SipMessage, tx: &TransactionContext) -> bool {
        if response.call_id() != Some(self.call_id.as_str()) {
            return false;
        }
        match response.cseq() {
            Some((seq, method)) if seq == tx.cseq && method == tx.method.as_str() => {}
            _ => return false,
        }
        match response.via_branch() {
            Some(branch) => branch == tx.branch,
            None => true,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Last CSeq used by a non-ACK request, 0 before the first one
    pub fn local_cseq(&self) -> u32 {
        self.local_cseq
    }

    pub fn contact_uri(&self) -> &str {
        &self.contact_uri
    }

    pub fn remote_contact_uri(&self) -> Option<&str> {
        self.remote_contact_uri.as_deref()
    }

    /// From header value with our tag
    pub fn from_header(&self) -> String {
        format!("{};tag={}", self.local_party, self.local_tag)
    }

    /// To header value, tagged once the remote tag is known
    pub fn to_header(&self) -> String {
        match &self.remote_tag {
            Some(tag) => format!("{};tag={}", self.remote_party, tag),
            None => self.remote_party.clone(),
        }
    }

    /// Where in-dialog requests go: the learned Contact, else `fallback`
    pub fn remote_target(&self, fallback: &str) -> String {
        self.remote_contact_uri
            .clone()
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialog() -> Dialog {
        Dialog::new(
            CallId::from_string("call-1@example.com"),
            "<sip:alice@example.com>",
            "<sip:bob@example.com>",
            "sip:alice@10.0.0.1:5060",
        )
    }

    fn response(code: u16, cseq: &str, to: &str) -> SipMessage {
        SipMessage::response(code, "x")
            .with_header("Call-ID", "call-1@example.com")
            .with_header("CSeq", cseq)
            .with_header("To", to)
    }

    #[test]
    fn test_cseq_strictly_increases() {
        let mut dialog = dialog();
        let mut last = 0;
        for method in [
            SipMethod::Register,
            SipMethod::Register,
            SipMethod::Invite,
            SipMethod::Invite,
            SipMethod::Bye,
        ] {
            let tx = dialog.new_transaction(method).unwrap();
            assert!(tx.cseq > last);
            last = tx.cseq;
        }
        assert_eq!(last, 5);
    }

    #[test]
    fn test_ack_reuses_invite_cseq() {
        let mut dialog = dialog();
        assert!(dialog.new_transaction(SipMethod::Ack).is_err());

        let invite = dialog.new_transaction(SipMethod::Invite).unwrap();
        let retry = dialog.new_transaction(SipMethod::Invite).unwrap();
        let ack = dialog.new_transaction(SipMethod::Ack).unwrap();

        assert_eq!(invite.cseq, 1);
        assert_eq!(ack.cseq, retry.cseq);
        assert_eq!(ack.cseq_header(), "2 ACK");
        assert_ne!(ack.branch, retry.branch);

        let bye = dialog.new_transaction(SipMethod::Bye).unwrap();
        assert_eq!(bye.cseq, 3);
    }

    #[test]
    fn test_branch_changes_per_transaction() {
        let mut dialog = dialog();
        let a = dialog.new_transaction(SipMethod::Register).unwrap();
        let b = dialog.new_transaction(SipMethod::Register).unwrap();
        assert!(a.branch.starts_with(BRANCH_COOKIE));
        assert_ne!(a.branch, b.branch);
    }

    #[test]
    fn test_remote_tag_first_wins_contact_latest_wins() {
        let mut dialog = dialog();
        dialog.record_response(
            &response(180, "1 INVITE", "<sip:bob@example.com>;tag=first")
                .with_header("Contact", "<sip:bob@10.0.0.2>"),
        );
        dialog.record_response(
            &response(200, "1 INVITE", "<sip:bob@example.com>;tag=second")
                .with_header("Contact", "<sip:bob@10.0.0.3:5070>"),
        );

        assert_eq!(dialog.remote_tag(), Some("first"));
        assert_eq!(dialog.remote_contact_uri(), Some("sip:bob@10.0.0.3:5070"));
        assert_eq!(dialog.to_header(), "<sip:bob@example.com>;tag=first");
    }

    #[test]
    fn test_empty_tag_is_ignored() {
        let mut dialog = dialog();
        dialog.record_response(&response(100, "1 INVITE", "<sip:bob@example.com>;tag="));
        assert_eq!(dialog.remote_tag(), None);
        assert_eq!(dialog.remote_target("sip:example.com"), "sip:example.com");
    }

    #[test]
    fn test_matches_outstanding_transaction() {
        let mut dialog = dialog();
        let tx = dialog.new_transaction(SipMethod::Invite).unwrap();

        let good = response(180, "1 INVITE", "<sip:bob@example.com>")
            .with_header("Via", format!("SIP/2.0/UDP 10.0.0.1:5060;branch={}", tx.branch));
        assert!(dialog.matches(&good, &tx));

        let stale = response(200, "0 INVITE", "<sip:bob@example.com>");
        assert!(!dialog.matches(&stale, &tx));

        let wrong_method = response(200, "1 REGISTER", "<sip:bob@example.com>");
        assert!(!dialog.matches(&wrong_method, &tx));

        let other_call = good.clone().with_header("Call-ID", "other@example.com");
        assert!(!dialog.matches(&other_call, &tx));

        let other_branch = good.with_header("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKold");
        assert!(!dialog.matches(&other_branch, &tx));
    }
}
