//! The durable outbound-message record and its per-recipient result model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default retry schedule, in minutes, used when a message carries no custom
/// schedule: roughly exponential out to 16 hours.
pub const DEFAULT_RETRY_DELAY_MINUTES: [u64; 9] = [1, 3, 10, 30, 60, 120, 240, 480, 960];

/// Default total-dialog budget base when `custom_timeout` is unset.
pub const DEFAULT_BASE_SEND_SECONDS_MAX: u64 = 600;

/// Default content-size scaling for the dialog budget: one extra second per
/// this many payload bytes.
pub const DEFAULT_NR_BYTES_TO_ADD_ONE_SEC: u64 = 20_000;

/// Lifecycle status of a stored message.
///
/// Only the delivery worker transitions `NonFinalIdle -> NonFinalSending`
/// and only the worker moves a message into a `Final*` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgStatus {
    /// Waiting for its next attempt.
    NonFinalIdle,
    /// An attempt is in flight.
    NonFinalSending,
    /// At least one recipient accepted the message and none remain pending.
    FinalDelivered,
    /// The retry schedule was exhausted with recipients still pending.
    FinalGaveUp,
    /// Every recipient was rejected permanently before any succeeded.
    FinalAborted,
}

impl MsgStatus {
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::FinalDelivered | Self::FinalGaveUp | Self::FinalAborted
        )
    }
}

/// TLS assurance ladder, both as a per-message requirement and as the level
/// achieved by an attempt. Variant order defines the ordering used by the
/// `achieved >= required` policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsAssurance {
    /// Cleartext is acceptable.
    NoTls,
    /// A TLS handshake must complete; the certificate is not evaluated.
    StartTls,
    /// Handshake completed but the certificate chain did not validate for
    /// any accepted identity.
    TlsAnonymous,
    /// The certificate matched the recipient domain or one of the
    /// additional match domains.
    TlsDomainMatchCert,
    /// The certificate matched the MX hostname itself.
    TlsExactMatchCert,
}

/// Per-recipient outcome state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MailboxState {
    Pending,
    Succeeded,
    TempFailed,
    PermFailed,
    GaveUp,
}

impl MailboxState {
    /// Terminal states never change and remove the mailbox from
    /// `pending_mailboxes`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::PermFailed | Self::GaveUp)
    }
}

/// Dialog stage in effect when a failure was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStage {
    Lookup,
    Connect,
    Greeting,
    Helo,
    StartTls,
    TlsHandshake,
    Auth,
    MailFrom,
    RcptTo,
    Data,
    Quit,
    Tls,
}

impl std::fmt::Display for SendStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Lookup => "lookup",
            Self::Connect => "connect",
            Self::Greeting => "greeting",
            Self::Helo => "helo",
            Self::StartTls => "starttls",
            Self::TlsHandshake => "tls-handshake",
            Self::Auth => "auth",
            Self::MailFrom => "mail-from",
            Self::RcptTo => "rcpt-to",
            Self::Data => "data",
            Self::Quit => "quit",
            Self::Tls => "tls",
        };
        f.write_str(name)
    }
}

/// Error kind recorded in a [`SendFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// DNS lookup failure.
    Resolver,
    /// Connect, read or write failure.
    Network,
    /// A phase or the total dialog budget elapsed.
    Timeout,
    /// Malformed SMTP reply.
    Protocol,
    /// Handshake, certificate or assurance failure.
    Tls,
    /// Relay authentication failed or no common mechanism.
    Auth,
    /// 4xx reply.
    ServerTemp,
    /// 5xx reply.
    ServerPerm,
    /// The stop controller fired mid-attempt.
    Cancelled,
    /// Invariant violation.
    Internal,
}

/// Enhanced status code (RFC 3463), e.g. `5.1.1`. All-zero means absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedStatus {
    pub class: u16,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatus {
    #[must_use]
    pub const fn new(class: u16, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    #[must_use]
    pub const fn is_absent(self) -> bool {
        self.class == 0 && self.subject == 0 && self.detail == 0
    }

    /// Parse `x.y.z` from the front of a reply line.
    #[must_use]
    pub fn parse_prefix(text: &str) -> Option<Self> {
        let mut parts = text.splitn(4, ['.', ' ']);
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail: u16 = parts.next()?.parse().ok()?;
        if matches!(class, 2 | 4 | 5) {
            Some(Self::new(class, subject, detail))
        } else {
            None
        }
    }
}

impl std::fmt::Display for EnhancedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Diagnostic payload captured when an attempt (or one recipient of it)
/// fails. Reply lines are preserved verbatim, CRLF stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendFailure {
    pub stage: SendStage,
    pub kind: FailureKind,
    /// Host in use when the failure occurred; empty before any connect.
    pub mx: String,
    /// 3-digit SMTP code, or 0 when no reply was involved.
    pub reply_code: u16,
    pub enh_status: EnhancedStatus,
    /// Single-line human description.
    pub desc: String,
    pub lines: Vec<String>,
}

/// Per-recipient record: terminal records are persisted on the message,
/// intermediate ones surface through the `on_result` callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxResult {
    pub time: DateTime<Utc>,
    pub mailbox: String,
    /// MX host that returned the 2xx, empty unless `state` is `Succeeded`.
    pub success_mx: String,
    pub state: MailboxState,
    pub failure: Option<SendFailure>,
}

/// Durable record of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgToSend {
    /// Assigned by the store at insert; zero until stored.
    pub entity_id: u64,
    pub status: MsgStatus,
    pub next_attempt_time: DateTime<Utc>,
    pub tls_requirement: TlsAssurance,
    pub from_address: String,
    /// Domain used for MX lookup and batching.
    pub to_domain: String,
    /// Domains that may also satisfy certificate identity checks.
    pub additional_match_domains: Vec<String>,
    /// Recipients still awaiting a terminal outcome.
    pub pending_mailboxes: Vec<String>,
    /// Terminal per-recipient records; grows only, never shrinks.
    pub mailbox_results: Vec<MailboxResult>,
    /// Fully encoded MIME bytes fed into DATA verbatim.
    pub content_part1: Vec<u8>,
    /// Opaque application blob echoed back in callbacks.
    pub delivery_context: Vec<u8>,
    pub custom_timeout: bool,
    pub base_send_seconds_max: u64,
    pub nr_bytes_to_add_one_sec: u64,
    pub custom_retry_schedule: bool,
    /// Non-negative minute delays; empty with `custom_retry_schedule` set
    /// means "give up after the first transient failure".
    pub future_retry_delay_minutes: Vec<u64>,
    /// Attempts since the last attempt that produced a new terminal
    /// per-recipient record. Drives the retry-schedule index.
    pub attempts_since_progress: u32,
}

impl MsgToSend {
    /// A new idle message, ready for `send_message`.
    #[must_use]
    pub fn new(
        from_address: impl Into<String>,
        to_domain: impl Into<String>,
        pending_mailboxes: Vec<String>,
        content_part1: Vec<u8>,
    ) -> Self {
        Self {
            entity_id: 0,
            status: MsgStatus::NonFinalIdle,
            next_attempt_time: Utc::now(),
            tls_requirement: TlsAssurance::NoTls,
            from_address: from_address.into(),
            to_domain: to_domain.into(),
            additional_match_domains: Vec::new(),
            pending_mailboxes,
            mailbox_results: Vec::new(),
            content_part1,
            delivery_context: Vec::new(),
            custom_timeout: false,
            base_send_seconds_max: DEFAULT_BASE_SEND_SECONDS_MAX,
            nr_bytes_to_add_one_sec: DEFAULT_NR_BYTES_TO_ADD_ONE_SEC,
            custom_retry_schedule: false,
            future_retry_delay_minutes: Vec::new(),
            attempts_since_progress: 0,
        }
    }

    /// The retry schedule in effect for this message.
    #[must_use]
    pub fn retry_schedule(&self) -> &[u64] {
        if self.custom_retry_schedule {
            &self.future_retry_delay_minutes
        } else {
            &DEFAULT_RETRY_DELAY_MINUTES
        }
    }

    /// Total dialog budget in seconds:
    /// `base + ceil(content_len / nr_bytes_to_add_one_sec)`.
    #[must_use]
    pub fn send_budget_secs(&self) -> u64 {
        let (base, per) = if self.custom_timeout {
            (self.base_send_seconds_max, self.nr_bytes_to_add_one_sec)
        } else {
            (DEFAULT_BASE_SEND_SECONDS_MAX, DEFAULT_NR_BYTES_TO_ADD_ONE_SEC)
        };
        let per = per.max(1);
        let len = self.content_part1.len() as u64;
        base + len.div_ceil(per)
    }

    /// Mailboxes already terminally recorded.
    #[must_use]
    pub fn terminal_mailboxes(&self) -> Vec<&str> {
        self.mailbox_results
            .iter()
            .filter(|r| r.state.is_terminal())
            .map(|r| r.mailbox.as_str())
            .collect()
    }

    /// True when `pending_mailboxes` and the terminally recorded mailboxes
    /// are disjoint and no mailbox is terminally recorded twice.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let terminal = self.terminal_mailboxes();
        let disjoint = !self
            .pending_mailboxes
            .iter()
            .any(|m| terminal.contains(&m.as_str()));
        let mut seen = std::collections::HashSet::new();
        let unique = terminal.iter().all(|m| seen.insert(*m));
        disjoint && unique && (!self.status.is_final() || self.pending_mailboxes.is_empty())
    }
}
