//! Host-facing observability callbacks.
//!
//! All callbacks run on the worker task, never re-entrantly for the same
//! message, and `on_attempt` always precedes `on_result` for an attempt.

use originator_common::{MailboxResult, MsgToSend, Severity, TlsAssurance};

/// The send log the worker reports into.
pub trait SendLog: Send + Sync {
    /// Free-form diagnostic event.
    fn log_event(&self, _severity: Severity, _text: &str) {}

    /// Startup recovery: messages found mid-send after a crash, already
    /// requeued as idle.
    fn on_reset(&self, _messages: &[MsgToSend]) {}

    /// Fires after a message is claimed, before its dialog starts.
    fn on_attempt(&self, _message: &MsgToSend) {}

    /// Fires after the attempt's result transaction committed.
    /// `mailbox_results` is the per-attempt outcome vector, including
    /// non-terminal entries that are not persisted on the message.
    fn on_result(
        &self,
        _message: &MsgToSend,
        _mailbox_results: &[MailboxResult],
        _tls_assurance_achieved: TlsAssurance,
    ) {
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSendLog;

impl SendLog for NullSendLog {}
