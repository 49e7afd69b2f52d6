//! Outbound email originator.
//!
//! A host application composes messages (fully encoded MIME bytes), hands
//! them to [`Originator::send_message`], and observes delivery through the
//! [`SendLog`] callbacks while the service persists each message, speaks
//! SMTP to the recipient domain's exchangers (or a configured relay) under
//! the requested TLS assurance, and retries until every recipient reaches a
//! terminal state.
//!
//! ```no_run
//! use std::sync::Arc;
//! use originator::{
//!     MsgToSend, NullSendLog, Originator, ServiceSettings, SmtpSettings,
//! };
//!
//! # async fn example() -> Result<(), originator::OriginatorError> {
//! let service = Originator::new();
//! service.set_service_settings(ServiceSettings::new(
//!     Some("/var/spool/originator".into()),
//!     Arc::new(NullSendLog),
//! ))?;
//! service.set_smtp_settings(SmtpSettings::direct("mail.origin.test"));
//! service.start().await?;
//!
//! let msg = MsgToSend::new(
//!     "sender@origin.test",
//!     "example.test",
//!     vec!["someone@example.test".to_string()],
//!     b"Subject: hello\r\n\r\nhello\r\n".to_vec(),
//! );
//! let id = service.send_message(msg).await?;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

mod error;
mod service;

pub use error::{OriginatorError, Result};
pub use service::{Originator, RemoveOutcome, ServiceSettings, ServiceState};

// The data model and collaborator surfaces hosts interact with.
pub use originator_common::{
    EnhancedStatus, FailureKind, MailboxResult, MailboxState, MsgStatus, MsgToSend, SendFailure,
    SendStage, Severity, TlsAssurance, DEFAULT_RETRY_DELAY_MINUTES,
};
pub use originator_delivery::{
    IpVerPreference, MxResolver, NullSendLog, RelayAuthType, SendLog, SmtpSettings,
    StaticMxResolver, WorkerOptions,
};
