//! Client-side SMTP dialog kernel.
//!
//! One [`attempt::run_attempt`] call performs one delivery attempt for a
//! `(message, domain)` pair: connect across the resolved MX targets, speak
//! the banner/EHLO/STARTTLS/AUTH/MAIL/RCPT/DATA/QUIT dialog, track the TLS
//! assurance achieved, and account per-recipient outcomes with verbatim
//! reply transcripts.

pub mod attempt;
pub mod auth;
pub mod client;
pub mod error;
pub mod extensions;
pub mod reply;
pub mod tls;

pub use attempt::{AttemptReport, AttemptSpec, MailboxDisposition, MxTarget, RelayAuth};
pub use auth::AuthMechanism;
pub use error::SendError;
pub use extensions::EhloKeywords;
pub use reply::Reply;
