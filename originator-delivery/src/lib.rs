//! Delivery queue worker: scans the store for due messages, drives one SMTP
//! attempt per message, applies the outcome inside a result transaction and
//! reports progress through the host's send log.

pub mod config;
pub mod dns;
pub mod log;
pub mod retry;
pub mod worker;

pub use config::{IpVerPreference, RelayAuthType, SmtpSettings};
pub use dns::{DnsError, HickoryMxResolver, MailExchanger, MxResolver, StaticMxResolver};
pub use log::{NullSendLog, SendLog};
pub use worker::{DeliveryWorker, WorkerOptions};
