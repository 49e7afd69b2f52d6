//! Shared test support: the scripted SMTP server and a recording send log.

pub mod mock_server;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use originator_common::{MailboxResult, MsgStatus, MsgToSend, Severity, TlsAssurance};
use originator_delivery::SendLog;

/// One observed callback.
#[derive(Debug, Clone)]
#[allow(dead_code)] // not every test inspects every variant
pub enum LogEvent {
    Event { severity: Severity, text: String },
    Reset(Vec<u64>),
    Attempt(u64),
    Result {
        entity_id: u64,
        status: MsgStatus,
        results: Vec<MailboxResult>,
        tls: TlsAssurance,
    },
}

/// Send log that records every callback for later assertions.
#[derive(Debug, Default)]
pub struct RecordingLog {
    events: Mutex<Vec<LogEvent>>,
}

impl RecordingLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.events.lock().expect("RecordingLog mutex poisoned").clone()
    }

    pub fn attempts(&self) -> Vec<u64> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                LogEvent::Attempt(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn results(&self) -> Vec<(u64, MsgStatus, Vec<MailboxResult>, TlsAssurance)> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                LogEvent::Result {
                    entity_id,
                    status,
                    results,
                    tls,
                } => Some((entity_id, status, results, tls)),
                _ => None,
            })
            .collect()
    }

    pub fn resets(&self) -> Vec<Vec<u64>> {
        self.snapshot()
            .into_iter()
            .filter_map(|e| match e {
                LogEvent::Reset(ids) => Some(ids),
                _ => None,
            })
            .collect()
    }

    /// Poll until `pred` holds over the recorded events, or fail the test.
    pub async fn wait_until(&self, pred: impl Fn(&[LogEvent]) -> bool, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if pred(&self.snapshot()) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for log condition; events: {:?}",
                self.snapshot()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl SendLog for RecordingLog {
    fn log_event(&self, severity: Severity, text: &str) {
        self.events
            .lock()
            .expect("RecordingLog mutex poisoned")
            .push(LogEvent::Event {
                severity,
                text: text.to_string(),
            });
    }

    fn on_reset(&self, messages: &[MsgToSend]) {
        self.events
            .lock()
            .expect("RecordingLog mutex poisoned")
            .push(LogEvent::Reset(messages.iter().map(|m| m.entity_id).collect()));
    }

    fn on_attempt(&self, message: &MsgToSend) {
        self.events
            .lock()
            .expect("RecordingLog mutex poisoned")
            .push(LogEvent::Attempt(message.entity_id));
    }

    fn on_result(
        &self,
        message: &MsgToSend,
        mailbox_results: &[MailboxResult],
        tls_assurance_achieved: TlsAssurance,
    ) {
        self.events
            .lock()
            .expect("RecordingLog mutex poisoned")
            .push(LogEvent::Result {
                entity_id: message.entity_id,
                status: message.status,
                results: mailbox_results.to_vec(),
                tls: tls_assurance_achieved,
            });
    }
}
