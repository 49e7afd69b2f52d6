//! Attempt-level error type, convertible into the stored diagnostic record.

use originator_common::{EnhancedStatus, FailureKind, SendFailure, SendStage};

use crate::reply::Reply;

/// A failure observed while driving the dialog.
///
/// `permanent` decides whether affected mailboxes are finalised or retried;
/// everything else is diagnostic payload.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{stage}: {desc}")]
pub struct SendError {
    pub stage: SendStage,
    pub kind: FailureKind,
    pub permanent: bool,
    /// Host in use when the failure occurred; empty before any connect.
    pub mx: String,
    pub reply: Option<Reply>,
    pub desc: String,
}

impl SendError {
    /// Network-level failure (connect, read, write): always temporary.
    pub fn network(stage: SendStage, mx: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Network,
            permanent: false,
            mx: mx.into(),
            reply: None,
            desc: desc.into(),
        }
    }

    /// A phase or total-dialog budget elapsed.
    pub fn timeout(stage: SendStage, mx: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Timeout,
            permanent: false,
            mx: mx.into(),
            reply: None,
            desc: "timed out".to_string(),
        }
    }

    /// Malformed reply; treated as transient so a flaky peer gets retried.
    pub fn protocol(stage: SendStage, mx: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Protocol,
            permanent: false,
            mx: mx.into(),
            reply: None,
            desc: desc.into(),
        }
    }

    /// TLS failure; permanence depends on the caller's policy (required
    /// STARTTLS not offered is permanent, a failed handshake is not).
    pub fn tls(
        stage: SendStage,
        mx: impl Into<String>,
        desc: impl Into<String>,
        permanent: bool,
    ) -> Self {
        Self {
            stage,
            kind: FailureKind::Tls,
            permanent,
            mx: mx.into(),
            reply: None,
            desc: desc.into(),
        }
    }

    pub fn auth(mx: impl Into<String>, desc: impl Into<String>, permanent: bool) -> Self {
        Self {
            stage: SendStage::Auth,
            kind: FailureKind::Auth,
            permanent,
            mx: mx.into(),
            reply: None,
            desc: desc.into(),
        }
    }

    pub fn cancelled(stage: SendStage, mx: impl Into<String>) -> Self {
        Self {
            stage,
            kind: FailureKind::Cancelled,
            permanent: false,
            mx: mx.into(),
            reply: None,
            desc: "stop requested".to_string(),
        }
    }

    /// Classify an unexpected server reply: 4xx transient, 5xx permanent,
    /// anything else a protocol error.
    pub fn from_reply(stage: SendStage, mx: impl Into<String>, reply: Reply) -> Self {
        let (kind, permanent) = if reply.is_transient_failure() {
            (FailureKind::ServerTemp, false)
        } else if reply.is_permanent_failure() {
            (FailureKind::ServerPerm, true)
        } else {
            (FailureKind::Protocol, false)
        };
        Self {
            stage,
            kind,
            permanent,
            mx: mx.into(),
            desc: format!("server replied {reply}"),
            reply: Some(reply),
        }
    }

    /// Flatten into the stored diagnostic record.
    #[must_use]
    pub fn to_failure(&self) -> SendFailure {
        SendFailure {
            stage: self.stage,
            kind: self.kind,
            mx: self.mx.clone(),
            reply_code: self.reply.as_ref().map_or(0, |r| r.code),
            enh_status: self
                .reply
                .as_ref()
                .map_or_else(EnhancedStatus::default, Reply::enhanced_status),
            desc: self.desc.clone(),
            lines: self
                .reply
                .as_ref()
                .map_or_else(Vec::new, |r| r.lines.clone()),
        }
    }
}
