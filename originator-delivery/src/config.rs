//! SMTP-side configuration: sender identity, IP version preference and the
//! optional relay block. Installed as an immutable snapshot; the worker
//! reads one snapshot per attempt.

use originator_common::TlsAssurance;
use serde::Deserialize;

/// Which address families to resolve, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum IpVerPreference {
    V4Only,
    V6Only,
    PreferV4,
    PreferV6,
}

impl Default for IpVerPreference {
    fn default() -> Self {
        Self::PreferV4
    }
}

/// Relay authentication selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RelayAuthType {
    None,
    Plain,
    Login,
    CramMd5,
}

impl Default for RelayAuthType {
    fn default() -> Self {
        Self::None
    }
}

/// SMTP settings installed through the service API.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    /// Name presented in EHLO.
    pub sender_computer_name: String,

    #[serde(default)]
    pub ip_ver_preference: IpVerPreference,

    /// Deliver everything through the configured relay instead of per-domain
    /// MX lookup.
    #[serde(default)]
    pub use_relay: bool,

    #[serde(default)]
    pub relay_host: String,

    #[serde(default = "default_relay_port")]
    pub relay_port: u16,

    /// Wrap the relay connection in TLS before the banner.
    #[serde(default)]
    pub relay_implicit_tls: bool,

    /// Assurance floor for relay deliveries; the stricter of this and the
    /// message's own requirement wins.
    #[serde(default = "default_relay_tls_requirement")]
    pub relay_tls_requirement: TlsAssurance,

    #[serde(default)]
    pub relay_auth_type: RelayAuthType,

    #[serde(default)]
    pub relay_username: String,

    #[serde(default)]
    pub relay_password: String,
}

const fn default_relay_port() -> u16 {
    25
}

const fn default_relay_tls_requirement() -> TlsAssurance {
    TlsAssurance::NoTls
}

impl SmtpSettings {
    /// Settings for direct MX delivery under `sender_computer_name`.
    #[must_use]
    pub fn direct(sender_computer_name: impl Into<String>) -> Self {
        Self {
            sender_computer_name: sender_computer_name.into(),
            ip_ver_preference: IpVerPreference::default(),
            use_relay: false,
            relay_host: String::new(),
            relay_port: default_relay_port(),
            relay_implicit_tls: false,
            relay_tls_requirement: default_relay_tls_requirement(),
            relay_auth_type: RelayAuthType::None,
            relay_username: String::new(),
            relay_password: String::new(),
        }
    }
}
