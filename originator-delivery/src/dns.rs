//! MX resolution for delivery.
//!
//! `resolve_domain` yields the exchanger list sorted by preference with a
//! shuffle inside each equal-preference group, so equally preferred hosts
//! share the load while the preference order itself stays stable.

use std::{collections::HashMap, net::IpAddr};

use async_trait::async_trait;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::op::ResponseCode,
    TokioAsyncResolver,
};
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::debug;

use crate::config::IpVerPreference;

/// DNS failure taxonomy the scheduler cares about.
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    /// The domain exists but advertises no mail exchangers.
    #[error("no MX records for domain: {0}")]
    NoMxRecords(String),

    /// The domain does not exist.
    #[error("domain does not exist: {0}")]
    NxDomain(String),

    /// The resolver itself failed; worth retrying.
    #[error("resolver unavailable: {0}")]
    ResolverUnavailable(String),
}

impl DnsError {
    /// Only resolver outages are transient; missing records are a property
    /// of the domain.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::ResolverUnavailable(_))
    }
}

/// One MX record: hostname plus preference (lower wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailExchanger {
    pub host: String,
    pub preference: u16,
    /// Submission port; 25 everywhere except test overrides.
    pub port: u16,
}

/// Standard SMTP relay port.
pub const SMTP_PORT: u16 = 25;

/// Sort by ascending preference, shuffling within equal-preference groups.
pub fn order_exchangers(exchangers: &mut [MailExchanger], rng: &mut impl rand::Rng) {
    exchangers.sort_by_key(|mx| mx.preference);
    let mut start = 0;
    while start < exchangers.len() {
        let preference = exchangers[start].preference;
        let end = exchangers[start..]
            .iter()
            .position(|mx| mx.preference != preference)
            .map_or(exchangers.len(), |p| start + p);
        exchangers[start..end].shuffle(rng);
        start = end;
    }
}

/// Name resolution as the delivery worker consumes it.
#[async_trait]
pub trait MxResolver: Send + Sync + std::fmt::Debug {
    /// Ordered exchanger list for a recipient domain.
    async fn resolve_domain(&self, domain: &str) -> Result<Vec<MailExchanger>, DnsError>;

    /// Addresses for one exchanger host, ordered per the IP preference.
    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Production resolver on hickory.
#[derive(Debug)]
pub struct HickoryMxResolver {
    resolver: TokioAsyncResolver,
}

const fn ip_strategy(preference: IpVerPreference) -> LookupIpStrategy {
    match preference {
        IpVerPreference::V4Only => LookupIpStrategy::Ipv4Only,
        IpVerPreference::V6Only => LookupIpStrategy::Ipv6Only,
        IpVerPreference::PreferV4 => LookupIpStrategy::Ipv4thenIpv6,
        IpVerPreference::PreferV6 => LookupIpStrategy::Ipv6thenIpv4,
    }
}

impl HickoryMxResolver {
    /// System-default resolver configuration with the given IP preference.
    #[must_use]
    pub fn new(preference: IpVerPreference) -> Self {
        let mut opts = ResolverOpts::default();
        opts.ip_strategy = ip_strategy(preference);
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
        }
    }
}

fn classify(domain: &str, err: &hickory_resolver::error::ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            if *response_code == ResponseCode::NXDomain {
                DnsError::NxDomain(domain.to_string())
            } else {
                DnsError::NoMxRecords(domain.to_string())
            }
        }
        _ => DnsError::ResolverUnavailable(err.to_string()),
    }
}

#[async_trait]
impl MxResolver for HickoryMxResolver {
    async fn resolve_domain(&self, domain: &str) -> Result<Vec<MailExchanger>, DnsError> {
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| classify(domain, &e))?;

        let mut exchangers: Vec<MailExchanger> = lookup
            .iter()
            .map(|mx| MailExchanger {
                host: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                preference: mx.preference(),
                port: SMTP_PORT,
            })
            .collect();

        if exchangers.is_empty() {
            return Err(DnsError::NoMxRecords(domain.to_string()));
        }

        order_exchangers(&mut exchangers, &mut rand::thread_rng());
        debug!(domain, count = exchangers.len(), "resolved MX records");
        Ok(exchangers)
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| classify(host, &e))?;
        let addrs: Vec<IpAddr> = lookup.iter().collect();
        if addrs.is_empty() {
            return Err(DnsError::NxDomain(host.to_string()));
        }
        Ok(addrs)
    }
}

/// Fixed-map resolver for tests and closed environments.
#[derive(Debug, Default)]
pub struct StaticMxResolver {
    domains: HashMap<String, Vec<MailExchanger>>,
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticMxResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mx(self, domain: &str, host: &str, preference: u16) -> Self {
        self.with_mx_on(domain, host, preference, SMTP_PORT)
    }

    /// MX entry on a non-standard port, for loopback test servers.
    #[must_use]
    pub fn with_mx_on(mut self, domain: &str, host: &str, preference: u16, port: u16) -> Self {
        self.domains
            .entry(domain.to_string())
            .or_default()
            .push(MailExchanger {
                host: host.to_string(),
                preference,
                port,
            });
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: &str, addrs: Vec<IpAddr>) -> Self {
        self.hosts.insert(host.to_string(), addrs);
        self
    }
}

#[async_trait]
impl MxResolver for StaticMxResolver {
    async fn resolve_domain(&self, domain: &str) -> Result<Vec<MailExchanger>, DnsError> {
        let mut exchangers = self
            .domains
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsError::NxDomain(domain.to_string()))?;
        if exchangers.is_empty() {
            return Err(DnsError::NoMxRecords(domain.to_string()));
        }
        order_exchangers(&mut exchangers, &mut rand::thread_rng());
        Ok(exchangers)
    }

    async fn resolve_host(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.hosts
            .get(host)
            .cloned()
            .ok_or_else(|| DnsError::NxDomain(host.to_string()))
    }
}
