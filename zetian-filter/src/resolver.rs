//! DNS lookups for the authentication scorers.
//!
//! The evaluators take a `RecordSource` so tests can run against pinned
//! records; the production implementation wraps hickory with optional
//! custom name servers.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    TokioAsyncResolver,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Authoritative "no such record" answer.
    #[error("No records found for {0}")]
    NotFound(String),

    /// Transient resolver or network failure; callers map this to
    /// `TempError` results.
    #[error("DNS lookup failed: {0}")]
    Temporary(String),
}

pub type LookupResult<T> = std::result::Result<T, LookupError>;

/// The record types the scorers consume.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// TXT records, each joined from its character-strings.
    async fn txt(&self, name: &str) -> LookupResult<Vec<String>>;

    /// A and AAAA records.
    async fn ip_addrs(&self, name: &str) -> LookupResult<Vec<IpAddr>>;

    /// MX exchange names, sorted by preference.
    async fn mx(&self, name: &str) -> LookupResult<Vec<String>>;
}

/// Production resolver backed by hickory.
#[derive(Debug)]
pub struct DnsClient {
    resolver: TokioAsyncResolver,
}

impl DnsClient {
    /// Resolver using the system configuration.
    #[must_use]
    pub fn system() -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), opts),
        }
    }

    /// Resolver pinned to specific name servers.
    #[must_use]
    pub fn with_servers(servers: &[IpAddr]) -> Self {
        if servers.is_empty() {
            return Self::system();
        }

        let mut config = ResolverConfig::new();
        for server in servers {
            config.add_name_server(NameServerConfig::new(
                SocketAddr::new(*server, 53),
                Protocol::Udp,
            ));
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    fn classify(name: &str, err: &hickory_resolver::error::ResolveError) -> LookupError {
        if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
            LookupError::NotFound(name.to_string())
        } else {
            LookupError::Temporary(err.to_string())
        }
    }
}

#[async_trait]
impl RecordSource for DnsClient {
    async fn txt(&self, name: &str) -> LookupResult<Vec<String>> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|txt| {
                    txt.iter()
                        .map(|part| String::from_utf8_lossy(part).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Err(err) => Err(Self::classify(name, &err)),
        }
    }

    async fn ip_addrs(&self, name: &str) -> LookupResult<Vec<IpAddr>> {
        match self.resolver.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) => Err(Self::classify(name, &err)),
        }
    }

    async fn mx(&self, name: &str) -> LookupResult<Vec<String>> {
        match self.resolver.mx_lookup(name).await {
            Ok(lookup) => {
                let mut records: Vec<(u16, String)> = lookup
                    .iter()
                    .map(|mx| (mx.preference(), mx.exchange().to_utf8()))
                    .collect();
                records.sort_by_key(|(preference, _)| *preference);
                Ok(records
                    .into_iter()
                    .map(|(_, exchange)| exchange.trim_end_matches('.').to_string())
                    .collect())
            }
            Err(err) => Err(Self::classify(name, &err)),
        }
    }
}

/// Fixed record set for tests.
#[derive(Debug, Default)]
pub struct StaticRecords {
    txt: HashMap<String, Vec<String>>,
    ips: HashMap<String, Vec<IpAddr>>,
    mx: HashMap<String, Vec<String>>,
    /// Names that answer with a temporary failure.
    flaky: Vec<String>,
}

impl StaticRecords {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_txt(mut self, name: &str, records: &[&str]) -> Self {
        self.txt.insert(
            name.to_ascii_lowercase(),
            records.iter().map(ToString::to_string).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_ips(mut self, name: &str, addrs: &[&str]) -> Self {
        self.ips.insert(
            name.to_ascii_lowercase(),
            addrs.iter().map(|a| a.parse().expect("test IP")).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_mx(mut self, name: &str, exchanges: &[&str]) -> Self {
        self.mx.insert(
            name.to_ascii_lowercase(),
            exchanges.iter().map(ToString::to_string).collect(),
        );
        self
    }

    #[must_use]
    pub fn with_temp_failure(mut self, name: &str) -> Self {
        self.flaky.push(name.to_ascii_lowercase());
        self
    }

    fn check_flaky(&self, name: &str) -> LookupResult<()> {
        if self.flaky.iter().any(|f| f == name) {
            Err(LookupError::Temporary(format!("simulated failure: {name}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordSource for StaticRecords {
    async fn txt(&self, name: &str) -> LookupResult<Vec<String>> {
        let name = name.to_ascii_lowercase();
        self.check_flaky(&name)?;
        self.txt
            .get(&name)
            .cloned()
            .ok_or(LookupError::NotFound(name))
    }

    async fn ip_addrs(&self, name: &str) -> LookupResult<Vec<IpAddr>> {
        let name = name.to_ascii_lowercase();
        self.check_flaky(&name)?;
        self.ips
            .get(&name)
            .cloned()
            .ok_or(LookupError::NotFound(name))
    }

    async fn mx(&self, name: &str) -> LookupResult<Vec<String>> {
        let name = name.to_ascii_lowercase();
        self.check_flaky(&name)?;
        self.mx
            .get(&name)
            .cloned()
            .ok_or(LookupError::NotFound(name))
    }
}
