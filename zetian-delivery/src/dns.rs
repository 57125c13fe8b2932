//! MX resolution for mail delivery.
//!
//! Implements MX lookups with A/AAAA fallback per RFC 5321 section 5.1,
//! with an LRU cache and TTL tracking.

use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    TokioAsyncResolver,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(String),

    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),
}

impl DnsError {
    /// Whether a retry might succeed.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::LookupFailed(_))
    }
}

/// A resolved next hop with its MX preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX preference (lower = higher priority). 0 for A/AAAA fallback.
    pub preference: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub const fn new(host: String, preference: u16, port: u16) -> Self {
        Self {
            host,
            preference,
            port,
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

const DEFAULT_CACHE_SIZE: NonZeroUsize = NonZeroUsize::new(1000).unwrap();

/// MX resolver with an LRU + TTL cache.
#[derive(Debug)]
pub struct MxResolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<lru::LruCache<String, CachedResult>>,
    cache_ttl: Duration,
}

impl MxResolver {
    /// Resolver over the system DNS configuration, or pinned servers
    /// when `servers` is non-empty.
    #[must_use]
    pub fn new(servers: &[IpAddr]) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);

        let config = if servers.is_empty() {
            ResolverConfig::default()
        } else {
            let mut config = ResolverConfig::new();
            for server in servers {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(*server, 53),
                    Protocol::Udp,
                ));
            }
            config
        };

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            cache: Mutex::new(lru::LruCache::new(DEFAULT_CACHE_SIZE)),
            cache_ttl: Duration::from_secs(300),
        }
    }

    /// Resolve the mail servers for `domain`, sorted by preference.
    ///
    /// Falls back to A/AAAA as an implicit preference-0 MX when the
    /// domain publishes no MX records.
    pub async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(domain) {
                if cached.expires_at > Instant::now() {
                    debug!("MX cache hit for {domain}");
                    return Ok(Arc::clone(&cached.servers));
                }
            }
        }

        let servers = Arc::new(self.resolve_uncached(domain).await?);

        let mut cache = self.cache.lock().await;
        cache.put(
            domain.to_string(),
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );

        Ok(servers)
    }

    async fn resolve_uncached(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let mut servers: Vec<MailServer> = lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8().trim_end_matches('.').to_string();
                        MailServer::new(host, mx.preference(), 25)
                    })
                    .collect();

                if servers.is_empty() {
                    return self.fallback_to_a_aaaa(domain).await;
                }

                servers.sort_by_key(|s| s.preference);
                debug!("Resolved {} MX record(s) for {domain}", servers.len());
                Ok(servers)
            }
            Err(err) => {
                if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    debug!("No MX records for {domain}, falling back to A/AAAA");
                    self.fallback_to_a_aaaa(domain).await
                } else {
                    warn!("MX lookup failed for {domain}: {err}");
                    Err(DnsError::LookupFailed(err.to_string()))
                }
            }
        }
    }

    async fn fallback_to_a_aaaa(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                let servers: Vec<MailServer> = lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, 25))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok(servers)
                }
            }
            Err(err) => {
                if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                    Err(DnsError::DomainNotFound(domain.to_string()))
                } else {
                    Err(DnsError::LookupFailed(err.to_string()))
                }
            }
        }
    }
}
