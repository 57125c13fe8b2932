//! Relay configuration surface.

use std::net::IpAddr;

use serde::Deserialize;
use zetian_common::Domain;

/// A pre-configured relay next hop.
#[derive(Debug, Clone, Deserialize)]
pub struct SmartHost {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Lower number = higher priority group.
    #[serde(default)]
    pub priority: u32,
    /// Selection weight within a priority group.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Implicit TLS from the first byte (the port 465 convention).
    #[serde(default)]
    pub use_tls: bool,
    /// Upgrade via STARTTLS after EHLO.
    #[serde(default)]
    pub use_starttls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

const fn default_smtp_port() -> u16 {
    25
}

const fn default_weight() -> u32 {
    1
}

const fn default_enabled() -> bool {
    true
}

impl SmartHost {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A CIDR network clients may relay from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl Network {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = s.split_once('/')?;
        let addr: IpAddr = addr.trim().parse().ok()?;
        let prefix: u8 = prefix.trim().parse().ok()?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - u32::from(self.prefix).min(32));
                (u32::from(ip) & mask) == (u32::from(net) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                if self.prefix == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - u32::from(self.prefix).min(128));
                (u128::from(ip) & mask) == (u128::from(net) & mask)
            }
            _ => false,
        }
    }
}

impl<'de> Deserialize<'de> for Network {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid CIDR network: {s}")))
    }
}

/// Everything the dispatcher needs to route and deliver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayOptions {
    /// Domains delivered locally through the message store.
    #[serde(default)]
    pub local_domains: Vec<Domain>,
    /// Domains always accepted for relay.
    #[serde(default)]
    pub relay_domains: Vec<Domain>,
    /// Client networks allowed to relay anywhere.
    #[serde(default)]
    pub relay_networks: Vec<Network>,
    /// Fixed next hop per recipient domain, tried before smart hosts.
    #[serde(default)]
    pub domain_routing: std::collections::HashMap<Domain, String>,
    #[serde(default)]
    pub smart_hosts: Vec<SmartHost>,
    /// Resolve MX records when no smart host matches.
    #[serde(default)]
    pub use_mx_routing: bool,
    /// Fallback next hop when all else fails.
    #[serde(default)]
    pub default_smart_host: Option<String>,
    /// Name servers for MX resolution; empty = system resolver.
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_deliveries: usize,
    #[serde(default = "default_queue_interval_secs")]
    pub queue_processing_interval_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Offer STARTTLS on outbound hops that advertise it.
    #[serde(default = "default_enable_tls")]
    pub enable_tls: bool,
    /// Fail delivery when TLS cannot be negotiated.
    #[serde(default)]
    pub require_tls: bool,
    #[serde(default = "default_enable_bounces")]
    pub enable_bounce_messages: bool,
    /// Mailbox named as the bounce originator in the DSN body.
    #[serde(default = "default_bounce_sender")]
    pub bounce_sender: String,
    /// Attach machine-readable delivery-status parts to bounces.
    #[serde(default = "default_enable_dsn")]
    pub enable_dsn: bool,
    /// Per-host outbound connection cap.
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
    /// Messages per pooled connection before it is retired.
    #[serde(default = "default_max_messages_per_connection")]
    pub max_messages_per_connection: usize,
    /// EHLO identity for outbound sessions.
    #[serde(default = "default_helo_name")]
    pub helo_name: String,
    /// Accept invalid TLS certificates on outbound hops (testing).
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

const fn default_max_concurrent() -> usize {
    10
}

const fn default_queue_interval_secs() -> u64 {
    10
}

const fn default_cleanup_interval_secs() -> u64 {
    300
}

const fn default_connect_timeout_secs() -> u64 {
    30
}

const fn default_enable_tls() -> bool {
    true
}

const fn default_enable_bounces() -> bool {
    true
}

fn default_bounce_sender() -> String {
    "postmaster@localhost".to_string()
}

const fn default_enable_dsn() -> bool {
    true
}

const fn default_max_connections_per_host() -> usize {
    8
}

const fn default_max_messages_per_connection() -> usize {
    50
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

impl RelayOptions {
    #[must_use]
    pub fn is_local_domain(&self, domain: &Domain) -> bool {
        self.local_domains.contains(domain)
    }

    #[must_use]
    pub fn is_relay_domain(&self, domain: &Domain) -> bool {
        self.relay_domains.contains(domain)
    }

    #[must_use]
    pub fn ip_may_relay(&self, ip: IpAddr) -> bool {
        self.relay_networks.iter().any(|net| net.contains(ip))
    }
}
