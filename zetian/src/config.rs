//! Top-level server configuration, loaded from a RON file.

use std::{collections::HashMap, net::IpAddr, path::PathBuf};

use serde::Deserialize;
use zetian_cluster::ClusterOptions;
use zetian_delivery::{RelayOptions, RetryPolicy};
use zetian_filter::{BayesConfig, GreylistConfig, SpfScores, Thresholds};
use zetian_smtp::SmtpServerTimeouts;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerOptions {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// Hostname used in the banner and EHLO response.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Zero means unlimited.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    /// Total concurrent inbound connections (0 = unlimited).
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub max_connections_per_ip: usize,
    #[serde(default)]
    pub timeouts: SmtpServerTimeouts,
    #[serde(default)]
    pub require_authentication: bool,
    #[serde(default)]
    pub require_secure_connection: bool,
    #[serde(default = "default_true")]
    pub allow_plaintext_authentication: bool,
    /// Advertised SASL mechanisms.
    #[serde(default = "default_mechanisms")]
    pub authentication_mechanisms: Vec<String>,
    /// Free text after the hostname in the 220 greeting.
    #[serde(default = "default_greeting")]
    pub greeting: String,
    /// Overrides the whole greeting text when set.
    #[serde(default)]
    pub banner: Option<String>,
    /// PEM certificate and key enabling STARTTLS.
    #[serde(default)]
    pub certificate: Option<PathBuf>,
    #[serde(default)]
    pub certificate_key: Option<PathBuf>,
    /// Minimum TLS protocol version label, recorded for operators.
    #[serde(default)]
    pub ssl_min_protocol: Option<String>,
    /// Credential map for SASL (identity -> secret).
    #[serde(default)]
    pub users: HashMap<String, String>,
}

const fn default_port() -> u16 {
    25
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_server_name() -> String {
    "localhost".to_string()
}

const fn default_max_message_size() -> usize {
    25 * 1024 * 1024
}

const fn default_max_recipients() -> usize {
    100
}

const fn default_true() -> bool {
    true
}

fn default_mechanisms() -> Vec<String> {
    vec!["PLAIN".to_string(), "LOGIN".to_string()]
}

fn default_greeting() -> String {
    "ESMTP Zetian ready".to_string()
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            server_name: default_server_name(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: 0,
            max_connections_per_ip: 0,
            timeouts: SmtpServerTimeouts::default(),
            require_authentication: false,
            require_secure_connection: false,
            allow_plaintext_authentication: true,
            authentication_mechanisms: default_mechanisms(),
            greeting: default_greeting(),
            banner: None,
            certificate: None,
            certificate_key: None,
            ssl_min_protocol: None,
            users: HashMap::new(),
        }
    }
}

/// Anti-abuse pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterOptions {
    #[serde(default = "default_true")]
    pub enable_spf: bool,
    #[serde(default = "default_true")]
    pub enable_dkim: bool,
    #[serde(default = "default_true")]
    pub enable_dmarc: bool,
    #[serde(default = "default_true")]
    pub enable_bayes: bool,
    #[serde(default)]
    pub enable_greylist: bool,
    #[serde(default = "default_weight")]
    pub spf_weight: f64,
    #[serde(default = "default_weight")]
    pub dkim_weight: f64,
    #[serde(default = "default_weight")]
    pub dmarc_weight: f64,
    #[serde(default = "default_weight")]
    pub bayes_weight: f64,
    #[serde(default)]
    pub dkim_strict: bool,
    /// `false` degrades DMARC policies to report-only.
    #[serde(default = "default_true")]
    pub dmarc_enforce: bool,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub spf_scores: SpfScores,
    #[serde(default)]
    pub greylist: GreylistConfig,
    #[serde(default)]
    pub bayes: BayesConfig,
    /// Name servers for TXT lookups; empty = system resolver.
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
}

const fn default_weight() -> f64 {
    1.0
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            enable_spf: true,
            enable_dkim: true,
            enable_dmarc: true,
            enable_bayes: true,
            enable_greylist: false,
            spf_weight: 1.0,
            dkim_weight: 1.0,
            dmarc_weight: 1.0,
            bayes_weight: 1.0,
            dkim_strict: false,
            dmarc_enforce: true,
            thresholds: Thresholds::default(),
            spf_scores: SpfScores::default(),
            greylist: GreylistConfig::default(),
            bayes: BayesConfig::default(),
            dns_servers: Vec::new(),
        }
    }
}

/// Where durable state lives.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageOptions {
    /// Directory for stored message bodies; `None` keeps them in
    /// memory.
    #[serde(default)]
    pub message_store_path: Option<PathBuf>,
    /// Directory for the relay queue; `None` keeps it in memory.
    #[serde(default)]
    pub queue_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZetianConfig {
    #[serde(default)]
    pub server: ServerOptions,
    #[serde(default)]
    pub relay: RelayOptions,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub filter: FilterOptions,
    #[serde(default)]
    pub storage: StorageOptions,
    /// Clustering is opt-in.
    #[serde(default)]
    pub cluster: Option<ClusterOptions>,
    /// Seconds allowed for in-flight work at shutdown.
    #[serde(default = "default_drain_window_secs")]
    pub drain_window_secs: u64,
}

const fn default_drain_window_secs() -> u64 {
    30
}

impl Default for ZetianConfig {
    fn default() -> Self {
        Self {
            server: ServerOptions::default(),
            relay: RelayOptions::default(),
            retry: RetryPolicy::default(),
            filter: FilterOptions::default(),
            storage: StorageOptions::default(),
            cluster: None,
            drain_window_secs: default_drain_window_secs(),
        }
    }
}

impl ZetianConfig {
    /// Load from a RON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }
}
