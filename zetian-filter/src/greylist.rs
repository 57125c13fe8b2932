//! Greylisting keyed by the (client network, sender, first recipient)
//! triplet.
//!
//! First contact is embargoed with a 451; a retry after the initial
//! delay but before the retry window closes is accepted and the triplet
//! whitelisted. State is process-wide with the pipeline's lifetime.

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GreylistConfig {
    /// Minimum wait before a retry is accepted.
    #[serde(default = "default_initial_delay", with = "duration_secs")]
    pub initial_delay: Duration,
    /// Retries after this long restart the embargo from scratch.
    #[serde(default = "default_max_retry_time", with = "duration_secs")]
    pub max_retry_time: Duration,
    /// How long an accepted triplet stays whitelisted.
    #[serde(default = "default_whitelist_duration", with = "duration_secs")]
    pub whitelist_duration: Duration,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

const fn default_initial_delay() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

const fn default_max_retry_time() -> Duration {
    Duration::from_secs(12 * 3600)
}

const fn default_whitelist_duration() -> Duration {
    Duration::from_secs(36 * 24 * 3600) // 36 days
}

impl Default for GreylistConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_retry_time: default_max_retry_time(),
            whitelist_duration: default_whitelist_duration(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    first_seen: Instant,
    last_seen: Instant,
    attempts: u32,
    whitelisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreylistOutcome {
    /// First sight or too early; retry after the embargo.
    Embargoed { retry_after: Duration },
    /// Retry landed inside the window; triplet is now whitelisted.
    Accepted,
    /// Triplet was already whitelisted.
    Whitelisted,
}

#[derive(Debug)]
pub struct Greylist {
    entries: DashMap<String, Entry>,
    config: GreylistConfig,
}

impl Greylist {
    #[must_use]
    pub fn new(config: GreylistConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// The triplet identity: IPv4 clients are keyed by their /24, IPv6
    /// by their /64, so farm retries from a neighboring MTA still match.
    fn triplet_key(ip: IpAddr, sender: &str, recipient: &str) -> String {
        let network = match ip {
            IpAddr::V4(v4) => {
                let octets = v4.octets();
                format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
            }
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                format!(
                    "{:x}:{:x}:{:x}:{:x}::/64",
                    segments[0], segments[1], segments[2], segments[3]
                )
            }
        };
        format!(
            "{network}|{}|{}",
            sender.to_ascii_lowercase(),
            recipient.to_ascii_lowercase()
        )
    }

    pub fn check(&self, ip: IpAddr, sender: &str, recipient: &str) -> GreylistOutcome {
        let key = Self::triplet_key(ip, sender, recipient);
        let now = Instant::now();

        let mut entry = self.entries.entry(key).or_insert_with(|| Entry {
            first_seen: now,
            last_seen: now,
            attempts: 0,
            whitelisted: false,
        });

        entry.attempts += 1;
        entry.last_seen = now;

        if entry.whitelisted {
            return GreylistOutcome::Whitelisted;
        }

        let age = now.duration_since(entry.first_seen);

        if age >= self.config.max_retry_time {
            // The window closed; start over as a fresh sighting
            entry.first_seen = now;
            entry.attempts = 1;
            return GreylistOutcome::Embargoed {
                retry_after: self.config.initial_delay,
            };
        }

        if age < self.config.initial_delay {
            return GreylistOutcome::Embargoed {
                retry_after: self.config.initial_delay - age,
            };
        }

        entry.whitelisted = true;
        GreylistOutcome::Accepted
    }

    /// Remove entries past their useful life. Returns how many were
    /// purged.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let age = now.duration_since(entry.last_seen);
            if entry.whitelisted {
                age < self.config.whitelist_duration
            } else {
                age < self.config.max_retry_time
            }
        });
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
