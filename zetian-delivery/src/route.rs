//! Route selection for outbound recipients.
//!
//! The ladder for `user@domain`: local domains, per-domain routing,
//! weighted smart-host groups, MX resolution, then the default smart
//! host. No rung matching is a permanent no-route failure.

use rand::Rng;
use zetian_common::Domain;

use crate::{
    config::{RelayOptions, SmartHost},
    dns::{DnsError, MailServer, MxResolver},
    error::{DeliveryError, PermanentError, TemporaryError},
};

/// A concrete place to connect to, with session options resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub use_starttls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl HostTarget {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn from_smart_host(smart_host: &SmartHost) -> Self {
        Self {
            host: smart_host.host.clone(),
            port: smart_host.port,
            use_tls: smart_host.use_tls,
            use_starttls: smart_host.use_starttls,
            username: smart_host.username.clone(),
            password: smart_host.password.clone(),
        }
    }

    pub(crate) fn plain(address: &str) -> Self {
        let (host, port) = address
            .rsplit_once(':')
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
            .unwrap_or_else(|| (address.to_string(), 25));
        Self {
            host,
            port,
            use_tls: false,
            use_starttls: true,
            username: None,
            password: None,
        }
    }

    fn from_mail_server(server: &MailServer) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            use_tls: false,
            use_starttls: true,
            username: None,
            password: None,
        }
    }
}

/// Where a recipient's mail goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Hand to the message store; no outbound SMTP.
    Local,
    /// Try these targets in order, falling through on connection
    /// failure.
    Remote {
        targets: Vec<HostTarget>,
        /// Label recorded on the queue entry (`smart-host`, `mx`, ...).
        via: &'static str,
    },
}

#[derive(Debug)]
pub struct Router {
    options: RelayOptions,
    resolver: MxResolver,
}

impl Router {
    #[must_use]
    pub fn new(options: RelayOptions) -> Self {
        let resolver = MxResolver::new(&options.dns_servers);
        Self { options, resolver }
    }

    #[must_use]
    pub const fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Decide the route for one recipient domain.
    pub async fn select(&self, domain: &Domain) -> Result<RouteDecision, DeliveryError> {
        if self.options.is_local_domain(domain) {
            return Ok(RouteDecision::Local);
        }

        if let Some(host) = self.options.domain_routing.get(domain) {
            return Ok(RouteDecision::Remote {
                targets: vec![HostTarget::plain(host)],
                via: "domain-routing",
            });
        }

        let enabled: Vec<&SmartHost> = self
            .options
            .smart_hosts
            .iter()
            .filter(|h| h.enabled)
            .collect();
        if !enabled.is_empty() {
            let ordered = weighted_order(&enabled);
            return Ok(RouteDecision::Remote {
                targets: ordered.iter().map(|h| HostTarget::from_smart_host(h)).collect(),
                via: "smart-host",
            });
        }

        if self.options.use_mx_routing {
            return match self.resolver.resolve(domain.as_str()).await {
                Ok(servers) => Ok(RouteDecision::Remote {
                    targets: mx_order(&servers),
                    via: "mx",
                }),
                Err(err @ DnsError::LookupFailed(_)) => Err(DeliveryError::Temporary(
                    TemporaryError::DnsLookupFailed(err.to_string()),
                )),
                Err(DnsError::NoMailServers(domain) | DnsError::DomainNotFound(domain)) => Err(
                    DeliveryError::Permanent(PermanentError::NoMailServers(domain)),
                ),
            };
        }

        if let Some(default) = &self.options.default_smart_host {
            return Ok(RouteDecision::Remote {
                targets: vec![HostTarget::plain(default)],
                via: "default",
            });
        }

        Err(DeliveryError::Permanent(PermanentError::NoRoute(
            domain.as_str().to_string(),
        )))
    }
}

/// Order enabled smart hosts: priority groups ascending, and within a
/// group a weighted random order (selection without replacement,
/// probability proportional to weight). Connect failures walk down this
/// list, exhausting a group before the next one starts.
#[must_use]
pub fn weighted_order<'a>(hosts: &[&'a SmartHost]) -> Vec<&'a SmartHost> {
    let mut priorities: Vec<u32> = hosts.iter().map(|h| h.priority).collect();
    priorities.sort_unstable();
    priorities.dedup();

    let mut rng = rand::rng();
    let mut ordered = Vec::with_capacity(hosts.len());

    for priority in priorities {
        let mut group: Vec<&SmartHost> = hosts
            .iter()
            .filter(|h| h.priority == priority)
            .copied()
            .collect();

        while !group.is_empty() {
            let total: u64 = group.iter().map(|h| u64::from(h.weight.max(1))).sum();
            let mut roll = rng.random_range(0..total);
            let mut chosen = 0;
            for (index, host) in group.iter().enumerate() {
                let weight = u64::from(host.weight.max(1));
                if roll < weight {
                    chosen = index;
                    break;
                }
                roll -= weight;
            }
            ordered.push(group.remove(chosen));
        }
    }

    ordered
}

/// MX targets sorted by preference; equal preferences are shuffled.
fn mx_order(servers: &[MailServer]) -> Vec<HostTarget> {
    let mut preferences: Vec<u16> = servers.iter().map(|s| s.preference).collect();
    preferences.sort_unstable();
    preferences.dedup();

    let mut rng = rand::rng();
    let mut ordered = Vec::with_capacity(servers.len());

    for preference in preferences {
        let mut tied: Vec<&MailServer> = servers
            .iter()
            .filter(|s| s.preference == preference)
            .collect();
        // Randomize ties
        for i in (1..tied.len()).rev() {
            let j = rng.random_range(0..=i);
            tied.swap(i, j);
        }
        ordered.extend(tied.iter().map(|s| HostTarget::from_mail_server(s)));
    }

    ordered
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn smart_host(host: &str, priority: u32, weight: u32) -> SmartHost {
        SmartHost {
            host: host.to_string(),
            port: 25,
            priority,
            weight,
            enabled: true,
            use_tls: false,
            use_starttls: false,
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn local_domain_wins() {
        let router = Router::new(RelayOptions {
            local_domains: vec![Domain::new("local.example")],
            smart_hosts: vec![smart_host("relay.example", 0, 1)],
            ..RelayOptions::default()
        });

        assert_eq!(
            router.select(&Domain::new("local.example")).await.unwrap(),
            RouteDecision::Local
        );
    }

    #[tokio::test]
    async fn domain_routing_beats_smart_hosts() {
        let mut domain_routing = HashMap::new();
        domain_routing.insert(Domain::new("special.example"), "gw.example:2525".to_string());

        let router = Router::new(RelayOptions {
            domain_routing,
            smart_hosts: vec![smart_host("relay.example", 0, 1)],
            ..RelayOptions::default()
        });

        let RouteDecision::Remote { targets, via } = router
            .select(&Domain::new("special.example"))
            .await
            .unwrap()
        else {
            panic!("expected Remote");
        };
        assert_eq!(via, "domain-routing");
        assert_eq!(targets[0].host, "gw.example");
        assert_eq!(targets[0].port, 2525);
    }

    #[tokio::test]
    async fn default_smart_host_is_last_resort() {
        let router = Router::new(RelayOptions {
            default_smart_host: Some("fallback.example".to_string()),
            ..RelayOptions::default()
        });

        let RouteDecision::Remote { targets, via } =
            router.select(&Domain::new("anything.example")).await.unwrap()
        else {
            panic!("expected Remote");
        };
        assert_eq!(via, "default");
        assert_eq!(targets[0].host, "fallback.example");
        assert_eq!(targets[0].port, 25);
    }

    #[tokio::test]
    async fn no_route_is_permanent() {
        let router = Router::new(RelayOptions::default());
        let err = router
            .select(&Domain::new("nowhere.example"))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn priority_groups_respected() {
        let primary_a = smart_host("a.example", 0, 1);
        let primary_b = smart_host("b.example", 0, 1);
        let backup = smart_host("backup.example", 10, 100);
        let hosts = vec![&primary_a, &primary_b, &backup];

        for _ in 0..50 {
            let ordered = weighted_order(&hosts);
            assert_eq!(ordered.len(), 3);
            // The backup always sorts after the priority-0 group
            assert_eq!(ordered[2].host, "backup.example");
        }
    }

    #[test]
    fn disabled_hosts_are_skipped_by_router() {
        let hosts = [
            smart_host("on.example", 0, 1),
            SmartHost {
                enabled: false,
                ..smart_host("off.example", 0, 100)
            },
        ];
        let enabled: Vec<&SmartHost> = hosts.iter().filter(|h| h.enabled).collect();
        let ordered = weighted_order(&enabled);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].host, "on.example");
    }

    #[test]
    fn weighted_selection_tracks_weights() {
        // 40/30/20/10 weights; first-pick frequency over 10000 draws
        // must match the distribution within ±3 percentage points
        let h40 = smart_host("h40.example", 0, 40);
        let h30 = smart_host("h30.example", 0, 30);
        let h20 = smart_host("h20.example", 0, 20);
        let h10 = smart_host("h10.example", 0, 10);
        let hosts = vec![&h40, &h30, &h20, &h10];

        let mut first_picks: HashMap<String, usize> = HashMap::new();
        const DRAWS: usize = 10_000;
        for _ in 0..DRAWS {
            let ordered = weighted_order(&hosts);
            *first_picks.entry(ordered[0].host.clone()).or_insert(0) += 1;
        }

        #[allow(clippy::cast_precision_loss)]
        let pct = |host: &str| first_picks.get(host).copied().unwrap_or(0) as f64 / DRAWS as f64;

        assert!((pct("h40.example") - 0.40).abs() < 0.03, "{first_picks:?}");
        assert!((pct("h30.example") - 0.30).abs() < 0.03, "{first_picks:?}");
        assert!((pct("h20.example") - 0.20).abs() < 0.03, "{first_picks:?}");
        assert!((pct("h10.example") - 0.10).abs() < 0.03, "{first_picks:?}");
    }

    #[test]
    fn mx_tie_randomization_keeps_preference_order() {
        let servers = vec![
            MailServer::new("mx-b.example".into(), 10, 25),
            MailServer::new("mx-a.example".into(), 5, 25),
            MailServer::new("mx-c.example".into(), 10, 25),
        ];

        for _ in 0..20 {
            let ordered = mx_order(&servers);
            assert_eq!(ordered[0].host, "mx-a.example");
            let tail: Vec<&str> = ordered[1..].iter().map(|t| t.host.as_str()).collect();
            assert!(tail.contains(&"mx-b.example"));
            assert!(tail.contains(&"mx-c.example"));
        }
    }
}
