//! SPF evaluation (RFC 7208 subset).
//!
//! Evaluates `all`, `ip4`, `ip6`, `a`, `mx`, `include` and `exists`
//! mechanisms with the four qualifiers. `include:` recurses with a depth
//! cap of 10.

use std::net::IpAddr;

use async_trait::async_trait;
use serde::Deserialize;
use zetian_common::{Envelope, FilterAction, SessionInfo, Verdict};

use crate::{
    resolver::{LookupError, RecordSource},
    Scorer,
};

/// Maximum `include:` recursion depth.
const MAX_RECURSION: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
}

/// Per-result scores, from policy. SoftFail is a single configurable
/// value.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SpfScores {
    #[serde(default = "default_fail_score")]
    pub fail: f64,
    #[serde(default = "default_softfail_score")]
    pub softfail: f64,
    #[serde(default = "default_neutral_score")]
    pub neutral: f64,
    #[serde(default = "default_none_score")]
    pub none: f64,
    #[serde(default)]
    pub temperror: f64,
    #[serde(default = "default_pass_score")]
    pub pass: f64,
}

const fn default_fail_score() -> f64 {
    4.0
}

const fn default_softfail_score() -> f64 {
    2.0
}

const fn default_neutral_score() -> f64 {
    0.5
}

const fn default_none_score() -> f64 {
    0.5
}

const fn default_pass_score() -> f64 {
    -1.0
}

impl Default for SpfScores {
    fn default() -> Self {
        Self {
            fail: default_fail_score(),
            softfail: default_softfail_score(),
            neutral: default_neutral_score(),
            none: default_none_score(),
            temperror: 0.0,
            pass: default_pass_score(),
        }
    }
}

impl SpfScores {
    #[must_use]
    pub const fn score_for(&self, result: SpfResult) -> f64 {
        match result {
            SpfResult::Pass => self.pass,
            SpfResult::Fail => self.fail,
            SpfResult::SoftFail => self.softfail,
            SpfResult::Neutral => self.neutral,
            SpfResult::None => self.none,
            SpfResult::TempError => self.temperror,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    const fn result(self) -> SpfResult {
        match self {
            Self::Pass => SpfResult::Pass,
            Self::Fail => SpfResult::Fail,
            Self::SoftFail => SpfResult::SoftFail,
            Self::Neutral => SpfResult::Neutral,
        }
    }
}

/// Evaluate the SPF policy of `domain` for a connection from `client`.
pub async fn evaluate(
    source: &dyn RecordSource,
    client: IpAddr,
    domain: &str,
) -> SpfResult {
    evaluate_at_depth(source, client, domain, 0).await
}

/// Boxed recursion so the future stays `Send` and finitely sized.
fn evaluate_at_depth<'a>(
    source: &'a dyn RecordSource,
    client: IpAddr,
    domain: &'a str,
    depth: usize,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = SpfResult> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_RECURSION {
            return SpfResult::None;
        }

        let records = match source.txt(domain).await {
            Ok(records) => records,
            Err(LookupError::NotFound(_)) => return SpfResult::None,
            Err(LookupError::Temporary(_)) => return SpfResult::TempError,
        };

        let Some(record) = records
            .iter()
            .find(|r| r.trim_start().to_ascii_lowercase().starts_with("v=spf1"))
        else {
            return SpfResult::None;
        };

        for term in record.split_whitespace().skip(1) {
            let (qualifier, mechanism) = split_qualifier(term);

            let matched = match match_mechanism(source, client, domain, mechanism, depth).await {
                Ok(matched) => matched,
                Err(result) => return result,
            };

            if matched {
                return qualifier.result();
            }
        }

        // Record exhausted without a match
        SpfResult::Neutral
    })
}

fn split_qualifier(term: &str) -> (Qualifier, &str) {
    match term.as_bytes().first() {
        Some(b'+') => (Qualifier::Pass, &term[1..]),
        Some(b'-') => (Qualifier::Fail, &term[1..]),
        Some(b'~') => (Qualifier::SoftFail, &term[1..]),
        Some(b'?') => (Qualifier::Neutral, &term[1..]),
        _ => (Qualifier::Pass, term),
    }
}

/// Returns `Ok(matched)` or `Err(final_result)` when evaluation must end
/// (temp errors, include pass-through).
async fn match_mechanism(
    source: &dyn RecordSource,
    client: IpAddr,
    domain: &str,
    mechanism: &str,
    depth: usize,
) -> Result<bool, SpfResult> {
    let lower = mechanism.to_ascii_lowercase();

    if lower == "all" {
        return Ok(true);
    }

    if let Some(network) = lower.strip_prefix("ip4:") {
        return Ok(ip_in_network(client, network, 32));
    }

    if let Some(network) = lower.strip_prefix("ip6:") {
        return Ok(ip_in_network(client, network, 128));
    }

    if lower == "a" || lower.starts_with("a:") || lower.starts_with("a/") {
        let (target, prefix) = parse_domain_spec(&lower, "a", domain);
        return match source.ip_addrs(&target).await {
            Ok(addrs) => Ok(addrs.iter().any(|a| same_network(client, *a, prefix))),
            Err(LookupError::NotFound(_)) => Ok(false),
            Err(LookupError::Temporary(_)) => Err(SpfResult::TempError),
        };
    }

    if lower == "mx" || lower.starts_with("mx:") || lower.starts_with("mx/") {
        let (target, prefix) = parse_domain_spec(&lower, "mx", domain);
        let exchanges = match source.mx(&target).await {
            Ok(exchanges) => exchanges,
            Err(LookupError::NotFound(_)) => return Ok(false),
            Err(LookupError::Temporary(_)) => return Err(SpfResult::TempError),
        };
        for exchange in exchanges {
            match source.ip_addrs(&exchange).await {
                Ok(addrs) => {
                    if addrs.iter().any(|a| same_network(client, *a, prefix)) {
                        return Ok(true);
                    }
                }
                Err(LookupError::NotFound(_)) => {}
                Err(LookupError::Temporary(_)) => return Err(SpfResult::TempError),
            }
        }
        return Ok(false);
    }

    if let Some(target) = lower.strip_prefix("include:") {
        return match evaluate_at_depth(source, client, target, depth + 1).await {
            SpfResult::Pass => Ok(true),
            SpfResult::TempError => Err(SpfResult::TempError),
            _ => Ok(false),
        };
    }

    if let Some(target) = lower.strip_prefix("exists:") {
        return match source.ip_addrs(target).await {
            Ok(addrs) => Ok(!addrs.is_empty()),
            Err(LookupError::NotFound(_)) => Ok(false),
            Err(LookupError::Temporary(_)) => Err(SpfResult::TempError),
        };
    }

    // Unknown mechanisms and modifiers (redirect=, exp=) never match
    Ok(false)
}

/// `a`/`mx` domain-spec: optional `:domain` and `/prefix` suffixes.
fn parse_domain_spec(mechanism: &str, verb: &str, default_domain: &str) -> (String, Option<u8>) {
    let rest = &mechanism[verb.len()..];
    let (domain_part, prefix) = rest
        .split_once('/')
        .map_or((rest, None), |(d, p)| (d, p.parse::<u8>().ok()));
    let domain = domain_part
        .strip_prefix(':')
        .filter(|d| !d.is_empty())
        .unwrap_or(default_domain);
    (domain.to_string(), prefix)
}

fn ip_in_network(client: IpAddr, network: &str, max_prefix: u8) -> bool {
    let (addr, prefix) = network
        .split_once('/')
        .map_or((network, max_prefix), |(a, p)| {
            (a, p.parse::<u8>().unwrap_or(max_prefix))
        });
    let Ok(addr) = addr.parse::<IpAddr>() else {
        return false;
    };
    same_network(client, addr, Some(prefix))
}

/// Compare under an optional prefix length; `None` means exact match.
fn same_network(client: IpAddr, other: IpAddr, prefix: Option<u8>) -> bool {
    match (client, other) {
        (IpAddr::V4(a), IpAddr::V4(b)) => {
            let bits = u32::from(prefix.unwrap_or(32)).min(32);
            if bits == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - bits);
            (u32::from(a) & mask) == (u32::from(b) & mask)
        }
        (IpAddr::V6(a), IpAddr::V6(b)) => {
            let bits = u32::from(prefix.unwrap_or(128)).min(128);
            if bits == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - bits);
            (u128::from(a) & mask) == (u128::from(b) & mask)
        }
        _ => false,
    }
}

/// SPF as a pipeline scorer.
pub struct SpfScorer {
    source: std::sync::Arc<dyn RecordSource>,
    scores: SpfScores,
    /// Produce a `Reject` action on hard fail.
    reject_on_fail: bool,
}

impl SpfScorer {
    #[must_use]
    pub fn new(source: std::sync::Arc<dyn RecordSource>, scores: SpfScores) -> Self {
        Self {
            source,
            scores,
            reject_on_fail: false,
        }
    }

    #[must_use]
    pub const fn reject_on_fail(mut self, reject: bool) -> Self {
        self.reject_on_fail = reject;
        self
    }
}

#[async_trait]
impl Scorer for SpfScorer {
    fn name(&self) -> &'static str {
        "spf"
    }

    async fn check(&self, envelope: &Envelope, _body: &[u8], session: &SessionInfo) -> Verdict {
        // The null sender is evaluated against the EHLO identity
        let domain = envelope.from().map_or_else(
            || session.ehlo_name.clone(),
            |from| from.domain().as_str().to_string(),
        );

        let result = evaluate(self.source.as_ref(), envelope.remote_ip(), &domain).await;
        let score = self.scores.score_for(result);

        let action = if self.reject_on_fail && result == SpfResult::Fail {
            FilterAction::Reject
        } else {
            FilterAction::None
        };

        Verdict {
            score,
            is_spam: matches!(result, SpfResult::Fail | SpfResult::SoftFail),
            reason: format!("SPF {result:?} for {domain}"),
            checker: "spf".to_string(),
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::resolver::StaticRecords;

    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn ip4_mechanism() {
        let records =
            StaticRecords::new().with_txt("example.com", &["v=spf1 ip4:192.0.2.0/24 -all"]);

        assert_eq!(
            evaluate(&records, ip("192.0.2.55"), "example.com").await,
            SpfResult::Pass
        );
        assert_eq!(
            evaluate(&records, ip("198.51.100.1"), "example.com").await,
            SpfResult::Fail
        );
    }

    #[tokio::test]
    async fn ip6_mechanism() {
        let records =
            StaticRecords::new().with_txt("example.com", &["v=spf1 ip6:2001:db8::/32 ~all"]);

        assert_eq!(
            evaluate(&records, ip("2001:db8::1"), "example.com").await,
            SpfResult::Pass
        );
        assert_eq!(
            evaluate(&records, ip("2001:db9::1"), "example.com").await,
            SpfResult::SoftFail
        );
    }

    #[tokio::test]
    async fn a_mechanism_with_explicit_domain() {
        let records = StaticRecords::new()
            .with_txt("example.com", &["v=spf1 a:mail.example.com -all"])
            .with_ips("mail.example.com", &["192.0.2.10"]);

        assert_eq!(
            evaluate(&records, ip("192.0.2.10"), "example.com").await,
            SpfResult::Pass
        );
        assert_eq!(
            evaluate(&records, ip("192.0.2.11"), "example.com").await,
            SpfResult::Fail
        );
    }

    #[tokio::test]
    async fn mx_mechanism() {
        let records = StaticRecords::new()
            .with_txt("example.com", &["v=spf1 mx -all"])
            .with_mx("example.com", &["mx1.example.com"])
            .with_ips("mx1.example.com", &["203.0.113.5"]);

        assert_eq!(
            evaluate(&records, ip("203.0.113.5"), "example.com").await,
            SpfResult::Pass
        );
    }

    #[tokio::test]
    async fn include_recursion() {
        let records = StaticRecords::new()
            .with_txt("example.com", &["v=spf1 include:_spf.other.example -all"])
            .with_txt("_spf.other.example", &["v=spf1 ip4:10.1.0.0/16 -all"]);

        assert_eq!(
            evaluate(&records, ip("10.1.2.3"), "example.com").await,
            SpfResult::Pass
        );
        // The included record's Fail does not pass through; outer -all
        // decides
        assert_eq!(
            evaluate(&records, ip("10.2.0.1"), "example.com").await,
            SpfResult::Fail
        );
    }

    #[tokio::test]
    async fn include_self_reference_terminates() {
        let records =
            StaticRecords::new().with_txt("loop.example", &["v=spf1 include:loop.example ?all"]);

        // Recursion cap prevents infinite descent; the ?all catches it
        assert_eq!(
            evaluate(&records, ip("192.0.2.1"), "loop.example").await,
            SpfResult::Neutral
        );
    }

    #[tokio::test]
    async fn exists_mechanism() {
        let records = StaticRecords::new()
            .with_txt("example.com", &["v=spf1 exists:gate.example.com -all"])
            .with_ips("gate.example.com", &["127.0.0.2"]);

        assert_eq!(
            evaluate(&records, ip("192.0.2.1"), "example.com").await,
            SpfResult::Pass
        );
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let records = StaticRecords::new().with_txt("example.com", &["not spf at all"]);
        assert_eq!(
            evaluate(&records, ip("192.0.2.1"), "example.com").await,
            SpfResult::None
        );

        let empty = StaticRecords::new();
        assert_eq!(
            evaluate(&empty, ip("192.0.2.1"), "example.com").await,
            SpfResult::None
        );
    }

    #[tokio::test]
    async fn temp_failure_is_temperror() {
        let records = StaticRecords::new().with_temp_failure("example.com");
        assert_eq!(
            evaluate(&records, ip("192.0.2.1"), "example.com").await,
            SpfResult::TempError
        );
    }

    #[tokio::test]
    async fn neutral_when_no_mechanism_matches() {
        let records = StaticRecords::new().with_txt("example.com", &["v=spf1 ip4:10.0.0.1"]);
        assert_eq!(
            evaluate(&records, ip("192.0.2.1"), "example.com").await,
            SpfResult::Neutral
        );
    }

    #[test]
    fn network_matching() {
        assert!(ip_in_network(ip("192.0.2.5"), "192.0.2.0/24", 32));
        assert!(!ip_in_network(ip("192.0.3.5"), "192.0.2.0/24", 32));
        assert!(ip_in_network(ip("192.0.2.5"), "192.0.2.5", 32));
        // Mixed families never match
        assert!(!ip_in_network(ip("::1"), "192.0.2.0/24", 32));
    }
}
