//! DMARC evaluation (RFC 7489).
//!
//! DMARC passes iff SPF passes with an aligned domain, or any DKIM
//! signature passes with an aligned `d=` domain. Alignment compares the
//! RFC5322.From domain against the SPF-authenticated domain or the DKIM
//! signing domain; strict mode is exact equality, relaxed mode compares
//! organizational domains.

use async_trait::async_trait;
use rand::Rng;
use zetian_common::{Envelope, FilterAction, SessionInfo, Verdict};

use crate::{
    dkim::{self, DkimResult},
    resolver::{LookupError, RecordSource},
    spf::{self, SpfResult},
    Scorer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcResult {
    Pass,
    Fail,
    None,
    TempError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alignment {
    Strict,
    Relaxed,
}

#[derive(Debug, Clone)]
struct DmarcRecord {
    policy: DmarcPolicy,
    subdomain_policy: Option<DmarcPolicy>,
    dkim_alignment: Alignment,
    spf_alignment: Alignment,
    pct: u8,
}

fn parse_policy(value: &str) -> Option<DmarcPolicy> {
    match value.trim().to_ascii_lowercase().as_str() {
        "none" => Some(DmarcPolicy::None),
        "quarantine" => Some(DmarcPolicy::Quarantine),
        "reject" => Some(DmarcPolicy::Reject),
        _ => None,
    }
}

fn parse_record(record: &str) -> Option<DmarcRecord> {
    let mut tags = record.split(';');
    let version = tags.next()?.trim();
    if !version.eq_ignore_ascii_case("v=DMARC1") {
        return None;
    }

    let mut policy = None;
    let mut subdomain_policy = None;
    let mut dkim_alignment = Alignment::Relaxed;
    let mut spf_alignment = Alignment::Relaxed;
    let mut pct = 100u8;

    for tag in tags {
        let Some((key, value)) = tag.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "p" => policy = parse_policy(value),
            "sp" => subdomain_policy = parse_policy(value),
            "adkim" => {
                dkim_alignment = if value.trim().eq_ignore_ascii_case("s") {
                    Alignment::Strict
                } else {
                    Alignment::Relaxed
                };
            }
            "aspf" => {
                spf_alignment = if value.trim().eq_ignore_ascii_case("s") {
                    Alignment::Strict
                } else {
                    Alignment::Relaxed
                };
            }
            "pct" => pct = value.trim().parse().unwrap_or(100).min(100),
            _ => {}
        }
    }

    Some(DmarcRecord {
        policy: policy?,
        subdomain_policy,
        dkim_alignment,
        spf_alignment,
        pct,
    })
}

/// Two-level public suffixes that the last-two-labels rule would get
/// wrong. Not the full public suffix list, but the common cases.
const TWO_LEVEL_SUFFIXES: &[&str] = &[
    "ac.uk", "co.uk", "gov.uk", "ltd.uk", "me.uk", "net.uk", "org.uk", "plc.uk", "sch.uk",
    "com.au", "net.au", "org.au", "edu.au", "gov.au", "id.au", "asn.au",
    "co.jp", "ne.jp", "or.jp", "ac.jp", "go.jp", "ad.jp", "ed.jp",
    "com.br", "net.br", "org.br", "gov.br", "edu.br",
    "co.nz", "net.nz", "org.nz", "govt.nz", "ac.nz",
    "co.za", "net.za", "org.za", "gov.za", "ac.za",
    "com.cn", "net.cn", "org.cn", "gov.cn", "edu.cn",
    "co.in", "net.in", "org.in", "gov.in", "ac.in",
    "com.mx", "com.ar", "com.tr", "com.tw", "com.sg", "com.hk", "com.my",
    "co.kr", "or.kr", "co.id", "co.th", "co.il",
];

/// Registrable suffix plus one label: `mail.sub.example.co.uk` becomes
/// `example.co.uk`.
#[must_use]
pub fn organizational_domain(domain: &str) -> String {
    let domain = domain.to_ascii_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() <= 2 {
        return domain;
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if TWO_LEVEL_SUFFIXES.contains(&last_two.as_str()) {
        if labels.len() == 3 {
            return domain;
        }
        return labels[labels.len() - 3..].join(".");
    }

    last_two
}

fn aligned(from_domain: &str, authenticated_domain: &str, alignment: Alignment) -> bool {
    let from = from_domain.to_ascii_lowercase();
    let authenticated = authenticated_domain.to_ascii_lowercase();
    match alignment {
        Alignment::Strict => from == authenticated,
        Alignment::Relaxed => {
            organizational_domain(&from) == organizational_domain(&authenticated)
        }
    }
}

/// Evaluation output: the result plus the policy the sender published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmarcEvaluation {
    pub result: DmarcResult,
    pub policy: DmarcPolicy,
    /// Whether the `pct=` roulette selected this message for policy
    /// application.
    pub sampled: bool,
}

/// Evaluate DMARC for one message.
///
/// `spf_result`/`spf_domain` come from the MAIL FROM check (EHLO identity
/// for the null sender); `dkim_verifications` from signature
/// verification.
pub async fn evaluate(
    source: &dyn RecordSource,
    from_domain: &str,
    spf_result: SpfResult,
    spf_domain: &str,
    dkim_verifications: &[dkim::SignatureVerification],
) -> DmarcEvaluation {
    let org = organizational_domain(from_domain);

    let records = match source.txt(&format!("_dmarc.{org}")).await {
        Ok(records) => records,
        Err(LookupError::NotFound(_)) => {
            return DmarcEvaluation {
                result: DmarcResult::None,
                policy: DmarcPolicy::None,
                sampled: false,
            };
        }
        Err(LookupError::Temporary(_)) => {
            return DmarcEvaluation {
                result: DmarcResult::TempError,
                policy: DmarcPolicy::None,
                sampled: false,
            };
        }
    };

    let Some(record) = records.iter().find_map(|r| parse_record(r)) else {
        return DmarcEvaluation {
            result: DmarcResult::None,
            policy: DmarcPolicy::None,
            sampled: false,
        };
    };

    let spf_aligned = spf_result == SpfResult::Pass
        && aligned(from_domain, spf_domain, record.spf_alignment);

    let dkim_aligned = dkim_verifications.iter().any(|v| {
        v.result == DkimResult::Pass && aligned(from_domain, &v.domain, record.dkim_alignment)
    });

    let result = if spf_aligned || dkim_aligned {
        DmarcResult::Pass
    } else {
        DmarcResult::Fail
    };

    // Subdomain policy applies when the From domain is not the
    // organizational domain itself
    let policy = if from_domain.eq_ignore_ascii_case(&org) {
        record.policy
    } else {
        record.subdomain_policy.unwrap_or(record.policy)
    };

    let sampled = record.pct >= 100 || rand::rng().random_range(0..100) < record.pct;

    DmarcEvaluation {
        result,
        policy,
        sampled,
    }
}

/// DMARC as a pipeline scorer. Runs its own SPF and DKIM evaluation so
/// the check is self-contained.
pub struct DmarcScorer {
    source: std::sync::Arc<dyn RecordSource>,
    fail_score: f64,
    /// When false, published policies degrade to report-only: the score
    /// still applies but no Reject/Quarantine action is taken.
    enforce: bool,
}

impl DmarcScorer {
    #[must_use]
    pub fn new(source: std::sync::Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            fail_score: 5.0,
            enforce: true,
        }
    }

    #[must_use]
    pub const fn enforce(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }
}

#[async_trait]
impl Scorer for DmarcScorer {
    fn name(&self) -> &'static str {
        "dmarc"
    }

    async fn check(&self, envelope: &Envelope, body: &[u8], session: &SessionInfo) -> Verdict {
        // Header From decides alignment targets
        let Some(from_domain) = envelope
            .headers()
            .get("from")
            .and_then(|value| zetian_common::Address::parse(value).ok())
            .map(|addr| addr.domain().as_str().to_string())
        else {
            return Verdict::clean("dmarc");
        };

        let spf_domain = envelope.from().map_or_else(
            || session.ehlo_name.clone(),
            |from| from.domain().as_str().to_string(),
        );
        let spf_result =
            spf::evaluate(self.source.as_ref(), envelope.remote_ip(), &spf_domain).await;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let dkim_verifications =
            dkim::verify_message(self.source.as_ref(), body, false, now).await;

        let evaluation = evaluate(
            self.source.as_ref(),
            &from_domain,
            spf_result,
            &spf_domain,
            &dkim_verifications,
        )
        .await;

        let failed = evaluation.result == DmarcResult::Fail;
        let action = if failed && self.enforce && evaluation.sampled {
            match evaluation.policy {
                DmarcPolicy::Reject => FilterAction::Reject,
                DmarcPolicy::Quarantine => FilterAction::Quarantine,
                DmarcPolicy::None => FilterAction::None,
            }
        } else {
            FilterAction::None
        };

        Verdict {
            score: if failed { self.fail_score } else { 0.0 },
            is_spam: failed,
            reason: format!(
                "DMARC {:?} (policy {:?}) for {from_domain}",
                evaluation.result, evaluation.policy
            ),
            checker: "dmarc".to_string(),
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::resolver::StaticRecords;

    use super::*;

    #[test]
    fn organizational_domains() {
        assert_eq!(organizational_domain("example.com"), "example.com");
        assert_eq!(organizational_domain("mail.example.com"), "example.com");
        assert_eq!(organizational_domain("a.b.example.com"), "example.com");
        assert_eq!(
            organizational_domain("mail.sub.example.co.uk"),
            "example.co.uk"
        );
        assert_eq!(organizational_domain("example.co.uk"), "example.co.uk");
        assert_eq!(organizational_domain("co.uk"), "co.uk");
        assert_eq!(organizational_domain("localhost"), "localhost");
    }

    #[test]
    fn alignment_modes() {
        assert!(aligned("example.com", "example.com", Alignment::Strict));
        assert!(!aligned("mail.example.com", "example.com", Alignment::Strict));
        assert!(aligned("mail.example.com", "example.com", Alignment::Relaxed));
        assert!(aligned(
            "a.example.co.uk",
            "b.example.co.uk",
            Alignment::Relaxed
        ));
        assert!(!aligned("example.com", "example.org", Alignment::Relaxed));
    }

    #[test]
    fn record_parsing() {
        let record =
            parse_record("v=DMARC1; p=reject; sp=quarantine; adkim=s; aspf=r; pct=30").unwrap();
        assert_eq!(record.policy, DmarcPolicy::Reject);
        assert_eq!(record.subdomain_policy, Some(DmarcPolicy::Quarantine));
        assert_eq!(record.dkim_alignment, Alignment::Strict);
        assert_eq!(record.spf_alignment, Alignment::Relaxed);
        assert_eq!(record.pct, 30);

        assert!(parse_record("v=spf1 -all").is_none());
        assert!(parse_record("v=DMARC1; sp=reject").is_none());
    }

    #[tokio::test]
    async fn spf_alignment_passes_dmarc() {
        let records = StaticRecords::new().with_txt("_dmarc.example.com", &["v=DMARC1; p=reject"]);

        let evaluation = evaluate(
            &records,
            "example.com",
            SpfResult::Pass,
            "example.com",
            &[],
        )
        .await;
        assert_eq!(evaluation.result, DmarcResult::Pass);
        assert_eq!(evaluation.policy, DmarcPolicy::Reject);
    }

    #[tokio::test]
    async fn unaligned_spf_pass_fails_dmarc() {
        let records = StaticRecords::new().with_txt("_dmarc.example.com", &["v=DMARC1; p=reject"]);

        // SPF passed, but for an unrelated domain
        let evaluation = evaluate(
            &records,
            "example.com",
            SpfResult::Pass,
            "spammer.example.net",
            &[],
        )
        .await;
        assert_eq!(evaluation.result, DmarcResult::Fail);
    }

    #[tokio::test]
    async fn dkim_alignment_passes_dmarc() {
        let records = StaticRecords::new().with_txt("_dmarc.example.com", &["v=DMARC1; p=none"]);

        let verifications = vec![dkim::SignatureVerification {
            domain: "mail.example.com".to_string(),
            selector: "s1".to_string(),
            result: DkimResult::Pass,
        }];

        let evaluation = evaluate(
            &records,
            "example.com",
            SpfResult::Fail,
            "example.com",
            &verifications,
        )
        .await;
        assert_eq!(evaluation.result, DmarcResult::Pass);
    }

    #[tokio::test]
    async fn strict_dkim_alignment_rejects_subdomain() {
        let records =
            StaticRecords::new().with_txt("_dmarc.example.com", &["v=DMARC1; p=reject; adkim=s"]);

        let verifications = vec![dkim::SignatureVerification {
            domain: "mail.example.com".to_string(),
            selector: "s1".to_string(),
            result: DkimResult::Pass,
        }];

        let evaluation = evaluate(
            &records,
            "example.com",
            SpfResult::None,
            "example.com",
            &verifications,
        )
        .await;
        assert_eq!(evaluation.result, DmarcResult::Fail);
    }

    #[tokio::test]
    async fn subdomain_policy_applies_to_subdomains() {
        let records = StaticRecords::new()
            .with_txt("_dmarc.example.com", &["v=DMARC1; p=reject; sp=none"]);

        let evaluation = evaluate(
            &records,
            "sub.example.com",
            SpfResult::None,
            "other.example.net",
            &[],
        )
        .await;
        assert_eq!(evaluation.result, DmarcResult::Fail);
        assert_eq!(evaluation.policy, DmarcPolicy::None);

        let evaluation = evaluate(
            &records,
            "example.com",
            SpfResult::None,
            "other.example.net",
            &[],
        )
        .await;
        assert_eq!(evaluation.policy, DmarcPolicy::Reject);
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let records = StaticRecords::new();
        let evaluation = evaluate(
            &records,
            "example.com",
            SpfResult::Pass,
            "example.com",
            &[],
        )
        .await;
        assert_eq!(evaluation.result, DmarcResult::None);
    }

    #[tokio::test]
    async fn pct_zero_never_samples() {
        let records =
            StaticRecords::new().with_txt("_dmarc.example.com", &["v=DMARC1; p=reject; pct=0"]);

        let evaluation = evaluate(
            &records,
            "example.com",
            SpfResult::None,
            "other.example.net",
            &[],
        )
        .await;
        assert_eq!(evaluation.result, DmarcResult::Fail);
        assert!(!evaluation.sampled);
    }
}
