//! Anti-abuse pipeline: an ordered stack of scorers producing a single
//! verdict and SMTP action for each accepted message.
//!
//! Scorers are stateless across envelopes except for the documented
//! training state (Bayesian) and rolling state (greylist); both live for
//! the lifetime of the pipeline instance that owns them.

pub mod bayes;
pub mod dkim;
pub mod dmarc;
pub mod greylist;
pub mod resolver;
pub mod spf;

pub use bayes::{BayesClassifier, BayesConfig, BayesScorer};
pub use dkim::{DkimResult, DkimScorer};
pub use dmarc::{DmarcResult, DmarcScorer};
pub use greylist::{Greylist, GreylistConfig, GreylistOutcome};
pub use resolver::{DnsClient, LookupError, RecordSource, StaticRecords};
pub use spf::{SpfResult, SpfScorer, SpfScores};

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use zetian_common::{Envelope, FilterAction, SessionInfo, Verdict};

/// A single check in the pipeline.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, envelope: &Envelope, body: &[u8], session: &SessionInfo) -> Verdict;
}

/// Score thresholds mapping the weighted aggregate onto an action.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_mark")]
    pub mark: f64,
    #[serde(default = "default_quarantine")]
    pub quarantine: f64,
    #[serde(default = "default_reject")]
    pub reject: f64,
    /// A scorer returning `Reject` with at least this score ends the
    /// pipeline immediately.
    #[serde(default = "default_hard_reject")]
    pub hard_reject: f64,
}

const fn default_mark() -> f64 {
    3.0
}

const fn default_quarantine() -> f64 {
    6.0
}

const fn default_reject() -> f64 {
    10.0
}

const fn default_hard_reject() -> f64 {
    8.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            mark: default_mark(),
            quarantine: default_quarantine(),
            reject: default_reject(),
            hard_reject: default_hard_reject(),
        }
    }
}

/// What the pipeline wants done with a message.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    /// Deliver (possibly tagged or quarantined) or reject outright.
    Proceed {
        action: FilterAction,
        score: f64,
        verdicts: Vec<Verdict>,
    },
    /// Greylisted: the client should retry after the embargo.
    Greylisted { retry_after: Duration },
}

impl PipelineOutcome {
    /// Reason string of the most damning verdict, for the SMTP reply.
    #[must_use]
    pub fn reject_reason(&self) -> String {
        match self {
            Self::Proceed { verdicts, .. } => verdicts
                .iter()
                .filter(|v| v.is_spam && !v.reason.is_empty())
                .map(|v| v.reason.clone())
                .next_back()
                .unwrap_or_else(|| "Message refused by policy".to_string()),
            Self::Greylisted { retry_after } => {
                format!("greylisted, retry after {}s", retry_after.as_secs())
            }
        }
    }
}

/// The ordered scorer stack.
///
/// Order is explicit in configuration; there is no registry magic. Each
/// scorer carries a weight applied to its score before aggregation.
pub struct Pipeline {
    scorers: Vec<(Arc<dyn Scorer>, f64)>,
    thresholds: Thresholds,
    greylist: Option<Arc<Greylist>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            scorers: Vec::new(),
            thresholds,
            greylist: None,
        }
    }

    /// Append a scorer with its weight. Order of calls is pipeline
    /// order.
    #[must_use]
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>, weight: f64) -> Self {
        self.scorers.push((scorer, weight));
        self
    }

    /// Enable greylisting, consulted before any scoring.
    #[must_use]
    pub fn with_greylist(mut self, greylist: Arc<Greylist>) -> Self {
        self.greylist = Some(greylist);
        self
    }

    #[must_use]
    pub fn greylist(&self) -> Option<&Arc<Greylist>> {
        self.greylist.as_ref()
    }

    /// Run the stack against one message.
    pub async fn run(
        &self,
        envelope: &Envelope,
        body: &[u8],
        session: &SessionInfo,
    ) -> PipelineOutcome {
        if let Some(greylist) = &self.greylist {
            if let Some(first_recipient) = envelope.recipients().first() {
                let sender = envelope
                    .from()
                    .map(zetian_common::Address::as_smtp_string)
                    .unwrap_or_default();
                match greylist.check(
                    envelope.remote_ip(),
                    &sender,
                    &first_recipient.as_smtp_string(),
                ) {
                    GreylistOutcome::Embargoed { retry_after } => {
                        return PipelineOutcome::Greylisted { retry_after };
                    }
                    GreylistOutcome::Accepted | GreylistOutcome::Whitelisted => {}
                }
            }
        }

        let mut verdicts = Vec::with_capacity(self.scorers.len());
        let mut aggregate = 0.0;

        for (scorer, weight) in &self.scorers {
            let verdict = scorer.check(envelope, body, session).await;
            tracing::debug!(
                checker = verdict.checker,
                score = verdict.score,
                action = ?verdict.action,
                "Scorer verdict"
            );

            aggregate += verdict.score * weight;

            let hard_reject = verdict.action == FilterAction::Reject
                && verdict.score >= self.thresholds.hard_reject;
            verdicts.push(verdict);

            if hard_reject {
                return PipelineOutcome::Proceed {
                    action: FilterAction::Reject,
                    score: aggregate,
                    verdicts,
                };
            }
        }

        let action = if aggregate >= self.thresholds.reject {
            FilterAction::Reject
        } else if aggregate >= self.thresholds.quarantine {
            FilterAction::Quarantine
        } else if aggregate >= self.thresholds.mark {
            FilterAction::Mark
        } else {
            FilterAction::None
        };

        PipelineOutcome::Proceed {
            action,
            score: aggregate,
            verdicts,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use chrono::Utc;
    use zetian_common::{Address, HeaderMap, TlsState};

    use super::*;

    struct FixedScorer {
        name: &'static str,
        score: f64,
        action: FilterAction,
    }

    #[async_trait]
    impl Scorer for FixedScorer {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check(&self, _: &Envelope, _: &[u8], _: &SessionInfo) -> Verdict {
            Verdict {
                score: self.score,
                is_spam: self.score > 0.0,
                reason: format!("{} fired", self.name),
                checker: self.name.to_string(),
                action: self.action,
            }
        }
    }

    fn envelope() -> Envelope {
        Envelope::builder()
            .from(Some(Address::parse("<a@x.example>").unwrap()))
            .recipients(vec![Address::parse("<u@y.example>").unwrap()])
            .remote_ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
            .headers(HeaderMap::new())
            .seal()
    }

    fn session() -> SessionInfo {
        SessionInfo {
            session_id: "s1".to_string(),
            remote_ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
            started_at: Utc::now(),
            ehlo_name: "client.example".to_string(),
            tls_state: TlsState::None,
            authenticated_identity: None,
        }
    }

    #[tokio::test]
    async fn aggregate_maps_to_thresholds() {
        let pipeline = Pipeline::new(Thresholds::default())
            .with_scorer(
                Arc::new(FixedScorer {
                    name: "a",
                    score: 2.0,
                    action: FilterAction::None,
                }),
                1.0,
            )
            .with_scorer(
                Arc::new(FixedScorer {
                    name: "b",
                    score: 2.0,
                    action: FilterAction::None,
                }),
                1.0,
            );

        let outcome = pipeline.run(&envelope(), b"", &session()).await;
        let PipelineOutcome::Proceed { action, score, .. } = outcome else {
            panic!("expected Proceed");
        };
        assert!((score - 4.0).abs() < f64::EPSILON);
        assert_eq!(action, FilterAction::Mark);
    }

    #[tokio::test]
    async fn weights_scale_scores() {
        let pipeline = Pipeline::new(Thresholds::default()).with_scorer(
            Arc::new(FixedScorer {
                name: "a",
                score: 2.0,
                action: FilterAction::None,
            }),
            4.0,
        );

        let outcome = pipeline.run(&envelope(), b"", &session()).await;
        let PipelineOutcome::Proceed { action, score, .. } = outcome else {
            panic!("expected Proceed");
        };
        assert!((score - 8.0).abs() < f64::EPSILON);
        assert_eq!(action, FilterAction::Quarantine);
    }

    #[tokio::test]
    async fn hard_reject_short_circuits() {
        let pipeline = Pipeline::new(Thresholds::default())
            .with_scorer(
                Arc::new(FixedScorer {
                    name: "killer",
                    score: 9.0,
                    action: FilterAction::Reject,
                }),
                1.0,
            )
            .with_scorer(
                Arc::new(FixedScorer {
                    name: "never-runs",
                    score: -100.0,
                    action: FilterAction::None,
                }),
                1.0,
            );

        let outcome = pipeline.run(&envelope(), b"", &session()).await;
        let PipelineOutcome::Proceed {
            action, verdicts, ..
        } = outcome
        else {
            panic!("expected Proceed");
        };
        assert_eq!(action, FilterAction::Reject);
        assert_eq!(verdicts.len(), 1);
    }

    #[tokio::test]
    async fn clean_message_passes() {
        let pipeline = Pipeline::new(Thresholds::default());
        let outcome = pipeline.run(&envelope(), b"", &session()).await;
        let PipelineOutcome::Proceed { action, .. } = outcome else {
            panic!("expected Proceed");
        };
        assert_eq!(action, FilterAction::None);
    }
}
