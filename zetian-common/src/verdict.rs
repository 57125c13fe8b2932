//! Scorer verdicts and the SMTP-level actions they map to.

use serde::{Deserialize, Serialize};

/// What the server should do with a message after scoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilterAction {
    /// Accept unchanged.
    #[default]
    None,
    /// Accept, but tag with `X-Spam-*` headers before persisting.
    Mark,
    /// Accept, but route to the quarantine queue instead of delivery.
    Quarantine,
    /// Refuse at DATA time with a 550 and do not persist.
    Reject,
}

/// Output of a single scorer, or of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub score: f64,
    pub is_spam: bool,
    pub reason: String,
    pub checker: String,
    pub action: FilterAction,
}

impl Verdict {
    /// A neutral verdict from `checker` that carries no opinion.
    #[must_use]
    pub fn clean(checker: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            is_spam: false,
            reason: String::new(),
            checker: checker.into(),
            action: FilterAction::None,
        }
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Self::clean("none")
    }
}
