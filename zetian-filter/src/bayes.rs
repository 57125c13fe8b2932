//! Bayesian content classification.
//!
//! Token statistics live in a concurrent map; the paired message totals
//! sit behind a mutex because they must move together. Per-token spam
//! probabilities use Laplace smoothing with Robinson's bounding, and the
//! top-N most decisive tokens combine through Fisher's inverse
//! chi-square.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use zetian_common::{Envelope, FilterAction, SessionInfo, Verdict};

use crate::Scorer;

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BayesConfig {
    #[serde(default = "default_min_token_len")]
    pub min_token_len: usize,
    #[serde(default = "default_max_token_len")]
    pub max_token_len: usize,
    /// How many of the most decisive tokens participate in the combined
    /// probability.
    #[serde(default = "default_top_tokens")]
    pub top_tokens: usize,
    /// Combined probability above which the message counts as spam.
    #[serde(default = "default_spam_cutoff")]
    pub spam_cutoff: f64,
}

const fn default_min_token_len() -> usize {
    3
}

const fn default_max_token_len() -> usize {
    24
}

const fn default_top_tokens() -> usize {
    15
}

const fn default_spam_cutoff() -> f64 {
    0.9
}

impl Default for BayesConfig {
    fn default() -> Self {
        Self {
            min_token_len: default_min_token_len(),
            max_token_len: default_max_token_len(),
            top_tokens: default_top_tokens(),
            spam_cutoff: default_spam_cutoff(),
        }
    }
}

#[derive(Debug, Default)]
struct TokenCounts {
    spam: u64,
    ham: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    spam_messages: u64,
    ham_messages: u64,
}

#[derive(Debug)]
pub struct BayesClassifier {
    tokens: DashMap<String, TokenCounts>,
    totals: Mutex<Totals>,
    config: BayesConfig,
}

impl BayesClassifier {
    #[must_use]
    pub fn new(config: BayesConfig) -> Self {
        Self {
            tokens: DashMap::new(),
            totals: Mutex::new(Totals::default()),
            config,
        }
    }

    /// Feed one classified message into the statistics.
    pub fn train(&self, text: &str, is_spam: bool) {
        for token in self.tokenize(text) {
            let mut counts = self.tokens.entry(token).or_default();
            if is_spam {
                counts.spam += 1;
            } else {
                counts.ham += 1;
            }
        }

        let mut totals = self.totals.lock();
        if is_spam {
            totals.spam_messages += 1;
        } else {
            totals.ham_messages += 1;
        }
    }

    /// Combined spam probability in `[0, 1]`; 0.5 when untrained.
    #[must_use]
    pub fn classify(&self, text: &str) -> f64 {
        let totals = *self.totals.lock();
        if totals.spam_messages == 0 || totals.ham_messages == 0 {
            return 0.5;
        }

        let mut probabilities: Vec<f64> = self
            .tokenize(text)
            .into_iter()
            .filter_map(|token| {
                self.tokens
                    .get(&token)
                    .map(|counts| token_probability(&counts, totals))
            })
            .collect();

        if probabilities.is_empty() {
            return 0.5;
        }

        // Keep the N tokens furthest from neutral
        probabilities.sort_by(|a, b| {
            (b - 0.5)
                .abs()
                .partial_cmp(&(a - 0.5).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        probabilities.truncate(self.config.top_tokens);

        fisher_combine(&probabilities)
    }

    /// Tokens for `text`: plain words plus the structural markers.
    fn tokenize(&self, text: &str) -> Vec<String> {
        let stripped = strip_html(text);
        let mut tokens = Vec::new();

        for word in stripped.split(|c: char| c.is_whitespace() || ",;<>()[]{}\"'".contains(c)) {
            if word.is_empty() {
                continue;
            }

            if let Some(host) = url_host(word) {
                tokens.push(format!("URL:{host}"));
                continue;
            }

            if let Some(domain) = email_domain(word) {
                tokens.push(format!("EMAILDOMAIN:{domain}"));
                continue;
            }

            if looks_like_money(word) {
                tokens.push("MONEY".to_string());
                continue;
            }

            if looks_like_phone(word) {
                tokens.push("PHONE".to_string());
                continue;
            }

            let cleaned: String = word
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '-')
                .collect();
            if cleaned.len() >= self.config.min_token_len
                && cleaned.len() <= self.config.max_token_len
            {
                tokens.push(cleaned.to_lowercase());
            }
        }

        if excessive_caps(&stripped) {
            tokens.push("EXCESSIVE_CAPS".to_string());
        }
        if excessive_punctuation(&stripped) {
            tokens.push("EXCESSIVE_PUNCTUATION".to_string());
        }

        tokens
    }

    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub const fn config(&self) -> &BayesConfig {
        &self.config
    }
}

/// Laplace-smoothed spam probability with Robinson's bound, so rare
/// tokens cannot saturate the combination.
fn token_probability(counts: &TokenCounts, totals: Totals) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let spam_freq = counts.spam as f64 / totals.spam_messages.max(1) as f64;
    #[allow(clippy::cast_precision_loss)]
    let ham_freq = counts.ham as f64 / totals.ham_messages.max(1) as f64;

    let naive = spam_freq / (spam_freq + ham_freq + f64::EPSILON);

    // Robinson: s=1, x=0.5
    #[allow(clippy::cast_precision_loss)]
    let n = (counts.spam + counts.ham) as f64;
    let adjusted = (0.5 + n * naive) / (1.0 + n);

    adjusted.clamp(0.01, 0.99)
}

/// Fisher's method: `H` from the spam probabilities, `S` from their
/// complements, combined as `(1 + H - S) / 2`.
fn fisher_combine(probabilities: &[f64]) -> f64 {
    let df = 2 * probabilities.len();

    let chi_spam: f64 = -2.0 * probabilities.iter().map(|p| p.ln()).sum::<f64>();
    let chi_ham: f64 = -2.0 * probabilities.iter().map(|p| (1.0 - p).ln()).sum::<f64>();

    let h = 1.0 - inverse_chi_square(chi_ham, df);
    let s = 1.0 - inverse_chi_square(chi_spam, df);

    (1.0 + h - s) / 2.0
}

/// Upper-tail probability of a chi-square with `df` degrees of freedom
/// (df even).
fn inverse_chi_square(chi: f64, df: usize) -> f64 {
    let m = chi / 2.0;
    let mut term = (-m).exp();
    let mut sum = term;
    for i in 1..(df / 2) {
        #[allow(clippy::cast_precision_loss)]
        {
            term *= m / i as f64;
        }
        sum += term;
    }
    sum.min(1.0)
}

fn strip_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn url_host(word: &str) -> Option<String> {
    let rest = word
        .strip_prefix("http://")
        .or_else(|| word.strip_prefix("https://"))?;
    let host: String = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .to_lowercase();
    (!host.is_empty()).then_some(host)
}

fn email_domain(word: &str) -> Option<String> {
    let (local, domain) = word.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return None;
    }
    Some(domain.trim_end_matches('.').to_lowercase())
}

fn looks_like_money(word: &str) -> bool {
    let trimmed = word.trim_end_matches(['.', ',', '!']);
    (trimmed.starts_with('$') || trimmed.starts_with('€') || trimmed.starts_with('£'))
        && trimmed.chars().skip(1).any(|c| c.is_ascii_digit())
}

fn looks_like_phone(word: &str) -> bool {
    let digits = word.chars().filter(char::is_ascii_digit).count();
    let separators = word.chars().filter(|c| "-().+ ".contains(*c)).count();
    digits >= 10 && digits + separators == word.chars().count()
}

fn excessive_caps(text: &str) -> bool {
    let letters: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 20 {
        return false;
    }
    let caps = letters.iter().filter(|c| c.is_uppercase()).count();
    #[allow(clippy::cast_precision_loss)]
    {
        caps as f64 / letters.len() as f64 > 0.5
    }
}

fn excessive_punctuation(text: &str) -> bool {
    text.contains("!!!") || text.contains("???") || text.matches('!').count() > 5
}

/// Bayesian scorer over the subject, sender, and body.
pub struct BayesScorer {
    classifier: std::sync::Arc<BayesClassifier>,
    /// Scale factor mapping the probability excess over 0.5 onto the
    /// pipeline score.
    scale: f64,
}

impl BayesScorer {
    #[must_use]
    pub fn new(classifier: std::sync::Arc<BayesClassifier>) -> Self {
        Self {
            classifier,
            scale: 8.0,
        }
    }

    /// The text a message contributes to classification and training.
    #[must_use]
    pub fn corpus_text(envelope: &Envelope, body: &[u8]) -> String {
        let mut text = String::new();
        if let Some(subject) = envelope.headers().get("subject") {
            text.push_str(subject);
            text.push(' ');
        }
        if let Some(from) = envelope.headers().get("from") {
            text.push_str(from);
            text.push(' ');
        }
        for value in envelope.headers().get_all("x-mailer") {
            text.push_str(value);
            text.push(' ');
        }

        // Body after the header section
        let body_start = body
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map_or(0, |p| p + 4);
        text.push_str(&String::from_utf8_lossy(&body[body_start..]));
        text
    }
}

#[async_trait]
impl Scorer for BayesScorer {
    fn name(&self) -> &'static str {
        "bayes"
    }

    async fn check(&self, envelope: &Envelope, body: &[u8], _session: &SessionInfo) -> Verdict {
        let text = Self::corpus_text(envelope, body);
        let probability = self.classifier.classify(&text);
        let cutoff = self.classifier.config().spam_cutoff;

        Verdict {
            score: (probability - 0.5) * self.scale,
            is_spam: probability >= cutoff,
            reason: format!("Bayes probability {probability:.3}"),
            checker: "bayes".to_string(),
            action: FilterAction::None,
        }
    }
}
