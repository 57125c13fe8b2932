//! DKIM signature verification (RFC 6376, RFC 8463).
//!
//! Signatures are verified for real: the body hash is recomputed under
//! the declared canonicalization, and the `b=` value is checked against
//! the selector's published key (RSA-SHA256/RSA-SHA1 via PKCS#1 v1.5,
//! Ed25519 over the SHA-256 header digest).

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::{pkcs8::DecodePublicKey, signature::Verifier, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use zetian_common::{Envelope, FilterAction, SessionInfo, Verdict};

use crate::{
    resolver::{LookupError, RecordSource},
    Scorer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkimResult {
    Pass,
    Fail,
    /// Structural or policy problems: unsupported algorithm, required
    /// headers unsigned, expired signature.
    Policy,
    TempError,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Canonicalization {
    Simple,
    Relaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    RsaSha256,
    RsaSha1,
    Ed25519Sha256,
}

/// Parsed `DKIM-Signature` header.
#[derive(Debug, Clone)]
pub(crate) struct Signature {
    algorithm: Algorithm,
    header_canon: Canonicalization,
    body_canon: Canonicalization,
    pub(crate) domain: String,
    pub(crate) selector: String,
    body_hash: Vec<u8>,
    signature: Vec<u8>,
    signed_headers: Vec<String>,
    body_length: Option<usize>,
    expires: Option<u64>,
    /// The raw header value with the b= value blanked, needed for the
    /// header hash.
    raw_value_unsigned: String,
}

impl Signature {
    pub(crate) fn parse(value: &str) -> Result<Self, String> {
        let mut version = None;
        let mut algorithm = None;
        let mut header_canon = Canonicalization::Simple;
        let mut body_canon = Canonicalization::Simple;
        let mut domain = None;
        let mut selector = None;
        let mut body_hash = None;
        let mut signature = None;
        let mut signed_headers = None;
        let mut body_length = None;
        let mut expires = None;

        for tag in value.split(';') {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            let Some((key, val)) = tag.split_once('=') else {
                return Err(format!("Malformed tag: {tag}"));
            };
            let key = key.trim();
            let val = val.trim();

            match key {
                "v" => version = Some(val.to_string()),
                "a" => {
                    algorithm = Some(match val.to_ascii_lowercase().as_str() {
                        "rsa-sha256" => Algorithm::RsaSha256,
                        "rsa-sha1" => Algorithm::RsaSha1,
                        "ed25519-sha256" => Algorithm::Ed25519Sha256,
                        other => return Err(format!("Unsupported algorithm: {other}")),
                    });
                }
                "c" => {
                    let (header, body) = val.split_once('/').unwrap_or((val, "simple"));
                    header_canon = parse_canon(header)?;
                    body_canon = parse_canon(body)?;
                }
                "d" => domain = Some(val.to_ascii_lowercase()),
                "s" => selector = Some(val.to_string()),
                "bh" => {
                    body_hash = Some(
                        BASE64
                            .decode(strip_ws(val))
                            .map_err(|e| format!("Bad bh=: {e}"))?,
                    );
                }
                "b" => {
                    signature = Some(
                        BASE64
                            .decode(strip_ws(val))
                            .map_err(|e| format!("Bad b=: {e}"))?,
                    );
                }
                "h" => {
                    signed_headers = Some(
                        val.split(':')
                            .map(|h| h.trim().to_ascii_lowercase())
                            .filter(|h| !h.is_empty())
                            .collect::<Vec<_>>(),
                    );
                }
                "l" => body_length = val.parse::<usize>().ok(),
                "x" => expires = val.parse::<u64>().ok(),
                // i=, t=, q=, z= and unknown tags are tolerated
                _ => {}
            }
        }

        if version.as_deref() != Some("1") {
            return Err("Unsupported DKIM version".to_string());
        }

        Ok(Self {
            algorithm: algorithm.ok_or("Missing a= tag")?,
            header_canon,
            body_canon,
            domain: domain.ok_or("Missing d= tag")?,
            selector: selector.ok_or("Missing s= tag")?,
            body_hash: body_hash.ok_or("Missing bh= tag")?,
            signature: signature.ok_or("Missing b= tag")?,
            signed_headers: signed_headers.ok_or("Missing h= tag")?,
            body_length,
            expires,
            raw_value_unsigned: blank_b_tag(value),
        })
    }
}

fn parse_canon(name: &str) -> Result<Canonicalization, String> {
    match name.trim().to_ascii_lowercase().as_str() {
        "simple" => Ok(Canonicalization::Simple),
        "relaxed" => Ok(Canonicalization::Relaxed),
        other => Err(format!("Unknown canonicalization: {other}")),
    }
}

fn strip_ws(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Empty the b= tag value while keeping everything else byte-for-byte.
fn blank_b_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (index, tag) in value.split(';').enumerate() {
        if index > 0 {
            out.push(';');
        }
        let trimmed = tag.trim_start();
        if trimmed.len() >= 2
            && trimmed[..2].eq_ignore_ascii_case("b=")
        {
            // Preserve leading whitespace and the key, drop the value
            let key_at = tag.len() - trimmed.len();
            out.push_str(&tag[..key_at + 2]);
        } else {
            out.push_str(tag);
        }
    }
    out
}

/// Raw header fields of a message: `(lowercased name, raw field bytes
/// without trailing CRLF, unfolded value)` plus the body offset.
fn split_message(raw: &[u8]) -> (Vec<(String, Vec<u8>)>, usize) {
    let mut fields: Vec<(String, Vec<u8>)> = Vec::new();
    let mut pos = 0;

    while pos < raw.len() {
        let line_end = raw[pos..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map_or(raw.len(), |p| pos + p);

        let line = &raw[pos..line_end];
        let next = line_end + 2;

        if line.is_empty() {
            // Blank line: body starts after it
            return (fields, next.min(raw.len()));
        }

        if (line.starts_with(b" ") || line.starts_with(b"\t")) && !fields.is_empty() {
            // Folded continuation belongs to the previous field
            if let Some((_, field)) = fields.last_mut() {
                field.extend_from_slice(b"\r\n");
                field.extend_from_slice(line);
            }
        } else {
            let name = line
                .split(|&b| b == b':')
                .next()
                .map(|n| String::from_utf8_lossy(n).trim().to_ascii_lowercase())
                .unwrap_or_default();
            fields.push((name, line.to_vec()));
        }

        pos = next;
    }

    (fields, raw.len())
}

fn canonicalize_header(field: &[u8], canon: Canonicalization) -> Vec<u8> {
    match canon {
        Canonicalization::Simple => {
            let mut out = field.to_vec();
            out.extend_from_slice(b"\r\n");
            out
        }
        Canonicalization::Relaxed => {
            let text = String::from_utf8_lossy(field);
            let (name, value) = text.split_once(':').unwrap_or((text.as_ref(), ""));

            let mut out = name.trim().to_ascii_lowercase().into_bytes();
            out.push(b':');

            // Unfold and collapse WSP runs to a single space
            let mut collapsed = String::with_capacity(value.len());
            let mut in_ws = false;
            for c in value.replace("\r\n", " ").chars() {
                if c == ' ' || c == '\t' {
                    in_ws = true;
                } else {
                    if in_ws && !collapsed.is_empty() {
                        collapsed.push(' ');
                    }
                    in_ws = false;
                    collapsed.push(c);
                }
            }
            out.extend_from_slice(collapsed.as_bytes());
            out.extend_from_slice(b"\r\n");
            out
        }
    }
}

fn canonicalize_body(body: &[u8], canon: Canonicalization) -> Vec<u8> {
    let mut lines: Vec<Vec<u8>> = Vec::new();
    for line in body.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        lines.push(line.to_vec());
    }
    // A trailing CRLF produces one empty trailing element; drop it so it
    // is not counted as an empty line
    if body.ends_with(b"\n") {
        lines.pop();
    }

    if canon == Canonicalization::Relaxed {
        for line in &mut lines {
            let text = String::from_utf8_lossy(line);
            let mut collapsed = String::with_capacity(text.len());
            let mut in_ws = false;
            for c in text.chars() {
                if c == ' ' || c == '\t' {
                    in_ws = true;
                } else {
                    if in_ws && !collapsed.is_empty() {
                        collapsed.push(' ');
                    }
                    in_ws = false;
                    collapsed.push(c);
                }
            }
            *line = collapsed.into_bytes();
        }
    }

    // Strip trailing empty lines
    while lines.last().is_some_and(std::vec::Vec::is_empty) {
        lines.pop();
    }

    let mut out = Vec::with_capacity(body.len());
    for line in &lines {
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }

    if out.is_empty() && canon == Canonicalization::Simple {
        out.extend_from_slice(b"\r\n");
    }

    out
}

/// The exact bytes the signature covers: the signed headers selected
/// bottom-up, then the unsigned DKIM-Signature field itself.
pub(crate) fn header_hash_input(
    fields: &[(String, Vec<u8>)],
    signature: &Signature,
    dkim_field_raw: &[u8],
) -> Vec<u8> {
    let mut input = Vec::new();
    let mut used = vec![false; fields.len()];

    for name in &signature.signed_headers {
        // RFC 6376 5.4.2: occurrences are consumed from the bottom up
        let found = fields
            .iter()
            .enumerate()
            .rev()
            .find(|(index, (field_name, _))| field_name == name && !used[*index]);
        if let Some((index, (_, field))) = found {
            used[index] = true;
            input.extend_from_slice(&canonicalize_header(field, signature.header_canon));
        }
        // A signed-but-absent header contributes nothing (it still
        // protects against later insertion)
    }

    // The DKIM-Signature itself, b= blanked, no trailing CRLF
    let name_prefix_len = dkim_field_raw
        .iter()
        .position(|&b| b == b':')
        .map_or(dkim_field_raw.len(), |p| p + 1);
    let mut unsigned_field = dkim_field_raw[..name_prefix_len].to_vec();
    unsigned_field.extend_from_slice(signature.raw_value_unsigned.as_bytes());

    let mut canonical = canonicalize_header(&unsigned_field, signature.header_canon);
    if canonical.ends_with(b"\r\n") {
        canonical.truncate(canonical.len() - 2);
    }
    input.extend_from_slice(&canonical);
    input
}

fn verify_signature_bytes(
    algorithm: Algorithm,
    key_bytes: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), ()> {
    match algorithm {
        Algorithm::RsaSha256 => {
            let key = RsaPublicKey::from_public_key_der(key_bytes).map_err(|_| ())?;
            let verifying = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key);
            let signature = rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| ())?;
            verifying.verify(message, &signature).map_err(|_| ())
        }
        Algorithm::RsaSha1 => {
            let key = RsaPublicKey::from_public_key_der(key_bytes).map_err(|_| ())?;
            let verifying = rsa::pkcs1v15::VerifyingKey::<Sha1>::new(key);
            let signature = rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| ())?;
            verifying.verify(message, &signature).map_err(|_| ())
        }
        Algorithm::Ed25519Sha256 => {
            // RFC 8463: Ed25519 signs the SHA-256 digest of the header
            // hash input
            let digest = Sha256::digest(message);
            ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, key_bytes)
                .verify(&digest, signature)
                .map_err(|_| ())
        }
    }
}

/// Outcome for one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureVerification {
    pub domain: String,
    pub selector: String,
    pub result: DkimResult,
}

/// Verify every `DKIM-Signature` on a raw message.
pub async fn verify_message(
    source: &dyn RecordSource,
    raw: &[u8],
    strict: bool,
    now_epoch: u64,
) -> Vec<SignatureVerification> {
    let (fields, body_start) = split_message(raw);
    let body = &raw[body_start..];

    let mut results = Vec::new();

    for (name, field) in &fields {
        if name != "dkim-signature" {
            continue;
        }

        let value_start = field.iter().position(|&b| b == b':').map_or(0, |p| p + 1);
        let value = String::from_utf8_lossy(&field[value_start..]).into_owned();

        let signature = match Signature::parse(&value) {
            Ok(signature) => signature,
            Err(reason) => {
                tracing::debug!("Unverifiable DKIM signature: {reason}");
                results.push(SignatureVerification {
                    domain: String::new(),
                    selector: String::new(),
                    result: DkimResult::Policy,
                });
                continue;
            }
        };

        let result =
            verify_one(source, &signature, &fields, field, body, strict, now_epoch).await;
        results.push(SignatureVerification {
            domain: signature.domain.clone(),
            selector: signature.selector.clone(),
            result,
        });
    }

    results
}

async fn verify_one(
    source: &dyn RecordSource,
    signature: &Signature,
    fields: &[(String, Vec<u8>)],
    dkim_field: &[u8],
    body: &[u8],
    strict: bool,
    now_epoch: u64,
) -> DkimResult {
    // Required signed headers
    let required: &[&str] = if strict {
        &["from", "to", "subject", "date"]
    } else {
        &["from"]
    };
    for header in required {
        if !signature.signed_headers.iter().any(|h| h == header) {
            return DkimResult::Policy;
        }
    }

    if let Some(expires) = signature.expires {
        if expires < now_epoch {
            return DkimResult::Policy;
        }
    }

    // Body hash
    let mut canonical_body = canonicalize_body(body, signature.body_canon);
    if let Some(length) = signature.body_length {
        canonical_body.truncate(length);
    }
    let computed: Vec<u8> = match signature.algorithm {
        Algorithm::RsaSha1 => sha1::Sha1::digest(&canonical_body).to_vec(),
        Algorithm::RsaSha256 | Algorithm::Ed25519Sha256 => {
            Sha256::digest(&canonical_body).to_vec()
        }
    };
    if computed != signature.body_hash {
        return DkimResult::Fail;
    }

    // Selector key
    let key_name = format!("{}._domainkey.{}", signature.selector, signature.domain);
    let records = match source.txt(&key_name).await {
        Ok(records) => records,
        Err(LookupError::NotFound(_)) => return DkimResult::Fail,
        Err(LookupError::Temporary(_)) => return DkimResult::TempError,
    };

    let Some(key_bytes) = extract_public_key(&records) else {
        return DkimResult::Fail;
    };

    let input = header_hash_input(fields, signature, dkim_field);
    if verify_signature_bytes(
        signature.algorithm,
        &key_bytes,
        &input,
        &signature.signature,
    )
    .is_ok()
    {
        DkimResult::Pass
    } else {
        DkimResult::Fail
    }
}

/// Pull `p=` out of a selector TXT record. An empty p= is a revoked key.
fn extract_public_key(records: &[String]) -> Option<Vec<u8>> {
    for record in records {
        let mut key = None;
        for tag in record.split(';') {
            let tag = tag.trim();
            if let Some(value) = tag.strip_prefix("p=") {
                key = BASE64.decode(strip_ws(value)).ok().filter(|k| !k.is_empty());
            }
        }
        if key.is_some() {
            return key;
        }
    }
    None
}

/// DKIM as a pipeline scorer: Pass if any signature verifies.
pub struct DkimScorer {
    source: std::sync::Arc<dyn RecordSource>,
    strict: bool,
    fail_score: f64,
    pass_score: f64,
}

impl DkimScorer {
    #[must_use]
    pub fn new(source: std::sync::Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            strict: false,
            fail_score: 3.0,
            pass_score: -1.0,
        }
    }

    #[must_use]
    pub const fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

#[async_trait]
impl Scorer for DkimScorer {
    fn name(&self) -> &'static str {
        "dkim"
    }

    async fn check(&self, _envelope: &Envelope, body: &[u8], _session: &SessionInfo) -> Verdict {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let verifications = verify_message(self.source.as_ref(), body, self.strict, now).await;

        let overall = if verifications.is_empty() {
            DkimResult::None
        } else if verifications.iter().any(|v| v.result == DkimResult::Pass) {
            DkimResult::Pass
        } else if verifications
            .iter()
            .any(|v| v.result == DkimResult::TempError)
        {
            DkimResult::TempError
        } else if verifications.iter().all(|v| v.result == DkimResult::Policy) {
            DkimResult::Policy
        } else {
            DkimResult::Fail
        };

        let score = match overall {
            DkimResult::Pass => self.pass_score,
            DkimResult::Fail => self.fail_score,
            DkimResult::Policy => self.fail_score / 2.0,
            DkimResult::TempError | DkimResult::None => 0.0,
        };

        Verdict {
            score,
            is_spam: matches!(overall, DkimResult::Fail),
            reason: format!("DKIM {overall:?}"),
            checker: "dkim".to_string(),
            action: FilterAction::None,
        }
    }
}
