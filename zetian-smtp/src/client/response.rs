//! Parsed server responses, multi-line form included.

use super::error::{ClientError, Result};

/// One complete SMTP response: the code plus every text line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    lines: Vec<String>,
}

impl Response {
    /// Parse a full response from `text`, which must contain the final
    /// (space-separated) line. Returns the response and how many bytes
    /// were consumed.
    pub fn parse(text: &str) -> Result<Option<(Self, usize)>> {
        let mut lines = Vec::new();
        let mut code: Option<u16> = None;
        let mut consumed = 0;

        for line in text.split_inclusive("\r\n") {
            if !line.ends_with("\r\n") {
                // Partial line; wait for more bytes
                return Ok(None);
            }

            let stripped = &line[..line.len() - 2];
            if stripped.len() < 3 {
                return Err(ClientError::ParseError(format!("Short line: {stripped}")));
            }

            let this_code = stripped[..3]
                .parse::<u16>()
                .map_err(|_| ClientError::ParseError(format!("Bad status code: {stripped}")))?;

            if let Some(expected) = code {
                if this_code != expected {
                    return Err(ClientError::ParseError(format!(
                        "Mixed status codes in response: {expected} then {this_code}"
                    )));
                }
            } else {
                code = Some(this_code);
            }

            consumed += line.len();
            let (sep, rest) = stripped
                .get(3..4)
                .map_or((" ", ""), |s| (s, stripped.get(4..).unwrap_or("")));
            lines.push(rest.to_string());

            match sep {
                "-" => {}
                _ => {
                    // Space (or bare code): final line
                    return Ok(Some((
                        Self {
                            code: code.unwrap_or(0),
                            lines,
                        },
                        consumed,
                    )));
                }
            }
        }

        Ok(None)
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// All text lines joined with newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Whether an EHLO response advertises `keyword`.
    #[must_use]
    pub fn has_capability(&self, keyword: &str) -> bool {
        self.lines.iter().any(|line| {
            let mut parts = line.split_whitespace();
            parts
                .next()
                .is_some_and(|first| first.eq_ignore_ascii_case(keyword))
        })
    }
}
