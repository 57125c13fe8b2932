//! Message header collection.
//!
//! Preserves insertion order, duplicate fields, and the case of the first
//! occurrence of each name, while lookups are case-insensitive. The
//! envelope carries these so scorers can inspect DKIM signatures, the
//! subject line, and friends without re-parsing the stored body.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Parse the header section of a raw message.
    ///
    /// Stops at the first empty line. Continuation lines (leading SP or
    /// HTAB) are folded into the preceding field with a single space.
    /// Malformed lines without a colon are skipped rather than failing
    /// the whole message.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let mut entries: Vec<(String, String)> = Vec::new();

        for line in split_header_lines(raw) {
            if line.is_empty() {
                break;
            }

            if line.starts_with(b" ") || line.starts_with(b"\t") {
                if let Some((_, value)) = entries.last_mut() {
                    value.push(' ');
                    value.push_str(String::from_utf8_lossy(line).trim());
                }
                continue;
            }

            let text = String::from_utf8_lossy(line);
            if let Some((name, value)) = text.split_once(':') {
                entries.push((name.trim().to_string(), value.trim().to_string()));
            }
        }

        Self { entries }
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Insert at the front, the way trace and `X-Spam-*` fields are added.
    pub fn prepend(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(0, (name.into(), value.into()));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Render back to wire form, one CRLF-terminated field per entry.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.entries {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

/// Split on CRLF or bare LF without consuming continuation markers.
fn split_header_lines(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    raw.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}
