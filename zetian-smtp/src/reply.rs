//! Server reply rendering.
//!
//! Multi-line replies use the `xxx-text` continuation form; the final
//! line always uses the `xxx text` space separator.

use core::fmt::{self, Display, Formatter};

use zetian_common::Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    #[must_use]
    pub fn new(status: Status, text: impl Into<String>) -> Self {
        Self {
            code: status.into(),
            lines: vec![text.into()],
        }
    }

    #[must_use]
    pub fn with_code(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// A multi-line reply; `lines` must be non-empty, which all call
    /// sites guarantee statically (EHLO always has the banner line).
    #[must_use]
    pub fn multiline(status: Status, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty());
        Self {
            code: status.into(),
            lines,
        }
    }

    #[must_use]
    pub const fn code(&self) -> u16 {
        self.code
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.code >= 400
    }

    /// Render to wire bytes, CRLF included on every line.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (index, line) in self.lines.iter().enumerate() {
            let sep = if index == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{}\r\n", self.code));
        }
        out
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_wire().trim_end_matches("\r\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_uses_space() {
        let reply = Reply::new(Status::Ok, "Queued");
        assert_eq!(reply.to_wire(), "250 Queued\r\n");
    }

    #[test]
    fn multiline_continuation() {
        let reply = Reply::multiline(
            Status::Ok,
            vec![
                "mail.example.com".to_string(),
                "PIPELINING".to_string(),
                "SIZE 1000".to_string(),
            ],
        );
        assert_eq!(
            reply.to_wire(),
            "250-mail.example.com\r\n250-PIPELINING\r\n250 SIZE 1000\r\n"
        );
    }

    #[test]
    fn last_line_always_space_separated() {
        let reply = Reply::multiline(Status::Ok, vec!["only".to_string()]);
        assert_eq!(reply.to_wire(), "250 only\r\n");
    }
}
