use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use zetian_common::address::Address;

#[derive(PartialEq, Eq, Hash, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl HeloVariant {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Ehlo(name) | Self::Helo(name) => name,
        }
    }
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ehlo(_) => "EHLO",
            Self::Helo(_) => "HELO",
        })
    }
}

/// ESMTP parameters accepted on MAIL FROM (RFC 1870, RFC 6152, RFC 4954,
/// RFC 6531).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailParameters {
    /// Declared message size in bytes (`SIZE=`).
    pub size: Option<usize>,
    /// `BODY=7BIT`, `BODY=8BITMIME` or `BODY=BINARYMIME`.
    pub body: Option<String>,
    /// `AUTH=<mailbox>` supplied by a trusted relay.
    pub auth: Option<String>,
    /// The client asked for SMTPUTF8 handling.
    pub smtputf8: bool,
}

impl MailParameters {
    /// Parse the whitespace-separated parameter list after the path.
    ///
    /// Duplicate parameters are rejected; unknown ones are an error so a
    /// client never silently loses an extension it asked for.
    pub fn parse(params: &str) -> Result<Self, String> {
        let mut out = Self::default();

        for param in params.split_whitespace() {
            let (key, value) = param
                .split_once('=')
                .map_or((param, None), |(k, v)| (k, Some(v)));

            if key.eq_ignore_ascii_case("SIZE") {
                if out.size.is_some() {
                    return Err("Duplicate SIZE parameter not allowed".to_string());
                }
                let value = value.ok_or_else(|| "SIZE requires a value".to_string())?;
                let size = value
                    .parse::<usize>()
                    .map_err(|_| format!("Invalid SIZE value: {value}"))?;
                // RFC 1870: zero means "no declared size", so drop it
                out.size = if size == 0 { None } else { Some(size) };
            } else if key.eq_ignore_ascii_case("BODY") {
                if out.body.is_some() {
                    return Err("Duplicate BODY parameter not allowed".to_string());
                }
                let value = value.ok_or_else(|| "BODY requires a value".to_string())?;
                match value.to_ascii_uppercase().as_str() {
                    kind @ ("7BIT" | "8BITMIME" | "BINARYMIME") => {
                        out.body = Some(kind.to_string());
                    }
                    other => return Err(format!("Unknown BODY type: {other}")),
                }
            } else if key.eq_ignore_ascii_case("AUTH") {
                if out.auth.is_some() {
                    return Err("Duplicate AUTH parameter not allowed".to_string());
                }
                out.auth = Some(value.unwrap_or_default().to_string());
            } else if key.eq_ignore_ascii_case("SMTPUTF8") {
                if out.smtputf8 {
                    return Err("Duplicate SMTPUTF8 parameter not allowed".to_string());
                }
                out.smtputf8 = true;
            } else {
                return Err(format!("Unrecognized parameter: {key}"));
            }
        }

        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null sender (`MAIL FROM:<>`), the reverse path of
    /// bounces per RFC 5321.
    MailFrom(Option<Address>, MailParameters),
    RcptTo(Address),
    Data,
    Bdat {
        size: usize,
        last: bool,
    },
    Rset,
    Noop,
    Quit,
    Vrfy(String),
    Help,
    StartTls,
    Auth {
        mechanism: String,
        initial: Option<String>,
    },
    Invalid(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => write!(fmt, "{v} {}", v.name()),
            Self::MailFrom(None, _) => fmt.write_str("MAIL FROM:<>"),
            Self::MailFrom(Some(addr), _) => write!(fmt, "MAIL FROM:{addr}"),
            Self::RcptTo(addr) => write!(fmt, "RCPT TO:{addr}"),
            Self::Data => fmt.write_str("DATA"),
            Self::Bdat { size, last } => {
                if *last {
                    write!(fmt, "BDAT {size} LAST")
                } else {
                    write!(fmt, "BDAT {size}")
                }
            }
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::Vrfy(who) => write!(fmt, "VRFY {who}"),
            Self::Help => fmt.write_str("HELP"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

impl Command {
    /// Parse one command line (without its CRLF).
    ///
    /// `allow_utf8` reflects whether SMTPUTF8 was advertised; without it,
    /// non-ASCII path arguments are invalid.
    #[must_use]
    pub fn parse(line: &str, allow_utf8: bool) -> Self {
        let upper = line.to_ascii_uppercase();
        let upper = upper.trim();

        if let Some(rest) = strip_verb_prefix(line, "MAIL FROM:") {
            return Self::parse_mail_from(rest, allow_utf8, line);
        }

        if let Some(rest) = strip_verb_prefix(line, "RCPT TO:") {
            let (path, params) = split_path_and_params(rest);
            if !params.trim().is_empty() {
                return Self::Invalid(format!("Unexpected RCPT parameters: {params}"));
            }
            return match Address::parse_with_policy(path, allow_utf8) {
                Ok(addr) => Self::RcptTo(addr),
                Err(e) => Self::Invalid(e.to_string()),
            };
        }

        if upper.starts_with("EHLO") || upper.starts_with("HELO") {
            return match line.trim().split_once(' ') {
                None => Self::Invalid(format!("Expected hostname in {upper}")),
                Some((verb, host)) if verb.eq_ignore_ascii_case("EHLO") => {
                    Self::Helo(HeloVariant::Ehlo(host.trim().to_string()))
                }
                Some((_, host)) => Self::Helo(HeloVariant::Helo(host.trim().to_string())),
            };
        }

        if upper.starts_with("BDAT") {
            return Self::parse_bdat(line);
        }

        if upper.starts_with("AUTH") {
            let mut parts = line.trim().split_whitespace();
            let _verb = parts.next();
            let Some(mechanism) = parts.next() else {
                return Self::Invalid("AUTH requires a mechanism".to_string());
            };
            let initial = parts.next().map(str::to_string);
            if parts.next().is_some() {
                return Self::Invalid("Too many AUTH arguments".to_string());
            }
            return Self::Auth {
                mechanism: mechanism.to_ascii_uppercase(),
                initial,
            };
        }

        if upper.starts_with("VRFY") {
            return line.trim().split_once(' ').map_or_else(
                || Self::Invalid("VRFY requires an argument".to_string()),
                |(_, who)| Self::Vrfy(who.trim().to_string()),
            );
        }

        // NOOP may carry an ignored string argument (RFC 5321 4.1.1.9)
        if upper == "NOOP" || upper.starts_with("NOOP ") {
            return Self::Noop;
        }

        match upper {
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            "HELP" => Self::Help,
            "STARTTLS" => Self::StartTls,
            _ => Self::Invalid(line.trim().to_string()),
        }
    }

    fn parse_mail_from(rest: &str, allow_utf8: bool, original: &str) -> Self {
        let (path, params) = split_path_and_params(rest);

        let params = match MailParameters::parse(params) {
            Ok(params) => params,
            Err(e) => return Self::Invalid(e),
        };

        // UTF-8 paths require both the advertisement and the client
        // passing SMTPUTF8 on this MAIL command
        let allow_utf8 = allow_utf8 && params.smtputf8;

        if path == "<>" {
            return Self::MailFrom(None, params);
        }

        if path.is_empty() {
            return Self::Invalid(format!("Missing reverse path in {original}"));
        }

        match Address::parse_with_policy(path, allow_utf8) {
            Ok(addr) => Self::MailFrom(Some(addr), params),
            Err(e) => Self::Invalid(e.to_string()),
        }
    }

    fn parse_bdat(line: &str) -> Self {
        let mut parts = line.trim().split_whitespace();
        let _verb = parts.next();
        let Some(size) = parts.next() else {
            return Self::Invalid("BDAT requires a chunk size".to_string());
        };
        let Ok(size) = size.parse::<usize>() else {
            return Self::Invalid(format!("Invalid BDAT chunk size: {size}"));
        };
        let last = match parts.next() {
            None => false,
            Some(word) if word.eq_ignore_ascii_case("LAST") => true,
            Some(other) => return Self::Invalid(format!("Unexpected BDAT argument: {other}")),
        };
        if parts.next().is_some() {
            return Self::Invalid("Too many BDAT arguments".to_string());
        }
        Self::Bdat { size, last }
    }
}

/// Case-insensitive verb prefix strip that returns the argument slice of
/// the original (case-preserved) line.
fn strip_verb_prefix<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    if trimmed.len() >= prefix.len() && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(trimmed[prefix.len()..].trim())
    } else {
        None
    }
}

/// Split `<path> [params...]` keeping the path intact.
fn split_path_and_params(rest: &str) -> (&str, &str) {
    let rest = rest.trim();
    rest.split_once(char::is_whitespace)
        .map_or((rest, ""), |(path, params)| (path, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Idea copied from
    // https://gitlab.com/erichdongubler-experiments/rust_case_permutations
    fn string_casing(string: &str) -> impl Iterator<Item = String> + '_ {
        let len = string.len();
        let num_cases = usize::pow(2, u32::try_from(len).unwrap_or(0));

        (0..num_cases).map(move |i| {
            string
                .chars()
                .enumerate()
                .map(|(idx, c)| {
                    if (i >> idx) & 1 == 0 {
                        c.to_ascii_lowercase()
                    } else {
                        c.to_ascii_uppercase()
                    }
                })
                .collect()
        })
    }

    #[test]
    fn mail_from_variants() {
        assert!(matches!(
            Command::parse("MAIL FROM:<test@example.com>", false),
            Command::MailFrom(Some(_), _)
        ));

        assert_eq!(
            Command::parse("MAIL FROM:<>", false),
            Command::MailFrom(None, MailParameters::default())
        );

        assert!(matches!(
            Command::parse("MAIL FROM:", false),
            Command::Invalid(_)
        ));

        for verb in string_casing("mail from") {
            assert!(matches!(
                Command::parse(&format!("{verb}:<test@example.com>"), false),
                Command::MailFrom(Some(_), _)
            ));
        }
    }

    #[test]
    fn mail_parameters() {
        let cmd = Command::parse("MAIL FROM:<a@b.example> SIZE=12345", false);
        let Command::MailFrom(Some(_), params) = cmd else {
            panic!("expected MailFrom, got {cmd:?}");
        };
        assert_eq!(params.size, Some(12345));

        // SIZE=0 means undeclared
        let cmd = Command::parse("MAIL FROM:<a@b.example> SIZE=0", false);
        let Command::MailFrom(_, params) = cmd else {
            panic!("expected MailFrom");
        };
        assert_eq!(params.size, None);

        // Duplicates rejected
        assert!(matches!(
            Command::parse("MAIL FROM:<a@b.example> SIZE=1 SIZE=2", false),
            Command::Invalid(_)
        ));

        // BODY and SMTPUTF8
        let cmd = Command::parse("MAIL FROM:<a@b.example> BODY=8BITMIME SMTPUTF8", true);
        let Command::MailFrom(_, params) = cmd else {
            panic!("expected MailFrom");
        };
        assert_eq!(params.body.as_deref(), Some("8BITMIME"));
        assert!(params.smtputf8);

        // Unknown parameters are errors, not silently dropped
        assert!(matches!(
            Command::parse("MAIL FROM:<a@b.example> RET=FULL", false),
            Command::Invalid(_)
        ));
    }

    #[test]
    fn utf8_addresses_gated_on_smtputf8() {
        assert!(matches!(
            Command::parse("MAIL FROM:<ü@example.com>", false),
            Command::Invalid(_)
        ));
        assert!(matches!(
            Command::parse("MAIL FROM:<ü@example.com> SMTPUTF8", true),
            Command::MailFrom(Some(_), _)
        ));
    }

    #[test]
    fn rcpt_to() {
        assert!(matches!(
            Command::parse("RCPT TO:<u@example.com>", false),
            Command::RcptTo(_)
        ));
        assert!(matches!(
            Command::parse("RCPT TO:", false),
            Command::Invalid(_)
        ));

        for verb in string_casing("rcpt to") {
            assert!(matches!(
                Command::parse(&format!("{verb}:<u@example.com>"), false),
                Command::RcptTo(_)
            ));
        }
    }

    #[test]
    fn helo_and_ehlo() {
        assert!(matches!(
            Command::parse("EHLO", false),
            Command::Invalid(_)
        ));

        assert_eq!(
            Command::parse("EHLO client.example.com", false),
            Command::Helo(HeloVariant::Ehlo("client.example.com".to_string()))
        );
        assert_eq!(
            Command::parse("HELO client.example.com", false),
            Command::Helo(HeloVariant::Helo("client.example.com".to_string()))
        );
    }

    #[test]
    fn bdat() {
        assert_eq!(
            Command::parse("BDAT 1000", false),
            Command::Bdat {
                size: 1000,
                last: false
            }
        );
        assert_eq!(
            Command::parse("BDAT 0 LAST", false),
            Command::Bdat {
                size: 0,
                last: true
            }
        );
        assert!(matches!(
            Command::parse("BDAT notanumber", false),
            Command::Invalid(_)
        ));
        assert!(matches!(
            Command::parse("BDAT 10 NOTLAST", false),
            Command::Invalid(_)
        ));
    }

    #[test]
    fn auth() {
        assert_eq!(
            Command::parse("AUTH PLAIN", false),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: None
            }
        );
        assert_eq!(
            Command::parse("auth login dXNlcg==", false),
            Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial: Some("dXNlcg==".to_string())
            }
        );
        assert!(matches!(
            Command::parse("AUTH", false),
            Command::Invalid(_)
        ));
    }

    #[test]
    fn bare_verbs() {
        for (line, expected) in [
            ("DATA", Command::Data),
            ("QUIT", Command::Quit),
            ("RSET", Command::Rset),
            ("NOOP", Command::Noop),
            ("HELP", Command::Help),
            ("STARTTLS", Command::StartTls),
        ] {
            for permuted in string_casing(line) {
                assert_eq!(Command::parse(&permuted, false), expected);
            }
        }
    }

    #[test]
    fn unknown_is_invalid() {
        assert!(matches!(
            Command::parse("FROB something", false),
            Command::Invalid(_)
        ));
    }
}
