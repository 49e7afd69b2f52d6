//! SMTP reply parsing.
//!
//! Replies may span multiple lines: a 3-digit code followed by `-` continues,
//! `' '` (or nothing) ends the reply. Lines are kept verbatim (CRLF stripped)
//! so failure diagnostics can reproduce exactly what the server said.

use originator_common::EnhancedStatus;

/// A complete (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// The 3-digit status code.
    pub code: u16,
    /// Raw reply lines, verbatim, CRLF stripped.
    pub lines: Vec<String>,
}

/// Parse failure for a reply buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyParseError {
    #[error("reply line too short: '{0}'")]
    TooShort(String),
    #[error("invalid status code: '{0}'")]
    BadCode(String),
    #[error("invalid separator after status code: '{0}'")]
    BadSeparator(char),
    #[error("status code changed mid-reply: expected {expected}, got {got}")]
    CodeMismatch { expected: u16, got: u16 },
    #[error("reply is not valid UTF-8")]
    NotUtf8,
}

struct ParsedLine<'a> {
    code: u16,
    is_last: bool,
    text: &'a str,
}

fn parse_line(line: &str) -> Result<ParsedLine<'_>, ReplyParseError> {
    if line.len() < 3 {
        return Err(ReplyParseError::TooShort(line.to_string()));
    }
    let code = line[..3]
        .parse::<u16>()
        .map_err(|_| ReplyParseError::BadCode(line[..3].to_string()))?;

    let (is_last, text) = match line.as_bytes().get(3) {
        None => (true, ""),
        Some(b' ') => (true, &line[4..]),
        Some(b'-') => (false, &line[4..]),
        Some(_) => {
            let c = line[3..].chars().next().unwrap_or('?');
            return Err(ReplyParseError::BadSeparator(c));
        }
    };
    Ok(ParsedLine {
        code,
        is_last,
        text,
    })
}

impl Reply {
    /// Try to parse one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// more data is needed.
    pub fn parse(buffer: &[u8]) -> Result<Option<(Self, usize)>, ReplyParseError> {
        let text = std::str::from_utf8(buffer).map_err(|_| ReplyParseError::NotUtf8)?;

        let mut lines = Vec::new();
        let mut consumed = 0;
        let mut code = None;

        loop {
            let rest = &text[consumed..];
            let Some(nl) = rest.find('\n') else {
                return Ok(None); // incomplete final line
            };
            let raw = rest[..nl].trim_end_matches('\r');
            consumed += nl + 1;

            let parsed = parse_line(raw)?;
            match code {
                None => code = Some(parsed.code),
                Some(expected) if expected != parsed.code => {
                    return Err(ReplyParseError::CodeMismatch {
                        expected,
                        got: parsed.code,
                    });
                }
                Some(_) => {}
            }
            lines.push(raw.to_string());

            if parsed.is_last {
                return Ok(Some((
                    Self {
                        code: code.unwrap_or_default(),
                        lines,
                    },
                    consumed,
                )));
            }
        }
    }

    /// The text portions of each line (code and separator stripped).
    #[must_use]
    pub fn texts(&self) -> Vec<&str> {
        self.lines
            .iter()
            .map(|l| {
                if l.len() > 4 {
                    &l[4..]
                } else {
                    ""
                }
            })
            .collect()
    }

    /// First line's text, for one-line diagnostics.
    #[must_use]
    pub fn first_text(&self) -> &str {
        self.lines
            .first()
            .map(|l| if l.len() > 4 { &l[4..] } else { "" })
            .unwrap_or("")
    }

    /// Enhanced status code from the first line, if present.
    #[must_use]
    pub fn enhanced_status(&self) -> EnhancedStatus {
        EnhancedStatus::parse_prefix(self.first_text()).unwrap_or_default()
    }

    #[must_use]
    pub const fn is_positive_completion(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    #[must_use]
    pub const fn is_positive_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    #[must_use]
    pub const fn is_transient_failure(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    #[must_use]
    pub const fn is_permanent_failure(&self) -> bool {
        self.code >= 500 && self.code < 600
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.lines.first() {
            Some(first) => f.write_str(first),
            None => write!(f, "{}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_line_reply() {
        let (reply, consumed) = Reply::parse(b"220 mail.example.test ESMTP\r\n")
            .expect("parse")
            .expect("complete");
        assert_eq!(reply.code, 220);
        assert_eq!(reply.lines, vec!["220 mail.example.test ESMTP"]);
        assert_eq!(consumed, 29);
    }

    #[test]
    fn parses_multi_line_reply() {
        let data = b"250-mail.example.test\r\n250-STARTTLS\r\n250 SIZE 35882577\r\n";
        let (reply, consumed) = Reply::parse(data).expect("parse").expect("complete");
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.texts(), vec!["mail.example.test", "STARTTLS", "SIZE 35882577"]);
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn incomplete_reply_needs_more_data() {
        assert_eq!(Reply::parse(b"250-mail.example.test\r\n250-SIZ").expect("parse"), None);
        assert_eq!(Reply::parse(b"25").expect("parse"), None);
    }

    #[test]
    fn bare_code_line_is_final() {
        let (reply, _) = Reply::parse(b"354\r\n").expect("parse").expect("complete");
        assert_eq!(reply.code, 354);
        assert!(reply.is_positive_intermediate());
    }

    #[test]
    fn rejects_code_change_mid_reply() {
        let err = Reply::parse(b"250-one\r\n251 two\r\n").expect_err("mismatch");
        assert_eq!(
            err,
            ReplyParseError::CodeMismatch {
                expected: 250,
                got: 251
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(Reply::parse(b"abc hello\r\n").is_err());
        assert!(Reply::parse(b"25x nope\r\n").is_err());
    }

    #[test]
    fn extracts_enhanced_status() {
        let (reply, _) = Reply::parse(b"550 5.1.1 User unknown\r\n")
            .expect("parse")
            .expect("complete");
        assert_eq!(reply.enhanced_status(), EnhancedStatus::new(5, 1, 1));
        assert!(reply.is_permanent_failure());

        let (reply, _) = Reply::parse(b"250 OK\r\n").expect("parse").expect("complete");
        assert!(reply.enhanced_status().is_absent());
    }

    #[test]
    fn accepts_bare_lf_line_endings() {
        let (reply, consumed) = Reply::parse(b"250 OK\n").expect("parse").expect("complete");
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec!["250 OK"]);
        assert_eq!(consumed, 7);
    }
}
