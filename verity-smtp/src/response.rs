//! SMTP reply parsing and representation.

use crate::error::{ClientError, Result};

/// A single parsed line of an SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The three-digit status code.
    pub code: u16,
    /// Whether this line terminates the reply (`250 ` vs `250-`).
    pub is_last: bool,
    /// The text after the code and separator.
    pub message: String,
}

/// A complete, possibly multi-line SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The status code shared by every line of the reply.
    pub code: u16,
    /// The text of each line, in order.
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All reply text joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// 2xx positive completion.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 4xx transient failure.
    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    /// 5xx permanent failure.
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Whether an EHLO reply advertises the given capability keyword.
    #[must_use]
    pub fn advertises(&self, capability: &str) -> bool {
        self.lines.iter().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|token| token.eq_ignore_ascii_case(capability))
        })
    }

    /// Parse one reply line.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Parse`] when the line does not match the
    /// `NNN[- ]text` shape.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        if line.len() < 3 {
            return Err(ClientError::Parse(format!("reply line too short: '{line}'")));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|_| ClientError::Parse(format!("invalid status code in '{line}'")))?;

        let is_last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(other) => {
                return Err(ClientError::Parse(format!(
                    "invalid separator {:?} in '{line}'",
                    char::from(*other)
                )));
            }
        };

        let message = if line.len() > 4 {
            line[4..].to_string()
        } else {
            String::new()
        };

        Ok(ResponseLine {
            code,
            is_last,
            message,
        })
    }

    /// Try to parse a complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes consumed, or `None` when
    /// the buffer does not yet hold a full reply.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Parse`] for malformed lines or a status code
    /// that changes between lines of one reply.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let text = std::str::from_utf8(buffer)?;
        let mut lines = Vec::new();
        let mut code: Option<u16> = None;
        let mut consumed = 0;

        loop {
            let rest = &text[consumed..];
            let Some(end) = rest.find('\n') else {
                return Ok(None);
            };
            let line = rest[..end].strip_suffix('\r').unwrap_or(&rest[..end]);
            consumed += end + 1;

            if line.is_empty() {
                continue;
            }

            let parsed = Self::parse_line(line)?;
            match code {
                Some(expected) if expected != parsed.code => {
                    return Err(ClientError::Parse(format!(
                        "status code changed mid-reply: {expected} then {}",
                        parsed.code
                    )));
                }
                None => code = Some(parsed.code),
                Some(_) => {}
            }

            let is_last = parsed.is_last;
            lines.push(parsed.message);
            if is_last {
                let code = code.unwrap_or(parsed.code);
                return Ok(Some((Self::new(code, lines), consumed)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let (response, consumed) = Response::parse_response(b"220 mx.example.com ESMTP\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(response.code, 220);
        assert_eq!(response.lines, vec!["mx.example.com ESMTP"]);
        assert_eq!(consumed, 26);
        assert!(response.is_success());
    }

    #[test]
    fn multi_line() {
        let data = b"250-mx.example.com\r\n250-STARTTLS\r\n250 SIZE 35882577\r\n";
        let (response, consumed) = Response::parse_response(data).unwrap().unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.lines.len(), 3);
        assert_eq!(consumed, data.len());
        assert!(response.advertises("starttls"));
        assert!(!response.advertises("8BITMIME"));
    }

    #[test]
    fn incomplete_needs_more_data() {
        assert!(Response::parse_response(b"250-mx.example.com\r\n250-STAR")
            .unwrap()
            .is_none());
        assert!(Response::parse_response(b"").unwrap().is_none());
    }

    #[test]
    fn code_mismatch_rejected() {
        let err = Response::parse_response(b"250-one\r\n550 two\r\n").unwrap_err();
        assert!(matches!(err, ClientError::Parse(_)));
    }

    #[test]
    fn short_and_garbled_lines_rejected() {
        assert!(Response::parse_line("25").is_err());
        assert!(Response::parse_line("abc hello").is_err());
        assert!(Response::parse_line("250_hello").is_err());
    }

    #[test]
    fn bare_code_is_terminal() {
        let line = Response::parse_line("221").unwrap();
        assert!(line.is_last);
        assert_eq!(line.code, 221);
        assert!(line.message.is_empty());
    }

    #[test]
    fn error_classes() {
        assert!(Response::new(451, vec![]).is_temporary_error());
        assert!(Response::new(550, vec![]).is_permanent_error());
        assert!(!Response::new(250, vec![]).is_permanent_error());
    }
}
