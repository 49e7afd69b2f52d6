//! EHLO keyword parsing.

use crate::reply::Reply;

/// Keywords advertised by the peer in its EHLO reply. Re-EHLO after
/// STARTTLS replaces the whole record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EhloKeywords {
    pub starttls: bool,
    pub pipelining: bool,
    pub eight_bit_mime: bool,
    /// Advertised maximum message size; `Some(0)` means "no fixed limit".
    pub size: Option<u64>,
    /// AUTH mechanisms, upper-cased.
    pub auth: Vec<String>,
}

impl EhloKeywords {
    /// Parse from an EHLO reply. The first line is the server's greeting
    /// domain; keywords start on the second line.
    #[must_use]
    pub fn parse(reply: &Reply) -> Self {
        let mut keywords = Self::default();
        for text in reply.texts().iter().skip(1) {
            let mut parts = text.split_ascii_whitespace();
            let Some(keyword) = parts.next() else { continue };
            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => keywords.starttls = true,
                "PIPELINING" => keywords.pipelining = true,
                "8BITMIME" => keywords.eight_bit_mime = true,
                "SIZE" => {
                    keywords.size = Some(parts.next().and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                "AUTH" => {
                    keywords
                        .auth
                        .extend(parts.map(|m| m.to_ascii_uppercase()));
                }
                _ => {}
            }
        }
        keywords
    }

    /// Whether the peer advertised the given AUTH mechanism.
    #[must_use]
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth.iter().any(|m| m.eq_ignore_ascii_case(mechanism))
    }
}
