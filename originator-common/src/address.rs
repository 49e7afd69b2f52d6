//! Minimal address grammar: the validation surface the delivery core needs.
//!
//! Accepts dot-atom local parts and LDH domains. Display names, comments,
//! quoted strings and address literals are the composer's business, not the
//! sender's; what reaches this crate is a bare addr-spec.

/// Printable ASCII allowed in an atom, per RFC 5322 `atext`.
fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn is_dot_atom(text: &str) -> bool {
    !text.is_empty()
        && !text.starts_with('.')
        && !text.ends_with('.')
        && !text.contains("..")
        && text.chars().all(|c| c == '.' || is_atext(c))
}

/// Validate a DNS domain: dot-separated LDH labels, 253 octets max.
#[must_use]
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Validate a bare addr-spec (`local@domain`).
#[must_use]
pub fn is_valid_addr_spec(address: &str) -> bool {
    split_addr_spec(address)
        .map(|(local, domain)| is_dot_atom(local) && is_valid_domain(domain))
        .unwrap_or(false)
}

/// Split an addr-spec at its final `@`.
#[must_use]
pub fn split_addr_spec(address: &str) -> Option<(&str, &str)> {
    let at = address.rfind('@')?;
    let (local, rest) = address.split_at(at);
    if local.is_empty() || rest.len() < 2 {
        return None;
    }
    Some((local, &rest[1..]))
}
