//! Address normalization and syntax filtering.
//!
//! The filter is pure and deterministic: a raw input either normalizes into
//! an [`EmailAddress`] (trimmed, lowercased, split at the single `@`) or is
//! rejected with a reason. Everything downstream of this module may assume
//! the invariants checked here.

use std::fmt::{self, Display};

use serde::Serialize;
use thiserror::Error;

use crate::domain::Domain;

/// Maximum total length of an address in octets (RFC 5321 forward-path).
const MAX_ADDRESS_LEN: usize = 254;

/// Maximum length of the local-part in octets.
const MAX_LOCAL_LEN: usize = 64;

/// Maximum length of a single domain label.
const MAX_LABEL_LEN: usize = 63;

/// Reasons a raw input fails the syntax filter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,

    #[error("address exceeds {MAX_ADDRESS_LEN} octets")]
    TooLong,

    #[error("address must contain exactly one '@'")]
    AtCount,

    #[error("local-part is invalid: {0}")]
    Local(&'static str),

    #[error("domain is invalid: {0}")]
    DomainPart(&'static str),
}

/// A normalized email address: lowercased, with local-part and domain
/// separated at the single `@`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EmailAddress {
    local: String,
    domain: Domain,
}

impl EmailAddress {
    /// Run the syntax filter over a raw input.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] naming the first rule the input violates.
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        if trimmed.len() > MAX_ADDRESS_LEN {
            return Err(AddressError::TooLong);
        }

        let normalized = trimmed.to_ascii_lowercase();
        let mut parts = normalized.splitn(3, '@');
        let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => (local, domain),
            _ => return Err(AddressError::AtCount),
        };

        validate_local(local)?;
        validate_domain(domain)?;

        Ok(Self {
            local: local.to_string(),
            domain: Domain::new(domain),
        })
    }

    /// The local-part (before the `@`).
    #[must_use]
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The recipient domain (after the `@`).
    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Render the local-part for an SMTP forward-path, quoting it per
    /// RFC 5321 only when it is not a dot-string.
    #[must_use]
    pub fn smtp_local(&self) -> String {
        if self.local.split('.').all(|atom| {
            !atom.is_empty() && atom.bytes().all(is_atext)
        }) {
            self.local.clone()
        } else {
            let escaped = self.local.replace('\\', "\\\\").replace('"', "\\\"");
            format!("\"{escaped}\"")
        }
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// RFC 5322 atext: the characters allowed in an unquoted atom.
const fn is_atext(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'}'
                | b'~'
        )
}

fn validate_local(local: &str) -> Result<(), AddressError> {
    if local.is_empty() {
        return Err(AddressError::Local("empty"));
    }
    if local.len() > MAX_LOCAL_LEN {
        return Err(AddressError::Local("longer than 64 octets"));
    }
    if local.starts_with('.') || local.ends_with('.') {
        return Err(AddressError::Local("leading or trailing dot"));
    }
    if local.contains("..") {
        return Err(AddressError::Local("consecutive dots"));
    }
    if !local.bytes().all(|b| b == b'.' || is_atext(b)) {
        return Err(AddressError::Local("character outside the atom set"));
    }
    Ok(())
}

fn validate_domain(domain: &str) -> Result<(), AddressError> {
    if domain.is_empty() {
        return Err(AddressError::DomainPart("empty"));
    }
    if domain.contains("..") {
        return Err(AddressError::DomainPart("consecutive dots"));
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return Err(AddressError::DomainPart("fewer than two labels"));
    }

    for label in &labels {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(AddressError::DomainPart("label length out of range"));
        }
        let bytes = label.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return Err(AddressError::DomainPart(
                "label must begin and end alphanumeric",
            ));
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
            return Err(AddressError::DomainPart("label contains invalid character"));
        }
    }

    let tld = labels[labels.len() - 1];
    if tld.len() < 2 || !tld.bytes().all(|b| b.is_ascii_alphabetic()) {
        return Err(AddressError::DomainPart("top-level label must be alphabetic"));
    }

    Ok(())
}
