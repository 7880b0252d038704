//! Domain newtype for type safety
//!
//! Wraps a recipient domain so email addresses or arbitrary strings cannot
//! be passed where a domain is expected. Cloning is cheap (`Arc<str>`),
//! which matters because domains key every shared map in the verifier.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A lowercased DNS domain name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    /// Create a new `Domain` from anything convertible to `Arc<str>`.
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    /// The domain as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_and_access() {
        let domain = Domain::new("example.com");
        assert_eq!(domain.as_str(), "example.com");
        assert_eq!(format!("{domain}"), "example.com");
    }

    #[test]
    fn equality_and_hashing() {
        use std::collections::HashMap;

        let a = Domain::new("example.com");
        let b: Domain = String::from("example.com").into();
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a.clone(), 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn serde_is_transparent() {
        let domain = Domain::new("mail.example.com");
        let json = serde_json::to_string(&domain).unwrap();
        assert_eq!(json, "\"mail.example.com\"");
        let back: Domain = serde_json::from_str(&json).unwrap();
        assert_eq!(back, domain);
    }
}
