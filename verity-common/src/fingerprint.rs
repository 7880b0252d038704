//! Salted address fingerprints.
//!
//! The result cache is keyed by a 256-bit salted SHA-256 hash of the
//! normalized address, so neither the cache nor any log line ever carries a
//! plaintext address. With a fixed salt the fingerprint is stable across
//! restarts; without one a random salt is drawn at startup.

use std::fmt::{self, Display};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::{Digest, Sha256};

use crate::address::EmailAddress;

/// A 256-bit fingerprint of a normalized address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != 64 {
            return Err(de::Error::custom("fingerprint must be 64 hex characters"));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(de::Error::custom)?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(de::Error::custom)?;
        }
        Ok(Self(bytes))
    }
}

/// Produces fingerprints under a fixed salt.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    salt: [u8; 32],
}

impl Fingerprinter {
    /// Create a fingerprinter with an explicit salt. Hashes are stable for
    /// the lifetime of the salt, which is what makes cached verdicts
    /// survive restarts when the backing store does.
    #[must_use]
    pub fn new(salt: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_ref());
        Self {
            salt: hasher.finalize().into(),
        }
    }

    /// Create a fingerprinter with a random salt. Fingerprints from
    /// different instances will not match.
    #[must_use]
    pub fn random() -> Self {
        let salt: [u8; 32] = rand::random();
        Self { salt }
    }

    /// Fingerprint a normalized address.
    #[must_use]
    pub fn fingerprint(&self, address: &EmailAddress) -> Fingerprint {
        self.fingerprint_raw(&address.to_string())
    }

    /// Fingerprint raw input after trimming and lowercasing. Used for
    /// inputs the syntax filter rejected, which still get a verdict and so
    /// still need a key.
    #[must_use]
    pub fn fingerprint_raw(&self, raw: &str) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.salt);
        hasher.update(raw.trim().to_ascii_lowercase().as_bytes());
        Fingerprint(hasher.finalize().into())
    }
}
