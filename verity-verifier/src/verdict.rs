//! The structured outcome of a verification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use verity_common::{Domain, Fingerprint};

use crate::dns::MxRecord;

/// Final status of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictStatus {
    /// The mailbox almost certainly exists.
    #[serde(rename = "valid")]
    Valid,

    /// The mailbox almost certainly does not exist (or the address never
    /// could: syntax failure, no mail service).
    #[serde(rename = "invalid")]
    Invalid,

    /// The domain accepts any local-part; existence is undecidable by RCPT.
    #[serde(rename = "catch-all")]
    CatchAll,

    /// Verification was inconclusive.
    #[serde(rename = "unknown")]
    Unknown,

    /// Deliverable but hazardous (disposable provider).
    #[serde(rename = "risky")]
    Risky,
}

/// The verdict returned for every verification. Nothing recoverable leaks
/// past the facade as an error; inconclusive outcomes are verdicts too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Salted fingerprint of the normalized address (the address itself is
    /// never stored).
    pub fingerprint: Fingerprint,

    /// The recipient domain; absent only for syntactic rejections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Domain>,

    pub status: VerdictStatus,

    /// Short machine-readable reason tag, e.g. `mailbox_exists`.
    pub reason: String,

    /// Confidence in `[0, 1]`. Exactly 1.0 only for syntactic rejections.
    pub confidence: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_code: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_response: Option<String>,

    /// The MX host that produced the deciding reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mx_host: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mx_records: Vec<MxRecord>,

    pub is_catch_all: bool,

    pub is_disposable: bool,

    pub duration_ms: u64,

    /// When the verification completed, RFC 3339 UTC.
    pub checked_at: DateTime<Utc>,
}

impl Verdict {
    /// Whether the status/flag invariants hold: `valid` excludes catch-all,
    /// `catch-all` requires the flag.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        let flags_consistent = match self.status {
            VerdictStatus::Valid => !self.is_catch_all,
            VerdictStatus::CatchAll => self.is_catch_all,
            _ => true,
        };
        flags_consistent && (0.0..=1.0).contains(&self.confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verity_common::{EmailAddress, Fingerprinter};

    fn sample() -> Verdict {
        let address = EmailAddress::parse("user@example.com").unwrap();
        Verdict {
            fingerprint: Fingerprinter::new(b"test").fingerprint(&address),
            domain: Some(address.domain().clone()),
            status: VerdictStatus::Valid,
            reason: "mailbox_exists".to_string(),
            confidence: 0.98,
            smtp_code: Some(250),
            smtp_response: Some("2.1.5 OK".to_string()),
            mx_host: Some("mx.example.com".to_string()),
            mx_records: vec![MxRecord::new("mx.example.com", 10)],
            is_catch_all: false,
            is_disposable: false,
            duration_ms: 128,
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn round_trips_through_json() {
        let verdict = sample();
        let json = serde_json::to_string(&verdict).unwrap();
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, verdict);
    }

    #[test]
    fn status_names_are_wire_format() {
        assert_eq!(
            serde_json::to_string(&VerdictStatus::CatchAll).unwrap(),
            "\"catch-all\""
        );
        assert_eq!(
            serde_json::to_string(&VerdictStatus::Valid).unwrap(),
            "\"valid\""
        );
    }

    #[test]
    fn absent_fields_are_omitted() {
        let mut verdict = sample();
        verdict.smtp_code = None;
        verdict.smtp_response = None;
        verdict.mx_host = None;
        verdict.mx_records.clear();

        let json = serde_json::to_string(&verdict).unwrap();
        assert!(!json.contains("smtp_code"));
        assert!(!json.contains("mx_host"));
        assert!(!json.contains("mx_records"));
    }

    #[test]
    fn invariants() {
        let mut verdict = sample();
        assert!(verdict.invariants_hold());

        verdict.is_catch_all = true;
        assert!(!verdict.invariants_hold());

        verdict.status = VerdictStatus::CatchAll;
        assert!(verdict.invariants_hold());
    }
}
