//! Per-domain memory: catch-all judgments, disposable flags, MX snapshots.
//!
//! Fields age independently. A catch-all judgment stays authoritative for
//! its (long) freshness window and is only revised once stale; the update
//! discipline is monotonic. The MX snapshot expires on the DNS-derived
//! schedule recorded with it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use verity_common::Domain;

use crate::dns::MxRecord;

/// Tri-state catch-all knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CatchAllStatus {
    Unknown,
    Yes,
    No,
}

/// Everything remembered about a domain between verifications.
#[derive(Debug, Clone, Serialize)]
pub struct DomainMetadata {
    pub domain: Domain,
    pub catch_all: CatchAllStatus,
    pub catch_all_checked_at: Option<DateTime<Utc>>,
    pub disposable: bool,
    pub mx_records: Vec<MxRecord>,
    pub mx_expires_at: Option<DateTime<Utc>>,
    pub last_probe_at: Option<DateTime<Utc>>,
}

impl DomainMetadata {
    fn new(domain: Domain) -> Self {
        Self {
            domain,
            catch_all: CatchAllStatus::Unknown,
            catch_all_checked_at: None,
            disposable: false,
            mx_records: Vec::new(),
            mx_expires_at: None,
            last_probe_at: None,
        }
    }
}

/// Shared store of [`DomainMetadata`].
pub struct DomainMetadataStore {
    entries: DashMap<Domain, DomainMetadata>,
    catchall_freshness: Duration,
}

impl DomainMetadataStore {
    #[must_use]
    pub fn new(catchall_freshness: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            catchall_freshness,
        }
    }

    /// A copy of the metadata for a domain, if any exists yet.
    #[must_use]
    pub fn snapshot(&self, domain: &Domain) -> Option<DomainMetadata> {
        self.entries.get(domain).map(|entry| entry.clone())
    }

    /// Current catch-all knowledge with freshness applied: a judgment past
    /// its window reads as `Unknown` again.
    #[must_use]
    pub fn catch_all(&self, domain: &Domain) -> CatchAllStatus {
        let Some(entry) = self.entries.get(domain) else {
            return CatchAllStatus::Unknown;
        };
        match (entry.catch_all, entry.catch_all_checked_at) {
            (CatchAllStatus::Unknown, _) | (_, None) => CatchAllStatus::Unknown,
            (status, Some(checked_at)) => {
                if is_fresh(checked_at, self.catchall_freshness) {
                    status
                } else {
                    CatchAllStatus::Unknown
                }
            }
        }
    }

    /// Record a catch-all judgment. Monotonic: an existing fresh judgment
    /// is never overwritten.
    pub fn record_catch_all(&self, domain: &Domain, is_catch_all: bool) {
        let mut entry = self.entry(domain);
        let current_fresh = entry
            .catch_all_checked_at
            .is_some_and(|at| is_fresh(at, self.catchall_freshness))
            && entry.catch_all != CatchAllStatus::Unknown;
        if current_fresh {
            return;
        }
        entry.catch_all = if is_catch_all {
            CatchAllStatus::Yes
        } else {
            CatchAllStatus::No
        };
        entry.catch_all_checked_at = Some(Utc::now());
        debug!(domain = %domain, catch_all = is_catch_all, "catch-all judgment recorded");
    }

    #[must_use]
    pub fn is_disposable(&self, domain: &Domain) -> bool {
        self.entries
            .get(domain)
            .is_some_and(|entry| entry.disposable)
    }

    pub fn mark_disposable(&self, domain: &Domain) {
        self.entry(domain).disposable = true;
    }

    /// Remember the resolved MX set and its expiry.
    pub fn record_mx(&self, domain: &Domain, records: &[MxRecord], expires_at: DateTime<Utc>) {
        let mut entry = self.entry(domain);
        entry.mx_records = records.to_vec();
        entry.mx_expires_at = Some(expires_at);
    }

    /// Note that a probe to this domain just happened.
    pub fn record_probe(&self, domain: &Domain) {
        self.entry(domain).last_probe_at = Some(Utc::now());
    }

    fn entry(&self, domain: &Domain) -> dashmap::mapref::one::RefMut<'_, Domain, DomainMetadata> {
        self.entries
            .entry(domain.clone())
            .or_insert_with(|| DomainMetadata::new(domain.clone()))
    }
}

fn is_fresh(checked_at: DateTime<Utc>, window: Duration) -> bool {
    let age = Utc::now().signed_duration_since(checked_at);
    chrono::Duration::from_std(window).is_ok_and(|window| age < window)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> DomainMetadataStore {
        DomainMetadataStore::new(Duration::from_secs(7 * 24 * 3600))
    }

    #[test]
    fn unknown_until_recorded() {
        let store = store();
        let domain = Domain::new("example.com");
        assert_eq!(store.catch_all(&domain), CatchAllStatus::Unknown);
        assert!(store.snapshot(&domain).is_none());

        store.record_catch_all(&domain, true);
        assert_eq!(store.catch_all(&domain), CatchAllStatus::Yes);
        assert!(store.snapshot(&domain).unwrap().catch_all_checked_at.is_some());
    }

    #[test]
    fn fresh_judgments_are_not_overwritten() {
        let store = store();
        let domain = Domain::new("example.com");

        store.record_catch_all(&domain, false);
        store.record_catch_all(&domain, true);
        assert_eq!(store.catch_all(&domain), CatchAllStatus::No);
    }

    #[test]
    fn stale_judgments_read_as_unknown_and_can_be_revised() {
        let store = DomainMetadataStore::new(Duration::ZERO);
        let domain = Domain::new("example.com");

        store.record_catch_all(&domain, true);
        assert_eq!(store.catch_all(&domain), CatchAllStatus::Unknown);

        store.record_catch_all(&domain, false);
        assert_eq!(store.snapshot(&domain).unwrap().catch_all, CatchAllStatus::No);
    }

    #[test]
    fn disposable_flag_sticks() {
        let store = store();
        let domain = Domain::new("tempmail.com");
        assert!(!store.is_disposable(&domain));
        store.mark_disposable(&domain);
        assert!(store.is_disposable(&domain));
    }

    #[test]
    fn mx_snapshot_and_probe_times_are_recorded() {
        let store = store();
        let domain = Domain::new("example.com");
        let records = vec![MxRecord::new("mx.example.com", 10)];

        store.record_mx(&domain, &records, Utc::now());
        store.record_probe(&domain);

        let snapshot = store.snapshot(&domain).unwrap();
        assert_eq!(snapshot.mx_records, records);
        assert!(snapshot.mx_expires_at.is_some());
        assert!(snapshot.last_probe_at.is_some());
    }
}
