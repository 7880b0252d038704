//! Verdict cache with per-key coalescing.
//!
//! Keyed by address fingerprint with a TTL and a bounded capacity under
//! least-recently-used eviction. Concurrent verifications of one
//! fingerprint coalesce: the first caller becomes the leader and computes,
//! the rest await its broadcast. Reads of one key never block on writers of
//! another (the map is sharded), and the leader broadcasts on every exit
//! path: a cancelled leader wakes its followers so the next caller can
//! take over.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, trace};

use verity_common::Fingerprint;

use crate::verdict::Verdict;

struct Entry {
    verdict: Verdict,
    expires_at: Instant,
    last_used: Instant,
}

/// How a caller enters a verification for a fingerprint.
pub enum Begin<'a> {
    /// A fresh cached verdict.
    Hit(Verdict),
    /// This caller does the work and must call [`InflightGuard::complete`].
    Leader(InflightGuard<'a>),
    /// Another caller is already working this fingerprint.
    Follower(watch::Receiver<Option<Verdict>>),
}

/// Marks one in-flight verification; dropping it without completing wakes
/// followers empty-handed so one of them can lead.
pub struct InflightGuard<'a> {
    cache: &'a ResultCache,
    fingerprint: Fingerprint,
    sender: Option<watch::Sender<Option<Verdict>>>,
}

impl InflightGuard<'_> {
    /// Publish the verdict: store it (when cacheable) and wake followers.
    pub fn complete(mut self, verdict: &Verdict, cacheable: bool) {
        if cacheable {
            self.cache.store(self.fingerprint, verdict);
        }
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(Some(verdict.clone()));
        }
        self.cache.inflight.remove(&self.fingerprint);
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            trace!(fingerprint = %self.fingerprint, "leader abandoned, waking followers");
            let _ = sender.send(None);
            self.cache.inflight.remove(&self.fingerprint);
        }
    }
}

/// Await the leader's broadcast. `None` means the leader went away without
/// a verdict and the caller should retry [`ResultCache::begin`].
pub async fn await_leader(mut rx: watch::Receiver<Option<Verdict>>) -> Option<Verdict> {
    loop {
        if let Some(verdict) = rx.borrow_and_update().clone() {
            return Some(verdict);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

/// Fingerprint → verdict cache shared by all verifications.
pub struct ResultCache {
    entries: DashMap<Fingerprint, Entry>,
    inflight: DashMap<Fingerprint, watch::Receiver<Option<Verdict>>>,
    ttl: Duration,
    capacity: usize,
}

impl ResultCache {
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// A fresh cached verdict, bumping its recency. Expired entries are
    /// dropped on sight.
    #[must_use]
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Verdict> {
        let mut expired = false;
        let found = self.entries.get_mut(fingerprint).and_then(|mut entry| {
            if entry.expires_at <= Instant::now() {
                expired = true;
                None
            } else {
                entry.last_used = Instant::now();
                Some(entry.verdict.clone())
            }
        });
        if expired {
            self.entries.remove(fingerprint);
        }
        found
    }

    /// Enter a verification: cache hit, leadership, or followership.
    #[must_use]
    pub fn begin(&self, fingerprint: Fingerprint, skip_cache: bool) -> Begin<'_> {
        if !skip_cache && let Some(verdict) = self.lookup(&fingerprint) {
            return Begin::Hit(verdict);
        }

        use dashmap::mapref::entry::Entry;
        match self.inflight.entry(fingerprint) {
            Entry::Occupied(occupied) => Begin::Follower(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx);
                Begin::Leader(InflightGuard {
                    cache: self,
                    fingerprint,
                    sender: Some(tx),
                })
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn store(&self, fingerprint: Fingerprint, verdict: &Verdict) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&fingerprint) {
            self.evict_one();
        }
        let now = Instant::now();
        self.entries.insert(
            fingerprint,
            Entry {
                verdict: verdict.clone(),
                expires_at: now + self.ttl,
                last_used: now,
            },
        );
    }

    /// Drop one entry: an expired one when available, otherwise the least
    /// recently used.
    fn evict_one(&self) {
        let now = Instant::now();
        let mut victim: Option<(Fingerprint, Instant)> = None;

        for entry in self.entries.iter() {
            if entry.expires_at <= now {
                victim = Some((*entry.key(), entry.last_used));
                break;
            }
            let stalest = victim
                .as_ref()
                .is_none_or(|(_, used)| entry.last_used < *used);
            if stalest {
                victim = Some((*entry.key(), entry.last_used));
            }
        }

        if let Some((key, _)) = victim {
            debug!(fingerprint = %key, "evicting result cache entry");
            self.entries.remove(&key);
        }
    }
}
