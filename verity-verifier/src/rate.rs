//! The Rate Gate: probe admission control.
//!
//! Three independent limits compose, and a lease is issued only when all
//! three admit: a minimum spacing between probe starts per domain, a
//! concurrency ceiling per domain, and a concurrency ceiling per MX host.
//! Leases are RAII so release happens on every exit path, including
//! cancellation. A 421 from a server penalizes its domain: the spacing
//! interval is multiplied for a jittered cool-down window and decays back
//! to baseline once the window lapses.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use verity_common::Domain;

use crate::config::RateConfig;

/// Why a lease could not be granted.
#[derive(Debug, Error)]
pub enum RateGateError {
    /// The caller's deadline passed while waiting for admission.
    #[error("rate gate acquisition timed out")]
    Timeout,

    /// The gate is shutting down.
    #[error("rate gate closed")]
    Closed,
}

/// Held for the duration of one probe; dropping it releases both
/// concurrency permits.
pub struct RateLease {
    _domain_permit: OwnedSemaphorePermit,
    _host_permit: OwnedSemaphorePermit,
}

struct Pacing {
    /// Earliest start for the next probe slot to this domain.
    next_at: Instant,
    /// While set and in the future, the penalized interval applies.
    penalty_until: Option<Instant>,
}

struct DomainGate {
    permits: Arc<Semaphore>,
    pacing: Mutex<Pacing>,
}

impl DomainGate {
    fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            pacing: Mutex::new(Pacing {
                next_at: Instant::now(),
                penalty_until: None,
            }),
        }
    }

    /// Claim the next start slot. O(1) under the lock; the sleep happens
    /// outside it.
    fn reserve_slot(&self, config: &RateConfig) -> Instant {
        let mut pacing = self.pacing.lock();
        let now = Instant::now();

        let interval = match pacing.penalty_until {
            Some(until) if until > now => config
                .per_domain_interval()
                .mul_f64(config.penalty_factor),
            _ => {
                pacing.penalty_until = None;
                config.per_domain_interval()
            }
        };

        let start = pacing.next_at.max(now);
        pacing.next_at = start + interval;
        start
    }
}

/// Process-wide admission control shared by every verification.
pub struct RateGate {
    config: RateConfig,
    domains: DashMap<Domain, Arc<DomainGate>>,
    hosts: DashMap<String, Arc<Semaphore>>,
}

impl RateGate {
    #[must_use]
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            domains: DashMap::new(),
            hosts: DashMap::new(),
        }
    }

    fn domain_gate(&self, domain: &Domain) -> Arc<DomainGate> {
        self.domains
            .entry(domain.clone())
            .or_insert_with(|| Arc::new(DomainGate::new(self.config.per_domain_concurrency)))
            .clone()
    }

    fn host_semaphore(&self, mx_host: &str) -> Arc<Semaphore> {
        self.hosts
            .entry(mx_host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_mx_concurrency)))
            .clone()
    }

    /// Wait for admission to probe `domain` via `mx_host`.
    ///
    /// Waiters are served first-come-first-served per domain (the permit
    /// queue is FIFO).
    ///
    /// # Errors
    ///
    /// [`RateGateError::Timeout`] when `deadline` passes first.
    pub async fn acquire(
        &self,
        domain: &Domain,
        mx_host: &str,
        deadline: Instant,
    ) -> Result<RateLease, RateGateError> {
        let gate = self.domain_gate(domain);
        let host = self.host_semaphore(mx_host);

        let admission = async {
            let domain_permit = gate
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| RateGateError::Closed)?;
            let host_permit = host
                .acquire_owned()
                .await
                .map_err(|_| RateGateError::Closed)?;

            let start_at = gate.reserve_slot(&self.config);
            tokio::time::sleep_until(start_at).await;

            Ok(RateLease {
                _domain_permit: domain_permit,
                _host_permit: host_permit,
            })
        };

        tokio::time::timeout_at(deadline, admission)
            .await
            .map_err(|_| RateGateError::Timeout)?
    }

    /// Apply the 421 penalty to a domain: multiply its spacing interval for
    /// a jittered cool-down window and push the next slot out.
    pub fn penalize(&self, domain: &Domain) {
        let gate = self.domain_gate(domain);
        let mut pacing = gate.pacing.lock();
        let now = Instant::now();

        let jitter = 1.0 + self.config.jitter_factor * (rand::rng().random::<f64>() * 2.0 - 1.0);
        let cooldown = self.config.penalty_cooldown().mul_f64(jitter.max(0.0));
        let penalized_interval = self
            .config
            .per_domain_interval()
            .mul_f64(self.config.penalty_factor);

        pacing.penalty_until = Some(now + cooldown);
        pacing.next_at = pacing.next_at.max(now + penalized_interval);

        debug!(
            domain = %domain,
            cooldown_ms = cooldown.as_millis(),
            "421 penalty applied"
        );
    }
}
