//! MX resolution with TTL-bounded caching.
//!
//! Positive answers are cached for the DNS TTL clamped into the configured
//! window; negative answers (no MX, NXDOMAIN) are cached briefly and never
//! permanently, because records may be published at any time. Lookup
//! failures (timeout, servfail) are not cached at all.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use verity_common::Domain;

use crate::config::{CacheConfig, DnsConfig};

/// Errors that can end MX resolution.
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    /// The domain does not exist.
    #[error("domain does not exist: {0}")]
    NxDomain(Domain),

    /// The domain exists but publishes no MX records.
    #[error("no MX records for domain: {0}")]
    NoMx(Domain),

    /// The query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(Domain),

    /// The resolver failed (servfail, network trouble).
    #[error("DNS lookup failed for {domain}: {message}")]
    Lookup { domain: Domain, message: String },
}

impl DnsError {
    /// Negative answers mean "no mail service" and are cacheable.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        matches!(self, Self::NxDomain(_) | Self::NoMx(_))
    }

    /// Whether a retry could plausibly produce an answer.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Lookup { .. })
    }
}

/// One mail exchanger for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MxRecord {
    /// Exchanger hostname, lowercased, no trailing dot.
    pub exchange: String,

    /// MX preference; lower wins.
    pub priority: u16,

    /// SMTP port, 25 unless overridden.
    #[serde(default = "default_port")]
    pub port: u16,
}

const fn default_port() -> u16 {
    25
}

impl MxRecord {
    #[must_use]
    pub fn new(exchange: impl Into<String>, priority: u16) -> Self {
        Self {
            exchange: exchange.into(),
            priority,
            port: default_port(),
        }
    }

    /// Override the SMTP port (test servers bind ephemeral ports).
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The dialable `host:port` address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.exchange, self.port)
    }
}

/// A raw answer from a lookup backend: records plus the smallest record TTL.
#[derive(Debug, Clone)]
pub struct MxAnswer {
    pub records: Vec<MxRecord>,
    pub ttl_secs: u32,
}

/// Seam between the resolver and the DNS backend, so tests can substitute a
/// static source.
#[async_trait]
pub trait MxSource: Send + Sync {
    /// Look up MX records for a domain, uncached.
    async fn lookup_mx(&self, domain: &Domain) -> Result<MxAnswer, DnsError>;
}

/// hickory-backed lookup source.
pub struct HickoryMxSource {
    resolver: TokioResolver,
    timeout: Duration,
}

impl HickoryMxSource {
    /// Build a resolver from the system configuration, falling back to
    /// Cloudflare when the system configuration is unusable.
    #[must_use]
    pub fn new(config: &DnsConfig) -> Self {
        let resolver = match TokioResolver::builder(TokioConnectionProvider::default()) {
            Ok(builder) => builder.with_options(ResolverOpts::default()).build(),
            Err(e) => {
                warn!(error = %e, "system DNS configuration failed, using Cloudflare fallback");
                TokioResolver::builder_with_config(
                    ResolverConfig::cloudflare(),
                    TokioConnectionProvider::default(),
                )
                .with_options(ResolverOpts::default())
                .build()
            }
        };

        Self {
            resolver,
            timeout: config.timeout(),
        }
    }
}

#[async_trait]
impl MxSource for HickoryMxSource {
    async fn lookup_mx(&self, domain: &Domain) -> Result<MxAnswer, DnsError> {
        let lookup = tokio::time::timeout(self.timeout, self.resolver.mx_lookup(domain.as_str()))
            .await
            .map_err(|_| DnsError::Timeout(domain.clone()))?;

        match lookup {
            Ok(mx_lookup) => {
                let ttl_secs = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let records: Vec<MxRecord> = mx_lookup
                    .iter()
                    .map(|mx| MxRecord::new(mx.exchange().to_utf8(), mx.preference()))
                    .collect();

                if records.is_empty() {
                    return Err(DnsError::NoMx(domain.clone()));
                }

                Ok(MxAnswer { records, ttl_secs })
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::NxDomain(domain.clone())),
            Err(err) if err.is_no_records_found() => Err(DnsError::NoMx(domain.clone())),
            Err(err) => Err(DnsError::Lookup {
                domain: domain.clone(),
                message: err.to_string(),
            }),
        }
    }
}

/// A cached, normalized resolution.
#[derive(Debug, Clone)]
pub struct ResolvedMx {
    /// Records sorted ascending by priority, ties in answer order.
    pub records: Arc<[MxRecord]>,
    /// When the cached entry lapses (wall clock, for metadata reporting).
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
enum CachedOutcome {
    Positive(ResolvedMx),
    Negative(DnsError),
}

struct CacheEntry {
    outcome: CachedOutcome,
    expires_at: Instant,
}

/// MX resolver with a TTL-bounded concurrent cache.
pub struct MxResolver {
    source: Arc<dyn MxSource>,
    cache: DashMap<Domain, CacheEntry>,
    config: CacheConfig,
}

impl MxResolver {
    #[must_use]
    pub fn new(source: Arc<dyn MxSource>, config: CacheConfig) -> Self {
        Self {
            source,
            cache: DashMap::new(),
            config,
        }
    }

    /// Resolve and order the mail exchangers for a domain.
    ///
    /// # Errors
    ///
    /// Returns a structured [`DnsError`]; negative answers come out of the
    /// cache until their (short) TTL lapses.
    pub async fn resolve(&self, domain: &Domain) -> Result<ResolvedMx, DnsError> {
        if let Some(entry) = self.cache.get(domain) {
            if entry.expires_at > Instant::now() {
                return match &entry.outcome {
                    CachedOutcome::Positive(resolved) => {
                        debug!(domain = %domain, records = resolved.records.len(), "mx cache hit");
                        Ok(resolved.clone())
                    }
                    CachedOutcome::Negative(err) => {
                        debug!(domain = %domain, "negative mx cache hit");
                        Err(err.clone())
                    }
                };
            }
        }

        // Populate off-lock; the entry is committed below in one insert.
        let answer = match self.source.lookup_mx(domain).await {
            Ok(answer) if answer.records.is_empty() => Err(DnsError::NoMx(domain.clone())),
            other => other,
        };

        match answer {
            Ok(answer) => {
                let records = normalize(answer.records);
                let ttl = Duration::from_secs(u64::from(answer.ttl_secs))
                    .clamp(self.config.mx_ttl_min(), self.config.mx_ttl_max());
                let resolved = ResolvedMx {
                    records: records.into(),
                    expires_at: Utc::now()
                        + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
                };
                debug!(
                    domain = %domain,
                    records = resolved.records.len(),
                    ttl_secs = ttl.as_secs(),
                    "mx resolved"
                );
                self.cache.insert(
                    domain.clone(),
                    CacheEntry {
                        outcome: CachedOutcome::Positive(resolved.clone()),
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(resolved)
            }
            Err(err) if err.is_negative() => {
                let ttl = self.config.mx_negative_ttl();
                debug!(domain = %domain, error = %err, ttl_secs = ttl.as_secs(), "caching negative mx answer");
                self.cache.insert(
                    domain.clone(),
                    CacheEntry {
                        outcome: CachedOutcome::Negative(err.clone()),
                        expires_at: Instant::now() + ttl,
                    },
                );
                Err(err)
            }
            Err(err) => {
                debug!(domain = %domain, error = %err, "mx lookup failed (not cached)");
                Err(err)
            }
        }
    }

    /// Drop the cached entry for a domain, forcing a fresh lookup.
    pub fn invalidate(&self, domain: &Domain) -> bool {
        self.cache.remove(domain).is_some()
    }
}

fn normalize(mut records: Vec<MxRecord>) -> Vec<MxRecord> {
    for record in &mut records {
        record.exchange = record
            .exchange
            .trim_end_matches('.')
            .to_ascii_lowercase();
    }
    records.sort_by_key(|r| r.priority);
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        answer: Result<MxAnswer, DnsError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MxSource for ScriptedSource {
        async fn lookup_mx(&self, _domain: &Domain) -> Result<MxAnswer, DnsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone()
        }
    }

    fn resolver_with(
        answer: Result<MxAnswer, DnsError>,
    ) -> (MxResolver, Arc<ScriptedSource>) {
        let source = Arc::new(ScriptedSource {
            answer,
            calls: AtomicUsize::new(0),
        });
        (
            MxResolver::new(source.clone(), CacheConfig::default()),
            source,
        )
    }

    #[test]
    fn normalization_orders_and_lowercases() {
        let records = normalize(vec![
            MxRecord::new("MX2.Example.COM.", 20),
            MxRecord::new("mx1.example.com.", 10),
            MxRecord::new("tie-b.example.com", 20),
        ]);
        assert_eq!(records[0].exchange, "mx1.example.com");
        assert_eq!(records[1].exchange, "mx2.example.com");
        // Stable sort keeps ties in answer order.
        assert_eq!(records[2].exchange, "tie-b.example.com");
    }

    #[tokio::test]
    async fn positive_answers_are_cached() {
        let (resolver, source) = resolver_with(Ok(MxAnswer {
            records: vec![MxRecord::new("mx.example.com", 10)],
            ttl_secs: 600,
        }));
        let domain = Domain::new("example.com");

        let first = resolver.resolve(&domain).await.unwrap();
        let second = resolver.resolve(&domain).await.unwrap();
        assert_eq!(first.records, second.records);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn negative_answers_are_cached() {
        let domain = Domain::new("nomx.test");
        let (resolver, source) = resolver_with(Err(DnsError::NoMx(domain.clone())));

        assert!(matches!(
            resolver.resolve(&domain).await,
            Err(DnsError::NoMx(_))
        ));
        assert!(matches!(
            resolver.resolve(&domain).await,
            Err(DnsError::NoMx(_))
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let domain = Domain::new("flaky.test");
        let (resolver, source) = resolver_with(Err(DnsError::Timeout(domain.clone())));

        let _ = resolver.resolve(&domain).await;
        let _ = resolver.resolve(&domain).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_lookup() {
        let (resolver, source) = resolver_with(Ok(MxAnswer {
            records: vec![MxRecord::new("mx.example.com", 10)],
            ttl_secs: 600,
        }));
        let domain = Domain::new("example.com");

        resolver.resolve(&domain).await.unwrap();
        assert!(resolver.invalidate(&domain));
        resolver.resolve(&domain).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn error_categories() {
        let domain = Domain::new("example.com");
        assert!(DnsError::NoMx(domain.clone()).is_negative());
        assert!(DnsError::NxDomain(domain.clone()).is_negative());
        assert!(!DnsError::Timeout(domain.clone()).is_negative());
        assert!(DnsError::Timeout(domain).is_temporary());
    }
}
