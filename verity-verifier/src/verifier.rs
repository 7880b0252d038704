//! The Verifier Facade.
//!
//! Composes the pipeline into one `verify(address) → Verdict` entrypoint:
//! syntax filter, result cache, domain metadata short-circuits, MX
//! resolution, rate-gated SMTP probing, classification, catch-all
//! refinement, and the cache writes. Reentrant and safe under any number
//! of concurrent callers; every recoverable failure comes back as a
//! verdict, never an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info};

use verity_common::{Domain, EmailAddress, Fingerprint, Fingerprinter};

use crate::api::{BatchVerifyRequest, BatchVerifyResponse, MAX_BATCH_SIZE, VerifyRequest};
use crate::catchall::{CatchAllDetector, CatchAllJudgment};
use crate::classify::{self, reason};
use crate::config::VerifierConfig;
use crate::disposable::DisposableSet;
use crate::dns::{DnsError, HickoryMxSource, MxSource, MxResolver, ResolvedMx};
use crate::domain_meta::{CatchAllStatus, DomainMetadataStore};
use crate::error::VerifyError;
use crate::probe::{ProbeError, ProbeReply, SmtpProber};
use crate::rate::RateGate;
use crate::result_cache::{self, Begin, ResultCache};
use crate::verdict::{Verdict, VerdictStatus};

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Bypass the result cache read; the outcome is still stored.
    pub skip_cache: bool,

    /// Overall deadline for this verification. Falls back to
    /// `verify.default_deadline`.
    pub deadline: Option<Duration>,
}

impl From<&VerifyRequest> for VerifyOptions {
    fn from(request: &VerifyRequest) -> Self {
        Self {
            skip_cache: request.skip_cache,
            deadline: request.deadline_ms.map(Duration::from_millis),
        }
    }
}

/// The deliverability verifier. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Verifier {
    inner: Arc<Inner>,
}

struct Inner {
    config: VerifierConfig,
    fingerprinter: Fingerprinter,
    resolver: MxResolver,
    gate: RateGate,
    prober: SmtpProber,
    catchall: CatchAllDetector,
    results: ResultCache,
    domains: DomainMetadataStore,
    disposable: DisposableSet,
}

impl Verifier {
    /// Build a verifier with the hickory DNS backend.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Config`] when the configuration is unusable.
    pub fn new(config: VerifierConfig) -> Result<Self, VerifyError> {
        config.validate()?;
        let source = Arc::new(HickoryMxSource::new(&config.dns));
        Ok(Self::assemble(config, source))
    }

    /// Build a verifier over a custom MX source (tests substitute a static
    /// one pointing at mock servers).
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Config`] when the configuration is unusable.
    pub fn with_mx_source(
        config: VerifierConfig,
        source: Arc<dyn MxSource>,
    ) -> Result<Self, VerifyError> {
        config.validate()?;
        Ok(Self::assemble(config, source))
    }

    fn assemble(config: VerifierConfig, source: Arc<dyn MxSource>) -> Self {
        let fingerprinter = config
            .verify
            .fingerprint_salt
            .as_ref()
            .map_or_else(Fingerprinter::random, |salt| {
                Fingerprinter::new(salt.as_bytes())
            });

        let inner = Inner {
            fingerprinter,
            resolver: MxResolver::new(source, config.cache.clone()),
            gate: RateGate::new(config.rate.clone()),
            prober: SmtpProber::new(config.smtp.clone(), config.retry.clone()),
            catchall: CatchAllDetector::new(config.catchall.clone()),
            results: ResultCache::new(config.cache.result_ttl(), config.cache.result_capacity),
            domains: DomainMetadataStore::new(config.catchall.freshness()),
            disposable: DisposableSet::with_extra(&config.disposable.extra_domains),
            config,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Verify one address with default options.
    pub async fn verify(&self, raw: &str) -> Verdict {
        self.verify_with(raw, VerifyOptions::default()).await
    }

    /// Serve an inbound request.
    pub async fn handle(&self, request: &VerifyRequest) -> Verdict {
        self.verify_with(&request.email, VerifyOptions::from(request))
            .await
    }

    /// Verify a batch, preserving input order.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::BatchTooLarge`] for more than
    /// [`MAX_BATCH_SIZE`] addresses.
    pub async fn verify_batch(
        &self,
        emails: &[String],
        options: VerifyOptions,
    ) -> Result<Vec<Verdict>, VerifyError> {
        if emails.len() > MAX_BATCH_SIZE {
            return Err(VerifyError::BatchTooLarge {
                len: emails.len(),
                max: MAX_BATCH_SIZE,
            });
        }
        let verifications = emails
            .iter()
            .map(|email| self.verify_with(email, options.clone()));
        Ok(futures_util::future::join_all(verifications).await)
    }

    /// Serve an inbound batch request.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::BatchTooLarge`] for oversize batches.
    pub async fn handle_batch(
        &self,
        request: &BatchVerifyRequest,
    ) -> Result<BatchVerifyResponse, VerifyError> {
        let results = self
            .verify_batch(&request.emails, VerifyOptions::default())
            .await?;
        Ok(BatchVerifyResponse { results })
    }

    /// Verify one address.
    pub async fn verify_with(&self, raw: &str, options: VerifyOptions) -> Verdict {
        let started = std::time::Instant::now();

        let address = match EmailAddress::parse(raw) {
            Ok(address) => address,
            Err(err) => {
                debug!(error = %err, "input rejected by syntax filter");
                let fingerprint = self.inner.fingerprinter.fingerprint_raw(raw);
                let mut verdict = blank_verdict(fingerprint, None, started);
                verdict.status = VerdictStatus::Invalid;
                verdict.reason = reason::SYNTAX_ERROR.to_string();
                verdict.confidence = 1.0;
                return verdict;
            }
        };

        let fingerprint = self.inner.fingerprinter.fingerprint(&address);
        let deadline = Instant::now()
            + options
                .deadline
                .unwrap_or_else(|| self.inner.config.verify.default_deadline());

        loop {
            match self.inner.results.begin(fingerprint, options.skip_cache) {
                Begin::Hit(verdict) => {
                    debug!(fingerprint = %fingerprint, "result cache hit");
                    return verdict;
                }
                Begin::Follower(rx) => {
                    match tokio::time::timeout_at(deadline, result_cache::await_leader(rx)).await {
                        Ok(Some(verdict)) => return verdict,
                        // The leader went away without a verdict; take over.
                        Ok(None) => {}
                        Err(_) => return self.deadline_verdict(&address, fingerprint, started),
                    }
                }
                Begin::Leader(guard) => {
                    let computed = tokio::time::timeout_at(
                        deadline,
                        self.compute(&address, fingerprint, deadline, started),
                    )
                    .await;

                    return match computed {
                        Ok(verdict) => {
                            guard.complete(&verdict, is_cacheable(&verdict));
                            verdict
                        }
                        Err(_) => {
                            // Dropping the guard wakes followers; nothing is
                            // written to the cache on cancellation.
                            drop(guard);
                            self.deadline_verdict(&address, fingerprint, started)
                        }
                    };
                }
            }
        }
    }

    /// The uncached pipeline for one address.
    async fn compute(
        &self,
        address: &EmailAddress,
        fingerprint: Fingerprint,
        deadline: Instant,
        started: std::time::Instant,
    ) -> Verdict {
        let inner = &self.inner;
        let domain = address.domain().clone();

        // Disposable domains are decided without touching the network.
        if inner.disposable.contains(&domain) || inner.domains.is_disposable(&domain) {
            inner.domains.mark_disposable(&domain);
            let mut verdict = blank_verdict(fingerprint, Some(domain.clone()), started);
            verdict.status = VerdictStatus::Risky;
            verdict.reason = reason::DISPOSABLE_DOMAIN.to_string();
            verdict.confidence = 0.90;
            verdict.is_disposable = true;
            return verdict;
        }

        // A fresh catch-all judgment makes probing pointless.
        if inner.domains.catch_all(&domain) == CatchAllStatus::Yes {
            let mut verdict = blank_verdict(fingerprint, Some(domain.clone()), started);
            verdict.status = VerdictStatus::CatchAll;
            verdict.reason = reason::CATCH_ALL_DOMAIN.to_string();
            verdict.confidence = 0.50;
            verdict.is_catch_all = true;
            if let Some(meta) = inner.domains.snapshot(&domain) {
                verdict.mx_records = meta.mx_records;
            }
            return verdict;
        }

        let resolved = match inner.resolver.resolve(&domain).await {
            Ok(resolved) => resolved,
            Err(err) => return self.dns_verdict(address, fingerprint, started, &err),
        };
        inner
            .domains
            .record_mx(&domain, &resolved.records, resolved.expires_at);

        let forward_path = format!("{}@{domain}", address.smtp_local());
        let mut last_reply: Option<ProbeReply> = None;
        let mut last_error: Option<ProbeError> = None;
        let mut decided: Option<ProbeReply> = None;

        for mx in resolved.records.iter() {
            let lease = match inner.gate.acquire(&domain, &mx.exchange, deadline).await {
                Ok(lease) => lease,
                Err(err) => {
                    debug!(domain = %domain, error = %err, "rate gate refused a lease");
                    let mut verdict =
                        blank_verdict(fingerprint, Some(domain.clone()), started);
                    verdict.reason = reason::RATE_LIMIT_TIMEOUT.to_string();
                    verdict.confidence = 0.20;
                    verdict.mx_records = resolved.records.to_vec();
                    return verdict;
                }
            };
            inner.domains.record_probe(&domain);

            let outcome = inner.prober.probe_mx(&forward_path, mx).await;
            drop(lease);

            match outcome {
                Ok(reply) if reply.is_deterministic() => {
                    decided = Some(reply);
                    break;
                }
                Ok(reply) => last_reply = Some(reply),
                Err(err) if err.is_rate_limited() => {
                    inner.gate.penalize(&domain);
                    let mut verdict =
                        blank_verdict(fingerprint, Some(domain.clone()), started);
                    verdict.reason = reason::RATE_LIMITED.to_string();
                    verdict.confidence = 0.20;
                    verdict.smtp_code = Some(421);
                    verdict.mx_host = Some(mx.exchange.clone());
                    verdict.mx_records = resolved.records.to_vec();
                    return verdict;
                }
                Err(err) => last_error = Some(err),
            }
        }

        if let Some(reply) = decided {
            return self
                .decide(address, fingerprint, started, &resolved, reply, deadline)
                .await;
        }

        // Every MX fell short of a deterministic RCPT reply.
        let mut verdict = blank_verdict(fingerprint, Some(domain), started);
        verdict.mx_records = resolved.records.to_vec();
        if let Some(reply) = last_reply {
            let classification = classify::classify_code(reply.code);
            verdict.status = classification.status;
            verdict.reason = classification.reason;
            verdict.confidence = classification.confidence;
            verdict.smtp_code = Some(reply.code);
            verdict.smtp_response = Some(reply.response);
            verdict.mx_host = Some(reply.mx_host);
        } else {
            let classification = classify::classify_no_reply();
            verdict.status = classification.status;
            verdict.confidence = classification.confidence;
            verdict.reason = match last_error {
                Some(err) if err.is_protocol() => reason::PROTOCOL_ERROR.to_string(),
                _ => classification.reason,
            };
        }
        verdict
    }

    /// Turn a deterministic RCPT reply into the final verdict, refining a
    /// provisional accept with catch-all detection before anything is
    /// cached.
    async fn decide(
        &self,
        address: &EmailAddress,
        fingerprint: Fingerprint,
        started: std::time::Instant,
        resolved: &ResolvedMx,
        reply: ProbeReply,
        deadline: Instant,
    ) -> Verdict {
        let inner = &self.inner;
        let domain = address.domain().clone();
        let classification = classify::classify_code(reply.code);

        let mut is_catch_all = false;
        if classification.status == VerdictStatus::Valid {
            is_catch_all = match inner.domains.catch_all(&domain) {
                CatchAllStatus::Yes => true,
                CatchAllStatus::No => false,
                CatchAllStatus::Unknown if inner.catchall.enabled() => {
                    let winning_mx = resolved
                        .records
                        .iter()
                        .find(|mx| mx.exchange == reply.mx_host)
                        .unwrap_or(&resolved.records[0]);
                    match inner
                        .catchall
                        .judge(&inner.prober, &inner.gate, &domain, winning_mx, deadline)
                        .await
                    {
                        CatchAllJudgment::CatchAll => {
                            inner.domains.record_catch_all(&domain, true);
                            true
                        }
                        CatchAllJudgment::NotCatchAll => {
                            inner.domains.record_catch_all(&domain, false);
                            false
                        }
                        CatchAllJudgment::Inconclusive => false,
                    }
                }
                CatchAllStatus::Unknown => false,
            };
        }

        let mut verdict = blank_verdict(fingerprint, Some(domain.clone()), started);
        verdict.smtp_code = Some(reply.code);
        verdict.smtp_response = Some(reply.response);
        verdict.mx_host = Some(reply.mx_host);
        verdict.mx_records = resolved.records.to_vec();

        if is_catch_all {
            verdict.status = VerdictStatus::CatchAll;
            verdict.reason = reason::CATCH_ALL_DOMAIN.to_string();
            verdict.confidence = 0.50;
            verdict.is_catch_all = true;
        } else {
            verdict.status = classification.status;
            verdict.reason = classification.reason;
            verdict.confidence = classification.confidence;
        }

        info!(
            fingerprint = %fingerprint,
            domain = %domain,
            status = ?verdict.status,
            reason = %verdict.reason,
            smtp_code = reply.code,
            "verification decided"
        );
        verdict
    }

    fn dns_verdict(
        &self,
        address: &EmailAddress,
        fingerprint: Fingerprint,
        started: std::time::Instant,
        err: &DnsError,
    ) -> Verdict {
        let mut verdict = blank_verdict(fingerprint, Some(address.domain().clone()), started);
        match err {
            DnsError::NoMx(_) | DnsError::NxDomain(_) => {
                verdict.status = VerdictStatus::Invalid;
                verdict.reason = reason::NO_MX_RECORDS.to_string();
                verdict.confidence = 0.95;
            }
            DnsError::Timeout(_) => {
                verdict.reason = reason::DNS_TIMEOUT.to_string();
                verdict.confidence = 0.20;
            }
            DnsError::Lookup { .. } => {
                verdict.reason = reason::DNS_SERVFAIL.to_string();
                verdict.confidence = 0.20;
            }
        }
        verdict
    }

    fn deadline_verdict(
        &self,
        address: &EmailAddress,
        fingerprint: Fingerprint,
        started: std::time::Instant,
    ) -> Verdict {
        let mut verdict = blank_verdict(fingerprint, Some(address.domain().clone()), started);
        verdict.reason = reason::DEADLINE_EXCEEDED.to_string();
        verdict.confidence = 0.10;
        verdict
    }
}

/// An unknown-status verdict skeleton; branches overwrite what they know.
fn blank_verdict(
    fingerprint: Fingerprint,
    domain: Option<Domain>,
    started: std::time::Instant,
) -> Verdict {
    Verdict {
        fingerprint,
        domain,
        status: VerdictStatus::Unknown,
        reason: String::new(),
        confidence: 0.0,
        smtp_code: None,
        smtp_response: None,
        mx_host: None,
        mx_records: Vec::new(),
        is_catch_all: false,
        is_disposable: false,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        checked_at: Utc::now(),
    }
}

/// Transient outcomes whose cause clears on its own stay out of the cache:
/// a cancelled caller's deadline and the rate-limit family, which must be
/// retryable after the cool-down.
fn is_cacheable(verdict: &Verdict) -> bool {
    !matches!(
        verdict.reason.as_str(),
        reason::DEADLINE_EXCEEDED | reason::RATE_LIMITED | reason::RATE_LIMIT_TIMEOUT
    )
}
