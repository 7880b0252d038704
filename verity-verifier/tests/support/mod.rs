//! Shared fixtures for the verifier integration tests.
#![allow(dead_code)]

pub mod mock_server;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use verity_common::Domain;
use verity_verifier::config::VerifierConfig;
use verity_verifier::dns::{DnsError, MxAnswer, MxRecord, MxSource};

/// Scripted DNS answers, keyed by domain.
#[derive(Clone)]
pub enum StaticAnswer {
    Records(Vec<MxRecord>),
    NoMx,
    NxDomain,
    Timeout,
}

/// An [`MxSource`] that serves scripted answers; unknown domains read as
/// NXDOMAIN.
#[derive(Default)]
pub struct StaticMxSource {
    answers: Mutex<HashMap<String, StaticAnswer>>,
}

impl StaticMxSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, domain: &str, answer: StaticAnswer) {
        self.answers.lock().insert(domain.to_string(), answer);
    }
}

#[async_trait]
impl MxSource for StaticMxSource {
    async fn lookup_mx(&self, domain: &Domain) -> Result<MxAnswer, DnsError> {
        let answer = self.answers.lock().get(domain.as_str()).cloned();
        match answer {
            Some(StaticAnswer::Records(records)) => Ok(MxAnswer {
                records,
                ttl_secs: 3600,
            }),
            Some(StaticAnswer::NoMx) => Err(DnsError::NoMx(domain.clone())),
            Some(StaticAnswer::Timeout) => Err(DnsError::Timeout(domain.clone())),
            Some(StaticAnswer::NxDomain) | None => Err(DnsError::NxDomain(domain.clone())),
        }
    }
}

/// A configuration tuned for tests: second-scale timeouts, millisecond
/// backoffs and pacing, seeded catch-all randomness.
pub fn test_config() -> VerifierConfig {
    let mut config = VerifierConfig::new("verify.test.local", "probe@test.local");
    config.smtp.connect_timeout_secs = 2;
    config.smtp.read_timeout_secs = 1;
    config.smtp.write_timeout_secs = 1;
    config.rate.per_domain_interval_ms = 10;
    config.rate.penalty_cooldown_secs = 2;
    config.rate.jitter_factor = 0.0;
    config.retry.base_backoff_ms = 10;
    config.retry.jitter_factor = 0.0;
    config.catchall.intra_probe_delay_ms = 10;
    config.catchall.seed = Some(7);
    config.verify.default_deadline_secs = 30;
    config.verify.fingerprint_salt = Some("integration-tests".to_string());
    config
}
