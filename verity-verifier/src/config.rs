//! Verifier configuration.
//!
//! Every tunable recognized by the core lives here, deserializable from the
//! `[smtp]` / `[dns]` / `[rate]` / `[retry]` / `[catchall]` / `[cache]` /
//! `[verify]` sections of the config file. Defaults follow the shipped
//! policy; `smtp.ehlo_hostname` and `smtp.mail_from` have no safe default
//! and must be provided.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("smtp.ehlo_hostname must be set")]
    MissingEhloHostname,

    #[error("smtp.mail_from must be set")]
    MissingMailFrom,

    #[error("rate.per_domain_concurrency must be at least 1")]
    ZeroDomainConcurrency,

    #[error("rate.per_mx_concurrency must be at least 1")]
    ZeroMxConcurrency,

    #[error("retry.max_attempts must be at least 1")]
    ZeroAttempts,
}

/// Top-level configuration for the verification core.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifierConfig {
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub rate: RateConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub catchall: CatchAllConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub disposable: DisposableConfig,
}

impl VerifierConfig {
    /// A configuration with default policy and the given SMTP identity.
    #[must_use]
    pub fn new(ehlo_hostname: impl Into<String>, mail_from: impl Into<String>) -> Self {
        Self {
            smtp: SmtpConfig::new(ehlo_hostname, mail_from),
            dns: DnsConfig::default(),
            rate: RateConfig::default(),
            retry: RetryConfig::default(),
            catchall: CatchAllConfig::default(),
            cache: CacheConfig::default(),
            verify: VerifyConfig::default(),
            disposable: DisposableConfig::default(),
        }
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violated [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smtp.ehlo_hostname.is_empty() {
            return Err(ConfigError::MissingEhloHostname);
        }
        if self.smtp.mail_from.is_empty() {
            return Err(ConfigError::MissingMailFrom);
        }
        if self.rate.per_domain_concurrency == 0 {
            return Err(ConfigError::ZeroDomainConcurrency);
        }
        if self.rate.per_mx_concurrency == 0 {
            return Err(ConfigError::ZeroMxConcurrency);
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}

/// SMTP session identity and timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Hostname announced in EHLO. Required.
    pub ehlo_hostname: String,

    /// Return-path for MAIL FROM; must resolve, or probes look like
    /// backscatter. Required.
    pub mail_from: String,

    /// TCP connect timeout in seconds (default: 10).
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Per-reply read timeout in seconds (default: 15).
    #[serde(default = "defaults::read_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Write timeout in seconds (default: 15).
    #[serde(default = "defaults::write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Skip TLS certificate validation on STARTTLS (default: true; MX hosts
    /// frequently present certificates that do not match their MX name).
    #[serde(default = "defaults::tls_insecure_skip_verify")]
    pub tls_insecure_skip_verify: bool,
}

impl SmtpConfig {
    #[must_use]
    pub fn new(ehlo_hostname: impl Into<String>, mail_from: impl Into<String>) -> Self {
        Self {
            ehlo_hostname: ehlo_hostname.into(),
            mail_from: mail_from.into(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            read_timeout_secs: defaults::read_timeout_secs(),
            write_timeout_secs: defaults::write_timeout_secs(),
            tls_insecure_skip_verify: defaults::tls_insecure_skip_verify(),
        }
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// DNS query behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// Query timeout in seconds (default: 5).
    #[serde(default = "defaults::dns_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::dns_timeout_secs(),
        }
    }
}

impl DnsConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Rate Gate limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RateConfig {
    /// Minimum spacing between probe starts per domain, in milliseconds
    /// (default: 1000).
    #[serde(default = "defaults::per_domain_interval_ms")]
    pub per_domain_interval_ms: u64,

    /// Concurrent probe ceiling per domain (default: 5).
    #[serde(default = "defaults::per_domain_concurrency")]
    pub per_domain_concurrency: usize,

    /// Concurrent probe ceiling per MX host (default: 50).
    #[serde(default = "defaults::per_mx_concurrency")]
    pub per_mx_concurrency: usize,

    /// Interval multiplier applied after a 421 (default: 2.0).
    #[serde(default = "defaults::penalty_factor")]
    pub penalty_factor: f64,

    /// How long the penalized interval stays in force, in seconds
    /// (default: 60). Jittered so penalized domains do not re-align.
    #[serde(default = "defaults::penalty_cooldown_secs")]
    pub penalty_cooldown_secs: u64,

    /// Jitter factor for the penalty window (default: 0.1).
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            per_domain_interval_ms: defaults::per_domain_interval_ms(),
            per_domain_concurrency: defaults::per_domain_concurrency(),
            per_mx_concurrency: defaults::per_mx_concurrency(),
            penalty_factor: defaults::penalty_factor(),
            penalty_cooldown_secs: defaults::penalty_cooldown_secs(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RateConfig {
    #[must_use]
    pub const fn per_domain_interval(&self) -> Duration {
        Duration::from_millis(self.per_domain_interval_ms)
    }

    #[must_use]
    pub const fn penalty_cooldown(&self) -> Duration {
        Duration::from_secs(self.penalty_cooldown_secs)
    }
}

/// Retry policy for probe attempts against a single MX.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per MX (default: 3).
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base backoff in milliseconds (default: 2000).
    #[serde(default = "defaults::base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Exponential backoff factor (default: 2.0).
    #[serde(default = "defaults::backoff_factor")]
    pub factor: f64,

    /// Backoff jitter factor (default: 0.1).
    #[serde(default = "defaults::jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_backoff_ms: defaults::base_backoff_ms(),
            factor: defaults::backoff_factor(),
            jitter_factor: defaults::jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Backoff before the next attempt; `attempt` is 1-indexed.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.base_backoff_ms);
        base.mul_f64(self.factor.powi(attempt.saturating_sub(1).try_into().unwrap_or(i32::MAX)))
    }
}

/// Catch-all detection behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct CatchAllConfig {
    /// Whether catch-all detection runs at all (default: true).
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Random local-parts probed per judgment (default: 2).
    #[serde(default = "defaults::probe_count")]
    pub probe_count: u32,

    /// Delay between consecutive catch-all probes in milliseconds
    /// (default: 500).
    #[serde(default = "defaults::intra_probe_delay_ms")]
    pub intra_probe_delay_ms: u64,

    /// How long a catch-all judgment stays fresh, in seconds
    /// (default: 7 days; domain configuration changes slowly).
    #[serde(default = "defaults::catchall_freshness_secs")]
    pub freshness_secs: u64,

    /// Fixed RNG seed for the probe local-parts. Unset draws from the OS;
    /// tests pin it for reproducible judgments.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for CatchAllConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            probe_count: defaults::probe_count(),
            intra_probe_delay_ms: defaults::intra_probe_delay_ms(),
            freshness_secs: defaults::catchall_freshness_secs(),
            seed: None,
        }
    }
}

impl CatchAllConfig {
    #[must_use]
    pub const fn intra_probe_delay(&self) -> Duration {
        Duration::from_millis(self.intra_probe_delay_ms)
    }

    #[must_use]
    pub const fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

/// TTLs and capacities of the in-process caches.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Lower clamp on positive MX cache TTL in seconds (default: 1 hour).
    #[serde(default = "defaults::mx_ttl_min_secs")]
    pub mx_ttl_min_secs: u64,

    /// Upper clamp on positive MX cache TTL in seconds (default: 24 hours).
    #[serde(default = "defaults::mx_ttl_max_secs")]
    pub mx_ttl_max_secs: u64,

    /// TTL for negative MX answers in seconds (default: 10 minutes;
    /// never permanent, since records may be published later).
    #[serde(default = "defaults::mx_negative_ttl_secs")]
    pub mx_negative_ttl_secs: u64,

    /// Result cache TTL in seconds (default: 7 days).
    #[serde(default = "defaults::result_ttl_secs")]
    pub result_ttl_secs: u64,

    /// Result cache entry bound; least-recently-used entries are evicted
    /// past this (default: 10000).
    #[serde(default = "defaults::result_capacity")]
    pub result_capacity: usize,

    /// Domain metadata TTL in seconds (default: 24 hours).
    #[serde(default = "defaults::domain_meta_ttl_secs")]
    pub domain_meta_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mx_ttl_min_secs: defaults::mx_ttl_min_secs(),
            mx_ttl_max_secs: defaults::mx_ttl_max_secs(),
            mx_negative_ttl_secs: defaults::mx_negative_ttl_secs(),
            result_ttl_secs: defaults::result_ttl_secs(),
            result_capacity: defaults::result_capacity(),
            domain_meta_ttl_secs: defaults::domain_meta_ttl_secs(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn mx_ttl_min(&self) -> Duration {
        Duration::from_secs(self.mx_ttl_min_secs)
    }

    #[must_use]
    pub const fn mx_ttl_max(&self) -> Duration {
        Duration::from_secs(self.mx_ttl_max_secs)
    }

    #[must_use]
    pub const fn mx_negative_ttl(&self) -> Duration {
        Duration::from_secs(self.mx_negative_ttl_secs)
    }

    #[must_use]
    pub const fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    #[must_use]
    pub const fn domain_meta_ttl(&self) -> Duration {
        Duration::from_secs(self.domain_meta_ttl_secs)
    }
}

/// Facade-level behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyConfig {
    /// Deadline applied when the caller does not pass one, in seconds
    /// (default: 60).
    #[serde(default = "defaults::default_deadline_secs")]
    pub default_deadline_secs: u64,

    /// Salt for address fingerprints. Set it to keep fingerprints stable
    /// across restarts; unset draws a random salt at startup.
    #[serde(default)]
    pub fingerprint_salt: Option<String>,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            default_deadline_secs: defaults::default_deadline_secs(),
            fingerprint_salt: None,
        }
    }
}

impl VerifyConfig {
    #[must_use]
    pub const fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }
}

/// Disposable-domain list extension.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DisposableConfig {
    /// Domains appended to the built-in disposable list.
    #[serde(default)]
    pub extra_domains: Vec<String>,
}

mod defaults {
    pub const fn connect_timeout_secs() -> u64 {
        10
    }
    pub const fn read_timeout_secs() -> u64 {
        15
    }
    pub const fn write_timeout_secs() -> u64 {
        15
    }
    pub const fn tls_insecure_skip_verify() -> bool {
        true
    }

    pub const fn dns_timeout_secs() -> u64 {
        5
    }

    pub const fn per_domain_interval_ms() -> u64 {
        1000
    }
    pub const fn per_domain_concurrency() -> usize {
        5
    }
    pub const fn per_mx_concurrency() -> usize {
        50
    }
    pub const fn penalty_factor() -> f64 {
        2.0
    }
    pub const fn penalty_cooldown_secs() -> u64 {
        60
    }
    pub const fn jitter_factor() -> f64 {
        0.1
    }

    pub const fn max_attempts() -> u32 {
        3
    }
    pub const fn base_backoff_ms() -> u64 {
        2000
    }
    pub const fn backoff_factor() -> f64 {
        2.0
    }

    pub const fn enabled() -> bool {
        true
    }
    pub const fn probe_count() -> u32 {
        2
    }
    pub const fn intra_probe_delay_ms() -> u64 {
        500
    }
    pub const fn catchall_freshness_secs() -> u64 {
        7 * 24 * 3600
    }

    pub const fn mx_ttl_min_secs() -> u64 {
        3600
    }
    pub const fn mx_ttl_max_secs() -> u64 {
        24 * 3600
    }
    pub const fn mx_negative_ttl_secs() -> u64 {
        600
    }
    pub const fn result_ttl_secs() -> u64 {
        7 * 24 * 3600
    }
    pub const fn result_capacity() -> usize {
        10_000
    }
    pub const fn domain_meta_ttl_secs() -> u64 {
        24 * 3600
    }

    pub const fn default_deadline_secs() -> u64 {
        60
    }
}
