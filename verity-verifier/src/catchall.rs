//! Catch-all detection.
//!
//! A provisional "mailbox exists" reply means little if the domain accepts
//! every local-part. The detector probes a handful of random local-parts
//! that are vanishingly unlikely to be real mailboxes; if at least half are
//! accepted the domain is judged a catch-all. The judgment is written to
//! the domain metadata with a long freshness window, since domain configuration
//! changes slowly.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tokio::time::Instant;
use tracing::debug;

use verity_common::Domain;

use crate::config::CatchAllConfig;
use crate::dns::MxRecord;
use crate::probe::{ProbeStage, SmtpProber};
use crate::rate::RateGate;

/// Outcome of a catch-all judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchAllJudgment {
    /// The domain accepts arbitrary local-parts.
    CatchAll,
    /// Random local-parts were rejected; accept replies are meaningful.
    NotCatchAll,
    /// Every probe was inconclusive (4xx, timeout); nothing was learned.
    Inconclusive,
}

/// Probes random local-parts through the Rate Gate to judge a domain.
pub struct CatchAllDetector {
    config: CatchAllConfig,
    rng: Mutex<SmallRng>,
}

impl CatchAllDetector {
    #[must_use]
    pub fn new(config: CatchAllConfig) -> Self {
        let rng = config
            .seed
            .map_or_else(SmallRng::from_os_rng, SmallRng::seed_from_u64);
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    pub const fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// A local-part no real mailbox plausibly uses.
    fn random_local(&self) -> String {
        format!("probe-{:016x}", self.rng.lock().random::<u64>())
    }

    /// Judge whether `domain` blindly accepts mail, probing via the MX that
    /// produced the provisional accept.
    pub async fn judge(
        &self,
        prober: &SmtpProber,
        gate: &RateGate,
        domain: &Domain,
        mx: &MxRecord,
        deadline: Instant,
    ) -> CatchAllJudgment {
        let count = self.config.probe_count.max(1);
        let mut accepted = 0u32;
        let mut rejected = 0u32;

        for i in 0..count {
            if i > 0 {
                tokio::time::sleep(self.config.intra_probe_delay()).await;
            }

            let forward_path = format!("{}@{domain}", self.random_local());
            let Ok(lease) = gate.acquire(domain, &mx.exchange, deadline).await else {
                debug!(domain = %domain, "catch-all probe gave up waiting for the rate gate");
                break;
            };
            let outcome = prober.probe_once(&forward_path, mx).await;
            drop(lease);

            match outcome {
                Ok(reply) if reply.stage == ProbeStage::Rcpt => match reply.code {
                    250 | 251 => accepted += 1,
                    550 | 551 | 553 => rejected += 1,
                    // 4xx and oddball codes count toward neither total.
                    _ => {}
                },
                Ok(_) => {}
                Err(err) if err.is_rate_limited() => {
                    gate.penalize(domain);
                    break;
                }
                Err(err) => {
                    debug!(domain = %domain, error = %err, "catch-all probe inconclusive");
                }
            }
        }

        let judgment = decide(accepted, rejected, count);
        debug!(domain = %domain, accepted, rejected, ?judgment, "catch-all judgment");
        judgment
    }
}

/// Catch-all iff at least ⌈count/2⌉ probes were accepted; all-inconclusive
/// rounds decide nothing.
const fn decide(accepted: u32, rejected: u32, count: u32) -> CatchAllJudgment {
    if accepted >= count.div_ceil(2) {
        CatchAllJudgment::CatchAll
    } else if accepted == 0 && rejected == 0 {
        CatchAllJudgment::Inconclusive
    } else {
        CatchAllJudgment::NotCatchAll
    }
}
