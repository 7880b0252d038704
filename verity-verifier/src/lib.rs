#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

//! Deliverability verification core.
//!
//! Answers, for a submitted address, whether the mailbox is likely to
//! exist, by running an SMTP RCPT TO handshake against the recipient's
//! mail exchanger, without ever transmitting message content. The pipeline
//! is syntax filter → MX resolution → rate-gated SMTP probe → reply
//! classification → catch-all refinement → caching; inconclusive is a
//! first-class outcome.
//!
//! The entrypoint is [`Verifier`]:
//!
//! ```rust,no_run
//! use verity_verifier::{Verifier, VerifierConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VerifierConfig::new("verify.example.com", "probe@example.com");
//! let verifier = Verifier::new(config)?;
//! let verdict = verifier.verify("user@example.com").await;
//! println!("{} ({})", serde_json::to_string(&verdict)?, verdict.confidence);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod catchall;
pub mod classify;
pub mod config;
pub mod disposable;
pub mod dns;
pub mod domain_meta;
pub mod error;
pub mod probe;
pub mod rate;
pub mod result_cache;
pub mod verdict;
pub mod verifier;

pub use api::{BatchVerifyRequest, BatchVerifyResponse, Priority, VerifyRequest};
pub use config::{ConfigError, VerifierConfig};
pub use dns::{DnsError, MxAnswer, MxRecord, MxSource};
pub use error::VerifyError;
pub use verdict::{Verdict, VerdictStatus};
pub use verifier::{Verifier, VerifyOptions};
