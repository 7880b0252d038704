//! Inbound request shapes.
//!
//! The JSON surface the HTTP collaborator submits to the facade. The
//! facade itself is language-agnostic: these are plain serde types.

use serde::{Deserialize, Serialize};

use crate::verdict::Verdict;

/// Largest batch a single request may carry.
pub const MAX_BATCH_SIZE: usize = 1000;

/// A single-address verification request.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub email: String,

    /// Bypass the result cache read (the result is still stored).
    #[serde(default)]
    pub skip_cache: bool,

    /// Per-request deadline in milliseconds.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

/// Scheduling hint carried by batch requests. Recorded, not acted on; the
/// queueing tiers live in the out-of-scope quota collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Express,
    Standard,
    Bulk,
}

/// A batch verification request, at most [`MAX_BATCH_SIZE`] addresses.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchVerifyRequest {
    pub emails: Vec<String>,

    #[serde(default)]
    pub priority: Option<Priority>,
}

/// Batch results in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchVerifyResponse {
    pub results: Vec<Verdict>,
}
