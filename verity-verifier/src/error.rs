//! Facade-level errors.
//!
//! Almost nothing escapes [`crate::Verifier`] as an error: recoverable
//! failures become verdicts. What remains is construction problems and
//! structurally invalid requests.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors the facade can actually return.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The configuration is unusable; the process should not start.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A batch request exceeded the size bound.
    #[error("batch of {len} exceeds the maximum of {max}")]
    BatchTooLarge { len: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_actionable() {
        let err = VerifyError::BatchTooLarge {
            len: 1200,
            max: 1000,
        };
        assert_eq!(err.to_string(), "batch of 1200 exceeds the maximum of 1000");
    }
}
