//! Exclusion oracle.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait EligibilityOracle: Send + Sync {
    /// Whether the recipient currently holds a disqualifying attribute.
    ///
    /// An `Err` means the oracle could not answer.
    async fn is_excluded(&self, identity: &str) -> Result<bool>;
}

/// Oracle that never excludes anyone. Used when no exclusion rule is configured.
pub struct NoExclusions;

#[async_trait]
impl EligibilityOracle for NoExclusions {
    async fn is_excluded(&self, _identity: &str) -> Result<bool> {
        Ok(false)
    }
}
