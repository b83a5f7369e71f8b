//! Eligibility gate: asks the exclusion oracle before every send.
//!
//! The answer is never cached: a recipient may pick up a disqualifying
//! attribute between the initial message and a reminder. When the oracle
//! cannot answer in time the gate lets the send through and says so.

use nudge_core::traits::EligibilityOracle;
use std::sync::Arc;
use std::time::Duration;

/// Result of one gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Excluded,
    /// Oracle unavailable; treated as eligible.
    Degraded,
}

impl Eligibility {
    pub fn is_excluded(&self) -> bool {
        matches!(self, Eligibility::Excluded)
    }
}

pub struct EligibilityGate {
    oracle: Arc<dyn EligibilityOracle>,
    timeout: Duration,
}

impl EligibilityGate {
    pub fn new(oracle: Arc<dyn EligibilityOracle>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }

    pub async fn check(&self, identity: &str) -> Eligibility {
        match tokio::time::timeout(self.timeout, self.oracle.is_excluded(identity)).await {
            Ok(Ok(true)) => Eligibility::Excluded,
            Ok(Ok(false)) => Eligibility::Eligible,
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Eligibility oracle unavailable for {identity}, allowing send: {e}");
                Eligibility::Degraded
            }
            Err(_) => {
                tracing::warn!(
                    "⚠️ Eligibility check for {identity} timed out after {}s, allowing send",
                    self.timeout.as_secs()
                );
                Eligibility::Degraded
            }
        }
    }

    pub async fn is_excluded(&self, identity: &str) -> bool {
        self.check(identity).await.is_excluded()
    }
}
