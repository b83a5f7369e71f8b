//! Delivery executor: one bounded send attempt, classified, then paced.
//!
//! Pacing is the only rate control: after every `Sent` the executor sleeps
//! before handing control back, so successive successful sends are spaced out.
//! Non-sends return immediately.

use nudge_core::error::DeliveryError;
use nudge_core::traits::Transport;
use nudge_core::types::{DeliveryOutcome, StageKey};
use std::sync::Arc;
use std::time::Duration;

use crate::shutdown::Shutdown;

/// Pause applied after a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub initial: Duration,
    pub reminder: Duration,
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            reminder: Duration::ZERO,
        }
    }

    pub fn for_key(&self, key: StageKey) -> Duration {
        match key {
            StageKey::Initial => self.initial,
            StageKey::Reminder1 | StageKey::Reminder2 => self.reminder,
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(15),
            reminder: Duration::from_secs(5),
        }
    }
}

pub struct DeliveryExecutor {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    pacing: Pacing,
}

impl DeliveryExecutor {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration, pacing: Pacing) -> Self {
        Self {
            transport,
            timeout,
            pacing,
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Attempt one send. A shutdown request cuts the pacing pause short but
    /// never the send itself.
    pub async fn send(
        &self,
        identity: &str,
        key: StageKey,
        body: &str,
        shutdown: &mut Shutdown,
    ) -> DeliveryOutcome {
        let outcome = self.attempt(identity, key, body).await;
        if outcome == DeliveryOutcome::Sent {
            let pause = self.pacing.for_key(key);
            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.wait() => {
                        tracing::debug!("Pacing pause cut short by shutdown");
                    }
                }
            }
        }
        outcome
    }

    /// One bounded send with no pacing.
    pub async fn attempt(&self, identity: &str, key: StageKey, body: &str) -> DeliveryOutcome {
        match tokio::time::timeout(self.timeout, self.transport.send(identity, body)).await {
            Ok(Ok(())) => DeliveryOutcome::Sent,
            Ok(Err(e)) => {
                let outcome = classify(&e);
                tracing::warn!(
                    "⚠️ {} send of '{key}' to {identity} failed: {e}",
                    self.transport.name()
                );
                outcome
            }
            Err(_) => {
                tracing::warn!(
                    "⚠️ {} send of '{key}' to {identity} timed out after {}s",
                    self.transport.name(),
                    self.timeout.as_secs()
                );
                DeliveryOutcome::Throttled
            }
        }
    }
}

fn classify(error: &DeliveryError) -> DeliveryOutcome {
    match error {
        DeliveryError::RateLimited { .. } | DeliveryError::Unavailable(_) => {
            DeliveryOutcome::Throttled
        }
        DeliveryError::Unreachable(_) | DeliveryError::Rejected(_) => {
            DeliveryOutcome::PermanentFailure(error.to_string())
        }
    }
}
