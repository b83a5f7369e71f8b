//! Outbound message transport.

use async_trait::async_trait;

use crate::error::DeliveryError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name, used in logs.
    fn name(&self) -> &str;

    /// Deliver one rendered message to a recipient.
    async fn send(&self, identity: &str, body: &str) -> std::result::Result<(), DeliveryError>;
}
