//! External log channel for human-readable campaign events.

use async_trait::async_trait;

use crate::error::Result;

/// Informational sink. Never used for control flow.
#[async_trait]
pub trait LogChannel: Send + Sync {
    async fn post(&self, line: &str) -> Result<()>;
}
