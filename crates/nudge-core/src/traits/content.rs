//! Message template source.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;

#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Read every `key → content` pair currently defined.
    async fn fetch(&self) -> Result<HashMap<String, String>>;
}
