//! Recipient record store.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{CompletionSubmission, RecipientRecord, RecordPatch, Stage, UpdateOutcome};

/// Tabular store with one row per recipient.
///
/// `load_all` returns rows in the store's natural order. `update` must be
/// idempotent: writing the same patch twice leaves the same row.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<RecipientRecord>>;

    /// Fetch one record, `None` when the identity is not in the store.
    async fn get(&self, identity: &str) -> Result<Option<RecipientRecord>>;

    async fn update(&self, identity: &str, patch: &RecordPatch) -> Result<UpdateOutcome>;

    /// Add recipients as `NotContacted`. Existing identities are left untouched.
    /// Returns how many rows were inserted.
    async fn enroll(&self, identities: &[String]) -> Result<usize>;

    /// Append a completion audit row.
    async fn append_response(&self, submission: &CompletionSubmission) -> Result<()>;

    async fn stage_counts(&self) -> Result<BTreeMap<Stage, usize>>;
}
