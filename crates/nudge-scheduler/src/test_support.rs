//! In-crate fakes for the campaign collaborators.

use async_trait::async_trait;
use chrono::Utc;
use nudge_core::error::{DeliveryError, NudgeError, Result};
use nudge_core::traits::{ContentSource, EligibilityOracle, LogChannel, RecordStore, Transport};
use nudge_core::types::{
    Column, CompletionSubmission, RecipientRecord, RecordPatch, Stage, UpdateOutcome,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::persistence::CampaignDb;

/// Records every send; individual recipients can be made to fail.
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<(String, String)>>,
    failures: Mutex<HashMap<String, DeliveryError>>,
    delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, identity: &str) -> usize {
        self.sent().iter().filter(|(id, _)| id == identity).count()
    }

    pub fn fail_with(&self, identity: &str, error: DeliveryError) {
        self.failures.lock().unwrap().insert(identity.to_string(), error);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send(&self, identity: &str, body: &str) -> std::result::Result<(), DeliveryError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().get(identity) {
            return Err(err.clone());
        }
        self.sent
            .lock()
            .unwrap()
            .push((identity.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeOracle {
    excluded: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FakeOracle {
    pub fn exclude(&self, identity: &str) {
        self.excluded.lock().unwrap().insert(identity.to_string());
    }

    pub fn include(&self, identity: &str) {
        self.excluded.lock().unwrap().remove(identity);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EligibilityOracle for FakeOracle {
    async fn is_excluded(&self, identity: &str) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(NudgeError::Eligibility("guild not reachable".into()));
        }
        Ok(self.excluded.lock().unwrap().contains(identity))
    }
}

#[derive(Default)]
pub struct FakeContent {
    rows: Mutex<HashMap<String, String>>,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl FakeContent {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let content = Self::default();
        for (k, v) in pairs {
            content.set(k, v);
        }
        content
    }

    pub fn set(&self, key: &str, value: &str) {
        self.rows
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every fetch wait forever.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentSource for FakeContent {
    async fn fetch(&self) -> Result<HashMap<String, String>> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(NudgeError::Content("quota exceeded".into()));
        }
        Ok(self.rows.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeLog {
    lines: Mutex<Vec<String>>,
}

impl FakeLog {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogChannel for FakeLog {
    async fn post(&self, line: &str) -> Result<()> {
        self.lines.lock().unwrap().push(line.to_string());
        Ok(())
    }
}

/// SQLite store with injectable failures and concurrent-completion hooks.
pub struct FlakyStore {
    pub inner: CampaignDb,
    fail_load: AtomicBool,
    fail_updates: AtomicBool,
    hanging: AtomicBool,
    complete_on_get: Mutex<HashSet<String>>,
    complete_on_update: Mutex<HashSet<String>>,
    updates: AtomicUsize,
}

impl FlakyStore {
    pub async fn with_recipients(ids: &[&str]) -> Self {
        let inner = CampaignDb::open_in_memory(false).unwrap();
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        inner.enroll(&ids).await.unwrap();
        Self {
            inner,
            fail_load: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            complete_on_get: Mutex::new(HashSet::new()),
            complete_on_update: Mutex::new(HashSet::new()),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Make every call wait forever.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    async fn maybe_hang(&self) {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    /// Complete `identity` out-of-band right before the next `get` of it.
    pub fn complete_before_get(&self, identity: &str) {
        self.complete_on_get.lock().unwrap().insert(identity.to_string());
    }

    /// Complete `identity` out-of-band right before the next `update` of it.
    pub fn complete_before_update(&self, identity: &str) {
        self.complete_on_update
            .lock()
            .unwrap()
            .insert(identity.to_string());
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Overwrite a record directly, bypassing guards.
    pub async fn put(&self, record: &RecipientRecord) {
        let mut patch = RecordPatch::new().stage(record.stage);
        for (column, at) in [
            (Column::InitialSentAt, record.initial_sent_at),
            (Column::FirstReminderSentAt, record.first_reminder_sent_at),
            (Column::SecondReminderSentAt, record.second_reminder_sent_at),
            (Column::CompletedAt, record.completed_at),
        ] {
            if let Some(at) = at {
                patch = patch.time(column, at);
            }
        }
        self.inner.update(&record.identity, &patch).await.unwrap();
    }

    pub async fn record(&self, identity: &str) -> RecipientRecord {
        self.inner.get(identity).await.unwrap().unwrap()
    }

    async fn complete_now(&self, identity: &str) {
        let current = self.inner.get(identity).await.unwrap().unwrap();
        let patch = RecordPatch::guarded(current.stage)
            .stage(Stage::Completed)
            .time(Column::CompletedAt, Utc::now());
        self.inner.update(identity, &patch).await.unwrap();
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn load_all(&self) -> Result<Vec<RecipientRecord>> {
        self.maybe_hang().await;
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(NudgeError::Store("sheet quota exceeded".into()));
        }
        self.inner.load_all().await
    }

    async fn get(&self, identity: &str) -> Result<Option<RecipientRecord>> {
        self.maybe_hang().await;
        let hook = self.complete_on_get.lock().unwrap().remove(identity);
        if hook {
            self.complete_now(identity).await;
        }
        self.inner.get(identity).await
    }

    async fn update(&self, identity: &str, patch: &RecordPatch) -> Result<UpdateOutcome> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(NudgeError::Store("write refused".into()));
        }
        let hook = self.complete_on_update.lock().unwrap().remove(identity);
        if hook {
            self.complete_now(identity).await;
        }
        self.inner.update(identity, patch).await
    }

    async fn enroll(&self, identities: &[String]) -> Result<usize> {
        self.inner.enroll(identities).await
    }

    async fn append_response(&self, submission: &CompletionSubmission) -> Result<()> {
        self.maybe_hang().await;
        self.inner.append_response(submission).await
    }

    async fn stage_counts(&self) -> Result<BTreeMap<Stage, usize>> {
        self.inner.stage_counts().await
    }
}
