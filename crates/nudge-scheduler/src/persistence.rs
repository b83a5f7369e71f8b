//! SQLite-backed persistence for recipients, completion responses and message content.
//! One file holds the whole campaign and survives restarts.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::{ContentSource, RecordStore};
use nudge_core::types::{
    CellValue, Column, CompletionSubmission, RecipientRecord, RecordPatch, Stage, UpdateOutcome,
};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// SQLite store for all campaign data.
#[derive(Clone)]
pub struct CampaignDb {
    conn: Arc<Mutex<Connection>>,
    strict_schema: bool,
}

impl CampaignDb {
    /// Open or create the campaign database.
    pub fn open(path: &Path, strict_schema: bool) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| NudgeError::Store(format!("DB open: {e}")))?;
        // WAL lets the gateway read while a pass writes
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::from_connection(conn, strict_schema)
    }

    pub fn open_in_memory(strict_schema: bool) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| NudgeError::Store(format!("DB open: {e}")))?;
        Self::from_connection(conn, strict_schema)
    }

    /// Wrap an existing connection. Tables that already exist are used as-is,
    /// even when they lack some of the expected columns.
    pub fn from_connection(conn: Connection, strict_schema: bool) -> Result<Self> {
        migrate(&conn)?;
        let header = header(&conn)?;
        let missing: Vec<&str> = Column::ALL
            .iter()
            .map(|c| c.name())
            .filter(|name| !header.contains(*name))
            .collect();
        if !missing.is_empty() {
            tracing::warn!(
                "⚠️ recipients table is missing columns {:?}; writes to them will be {}",
                missing,
                if strict_schema { "rejected" } else { "skipped" }
            );
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            strict_schema,
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, bool) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let strict = self.strict_schema;
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| NudgeError::Store(format!("Lock: {e}")))?;
            f(&guard, strict)
        })
        .await
        .map_err(|e| NudgeError::Store(format!("Blocking task: {e}")))?
    }

    /// Insert or replace a message template.
    pub async fn set_content(&self, key: &str, content: &str) -> Result<()> {
        let key = key.to_string();
        let content = content.to_string();
        self.with_conn(move |conn, _| {
            conn.execute(
                "INSERT OR REPLACE INTO messages (key, content) VALUES (?1, ?2)",
                params![key, content],
            )
            .map_err(|e| NudgeError::Store(format!("Save content: {e}")))?;
            Ok(())
        })
        .await
    }

    /// Most recent completion responses, newest first.
    pub async fn recent_responses(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        self.with_conn(move |conn, _| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, identity, username, fields, submitted_at
                     FROM responses ORDER BY id DESC LIMIT ?1",
                )
                .map_err(|e| NudgeError::Store(format!("Prepare responses: {e}")))?;
            let rows = stmt
                .query_map([limit as i64], |row| {
                    let fields: String = row.get(3)?;
                    Ok(serde_json::json!({
                        "id": row.get::<_, i64>(0)?,
                        "identity": row.get::<_, String>(1)?,
                        "username": row.get::<_, Option<String>>(2)?,
                        "fields": serde_json::from_str::<serde_json::Value>(&fields).unwrap_or_default(),
                        "submitted_at": row.get::<_, String>(4)?,
                    }))
                })
                .map_err(|e| NudgeError::Store(format!("Query responses: {e}")))?;
            Ok(rows.filter_map(|r| r.ok()).collect())
        })
        .await
    }
}

/// Create tables that do not exist yet.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- One row per recipient; rowid order is the campaign order
        CREATE TABLE IF NOT EXISTS recipients (
            identity TEXT PRIMARY KEY,
            stage TEXT NOT NULL DEFAULT 'not_contacted',
            initial_sent_at TEXT,
            first_reminder_sent_at TEXT,
            second_reminder_sent_at TEXT,
            completed_at TEXT,
            last_error TEXT,
            failure_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Completion audit trail (append-only)
        CREATE TABLE IF NOT EXISTS responses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            identity TEXT NOT NULL,
            username TEXT,
            fields TEXT NOT NULL DEFAULT '{}',   -- JSON object of submitted fields
            submitted_at TEXT NOT NULL
        );

        -- Message templates keyed by stage
        CREATE TABLE IF NOT EXISTS messages (
            key TEXT PRIMARY KEY,
            content TEXT NOT NULL DEFAULT ''
        );
        ",
    )
    .map_err(|e| NudgeError::Store(format!("Migration: {e}")))
}

/// Run a store call under a deadline; running out of time is a `Timeout` error.
pub(crate) async fn bounded<T>(
    limit: Duration,
    operation: &str,
    call: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| NudgeError::timeout(operation, limit.as_secs()))?
}

/// Column names currently present in the recipients table.
fn header(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(recipients)")
        .map_err(|e| NudgeError::Store(format!("Table info: {e}")))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| NudgeError::Store(format!("Table info: {e}")))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(names)
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339()
}

/// Accepts RFC 3339 and the naive ISO-8601 timestamps older sheets carry (read as UTC).
fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
                .ok()
                .map(|n| n.and_utc())
        })
}

/// Which progress cells hold anything at all. Older sheets mark sent
/// reminders with a non-time marker such as "✅", which still counts as sent.
#[derive(Debug, Clone, Copy, Default)]
struct Marks {
    initial: bool,
    first: bool,
    second: bool,
    completed: bool,
}

fn is_marked(cell: &Option<String>) -> bool {
    cell.as_deref().is_some_and(|c| !c.trim().is_empty())
}

/// Furthest stage the progress cells prove was reached.
fn derive_stage(marks: Marks) -> Stage {
    if marks.completed {
        Stage::Completed
    } else if marks.second {
        Stage::SecondReminderSent
    } else if marks.first {
        Stage::FirstReminderSent
    } else if marks.initial {
        Stage::InitialSent
    } else {
        Stage::NotContacted
    }
}

fn to_sql(value: &CellValue) -> Value {
    match value {
        CellValue::Text(s) => Value::Text(s.clone()),
        CellValue::Time(t) => Value::Text(format_time(t)),
        CellValue::Int(n) => Value::Integer(*n),
        CellValue::Null => Value::Null,
    }
}

fn select_records(
    conn: &Connection,
    filter_identity: Option<&str>,
) -> Result<Vec<RecipientRecord>> {
    let header = header(conn)?;
    if !header.contains("identity") {
        return Err(NudgeError::Store("recipients table has no identity column".into()));
    }
    let cols: Vec<&'static str> = std::iter::once("identity")
        .chain(Column::ALL.iter().map(|c| c.name()))
        .filter(|name| header.contains(*name))
        .collect();
    let has = |name: &str| cols.iter().any(|c| *c == name);

    let mut sql = format!("SELECT {} FROM recipients", cols.join(", "));
    if filter_identity.is_some() {
        sql.push_str(" WHERE identity = ?1");
    }
    sql.push_str(" ORDER BY rowid");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| NudgeError::Store(format!("Prepare load: {e}")))?;
    let params: Vec<Value> = filter_identity
        .map(|id| vec![Value::Text(id.to_string())])
        .unwrap_or_default();

    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |row| {
            let text = |name: &str| -> rusqlite::Result<Option<String>> {
                if has(name) {
                    // Older sheets stored ids as numbers
                    let v: Value = row.get(name)?;
                    Ok(match v {
                        Value::Text(s) => Some(s),
                        Value::Integer(n) => Some(n.to_string()),
                        Value::Real(f) => Some(f.to_string()),
                        _ => None,
                    })
                } else {
                    Ok(None)
                }
            };
            let failure_count: i64 = if has("failure_count") {
                row.get::<_, Option<i64>>("failure_count")?.unwrap_or(0)
            } else {
                0
            };
            Ok((
                text("identity")?.unwrap_or_default(),
                text("stage")?,
                text("initial_sent_at")?,
                text("first_reminder_sent_at")?,
                text("second_reminder_sent_at")?,
                text("completed_at")?,
                text("last_error")?,
                failure_count,
            ))
        })
        .map_err(|e| NudgeError::Store(format!("Query recipients: {e}")))?;

    let mut records = Vec::new();
    for row in rows {
        let (identity, stage, initial, first, second, completed, last_error, failures) =
            row.map_err(|e| NudgeError::Store(format!("Read row: {e}")))?;
        let identity = identity.trim().to_string();
        if identity.is_empty() {
            continue;
        }
        let marks = Marks {
            initial: is_marked(&initial),
            first: is_marked(&first),
            second: is_marked(&second),
            completed: is_marked(&completed),
        };
        let mut rec = RecipientRecord {
            identity,
            stage: Stage::NotContacted,
            initial_sent_at: initial.as_deref().and_then(parse_time),
            first_reminder_sent_at: first.as_deref().and_then(parse_time),
            second_reminder_sent_at: second.as_deref().and_then(parse_time),
            completed_at: completed.as_deref().and_then(parse_time),
            last_error: last_error.filter(|e| !e.is_empty()),
            failure_count: failures.max(0) as u32,
        };
        let marked = derive_stage(marks);
        rec.stage = match stage.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => match s.parse::<Stage>() {
                // A progress cell ahead of the stage cell means that send happened
                Ok(stage) if stage <= Stage::SecondReminderSent && marked > stage => {
                    tracing::warn!(
                        "⚠️ {} is marked {marked} but its stage says {stage}; using {marked}",
                        rec.identity
                    );
                    marked
                }
                Ok(stage) => stage,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping recipient {}: {e}", rec.identity);
                    continue;
                }
            },
            None => marked,
        };
        records.push(rec);
    }
    Ok(records)
}

fn update_record(
    conn: &Connection,
    strict: bool,
    identity: &str,
    patch: &RecordPatch,
) -> Result<UpdateOutcome> {
    let header = header(conn)?;
    let mut assignments = Vec::new();
    let mut values = Vec::new();
    for (column, value) in &patch.cells {
        if !header.contains(column.name()) {
            if strict {
                return Err(NudgeError::Store(format!(
                    "column '{}' does not exist in recipients",
                    column.name()
                )));
            }
            tracing::debug!("Skipping write to missing column '{}'", column.name());
            continue;
        }
        values.push(to_sql(value));
        assignments.push(format!("{} = ?{}", column.name(), values.len()));
    }

    let guard = match patch.expect_stage {
        Some(stage) if header.contains("stage") => Some(stage),
        Some(_) if strict => {
            return Err(NudgeError::Store("column 'stage' does not exist in recipients".into()));
        }
        _ => None,
    };

    if assignments.is_empty() {
        let exists: Option<String> = conn
            .query_row(
                "SELECT identity FROM recipients WHERE identity = ?1",
                [identity],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| NudgeError::Store(format!("Lookup: {e}")))?;
        return Ok(if exists.is_some() {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::NotFound
        });
    }

    values.push(Value::Text(identity.to_string()));
    let mut sql = format!(
        "UPDATE recipients SET {} WHERE identity = ?{}",
        assignments.join(", "),
        values.len()
    );
    if let Some(stage) = guard {
        values.push(Value::Text(stage.as_str().to_string()));
        sql.push_str(&format!(" AND stage = ?{}", values.len()));
    }

    let changed = conn
        .execute(&sql, rusqlite::params_from_iter(values))
        .map_err(|e| NudgeError::Store(format!("Update recipient: {e}")))?;
    if changed > 0 {
        return Ok(UpdateOutcome::Applied);
    }

    let exists: Option<String> = conn
        .query_row(
            "SELECT identity FROM recipients WHERE identity = ?1",
            [identity],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| NudgeError::Store(format!("Lookup: {e}")))?;
    Ok(match exists {
        Some(_) => UpdateOutcome::GuardMismatch,
        None => UpdateOutcome::NotFound,
    })
}

#[async_trait]
impl RecordStore for CampaignDb {
    async fn load_all(&self) -> Result<Vec<RecipientRecord>> {
        self.with_conn(|conn, _| select_records(conn, None)).await
    }

    async fn get(&self, identity: &str) -> Result<Option<RecipientRecord>> {
        let identity = identity.to_string();
        self.with_conn(move |conn, _| Ok(select_records(conn, Some(&identity))?.into_iter().next()))
            .await
    }

    async fn update(&self, identity: &str, patch: &RecordPatch) -> Result<UpdateOutcome> {
        let identity = identity.to_string();
        let patch = patch.clone();
        self.with_conn(move |conn, strict| update_record(conn, strict, &identity, &patch))
            .await
    }

    async fn enroll(&self, identities: &[String]) -> Result<usize> {
        let identities = identities.to_vec();
        self.with_conn(move |conn, _| {
            let mut inserted = 0;
            for identity in identities.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
                inserted += conn
                    .execute(
                        "INSERT OR IGNORE INTO recipients (identity, stage) VALUES (?1, ?2)",
                        params![identity, Stage::NotContacted.as_str()],
                    )
                    .map_err(|e| NudgeError::Store(format!("Enroll: {e}")))?;
            }
            Ok(inserted)
        })
        .await
    }

    async fn append_response(&self, submission: &CompletionSubmission) -> Result<()> {
        let submission = submission.clone();
        self.with_conn(move |conn, _| {
            let fields = serde_json::to_string(&submission.fields)?;
            conn.execute(
                "INSERT INTO responses (identity, username, fields, submitted_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    submission.identity,
                    submission.username,
                    fields,
                    format_time(&Utc::now())
                ],
            )
            .map_err(|e| NudgeError::Store(format!("Append response: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn stage_counts(&self) -> Result<BTreeMap<Stage, usize>> {
        let records = self.load_all().await?;
        let mut counts = BTreeMap::new();
        for rec in records {
            *counts.entry(rec.stage).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[async_trait]
impl ContentSource for CampaignDb {
    async fn fetch(&self) -> Result<HashMap<String, String>> {
        self.with_conn(|conn, _| {
            let mut stmt = conn
                .prepare("SELECT key, content FROM messages")
                .map_err(|e| NudgeError::Content(format!("Prepare messages: {e}")))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                })
                .map_err(|e| NudgeError::Content(format!("Query messages: {e}")))?;
            Ok(rows
                .filter_map(|r| r.ok())
                .filter(|(key, _)| !key.trim().is_empty())
                .map(|(key, content)| (key.trim().to_string(), content.unwrap_or_default()))
                .collect())
        })
        .await
    }
}
