//! Append-only audit trail of conversation changes.
//!
//! Every committed change batch is written here before it becomes visible.
//! Nothing is ever deleted: a clear is itself an audited change.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};
use whistle_core::{Change, ConversationId};

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit task failed: {0}")]
    Task(String),
}

/// One persisted change.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub conversation_id: ConversationId,
    pub change: Change,
    pub recorded_at: DateTime<Utc>,
}

/// Durable sink for conversation changes.
///
/// `commit` must be atomic per batch: either every change in the batch is
/// stored or none is.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn commit(&self, id: &ConversationId, changes: &[Change]) -> Result<(), AuditError>;

    /// All changes recorded for a conversation, oldest first.
    async fn history(&self, id: &ConversationId) -> Result<Vec<AuditRecord>, AuditError>;
}

fn change_kind(change: &Change) -> &'static str {
    match change {
        Change::Turn(_) => "turn",
        Change::Evidence(_) => "evidence",
        Change::Phase { .. } => "phase",
        Change::Judgment(_) => "judgment",
        Change::Cleared => "cleared",
    }
}

/// In-process audit trail. Lost on restart; for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn commit(&self, id: &ConversationId, changes: &[Change]) -> Result<(), AuditError> {
        let now = Utc::now();
        let mut records = self.records.lock();
        records.extend(changes.iter().map(|change| AuditRecord {
            conversation_id: id.clone(),
            change: change.clone(),
            recorded_at: now,
        }));
        Ok(())
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| &r.conversation_id == id)
            .cloned()
            .collect())
    }
}

/// SQLite-backed audit trail.
pub struct SqliteAuditStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAuditStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Opening audit database");
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, AuditError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), AuditError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_events_conversation
                ON audit_events(conversation_id, id);
            CREATE TABLE IF NOT EXISTS judgments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                severity INTEGER NOT NULL,
                violation_type TEXT NOT NULL,
                judged_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn commit_blocking(
        conn: &mut Connection,
        id: &ConversationId,
        changes: &[Change],
    ) -> Result<(), AuditError> {
        let now = Utc::now();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (id, first_seen, last_seen) VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET last_seen = excluded.last_seen",
            params![id.as_str(), now],
        )?;
        for change in changes {
            let payload = serde_json::to_string(change)?;
            tx.execute(
                "INSERT INTO audit_events (conversation_id, kind, payload, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), change_kind(change), payload, now],
            )?;
            if let Change::Judgment(judgment) = change {
                tx.execute(
                    "INSERT INTO judgments (conversation_id, severity, violation_type, judged_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        id.as_str(),
                        judgment.severity.ordinal(),
                        judgment.violation_type.join(", "),
                        judgment.judged_at
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn history_blocking(
        conn: &Connection,
        id: &ConversationId,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let mut stmt = conn.prepare(
            "SELECT payload, recorded_at FROM audit_events
             WHERE conversation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, DateTime<Utc>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (payload, recorded_at) = row?;
            out.push(AuditRecord {
                conversation_id: id.clone(),
                change: serde_json::from_str(&payload)?,
                recorded_at,
            });
        }
        Ok(out)
    }

    /// Number of judgments recorded for a conversation.
    pub fn judgment_count(&self, id: &ConversationId) -> Result<usize, AuditError> {
        let conn = self.conn.lock();
        let count: Option<i64> = conn
            .query_row(
                "SELECT COUNT(*) FROM judgments WHERE conversation_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0) as usize)
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn commit(&self, id: &ConversationId, changes: &[Change]) -> Result<(), AuditError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        let changes = changes.to_vec();
        let count = changes.len();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            Self::commit_blocking(&mut conn, &id, &changes)
        })
        .await
        .map_err(|e| AuditError::Task(e.to_string()))??;
        debug!(changes = count, "Audit batch committed");
        Ok(())
    }

    async fn history(&self, id: &ConversationId) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = Arc::clone(&self.conn);
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            Self::history_blocking(&conn, &id)
        })
        .await
        .map_err(|e| AuditError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whistle_core::{JudgmentResult, Phase, Severity, Turn};

    fn judgment() -> JudgmentResult {
        JudgmentResult {
            violation_type: vec!["Embezzlement".to_string()],
            severity: Severity::Serious,
            severity_label: Severity::Serious.label().to_string(),
            recommended_actions: vec!["Refer to audit".to_string()],
            rationale: "Unapproved transfers.".to_string(),
            policy_links: vec![],
            confidence: Some(0.8),
            needs_more_evidence: false,
            unverified_citations: vec![],
            judged_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_memory_store_history() {
        let store = MemoryAuditStore::new();
        let a = ConversationId::generate();
        let b = ConversationId::generate();
        store.commit(&a, &[Change::Turn(Turn::user("x"))]).await.unwrap();
        store.commit(&b, &[Change::Cleared]).await.unwrap();
        assert_eq!(store.history(&a).await.unwrap().len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let store = SqliteAuditStore::in_memory().unwrap();
        let id = ConversationId::generate();
        let batch = vec![
            Change::Turn(Turn::user("he moved the funds")),
            Change::Phase {
                from: Phase::Gathering,
                to: Phase::AwaitingConfirmation,
            },
            Change::Judgment(judgment()),
        ];
        store.commit(&id, &batch).await.unwrap();
        store.commit(&id, &[Change::Cleared]).await.unwrap();

        let history = store.history(&id).await.unwrap();
        let changes: Vec<Change> = history.into_iter().map(|r| r.change).collect();
        assert_eq!(changes.len(), 4);
        assert_eq!(&changes[..3], &batch[..]);
        assert_eq!(changes[3], Change::Cleared);
        assert_eq!(store.judgment_count(&id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let id = ConversationId::generate();
        {
            let store = SqliteAuditStore::open(&path).unwrap();
            store.commit(&id, &[Change::Turn(Turn::user("x"))]).await.unwrap();
        }
        let reopened = SqliteAuditStore::open(&path).unwrap();
        assert_eq!(reopened.history(&id).await.unwrap().len(), 1);
    }
}
