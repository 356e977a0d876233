//! Seen-file ledger: file id to last-known `(modified time, content hash)`.
//!
//! The ledger only ever grows. Entries are written in two places: the
//! change detector touches the timestamp of a file whose content is
//! confirmed unchanged, and the processor records a file after all of its
//! chunks have been written.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{PipelineError, Result};
use crate::models::LedgerEntry;

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get(&self, file_id: &str) -> Result<Option<LedgerEntry>>;

    /// Insert or replace the entry for `file_id`.
    async fn record(&self, file_id: &str, entry: &LedgerEntry) -> Result<()>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn get(&self, file_id: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.entries.read().await.get(file_id).cloned())
    }

    async fn record(&self, file_id: &str, entry: &LedgerEntry) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(file_id.to_string(), entry.clone());
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }
}

/// Ledger persisted in the `ledger` table.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All entries ordered by file id.
    pub async fn entries(&self) -> Result<Vec<(String, LedgerEntry)>> {
        let rows = sqlx::query(
            "SELECT file_id, modified_ms, content_hash FROM ledger ORDER BY file_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let file_id: String = row.get("file_id");
                let entry = LedgerEntry {
                    modified_time: from_millis(row.get("modified_ms"))?,
                    content_hash: row.get("content_hash"),
                };
                Ok((file_id, entry))
            })
            .collect()
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| PipelineError::Config(format!("invalid ledger timestamp: {}", ms)))
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn get(&self, file_id: &str) -> Result<Option<LedgerEntry>> {
        let row = sqlx::query("SELECT modified_ms, content_hash FROM ledger WHERE file_id = ?")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(LedgerEntry {
                modified_time: from_millis(row.get("modified_ms"))?,
                content_hash: row.get("content_hash"),
            })),
            None => Ok(None),
        }
    }

    async fn record(&self, file_id: &str, entry: &LedgerEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger (file_id, modified_ms, content_hash, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                modified_ms = excluded.modified_ms,
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(file_id)
        .bind(entry.modified_time.timestamp_millis())
        .bind(&entry.content_hash)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

/// Per-file-id async locks, so the read-decide-write sequence for one file
/// never interleaves with another task working on the same id.
///
/// An id's entry lives only while some task holds or waits for its lock.
#[derive(Default)]
pub struct LedgerLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Holds the lock for one file id; releases it and drops the id's entry
/// when no other task is waiting.
pub struct LedgerGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a LedgerLocks,
    file_id: String,
}

impl LedgerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, file_id: &str) -> LedgerGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(file_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        LedgerGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            file_id: file_id.to_string(),
        }
    }

    /// Number of ids currently held or waited on.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for LedgerGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        // Waiters clone the Arc under the map lock, so a count of one means
        // the map holds the only reference.
        if locks
            .get(&self.file_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.file_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(ts: &str, hash: &str) -> LedgerEntry {
        LedgerEntry {
            modified_time: DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc),
            content_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn test_in_memory_ledger() {
        let ledger = InMemoryLedger::new();
        assert!(ledger.is_empty().await.unwrap());
        ledger
            .record("f1", &entry("2024-03-01T10:00:00Z", "md5:aa"))
            .await
            .unwrap();
        ledger
            .record("f1", &entry("2024-03-02T10:00:00Z", "md5:bb"))
            .await
            .unwrap();
        assert_eq!(ledger.len().await.unwrap(), 1);
        assert_eq!(
            ledger.get("f1").await.unwrap(),
            Some(entry("2024-03-02T10:00:00Z", "md5:bb"))
        );
        assert_eq!(ledger.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_ledger_persists_across_connections() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ledger.sqlite");
        {
            let pool = crate::db::connect(&path).await.unwrap();
            crate::migrate::run_migrations(&pool).await.unwrap();
            let ledger = SqliteLedger::new(pool.clone());
            ledger
                .record("f1", &entry("2024-03-01T10:00:00.250Z", "sha256:00ff"))
                .await
                .unwrap();
            ledger
                .record("f1", &entry("2024-03-05T08:00:00Z", "sha256:11ee"))
                .await
                .unwrap();
            pool.close().await;
        }

        let pool = crate::db::connect(&path).await.unwrap();
        let ledger = SqliteLedger::new(pool);
        assert_eq!(ledger.len().await.unwrap(), 1);
        assert_eq!(
            ledger.get("f1").await.unwrap(),
            Some(entry("2024-03-05T08:00:00Z", "sha256:11ee"))
        );
        let all = ledger.entries().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "f1");
    }

    #[tokio::test]
    async fn test_millisecond_precision_survives() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&dir.path().join("l.sqlite")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let ledger = SqliteLedger::new(pool);
        let e = entry("2024-03-01T10:00:00.250Z", "md5:aa");
        ledger.record("f1", &e).await.unwrap();
        assert_eq!(ledger.get("f1").await.unwrap(), Some(e));
    }

    #[tokio::test]
    async fn test_locks_serialize_same_id() {
        let locks = Arc::new(LedgerLocks::new());
        let guard = locks.lock("f1").await;

        let other = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("f1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!other.is_finished());

        // A different id is not blocked.
        let _unrelated = locks.lock("f2").await;

        drop(guard);
        other.await.unwrap();
    }

    #[tokio::test]
    async fn test_released_locks_are_forgotten() {
        let locks = Arc::new(LedgerLocks::new());
        for n in 0..100 {
            let _guard = locks.lock(&format!("file-{}", n)).await;
        }
        assert_eq!(locks.tracked(), 0);

        let guard = locks.lock("f1").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("f1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.tracked(), 1);

        // The waiter still needs the entry after the first holder leaves.
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }
}
