use sqlx::SqlitePool;

use crate::error::Result;

/// Create the ledger and local warehouse tables. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Seen-file ledger: one row per drive file id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger (
            file_id TEXT PRIMARY KEY,
            modified_ms INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Local warehouse table, keyed like the remote one
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_records (
            id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            document_type TEXT NOT NULL,
            source_name TEXT NOT NULL,
            web_link TEXT NOT NULL,
            document_path TEXT NOT NULL DEFAULT '',
            file_mtime_ms INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            chunk_size INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (document_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_records_id ON chunk_records(id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&dir.path().join("data/test.sqlite"))
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["chunk_records".to_string(), "ledger".to_string()]);
    }
}
