use crate::db::models::{DbChunk, DbChunkSummary, DbFile, DbWeek};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const DEFAULT_MAX_CONNECTIONS: u32 = 8;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS files (
        id TEXT PRIMARY KEY NOT NULL,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        length INTEGER NOT NULL,
        chunk_size INTEGER NOT NULL,
        md5 TEXT,
        uploaded_at TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS chunks (
        file_id TEXT NOT NULL,
        n INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        data BLOB NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (file_id, n)
    )",
    "CREATE INDEX IF NOT EXISTS idx_chunks_offset ON chunks (file_id, byte_offset)",
    "CREATE TABLE IF NOT EXISTS weeks (
        id TEXT PRIMARY KEY NOT NULL,
        week_number INTEGER NOT NULL UNIQUE,
        summary TEXT NOT NULL,
        photo_file_ids TEXT NOT NULL DEFAULT '[]',
        report_file_id TEXT,
        revision INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
];

const FILE_COLUMNS: &str =
    "id, filename, content_type, length, chunk_size, md5, uploaded_at, metadata";

const WEEK_COLUMNS: &str = "id, week_number, summary, photo_file_ids, report_file_id, revision, created_at, updated_at";

/// Handle to the SQLite database holding chunks, the file catalog and weeks.
///
/// Cheap to clone (wraps a connection pool). Every storage component receives
/// one at construction; there is no process-wide connection state.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` with the default pool size.
    pub async fn new(path: &str) -> Result<Self, sqlx::Error> {
        Self::open(Path::new(path), DEFAULT_MAX_CONNECTIONS).await
    }

    /// Open (or create) the database at `path` and make sure the schema exists.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self, sqlx::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.create_schema().await?;
        info!("Opened database at {}", path.display());
        Ok(database)
    }

    async fn create_schema(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Round-trip a trivial query to confirm the backend is reachable.
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Chunks
    // =========================================================================

    pub async fn insert_chunk(
        &self,
        file_id: &str,
        n: i64,
        byte_offset: i64,
        data: &[u8],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO chunks (file_id, n, byte_offset, data, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(file_id)
        .bind(n)
        .bind(byte_offset)
        .bind(data)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of chunks and total stored bytes for a file id.
    pub async fn chunk_totals(&self, file_id: &str) -> Result<(i64, i64), sqlx::Error> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(length(data)), 0) FROM chunks WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Sequence number of the chunk holding the byte at `offset`.
    pub async fn chunk_containing(
        &self,
        file_id: &str,
        offset: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "SELECT n FROM chunks WHERE file_id = ? AND byte_offset <= ? ORDER BY n DESC LIMIT 1",
        )
        .bind(file_id)
        .bind(offset)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_chunk(&self, file_id: &str, n: i64) -> Result<Option<DbChunk>, sqlx::Error> {
        sqlx::query_as::<_, DbChunk>(
            "SELECT file_id, n, byte_offset, data FROM chunks WHERE file_id = ? AND n = ?",
        )
        .bind(file_id)
        .bind(n)
        .fetch_optional(&self.pool)
        .await
    }

    /// Delete every chunk of a file id. Returns the number of rows removed.
    pub async fn delete_chunks(&self, file_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM chunks WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Per-file aggregate of every chunk set in the store.
    pub async fn chunk_summaries(&self) -> Result<Vec<DbChunkSummary>, sqlx::Error> {
        sqlx::query_as::<_, DbChunkSummary>(
            "SELECT file_id,
                    COUNT(*) AS chunk_count,
                    SUM(length(data)) AS total_bytes,
                    MIN(n) AS min_n,
                    MAX(n) AS max_n,
                    MIN(created_at) AS first_written_at
             FROM chunks
             GROUP BY file_id
             ORDER BY file_id",
        )
        .fetch_all(&self.pool)
        .await
    }

    pub async fn count_chunks(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub async fn insert_file(&self, file: &DbFile) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "INSERT INTO files ({FILE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&file.id)
        .bind(&file.filename)
        .bind(&file.content_type)
        .bind(file.length)
        .bind(file.chunk_size)
        .bind(&file.md5)
        .bind(file.uploaded_at)
        .bind(&file.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file_by_id(&self, id: &str) -> Result<Option<DbFile>, sqlx::Error> {
        sqlx::query_as::<_, DbFile>(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Lazily stream every file row, oldest upload first.
    ///
    /// Each call issues a fresh query, so the stream reflects current state.
    pub fn stream_files(&self) -> BoxStream<'_, Result<DbFile, sqlx::Error>> {
        sqlx::query_as::<_, DbFile>(
            "SELECT id, filename, content_type, length, chunk_size, md5, uploaded_at, metadata
             FROM files ORDER BY uploaded_at, id",
        )
        .fetch(&self.pool)
    }

    /// Returns true when a row was removed.
    pub async fn delete_file(&self, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_files(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await
    }

    // =========================================================================
    // Weeks
    // =========================================================================

    /// Insert a week. Fails with a unique violation if the week number exists.
    pub async fn insert_week(&self, week: &DbWeek) -> Result<(), sqlx::Error> {
        sqlx::query(&format!(
            "INSERT INTO weeks ({WEEK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&week.id)
        .bind(week.week_number)
        .bind(&week.summary)
        .bind(&week.photo_file_ids)
        .bind(&week.report_file_id)
        .bind(week.revision)
        .bind(week.created_at)
        .bind(week.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_week_by_number(&self, week_number: i64) -> Result<Option<DbWeek>, sqlx::Error> {
        sqlx::query_as::<_, DbWeek>(&format!(
            "SELECT {WEEK_COLUMNS} FROM weeks WHERE week_number = ?"
        ))
        .bind(week_number)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn get_week_by_id(&self, id: &str) -> Result<Option<DbWeek>, sqlx::Error> {
        sqlx::query_as::<_, DbWeek>(&format!("SELECT {WEEK_COLUMNS} FROM weeks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_weeks(&self, descending: bool) -> Result<Vec<DbWeek>, sqlx::Error> {
        let direction = if descending { "DESC" } else { "ASC" };
        sqlx::query_as::<_, DbWeek>(&format!(
            "SELECT {WEEK_COLUMNS} FROM weeks ORDER BY week_number {direction}"
        ))
        .fetch_all(&self.pool)
        .await
    }

    /// Replace a week's asset references if its revision still matches.
    ///
    /// Returns false when another writer updated the row first (or it is gone).
    pub async fn update_week_assets(
        &self,
        id: &str,
        photo_file_ids: &str,
        report_file_id: Option<&str>,
        expected_revision: i64,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE weeks
             SET photo_file_ids = ?, report_file_id = ?, revision = revision + 1, updated_at = ?
             WHERE id = ? AND revision = ?",
        )
        .bind(photo_file_ids)
        .bind(report_file_id)
        .bind(updated_at)
        .bind(id)
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Remove a week if its revision still matches.
    ///
    /// Returns false when another writer updated the row first (or it is gone).
    pub async fn delete_week(&self, id: &str, expected_revision: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM weeks WHERE id = ? AND revision = ?")
            .bind(id)
            .bind(expected_revision)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_weeks(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM weeks")
            .fetch_one(&self.pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (Database, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        (db, tmp)
    }

    fn week_row(week_number: i64) -> DbWeek {
        DbWeek {
            id: uuid::Uuid::new_v4().to_string(),
            week_number,
            summary: "Visited the food bank".to_string(),
            photo_file_ids: "[]".to_string(),
            report_file_id: None,
            revision: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.db");
        let first = Database::new(path.to_str().unwrap()).await.unwrap();
        first.close().await;
        let second = Database::new(path.to_str().unwrap()).await.unwrap();
        second.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn week_number_is_unique() {
        let (db, _tmp) = open_temp().await;
        db.insert_week(&week_row(4)).await.unwrap();

        let err = db.insert_week(&week_row(4)).await.unwrap_err();
        match err {
            sqlx::Error::Database(e) => assert!(e.is_unique_violation()),
            other => panic!("expected unique violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_revision_update_is_rejected() {
        let (db, _tmp) = open_temp().await;
        let week = week_row(1);
        db.insert_week(&week).await.unwrap();

        assert!(db
            .update_week_assets(&week.id, "[\"a\"]", None, 0, Utc::now())
            .await
            .unwrap());
        assert!(!db
            .update_week_assets(&week.id, "[\"b\"]", None, 0, Utc::now())
            .await
            .unwrap());

        let stored = db.get_week_by_id(&week.id).await.unwrap().unwrap();
        assert_eq!(stored.photo_file_ids, "[\"a\"]");
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn stale_revision_delete_is_rejected() {
        let (db, _tmp) = open_temp().await;
        let week = week_row(2);
        db.insert_week(&week).await.unwrap();
        db.update_week_assets(&week.id, "[]", None, 0, Utc::now())
            .await
            .unwrap();

        assert!(!db.delete_week(&week.id, 0).await.unwrap());
        assert_eq!(db.count_weeks().await.unwrap(), 1);
        assert!(db.delete_week(&week.id, 1).await.unwrap());
        assert_eq!(db.count_weeks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn chunk_lookup_by_offset() {
        let (db, _tmp) = open_temp().await;
        db.insert_chunk("f", 0, 0, &[1, 2, 3, 4]).await.unwrap();
        db.insert_chunk("f", 1, 4, &[5, 6]).await.unwrap();

        assert_eq!(db.chunk_containing("f", 0).await.unwrap(), Some(0));
        assert_eq!(db.chunk_containing("f", 3).await.unwrap(), Some(0));
        assert_eq!(db.chunk_containing("f", 5).await.unwrap(), Some(1));
        assert_eq!(db.chunk_totals("f").await.unwrap(), (2, 6));
        assert_eq!(db.chunk_totals("missing").await.unwrap(), (0, 0));
    }
}
