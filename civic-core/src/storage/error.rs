use crate::storage::FileId;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    Duplicate(String),
    #[error("Range {start}-{end} not satisfiable for length {length}")]
    Range { start: u64, end: u64, length: u64 },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Upload exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Concurrent modification: {0}")]
    Conflict(String),
}

impl StorageError {
    /// Errors a whole-operation retry can reasonably expect to clear.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::Conflict(_))
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::Unavailable(err.to_string())
            }
            sqlx::Error::Io(e) => StorageError::Unavailable(e.to_string()),
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                StorageError::Duplicate(db.message().to_string())
            }
            sqlx::Error::Database(ref db) if is_busy(&**db) => {
                StorageError::Unavailable(db.message().to_string())
            }
            other => StorageError::Io(std::io::Error::other(other)),
        }
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, including their extended codes.
fn is_busy(db: &dyn sqlx::error::DatabaseError) -> bool {
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

/// Non-fatal integrity problem found during cleanup or an audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityWarning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub week_number: Option<u32>,
    pub message: String,
}

impl IntegrityWarning {
    pub fn for_file(file_id: &FileId, message: impl Into<String>) -> Self {
        Self {
            file_id: Some(file_id.clone()),
            week_number: None,
            message: message.into(),
        }
    }

    pub fn for_week(week_number: u32, message: impl Into<String>) -> Self {
        Self {
            file_id: None,
            week_number: Some(week_number),
            message: message.into(),
        }
    }

    pub fn with_week(mut self, week_number: u32) -> Self {
        self.week_number = Some(week_number);
        self
    }
}

impl std::fmt::Display for IntegrityWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.week_number, &self.file_id) {
            (Some(week), Some(file)) => write!(f, "week {} file {}: {}", week, file, self.message),
            (Some(week), None) => write!(f, "week {}: {}", week, self.message),
            (None, Some(file)) => write!(f, "file {}: {}", file, self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_maps_to_unavailable() {
        let err: StorageError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn row_not_found_maps_to_io() {
        let err: StorageError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn locked_database_maps_to_unavailable() {
        use sqlx::sqlite::SqliteConnectOptions;
        use sqlx::{Connection, SqliteConnection};
        use std::time::Duration;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("busy.db");
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO);
        let mut holder = SqliteConnection::connect_with(&options).await.unwrap();
        let mut other = SqliteConnection::connect_with(&options).await.unwrap();

        sqlx::query("BEGIN EXCLUSIVE")
            .execute(&mut holder)
            .await
            .unwrap();
        let err = sqlx::query("BEGIN EXCLUSIVE")
            .execute(&mut other)
            .await
            .unwrap_err();

        let err = StorageError::from(err);
        assert!(matches!(err, StorageError::Unavailable(_)), "{:?}", err);
        assert!(err.is_transient());
    }

    #[test]
    fn warning_display_includes_context() {
        let id = FileId::new();
        let warning = IntegrityWarning::for_file(&id, "chunks missing").with_week(3);
        assert_eq!(
            warning.to_string(),
            format!("week 3 file {}: chunks missing", id)
        );
    }
}
