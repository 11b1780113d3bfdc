use crate::content_type::ContentType;
use crate::db::{Database, DbFile};
use crate::storage::{FileId, StorageError};
use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Free-form string-keyed metadata attached to a file.
pub type Metadata = BTreeMap<String, Value>;

/// A stored asset's catalog entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub filename: String,
    pub content_type: ContentType,
    pub length: u64,
    pub chunk_size: u64,
    pub md5: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub metadata: Metadata,
}

impl FileRecord {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

impl TryFrom<DbFile> for FileRecord {
    type Error = StorageError;

    fn try_from(row: DbFile) -> Result<Self, Self::Error> {
        let metadata: Metadata = serde_json::from_str(&row.metadata).map_err(|e| {
            StorageError::Io(std::io::Error::other(format!(
                "metadata of {} is not a JSON object: {}",
                row.id, e
            )))
        })?;
        Ok(Self {
            id: FileId::parse(&row.id)?,
            filename: row.filename,
            content_type: ContentType::from_mime(&row.content_type),
            length: row.length as u64,
            chunk_size: row.chunk_size as u64,
            md5: row.md5,
            uploaded_at: row.uploaded_at,
            metadata,
        })
    }
}

/// Input to [`FileCatalog::register`]
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub id: FileId,
    pub filename: String,
    pub content_type: ContentType,
    pub length: u64,
    pub chunk_size: u64,
    pub md5: Option<String>,
    pub metadata: Metadata,
}

/// Predicate over file metadata for [`FileCatalog::query_by_metadata`].
///
/// All conditions must hold. An empty filter matches every file.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    equals: Vec<(String, Value)>,
    absent: Vec<String>,
}

impl MetadataFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    pub fn without_key(mut self, key: impl Into<String>) -> Self {
        self.absent.push(key.into());
        self
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, value)| metadata.get(key) == Some(value))
            && self.absent.iter().all(|key| !metadata.contains_key(key))
    }
}

/// Maps file ids to their records. Never touches chunk bytes.
#[derive(Clone, Debug)]
pub struct FileCatalog {
    db: Database,
}

impl FileCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn register(&self, new: NewFileRecord) -> Result<FileRecord, StorageError> {
        let record = FileRecord {
            id: new.id,
            filename: new.filename,
            content_type: new.content_type,
            length: new.length,
            chunk_size: new.chunk_size,
            md5: new.md5,
            uploaded_at: Utc::now(),
            metadata: new.metadata,
        };

        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| StorageError::InvalidInput(format!("unserializable metadata: {}", e)))?;
        let row = DbFile {
            id: record.id.to_string(),
            filename: record.filename.clone(),
            content_type: record.content_type.as_str().to_string(),
            length: record.length as i64,
            chunk_size: record.chunk_size as i64,
            md5: record.md5.clone(),
            uploaded_at: record.uploaded_at,
            metadata,
        };

        self.db.insert_file(&row).await.map_err(|e| match StorageError::from(e) {
            StorageError::Duplicate(_) => {
                StorageError::Duplicate(format!("file record {} already exists", record.id))
            }
            other => other,
        })?;

        debug!("Registered file {} ({})", record.id, record.filename);
        Ok(record)
    }

    pub async fn lookup(&self, file_id: &FileId) -> Result<FileRecord, StorageError> {
        self.db
            .get_file_by_id(file_id.as_str())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("file {}", file_id)))?
            .try_into()
    }

    /// Lazily stream every record whose metadata matches `filter`.
    ///
    /// Each call runs a fresh query, so calling again restarts from the
    /// current state of the catalog.
    pub fn query_by_metadata(
        &self,
        filter: MetadataFilter,
    ) -> BoxStream<'_, Result<FileRecord, StorageError>> {
        self.db
            .stream_files()
            .map(|row| FileRecord::try_from(row?))
            .try_filter(move |record| future::ready(filter.matches(&record.metadata)))
            .boxed()
    }

    /// Delete the record only. Returns whether a record existed.
    pub async fn remove(&self, file_id: &FileId) -> Result<bool, StorageError> {
        let removed = self.db.delete_file(file_id.as_str()).await?;
        if removed {
            debug!("Removed file record {}", file_id);
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<u64, StorageError> {
        Ok(self.db.count_files().await? as u64)
    }
}
