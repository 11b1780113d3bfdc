use crate::content_type::ContentType;
use crate::db::DbWeek;
use crate::storage::{FileId, IntegrityWarning, StorageError};
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::io;

/// A program week and the files attached to it
///
/// Week 0 is the standalone career-guidance bundle; it is stored like any
/// other week but its files are tagged so they are never treated as orphans.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeekAsset {
    pub id: String,
    pub week_number: u32,
    pub summary: String,
    /// Display order
    pub photo_file_ids: Vec<FileId>,
    pub report_file_id: Option<FileId>,
    #[serde(skip)]
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WeekAsset {
    /// Every referenced file id, photos first.
    pub fn file_ids(&self) -> impl Iterator<Item = &FileId> {
        self.photo_file_ids.iter().chain(self.report_file_id.iter())
    }

    pub fn references(&self, file_id: &FileId) -> bool {
        self.file_ids().any(|id| id == file_id)
    }
}

impl TryFrom<DbWeek> for WeekAsset {
    type Error = StorageError;

    fn try_from(row: DbWeek) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, detail: String| {
            StorageError::Io(io::Error::other(format!(
                "week {} has invalid {}: {}",
                row.week_number, what, detail
            )))
        };

        let photo_file_ids: Vec<FileId> = serde_json::from_str(&row.photo_file_ids)
            .map_err(|e| corrupt("photo references", e.to_string()))?;
        let report_file_id = row
            .report_file_id
            .as_deref()
            .map(FileId::parse)
            .transpose()
            .map_err(|e| corrupt("report reference", e.to_string()))?;
        let week_number = u32::try_from(row.week_number)
            .map_err(|e| corrupt("week number", e.to_string()))?;

        Ok(Self {
            id: row.id,
            week_number,
            summary: row.summary,
            photo_file_ids,
            report_file_id,
            revision: row.revision,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    #[serde(alias = "ascending")]
    Asc,
    #[serde(alias = "descending")]
    Desc,
}

/// Role of a file within its week, stored as `fileType` metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Photo,
    Report,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Photo => "photo",
            FileType::Report => "report",
        }
    }
}

/// One file to upload: a name, a content type and a byte stream
///
/// The body may borrow from the request it is read from (a multipart field).
pub struct AssetUpload<'a> {
    pub filename: String,
    pub content_type: ContentType,
    pub body: BoxStream<'a, io::Result<Bytes>>,
}

impl<'a> AssetUpload<'a> {
    /// The content type is taken from `declared` when it is specific,
    /// otherwise from the filename extension.
    pub fn new<S>(filename: impl Into<String>, declared: Option<&str>, body: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        let filename = filename.into();
        Self {
            content_type: ContentType::resolve(declared, &filename),
            filename,
            body: body.boxed(),
        }
    }

    pub fn from_bytes(filename: impl Into<String>, declared: Option<&str>, data: Bytes) -> Self {
        Self::new(filename, declared, futures::stream::iter([Ok(data)]))
    }
}

impl std::fmt::Debug for AssetUpload<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetUpload")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Outcome of deleting a week: the record is gone, file cleanup may be partial
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionReport {
    pub week_number: u32,
    pub week_id: String,
    pub removed: Vec<FileId>,
    pub failed: Vec<IntegrityWarning>,
}

impl DeletionReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Updated week after a single-asset change, plus any cleanup warnings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetChange {
    pub week: WeekAsset,
    pub warnings: Vec<IntegrityWarning>,
}
