use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Database rows for the storage system
///
/// Three tables make up the persisted layout:
/// - `files`: one row per stored asset (the catalog)
/// - `chunks`: the asset bytes, split into sequence-numbered rows
/// - `weeks`: week records referencing file ids as opaque strings
///
/// There are no foreign keys between them. Referential integrity is kept by
/// the week linker and checked by the integrity auditor.
///
/// A stored asset's catalog entry
#[derive(Debug, Clone, FromRow)]
pub struct DbFile {
    pub id: String,
    pub filename: String,
    /// MIME type string
    pub content_type: String,
    pub length: i64,
    pub chunk_size: i64,
    /// Hex MD5 of the full content, computed while storing
    pub md5: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    /// JSON object with free-form metadata
    pub metadata: String,
}

/// One chunk of a file's bytes
///
/// `n` is the zero-based sequence number, `byte_offset` the position of the
/// chunk's first byte within the file.
#[derive(Debug, Clone, FromRow)]
pub struct DbChunk {
    pub file_id: String,
    pub n: i64,
    pub byte_offset: i64,
    pub data: Vec<u8>,
}

/// Aggregate view of one file's chunk set, used by integrity checks
#[derive(Debug, Clone, FromRow)]
pub struct DbChunkSummary {
    pub file_id: String,
    pub chunk_count: i64,
    pub total_bytes: i64,
    pub min_n: i64,
    pub max_n: i64,
    /// Earliest chunk write for this file id
    pub first_written_at: DateTime<Utc>,
}

/// A week record
///
/// `photo_file_ids` is a JSON array of file id strings in display order.
/// `revision` increments on every update and guards read-modify-write cycles.
#[derive(Debug, Clone, FromRow)]
pub struct DbWeek {
    pub id: String,
    pub week_number: i64,
    pub summary: String,
    pub photo_file_ids: String,
    pub report_file_id: Option<String>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
