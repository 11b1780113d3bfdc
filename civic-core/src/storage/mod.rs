//! Chunked binary storage
//!
//! Asset bytes live in the `chunks` table as fixed-size, sequence-numbered
//! rows ([`ChunkStore`]); the `files` table maps each file id to its name,
//! content type, length and metadata ([`FileCatalog`]). [`RangeStreamer`]
//! serves a stored file over HTTP with byte-range support, and
//! [`FileStorage`] pairs the two stores for callers that upload or purge
//! whole files.
mod catalog;
mod chunk_store;
mod error;
mod files;
pub mod range;

pub use catalog::{FileCatalog, FileRecord, Metadata, MetadataFilter, NewFileRecord};
pub use chunk_store::{ChunkSet, ChunkStore, StoredFile};
pub use error::{IntegrityWarning, StorageError};
pub use files::FileStorage;
pub use range::{ByteRange, FileResponse, RangePlan, RangeStreamer};

use axum::body::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

/// Stream of file bytes read back from the chunk store.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Opaque identifier of one stored asset (hyphenated UUID v4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a caller-supplied id. Anything that is not a UUID is rejected.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        Uuid::parse_str(s)
            .map(|uuid| Self(uuid.hyphenated().to_string()))
            .map_err(|_| StorageError::InvalidInput(format!("malformed file id: {}", s)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for FileId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FileId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}

/// Per-call context: who is asking, and a cancellation signal.
///
/// Uploads observe the token between chunks; a cancelled upload removes its
/// partial chunks. A deadline cancels the token when it elapses.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    actor: Option<String>,
    cancel: CancellationToken,
    deadline: Option<Arc<DropGuard>>,
}

impl RequestContext {
    pub fn new(actor: Option<String>) -> Self {
        Self {
            actor,
            ..Default::default()
        }
    }

    /// Cancel this context once `timeout` elapses.
    ///
    /// The timer stops when the last clone of the context is dropped.
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        let finished = CancellationToken::new();
        let cancel = self.cancel.clone();
        let timer = finished.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => cancel.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        self.deadline = Some(Arc::new(finished.drop_guard()));
        self
    }

    /// Caller identity for logging; "anonymous" when absent.
    pub fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or("anonymous")
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
