//! Whole-file operations over the chunk store and catalog.
//!
//! Bytes are written before the catalog entry, and the catalog entry is
//! removed before the bytes, so a record never points at missing chunks
//! unless something failed in between (which the auditor reports).

use crate::content_type::ContentType;
use crate::storage::{
    ChunkStore, FileCatalog, FileId, FileRecord, Metadata, NewFileRecord, RequestContext,
    StorageError,
};
use axum::body::Bytes;
use futures::Stream;
use std::io;
use tracing::{debug, error, warn};

#[derive(Clone, Debug)]
pub struct FileStorage {
    chunks: ChunkStore,
    catalog: FileCatalog,
    chunk_size: usize,
}

impl FileStorage {
    pub fn new(chunks: ChunkStore, catalog: FileCatalog, chunk_size: usize) -> Self {
        Self {
            chunks,
            catalog,
            chunk_size,
        }
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    /// Store a byte stream under a fresh file id and register it.
    ///
    /// If registration fails the stored chunks are removed again.
    pub async fn upload<S>(
        &self,
        filename: &str,
        content_type: ContentType,
        stream: S,
        metadata: Metadata,
        ctx: &RequestContext,
    ) -> Result<FileRecord, StorageError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        let file_id = FileId::new();
        let stored = self
            .chunks
            .store(&file_id, stream, self.chunk_size, ctx.cancellation())
            .await?;

        let registered = self
            .catalog
            .register(NewFileRecord {
                id: file_id.clone(),
                filename: filename.to_string(),
                content_type,
                length: stored.length,
                chunk_size: self.chunk_size as u64,
                md5: Some(stored.md5),
                metadata,
            })
            .await;

        match registered {
            Ok(record) => {
                debug!(
                    "Uploaded {} as {} ({} bytes) for {}",
                    filename,
                    file_id,
                    record.length,
                    ctx.actor()
                );
                Ok(record)
            }
            Err(e) => {
                if let Err(cleanup) = self.chunks.delete_all(&file_id).await {
                    error!(
                        "Failed to remove chunks of unregistered file {}: {}",
                        file_id, cleanup
                    );
                }
                Err(e)
            }
        }
    }

    /// Remove a file's catalog entry, then its chunks.
    ///
    /// Returns whether a catalog entry existed. Safe to call repeatedly.
    pub async fn purge(&self, file_id: &FileId) -> Result<bool, StorageError> {
        let existed = self.catalog.remove(file_id).await?;
        let removed_chunks = self.chunks.delete_all(file_id).await?;
        if existed && removed_chunks == 0 {
            warn!("File {} had a catalog entry but no chunks", file_id);
        }
        debug!("Purged {} ({} chunks)", file_id, removed_chunks);
        Ok(existed)
    }
}
