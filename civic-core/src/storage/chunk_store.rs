use crate::config::MAX_CHUNK_SIZE;
use crate::db::Database;
use crate::storage::{ByteStream, FileId, StorageError};
use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use md5::{Digest, Md5};
use std::io;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Result of a successful `store` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub length: u64,
    pub chunk_count: u64,
    /// Hex MD5 of the full content
    pub md5: String,
}

/// Aggregate view of the chunks stored under one file id
#[derive(Debug, Clone)]
pub struct ChunkSet {
    pub file_id: String,
    pub chunk_count: u64,
    pub total_bytes: u64,
    /// Sequence numbers run 0..chunk_count without gaps
    pub contiguous: bool,
    pub first_written_at: DateTime<Utc>,
}

/// Splits byte streams into sequence-numbered chunks and reads ranges back.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    db: Database,
    max_file_bytes: u64,
}

impl ChunkStore {
    pub fn new(db: Database, max_file_bytes: u64) -> Self {
        Self { db, max_file_bytes }
    }

    /// Write `stream` as chunks of `chunk_size` bytes under `file_id`.
    ///
    /// Chunks are written in order, one at a time. If the stream fails, the
    /// backend fails, the size limit is exceeded or `cancel` fires, every
    /// chunk written by this call is removed before the error is returned.
    pub async fn store<S>(
        &self,
        file_id: &FileId,
        stream: S,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<StoredFile, StorageError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(StorageError::InvalidInput(format!(
                "chunk size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, chunk_size
            )));
        }

        let (existing, _) = self.db.chunk_totals(file_id.as_str()).await?;
        if existing > 0 {
            return Err(StorageError::Duplicate(format!(
                "chunks already stored for {}",
                file_id
            )));
        }

        match self.write_chunks(file_id, stream, chunk_size, cancel).await {
            Ok(stored) => {
                debug!(
                    "Stored {} ({} bytes in {} chunks)",
                    file_id, stored.length, stored.chunk_count
                );
                Ok(stored)
            }
            Err(e) => {
                match self.delete_all(file_id).await {
                    Ok(removed) => warn!(
                        "Store of {} failed ({}), removed {} partial chunks",
                        file_id, e, removed
                    ),
                    Err(cleanup) => error!(
                        "Store of {} failed ({}) and partial chunks could not be removed: {}",
                        file_id, e, cleanup
                    ),
                }
                Err(e)
            }
        }
    }

    async fn write_chunks<S>(
        &self,
        file_id: &FileId,
        mut stream: S,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<StoredFile, StorageError>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
    {
        let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
        let mut hasher = Md5::new();
        let mut length: u64 = 0;
        let mut written: u64 = 0;
        let mut n: i64 = 0;

        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            let mut data = item?;

            length += data.len() as u64;
            if length > self.max_file_bytes {
                return Err(StorageError::TooLarge {
                    limit: self.max_file_bytes,
                });
            }
            hasher.update(&data);

            while !data.is_empty() {
                let take = (chunk_size - buffer.len()).min(data.len());
                buffer.extend_from_slice(&data.split_to(take));
                if buffer.len() == chunk_size {
                    if cancel.is_cancelled() {
                        return Err(StorageError::Cancelled);
                    }
                    self.db
                        .insert_chunk(file_id.as_str(), n, written as i64, &buffer)
                        .await?;
                    written += buffer.len() as u64;
                    n += 1;
                    buffer.clear();
                }
            }
        }

        if !buffer.is_empty() {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            self.db
                .insert_chunk(file_id.as_str(), n, written as i64, &buffer)
                .await?;
            written += buffer.len() as u64;
            n += 1;
        }

        debug_assert_eq!(written, length);

        Ok(StoredFile {
            length,
            chunk_count: n as u64,
            md5: hex::encode(hasher.finalize()),
        })
    }

    /// Stream the inclusive byte range `start..=end` of a stored file.
    ///
    /// Chunks are fetched one at a time as the stream is polled; boundary
    /// chunks are sliced. Dropping the stream stops reading.
    pub async fn read_range(
        &self,
        file_id: &FileId,
        start: u64,
        end: u64,
    ) -> Result<ByteStream, StorageError> {
        let (count, length) = self.db.chunk_totals(file_id.as_str()).await?;
        if count == 0 {
            return Err(StorageError::NotFound(format!("no chunks for {}", file_id)));
        }

        let length = length as u64;
        if start > end || start >= length || end >= length {
            return Err(StorageError::Range { start, end, length });
        }

        let first = self
            .db
            .chunk_containing(file_id.as_str(), start as i64)
            .await?
            .ok_or_else(|| {
                StorageError::Io(io::Error::other(format!(
                    "no chunk of {} holds byte {}",
                    file_id, start
                )))
            })?;

        let cursor = ReadCursor {
            db: self.db.clone(),
            file_id: file_id.clone(),
            next: first,
            position: start,
            end,
        };

        Ok(futures::stream::try_unfold(cursor, read_next_chunk).boxed())
    }

    /// Remove every chunk of `file_id`. Returns how many were removed.
    pub async fn delete_all(&self, file_id: &FileId) -> Result<u64, StorageError> {
        Ok(self.db.delete_chunks(file_id.as_str()).await?)
    }

    /// Every chunk set in the store, keyed by raw file id.
    pub async fn chunk_sets(&self) -> Result<Vec<ChunkSet>, StorageError> {
        let summaries = self.db.chunk_summaries().await?;
        Ok(summaries
            .into_iter()
            .map(|s| ChunkSet {
                contiguous: s.min_n == 0 && s.max_n + 1 == s.chunk_count,
                file_id: s.file_id,
                chunk_count: s.chunk_count as u64,
                total_bytes: s.total_bytes as u64,
                first_written_at: s.first_written_at,
            })
            .collect())
    }

    /// Recompute the MD5 of a stored file by reading all of its chunks.
    pub async fn digest(&self, file_id: &FileId) -> Result<String, StorageError> {
        let (count, length) = self.db.chunk_totals(file_id.as_str()).await?;
        if count == 0 {
            return Err(StorageError::NotFound(format!("no chunks for {}", file_id)));
        }

        let mut hasher = Md5::new();
        let mut stream = self.read_range(file_id, 0, length as u64 - 1).await?;
        while let Some(bytes) = stream.next().await {
            hasher.update(&bytes?);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

struct ReadCursor {
    db: Database,
    file_id: FileId,
    next: i64,
    /// Next byte the stream must yield
    position: u64,
    /// Last byte to yield (inclusive)
    end: u64,
}

async fn read_next_chunk(
    mut cursor: ReadCursor,
) -> Result<Option<(Bytes, ReadCursor)>, StorageError> {
    if cursor.position > cursor.end {
        return Ok(None);
    }

    let chunk = cursor
        .db
        .get_chunk(cursor.file_id.as_str(), cursor.next)
        .await?
        .ok_or_else(|| {
            StorageError::Io(io::Error::other(format!(
                "chunk {} of {} is missing",
                cursor.next, cursor.file_id
            )))
        })?;

    let chunk_start = chunk.byte_offset as u64;
    let chunk_end = chunk_start + chunk.data.len() as u64;
    if chunk_start > cursor.position || chunk_end <= cursor.position {
        return Err(StorageError::Io(io::Error::other(format!(
            "chunk {} of {} does not cover byte {}",
            cursor.next, cursor.file_id, cursor.position
        ))));
    }

    let from = (cursor.position - chunk_start) as usize;
    let to = ((cursor.end + 1).min(chunk_end) - chunk_start) as usize;
    let bytes = Bytes::from(chunk.data).slice(from..to);

    cursor.position = chunk_start + to as u64;
    cursor.next += 1;
    Ok(Some((bytes, cursor)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    async fn open_store() -> (ChunkStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        (ChunkStore::new(db, 1024 * 1024), tmp)
    }

    fn body(data: &[u8], piece: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
        let parts: Vec<io::Result<Bytes>> = data
            .chunks(piece)
            .map(|p| Ok(Bytes::copy_from_slice(p)))
            .collect();
        futures::stream::iter(parts)
    }

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let parts: Vec<Bytes> = stream.try_collect().await.unwrap();
        parts.concat()
    }

    #[tokio::test]
    async fn stored_bytes_read_back_for_assorted_ranges() {
        let (store, _tmp) = open_store().await;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let id = FileId::new();

        let stored = store
            .store(&id, body(&data, 777), 1000, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stored.length, 10_000);
        assert_eq!(stored.chunk_count, 10);
        assert_eq!(stored.md5, hex::encode(Md5::digest(&data)));

        for (start, end) in [(0, 9_999), (0, 0), (999, 1000), (1500, 4321), (9_999, 9_999)] {
            let read = collect(store.read_range(&id, start, end).await.unwrap()).await;
            assert_eq!(read, &data[start as usize..=end as usize], "{start}-{end}");
        }
    }

    #[tokio::test]
    async fn out_of_bounds_range_is_rejected() {
        let (store, _tmp) = open_store().await;
        let id = FileId::new();
        store
            .store(&id, body(&[7u8; 100], 100), 30, &CancellationToken::new())
            .await
            .unwrap();

        for (start, end) in [(0, 100), (100, 100), (50, 10)] {
            let result = store.read_range(&id, start, end).await;
            assert!(
                matches!(result, Err(StorageError::Range { length: 100, .. })),
                "{start}-{end}"
            );
        }
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let (store, _tmp) = open_store().await;
        let result = store.read_range(&FileId::new(), 0, 0).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn stream_error_removes_partial_chunks() {
        let (store, _tmp) = open_store().await;
        let id = FileId::new();
        let parts: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from(vec![1u8; 64])),
            Ok(Bytes::from(vec![2u8; 64])),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];

        let result = store
            .store(&id, futures::stream::iter(parts), 32, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert_eq!(store.db.chunk_totals(id.as_str()).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn cancelled_store_leaves_nothing_behind() {
        let (store, _tmp) = open_store().await;
        let id = FileId::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = store.store(&id, body(&[1u8; 500], 50), 100, &cancel).await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
        assert_eq!(store.db.chunk_totals(id.as_str()).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn oversized_upload_is_rolled_back() {
        let tmp = TempDir::new().unwrap();
        let db = Database::new(tmp.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        let store = ChunkStore::new(db, 1000);
        let id = FileId::new();

        let result = store
            .store(&id, body(&[0u8; 1500], 100), 200, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StorageError::TooLarge { limit: 1000 })));
        assert_eq!(store.db.chunk_totals(id.as_str()).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn second_store_for_same_id_is_duplicate_and_keeps_first() {
        let (store, _tmp) = open_store().await;
        let id = FileId::new();
        let cancel = CancellationToken::new();
        store.store(&id, body(b"original", 8), 4, &cancel).await.unwrap();

        let result = store.store(&id, body(b"replacement", 8), 4, &cancel).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));
        assert_eq!(
            collect(store.read_range(&id, 0, 7).await.unwrap()).await,
            b"original"
        );
    }

    #[tokio::test]
    async fn delete_all_is_idempotent() {
        let (store, _tmp) = open_store().await;
        let id = FileId::new();
        store
            .store(&id, body(&[3u8; 10], 10), 4, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(store.delete_all(&id).await.unwrap(), 3);
        assert_eq!(store.delete_all(&id).await.unwrap(), 0);
        assert!(matches!(
            store.read_range(&id, 0, 0).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_middle_chunk_fails_the_stream() {
        let (store, _tmp) = open_store().await;
        let id = FileId::new();
        store
            .store(&id, body(&[5u8; 30], 30), 10, &CancellationToken::new())
            .await
            .unwrap();
        sqlx::query("DELETE FROM chunks WHERE file_id = ? AND n = 1")
            .bind(id.as_str())
            .execute(store.db.pool())
            .await
            .unwrap();

        // totals now report 20 bytes, so ask for a range spanning the gap
        let stream = store.read_range(&id, 0, 19).await.unwrap();
        let result: Result<Vec<Bytes>, _> = stream.try_collect().await;
        assert!(matches!(result, Err(StorageError::Io(_))));

        let sets = store.chunk_sets().await.unwrap();
        assert_eq!(sets.len(), 1);
        assert!(!sets[0].contiguous);
    }
}
