//! HTTP range serving for stored files
//!
//! Request lifecycle: parse the `Range` header, plan it against the file
//! length (full, partial or unsatisfiable), then stream chunks into the
//! response body as the client pulls them.

use crate::storage::{
    ByteStream, ChunkStore, FileCatalog, FileId, FileRecord, RequestContext, StorageError,
};
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{info, warn};

/// A single byte range as written in a `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-end`, both inclusive
    FromTo(u64, u64),
    /// `bytes=start-`
    From(u64),
    /// `bytes=-n`: the last n bytes
    Suffix(u64),
}

/// What to send for a request against a file of known length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePlan {
    Full,
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a `Range: bytes=...` header holding exactly one range.
///
/// Returns None for anything else (other units, multiple ranges, garbage);
/// callers treat that the same as no header at all.
pub fn parse_range_header(header: &str) -> Option<ByteRange> {
    let range_spec = header.trim().strip_prefix("bytes=")?;
    if range_spec.contains(',') {
        return None;
    }
    let (start_str, end_str) = range_spec.trim().split_once('-')?;

    match (start_str.trim(), end_str.trim()) {
        ("", "") => None,
        ("", suffix) => suffix.parse().ok().map(ByteRange::Suffix),
        (start, "") => start.parse().ok().map(ByteRange::From),
        (start, end) => Some(ByteRange::FromTo(start.parse().ok()?, end.parse().ok()?)),
    }
}

impl ByteRange {
    /// Plan this range against a file of `length` bytes. Never clamps.
    pub fn plan(self, length: u64) -> RangePlan {
        match self {
            ByteRange::FromTo(start, end) => {
                if start > end || start >= length || end >= length {
                    RangePlan::Unsatisfiable
                } else {
                    RangePlan::Partial { start, end }
                }
            }
            ByteRange::From(start) if start < length => RangePlan::Partial {
                start,
                end: length - 1,
            },
            ByteRange::Suffix(n) if n > 0 && length > 0 => RangePlan::Partial {
                start: length - n.min(length),
                end: length - 1,
            },
            _ => RangePlan::Unsatisfiable,
        }
    }

    /// Inclusive bounds as requested, for error reporting.
    fn bounds(self, length: u64) -> (u64, u64) {
        match self {
            ByteRange::FromTo(start, end) => (start, end),
            ByteRange::From(start) => (start, length.saturating_sub(1)),
            ByteRange::Suffix(n) => (length.saturating_sub(n), length.saturating_sub(1)),
        }
    }
}

/// Strong ETag derived from the file id. Stored files never change.
pub fn etag_for(file_id: &FileId) -> String {
    let digest = hex::encode(Sha256::digest(file_id.as_str().as_bytes()));
    format!("\"{}\"", &digest[..32])
}

fn etag_matches(header: &str, etag: &str) -> bool {
    header
        .split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || tag.trim_start_matches("W/") == etag)
}

/// Sanitize a filename for use in Content-Disposition headers.
/// Replaces characters that break the quoted-string production (RFC 6266).
fn sanitize_content_disposition_filename(name: &str) -> String {
    name.replace(['\\', '"'], "_")
        .chars()
        .map(|c| if c.is_control() { '_' } else { c })
        .collect()
}

/// Build a Content-Disposition value with an ASCII `filename` fallback and,
/// for non-ASCII names, an RFC 5987 `filename*` parameter.
fn content_disposition(disposition: &str, name: &str) -> String {
    let sanitized = sanitize_content_disposition_filename(name);
    if sanitized.is_ascii() {
        return format!("{}; filename=\"{}\"", disposition, sanitized);
    }
    let fallback: String = sanitized
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    format!(
        "{}; filename=\"{}\"; filename*=UTF-8''{}",
        disposition,
        fallback,
        percent_encode_attr(name)
    )
}

fn percent_encode_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'!'
            | b'#'
            | b'$'
            | b'&'
            | b'+'
            | b'-'
            | b'.'
            | b'^'
            | b'_'
            | b'`'
            | b'|'
            | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// A ready-to-send file response: status, headers and a streaming body.
pub struct FileResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Body,
}

impl FileResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn into_body(self) -> Body {
        self.body
    }
}

impl IntoResponse for FileResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Serves stored files with range, caching and conditional request support.
#[derive(Clone, Debug)]
pub struct RangeStreamer {
    catalog: FileCatalog,
    chunks: ChunkStore,
    cache_max_age: Duration,
}

impl RangeStreamer {
    pub fn new(catalog: FileCatalog, chunks: ChunkStore, cache_max_age: Duration) -> Self {
        Self {
            catalog,
            chunks,
            cache_max_age,
        }
    }

    /// Look up `file_id` and serve it.
    pub async fn serve(
        &self,
        file_id: &FileId,
        request_headers: &HeaderMap,
        download: bool,
        ctx: &RequestContext,
    ) -> Result<FileResponse, StorageError> {
        let record = self.catalog.lookup(file_id).await?;
        self.serve_record(&record, request_headers, download, ctx).await
    }

    /// Serve an already-resolved record.
    ///
    /// An unsatisfiable range is returned as [`StorageError::Range`]. A record
    /// whose chunks are missing or short is an [`StorageError::Io`]. The body
    /// ends early, without error, once `ctx` is cancelled.
    pub async fn serve_record(
        &self,
        record: &FileRecord,
        request_headers: &HeaderMap,
        download: bool,
        ctx: &RequestContext,
    ) -> Result<FileResponse, StorageError> {
        if ctx.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let etag = etag_for(&record.id);
        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, header_value(&etag));
        headers.insert(
            header::CACHE_CONTROL,
            header_value(&format!(
                "public, max-age={}, immutable",
                self.cache_max_age.as_secs()
            )),
        );
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

        if let Some(if_none_match) = header_str(request_headers, header::IF_NONE_MATCH) {
            if etag_matches(if_none_match, &etag) {
                return Ok(FileResponse {
                    status: StatusCode::NOT_MODIFIED,
                    headers,
                    body: Body::empty(),
                });
            }
        }

        let range_applies = match header_str(request_headers, header::IF_RANGE) {
            Some(if_range) => if_range.trim() == etag,
            None => true,
        };
        let range = if range_applies {
            header_str(request_headers, header::RANGE).and_then(parse_range_header)
        } else {
            None
        };

        let length = record.length;
        let plan = range.map_or(RangePlan::Full, |r| r.plan(length));

        headers.insert(
            header::CONTENT_TYPE,
            header_value(record.content_type.as_str()),
        );
        let disposition = if download { "attachment" } else { "inline" };
        headers.insert(
            header::CONTENT_DISPOSITION,
            HeaderValue::from_str(&content_disposition(disposition, &record.filename))
                .unwrap_or_else(|_| HeaderValue::from_static("inline")),
        );

        let (status, start, end) = match plan {
            RangePlan::Unsatisfiable => {
                let (start, end) = range.map_or((0, 0), |r| r.bounds(length));
                return Err(StorageError::Range { start, end, length });
            }
            RangePlan::Full if length == 0 => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
                return Ok(FileResponse {
                    status: StatusCode::OK,
                    headers,
                    body: Body::empty(),
                });
            }
            RangePlan::Full => (StatusCode::OK, 0, length - 1),
            RangePlan::Partial { start, end } => {
                headers.insert(
                    header::CONTENT_RANGE,
                    header_value(&format!("bytes {}-{}/{}", start, end, length)),
                );
                (StatusCode::PARTIAL_CONTENT, start, end)
            }
        };

        let stream = self
            .chunks
            .read_range(&record.id, start, end)
            .await
            .map_err(|e| match e {
                StorageError::NotFound(_) | StorageError::Range { .. } => {
                    warn!(
                        "File {} is catalogued with {} bytes but its chunks do not match: {}",
                        record.id, length, e
                    );
                    StorageError::Io(std::io::Error::other(format!(
                        "chunks of {} are missing or incomplete",
                        record.id
                    )))
                }
                other => other,
            })?;

        let expected = end - start + 1;
        headers.insert(header::CONTENT_LENGTH, header_value(&expected.to_string()));

        let tracked = TrackedStream::new(stream, record.id.clone(), expected, ctx.clone());

        Ok(FileResponse {
            status,
            headers,
            body: Body::from_stream(tracked),
        })
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_value(s: &str) -> HeaderValue {
    HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// Body stream that notes how far the client got.
///
/// Logs once when dropped before the last byte was sent (client went away),
/// once when a chunk read fails mid-stream, or once when the request is
/// cancelled. Cancellation ends the stream and releases the chunk cursor.
struct TrackedStream {
    inner: ByteStream,
    file_id: FileId,
    expected: u64,
    sent: u64,
    /// Already logged why the stream stopped early
    ended: bool,
    cancelled: BoxFuture<'static, ()>,
    // holds the deadline timer for as long as the body lives
    _ctx: RequestContext,
}

impl TrackedStream {
    fn new(inner: ByteStream, file_id: FileId, expected: u64, ctx: RequestContext) -> Self {
        let token = ctx.cancellation().clone();
        Self {
            inner,
            file_id,
            expected,
            sent: 0,
            ended: false,
            cancelled: async move { token.cancelled().await }.boxed(),
            _ctx: ctx,
        }
    }
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, StorageError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.ended {
            return Poll::Ready(None);
        }
        if this.cancelled.poll_unpin(cx).is_ready() {
            this.ended = true;
            info!(
                "Download of {} cancelled after {}/{} bytes",
                this.file_id, this.sent, this.expected
            );
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                this.sent += bytes.len() as u64;
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.ended = true;
                warn!(
                    "Read of {} failed after {}/{} bytes: {}",
                    this.file_id, this.sent, this.expected, e
                );
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if !self.ended && self.sent < self.expected {
            info!(
                "Client disconnected from {} after {}/{} bytes",
                self.file_id, self.sent, self.expected
            );
        }
    }
}
