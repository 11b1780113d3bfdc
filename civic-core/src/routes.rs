use std::io;
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::audit::{AuditOptions, AuditReport, IntegrityAuditor, RepairPlan};
use crate::config::Config;
use crate::db::Database;
use crate::storage::{
    ChunkStore, FileCatalog, FileId, FileRecord, FileResponse, FileStorage, RangeStreamer,
    RequestContext, StorageError,
};
use crate::weeks::{
    AssetChange, AssetUpload, DeletionReport, SortOrder, WeekAsset, WeekAssetLinker, WeekDraft,
};

/// Most files a single multipart request is expected to carry.
const MAX_FILES_PER_REQUEST: u64 = 32;

const ACTOR_HEADER: &str = "x-actor";

/// Shared state for the HTTP routes: every storage component, wired once.
pub struct AppState {
    pub db: Database,
    pub linker: WeekAssetLinker,
    pub streamer: RangeStreamer,
    pub auditor: IntegrityAuditor,
    pub config: Config,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Self {
        let chunks = ChunkStore::new(db.clone(), config.max_file_bytes);
        let catalog = FileCatalog::new(db.clone());
        let files = FileStorage::new(chunks.clone(), catalog.clone(), config.chunk_size_bytes);
        let linker = WeekAssetLinker::new(db.clone(), files);
        Self {
            streamer: RangeStreamer::new(catalog, chunks, config.cache_max_age),
            auditor: IntegrityAuditor::new(linker.clone()),
            linker,
            db,
            config,
        }
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state
        .config
        .max_file_bytes
        .saturating_mul(MAX_FILES_PER_REQUEST)
        .min(usize::MAX as u64) as usize;

    Router::new()
        .route("/health", get(health))
        .route("/api/weeks", get(list_weeks).post(create_week))
        .route(
            "/api/weeks/id/:id",
            get(get_week_by_id).delete(delete_week_by_id),
        )
        .route("/api/weeks/:week_number", get(get_week).delete(delete_week))
        .route("/api/weeks/:week_number/photos", post(add_photo))
        .route(
            "/api/weeks/:week_number/photos/:file_id",
            axum::routing::delete(remove_photo),
        )
        .route(
            "/api/weeks/:week_number/report",
            axum::routing::put(replace_report).delete(remove_report),
        )
        .route(
            "/api/weeks/:week_number/files/:file_id",
            get(serve_week_file),
        )
        .route("/api/files/:file_id", get(serve_file))
        .route("/api/files/:file_id/info", get(file_info))
        .route("/api/audit", get(audit))
        .route("/api/audit/repair", post(repair))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Error response for the REST boundary. Bodies are `{"error": message}`.
#[derive(Debug)]
pub enum ApiError {
    Storage(StorageError),
    /// Request body rejected before reaching storage, with its status
    Body(StatusCode, String),
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Storage(err)
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        body_rejection(&err)
    }
}

/// Status from the multipart layer: 413 past the body limit, else 400.
fn body_rejection(err: &MultipartError) -> ApiError {
    let status = err.status();
    let message = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "Request body too large".to_string()
    } else {
        format!("Malformed multipart body: {}", err)
    };
    ApiError::Body(status, message)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Body(status, message) => {
                return (status, Json(json!({ "error": message }))).into_response();
            }
            ApiError::Storage(err) => err,
        };

        // a file part that failed mid-stream surfaces as an IO error
        if let StorageError::Io(e) = &err {
            let multipart = e
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<MultipartError>());
            if let Some(multipart) = multipart {
                return body_rejection(multipart).into_response();
            }
        }

        let (status, message) = match &err {
            StorageError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
            StorageError::Duplicate(_) => (StatusCode::CONFLICT, err.to_string()),
            StorageError::Range { length, .. } => {
                return (
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    [(header::CONTENT_RANGE, format!("bytes */{}", length))],
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response();
            }
            StorageError::InvalidInput(_) => (StatusCode::BAD_REQUEST, err.to_string()),
            StorageError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, err.to_string()),
            StorageError::Io(e) => {
                error!("Internal storage error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            StorageError::Unavailable(e) => {
                warn!("Storage backend unavailable: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Storage backend unavailable".to_string(),
                )
            }
            StorageError::Cancelled => (StatusCode::REQUEST_TIMEOUT, err.to_string()),
            StorageError::Conflict(_) => (StatusCode::CONFLICT, err.to_string()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn request_context(headers: &HeaderMap, state: &AppState) -> RequestContext {
    let actor = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    RequestContext::new(actor).with_deadline(state.config.upload_timeout)
}

/// Wrap a multipart file part as an upload without buffering it.
fn field_upload(field: Field<'_>) -> AssetUpload<'_> {
    let filename = field.file_name().unwrap_or("upload").to_string();
    let declared = field.content_type().map(str::to_string);
    AssetUpload::new(
        filename,
        declared.as_deref(),
        field.map_err(io::Error::other),
    )
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.db.health_check().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct ListQuery {
    order: Option<SortOrder>,
}

async fn list_weeks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<WeekAsset>>> {
    let weeks = state
        .linker
        .list_weeks(query.order.unwrap_or_default())
        .await?;
    Ok(Json(weeks))
}

async fn get_week(
    State(state): State<Arc<AppState>>,
    Path(week_number): Path<u32>,
) -> ApiResult<Json<WeekAsset>> {
    Ok(Json(state.linker.get_week(week_number).await?))
}

async fn get_week_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<WeekAsset>> {
    Ok(Json(state.linker.get_week_by_id(&id).await?))
}

/// Multipart fields of a week upload, read in arrival order.
///
/// `weekNumber` must come before any file part so the duplicate check runs
/// before anything is stored.
#[derive(Default)]
struct WeekForm<'a> {
    draft: Option<WeekDraft<'a>>,
    summary: Option<String>,
}

async fn read_week_form<'a>(
    state: &'a AppState,
    ctx: &RequestContext,
    multipart: &mut Multipart,
    form: &mut WeekForm<'a>,
) -> ApiResult<()> {
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "weekNumber" => {
                let text = field.text().await?;
                let week_number: u32 = text.trim().parse().map_err(|_| {
                    StorageError::InvalidInput(format!("invalid weekNumber: {}", text))
                })?;
                if form.draft.is_some() {
                    return Err(StorageError::InvalidInput(
                        "weekNumber given more than once".to_string(),
                    )
                    .into());
                }
                form.draft = Some(state.linker.begin_week(week_number, ctx).await?);
            }
            "summary" => form.summary = Some(field.text().await?),
            "photos" | "reportPdf" => {
                let draft = form.draft.as_mut().ok_or_else(|| {
                    StorageError::InvalidInput(
                        "weekNumber must precede file parts".to_string(),
                    )
                })?;
                if name == "photos" {
                    draft.add_photo(field_upload(field)).await?;
                } else {
                    draft.set_report(field_upload(field)).await?;
                }
            }
            other => debug!("Ignoring multipart field {}", other),
        }
    }
    Ok(())
}

async fn create_week(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<WeekAsset>)> {
    let ctx = request_context(&headers, &state);
    let mut form = WeekForm::default();

    if let Err(e) = read_week_form(&state, &ctx, &mut multipart, &mut form).await {
        if let Some(draft) = form.draft.take() {
            draft.abort().await;
        }
        return Err(e);
    }

    let draft = form.draft.ok_or_else(|| {
        StorageError::InvalidInput("missing weekNumber".to_string())
    })?;
    let week = draft
        .commit(form.summary.as_deref().unwrap_or_default())
        .await?;
    Ok((StatusCode::CREATED, Json(week)))
}

async fn delete_week(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(week_number): Path<u32>,
) -> ApiResult<Json<DeletionReport>> {
    let ctx = request_context(&headers, &state);
    Ok(Json(state.linker.delete_week(week_number, &ctx).await?))
}

async fn delete_week_by_id(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<DeletionReport>> {
    let ctx = request_context(&headers, &state);
    Ok(Json(state.linker.delete_week_by_id(&id, &ctx).await?))
}

async fn add_photo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(week_number): Path<u32>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<AssetChange>)> {
    let ctx = request_context(&headers, &state);
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("photos") {
            let change = state
                .linker
                .add_photo(week_number, field_upload(field), &ctx)
                .await?;
            return Ok((StatusCode::CREATED, Json(change)));
        }
        debug!("Ignoring multipart field {:?}", field.name());
    }
    Err(StorageError::InvalidInput("missing photos part".to_string()).into())
}

async fn remove_photo(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((week_number, file_id)): Path<(u32, String)>,
) -> ApiResult<Json<AssetChange>> {
    let ctx = request_context(&headers, &state);
    let file_id = FileId::parse(&file_id)?;
    Ok(Json(
        state.linker.remove_photo(week_number, &file_id, &ctx).await?,
    ))
}

async fn replace_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(week_number): Path<u32>,
    mut multipart: Multipart,
) -> ApiResult<Json<AssetChange>> {
    let ctx = request_context(&headers, &state);
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some("reportPdf") {
            let change = state
                .linker
                .replace_report(week_number, field_upload(field), &ctx)
                .await?;
            return Ok(Json(change));
        }
        debug!("Ignoring multipart field {:?}", field.name());
    }
    Err(StorageError::InvalidInput("missing reportPdf part".to_string()).into())
}

async fn remove_report(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(week_number): Path<u32>,
) -> ApiResult<Json<AssetChange>> {
    let ctx = request_context(&headers, &state);
    Ok(Json(state.linker.remove_report(week_number, &ctx).await?))
}

#[derive(Deserialize)]
struct FileQuery {
    download: Option<bool>,
}

async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> ApiResult<FileResponse> {
    let ctx = request_context(&headers, &state);
    let file_id = FileId::parse(&file_id)?;
    Ok(state
        .streamer
        .serve(&file_id, &headers, query.download.unwrap_or(false), &ctx)
        .await?)
}

async fn serve_week_file(
    State(state): State<Arc<AppState>>,
    Path((week_number, file_id)): Path<(u32, String)>,
    Query(query): Query<FileQuery>,
    headers: HeaderMap,
) -> ApiResult<FileResponse> {
    let ctx = request_context(&headers, &state);
    let file_id = FileId::parse(&file_id)?;
    let record = state
        .linker
        .resolve_file_for_week(week_number, &file_id)
        .await?;
    Ok(state
        .streamer
        .serve_record(&record, &headers, query.download.unwrap_or(false), &ctx)
        .await?)
}

async fn file_info(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<FileRecord>> {
    let file_id = FileId::parse(&file_id)?;
    Ok(Json(state.linker.files().catalog().lookup(&file_id).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditQuery {
    verify_checksums: Option<bool>,
}

async fn audit(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<AuditReport>> {
    let options = AuditOptions {
        verify_checksums: query.verify_checksums.unwrap_or(false),
        orphan_grace: state.config.orphan_grace,
    };
    Ok(Json(state.auditor.audit(&options).await?))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RepairRequest {
    verify_checksums: bool,
    strip_dangling: bool,
    delete_orphans: bool,
}

async fn repair(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RepairRequest>,
) -> ApiResult<Json<AuditReport>> {
    let ctx = request_context(&headers, &state);
    warn!(
        "Integrity repair requested by {} (strip dangling: {}, delete orphans: {})",
        ctx.actor(),
        request.strip_dangling,
        request.delete_orphans
    );
    let options = AuditOptions {
        verify_checksums: request.verify_checksums,
        orphan_grace: state.config.orphan_grace,
    };
    let plan = RepairPlan {
        strip_dangling: request.strip_dangling,
        delete_orphans: request.delete_orphans,
    };
    Ok(Json(state.auditor.repair(&options, plan).await?))
}
