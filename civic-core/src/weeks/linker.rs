use crate::db::{Database, DbWeek};
use crate::storage::{
    FileId, FileRecord, FileStorage, IntegrityWarning, Metadata, RequestContext, StorageError,
};
use crate::weeks::models::{
    AssetChange, AssetUpload, DeletionReport, FileType, SortOrder, WeekAsset,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// `bundle` metadata value for files of the standalone week 0 bundle.
pub const CAREER_GUIDANCE_BUNDLE: &str = "career-guidance";

const MAX_UPDATE_ATTEMPTS: u32 = 5;

/// Binds week records to stored files.
///
/// All creation and removal of week references goes through here. Week rows
/// are only ever changed with a single-row update guarded by the row's
/// revision, so concurrent edits of one week either apply in turn or fail
/// with [`StorageError::Conflict`].
#[derive(Clone, Debug)]
pub struct WeekAssetLinker {
    db: Database,
    files: FileStorage,
}

impl WeekAssetLinker {
    pub fn new(db: Database, files: FileStorage) -> Self {
        Self { db, files }
    }

    pub fn files(&self) -> &FileStorage {
        &self.files
    }

    /// Start assembling a new week. Fails early if the week already exists,
    /// before anything is uploaded.
    pub async fn begin_week(
        &self,
        week_number: u32,
        ctx: &RequestContext,
    ) -> Result<WeekDraft<'_>, StorageError> {
        if self.db.get_week_by_number(week_number as i64).await?.is_some() {
            return Err(duplicate_week(week_number));
        }
        Ok(WeekDraft {
            linker: self,
            week_number,
            ctx: ctx.clone(),
            photos: Vec::new(),
            report: None,
            finished: false,
        })
    }

    /// Upload every asset and insert the week. On any failure everything
    /// uploaded by this call is deleted before the error is returned.
    pub async fn create_week(
        &self,
        week_number: u32,
        summary: &str,
        photos: Vec<AssetUpload<'_>>,
        report: Option<AssetUpload<'_>>,
        ctx: &RequestContext,
    ) -> Result<WeekAsset, StorageError> {
        validate_summary(summary)?;
        let mut draft = self.begin_week(week_number, ctx).await?;

        for photo in photos {
            if let Err(e) = draft.add_photo(photo).await.map(|_| ()) {
                draft.abort().await;
                return Err(e);
            }
        }
        if let Some(report) = report {
            if let Err(e) = draft.set_report(report).await.map(|_| ()) {
                draft.abort().await;
                return Err(e);
            }
        }

        draft.commit(summary).await
    }

    pub async fn get_week(&self, week_number: u32) -> Result<WeekAsset, StorageError> {
        self.db
            .get_week_by_number(week_number as i64)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("week {}", week_number)))?
            .try_into()
    }

    pub async fn get_week_by_id(&self, id: &str) -> Result<WeekAsset, StorageError> {
        self.db
            .get_week_by_id(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("week with id {}", id)))?
            .try_into()
    }

    pub async fn list_weeks(&self, order: SortOrder) -> Result<Vec<WeekAsset>, StorageError> {
        self.db
            .list_weeks(order == SortOrder::Desc)
            .await?
            .into_iter()
            .map(WeekAsset::try_from)
            .collect()
    }

    /// Remove the week record, then clean up each of its files.
    ///
    /// The record is removed even when file cleanup fails; failures are
    /// reported, not returned as errors. The cleanup covers exactly the
    /// references of the row that was deleted, including any added while
    /// the delete was in progress.
    pub async fn delete_week(
        &self,
        week_number: u32,
        ctx: &RequestContext,
    ) -> Result<DeletionReport, StorageError> {
        let week = self.delete_guarded(|| self.get_week(week_number)).await?;
        self.release_deleted(week, ctx).await
    }

    pub async fn delete_week_by_id(
        &self,
        id: &str,
        ctx: &RequestContext,
    ) -> Result<DeletionReport, StorageError> {
        let week = self.delete_guarded(|| self.get_week_by_id(id)).await?;
        self.release_deleted(week, ctx).await
    }

    /// Delete the row returned by `load`, provided nobody changed it in
    /// between. Returns the week as it was when deleted.
    async fn delete_guarded<F, Fut>(&self, load: F) -> Result<WeekAsset, StorageError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<WeekAsset, StorageError>>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let week = load().await?;
            if self.db.delete_week(&week.id, week.revision).await? {
                return Ok(week);
            }
            debug!(
                "Week {} changed while being deleted (attempt {}/{})",
                week.week_number, attempt, MAX_UPDATE_ATTEMPTS
            );
        }

        Err(StorageError::Conflict(
            "week kept changing during delete".to_string(),
        ))
    }

    async fn release_deleted(
        &self,
        week: WeekAsset,
        ctx: &RequestContext,
    ) -> Result<DeletionReport, StorageError> {
        info!("Deleted week {} by {}", week.week_number, ctx.actor());

        let mut report = DeletionReport {
            week_number: week.week_number,
            week_id: week.id.clone(),
            removed: Vec::new(),
            failed: Vec::new(),
        };
        for file_id in week.file_ids() {
            match self.release_file(week.week_number, file_id).await {
                Ok(()) => report.removed.push(file_id.clone()),
                Err(warning) => report.failed.push(warning),
            }
        }

        if !report.is_complete() {
            warn!(
                "Week {} deleted with {} of {} file cleanups failing",
                week.week_number,
                report.failed.len(),
                report.failed.len() + report.removed.len()
            );
        }
        Ok(report)
    }

    /// The record of `file_id`, provided it is attached to the week.
    pub async fn resolve_file_for_week(
        &self,
        week_number: u32,
        file_id: &FileId,
    ) -> Result<FileRecord, StorageError> {
        let week = self.get_week(week_number).await?;
        if !week.references(file_id) {
            return Err(StorageError::NotFound(format!(
                "file {} in week {}",
                file_id, week_number
            )));
        }
        self.files.catalog().lookup(file_id).await
    }

    /// Upload a photo and append it to the week's photo list.
    pub async fn add_photo(
        &self,
        week_number: u32,
        upload: AssetUpload<'_>,
        ctx: &RequestContext,
    ) -> Result<AssetChange, StorageError> {
        self.get_week(week_number).await?;
        let record = self
            .upload_asset(week_number, FileType::Photo, upload, ctx)
            .await?;

        let id = record.id.clone();
        let updated = self
            .update_references(week_number, |week| {
                week.photo_file_ids.push(id.clone());
                Ok(())
            })
            .await;

        match updated {
            Ok((week, ())) => {
                info!(
                    "Added photo {} to week {} by {}",
                    record.id,
                    week_number,
                    ctx.actor()
                );
                Ok(AssetChange {
                    week,
                    warnings: Vec::new(),
                })
            }
            Err(e) => {
                self.rollback_upload(&record.id).await;
                Err(e)
            }
        }
    }

    /// Detach a photo from the week and delete its file.
    pub async fn remove_photo(
        &self,
        week_number: u32,
        file_id: &FileId,
        ctx: &RequestContext,
    ) -> Result<AssetChange, StorageError> {
        let (week, ()) = self
            .update_references(week_number, |week| {
                let before = week.photo_file_ids.len();
                week.photo_file_ids.retain(|id| id != file_id);
                if week.photo_file_ids.len() == before {
                    return Err(StorageError::NotFound(format!(
                        "photo {} in week {}",
                        file_id, week_number
                    )));
                }
                Ok(())
            })
            .await?;
        info!(
            "Removed photo {} from week {} by {}",
            file_id,
            week_number,
            ctx.actor()
        );

        let warnings = self.release_file(week_number, file_id).await.err();
        Ok(AssetChange {
            week,
            warnings: warnings.into_iter().collect(),
        })
    }

    /// Upload a new report, swap it in, then delete the previous one.
    pub async fn replace_report(
        &self,
        week_number: u32,
        upload: AssetUpload<'_>,
        ctx: &RequestContext,
    ) -> Result<AssetChange, StorageError> {
        self.get_week(week_number).await?;
        let record = self
            .upload_asset(week_number, FileType::Report, upload, ctx)
            .await?;

        let id = record.id.clone();
        let updated = self
            .update_references(week_number, |week| {
                Ok(week.report_file_id.replace(id.clone()))
            })
            .await;

        let (week, previous) = match updated {
            Ok(updated) => updated,
            Err(e) => {
                self.rollback_upload(&record.id).await;
                return Err(e);
            }
        };
        info!(
            "Set report of week {} to {} by {}",
            week_number,
            record.id,
            ctx.actor()
        );

        let mut warnings = Vec::new();
        if let Some(previous) = previous {
            if let Err(warning) = self.release_file(week_number, &previous).await {
                warnings.push(warning);
            }
        }
        Ok(AssetChange { week, warnings })
    }

    pub async fn remove_report(
        &self,
        week_number: u32,
        ctx: &RequestContext,
    ) -> Result<AssetChange, StorageError> {
        let (week, previous) = self
            .update_references(week_number, |week| {
                week.report_file_id.take().ok_or_else(|| {
                    StorageError::NotFound(format!("report of week {}", week_number))
                })
            })
            .await?;
        info!(
            "Removed report {} from week {} by {}",
            previous,
            week_number,
            ctx.actor()
        );

        let warnings = self.release_file(week_number, &previous).await.err();
        Ok(AssetChange {
            week,
            warnings: warnings.into_iter().collect(),
        })
    }

    /// Drop the given ids from a week's references without touching files.
    pub async fn strip_references(
        &self,
        week_number: u32,
        file_ids: &HashSet<FileId>,
    ) -> Result<WeekAsset, StorageError> {
        let (week, stripped) = self
            .update_references(week_number, |week| {
                let before = week.file_ids().count();
                week.photo_file_ids.retain(|id| !file_ids.contains(id));
                if week
                    .report_file_id
                    .as_ref()
                    .is_some_and(|id| file_ids.contains(id))
                {
                    week.report_file_id = None;
                }
                Ok(before - week.file_ids().count())
            })
            .await?;
        info!(
            "Stripped {} references from week {}",
            stripped, week_number
        );
        Ok(week)
    }

    /// Read-modify-write of a week's references with optimistic concurrency.
    ///
    /// `mutate` may run several times; it must only depend on the week passed in.
    async fn update_references<T, F>(
        &self,
        week_number: u32,
        mutate: F,
    ) -> Result<(WeekAsset, T), StorageError>
    where
        F: Fn(&mut WeekAsset) -> Result<T, StorageError>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut week = self.get_week(week_number).await?;
            let value = mutate(&mut week)?;

            let photos = serde_json::to_string(&week.photo_file_ids)
                .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
            let now = Utc::now();
            let applied = self
                .db
                .update_week_assets(
                    &week.id,
                    &photos,
                    week.report_file_id.as_ref().map(FileId::as_str),
                    week.revision,
                    now,
                )
                .await?;

            if applied {
                week.revision += 1;
                week.updated_at = now;
                return Ok((week, value));
            }
            debug!(
                "Week {} changed concurrently (attempt {}/{})",
                week_number, attempt, MAX_UPDATE_ATTEMPTS
            );
        }

        Err(StorageError::Conflict(format!(
            "week {} kept changing during update",
            week_number
        )))
    }

    async fn upload_asset(
        &self,
        week_number: u32,
        file_type: FileType,
        upload: AssetUpload<'_>,
        ctx: &RequestContext,
    ) -> Result<FileRecord, StorageError> {
        let accepted = match file_type {
            FileType::Photo => upload.content_type.is_image(),
            FileType::Report => upload.content_type.is_report(),
        };
        if !accepted {
            return Err(StorageError::InvalidInput(format!(
                "{} is not a valid {} ({})",
                upload.filename,
                file_type.as_str(),
                upload.content_type
            )));
        }

        let metadata = file_metadata(week_number, file_type, ctx);
        self.files
            .upload(
                &upload.filename,
                upload.content_type,
                upload.body,
                metadata,
                ctx,
            )
            .await
    }

    async fn rollback_upload(&self, file_id: &FileId) {
        match self.files.purge(file_id).await {
            Ok(_) => info!("Rolled back upload {}", file_id),
            Err(e) => error!("Failed to roll back upload {}: {}", file_id, e),
        }
    }

    /// Delete a file that was attached to a week.
    ///
    /// A file whose record is already gone counts as a failure: the week
    /// pointed at something that no longer existed. Its chunks are still
    /// removed if any are left.
    async fn release_file(
        &self,
        week_number: u32,
        file_id: &FileId,
    ) -> Result<(), IntegrityWarning> {
        let failure = |message: String| {
            warn!("Week {} cleanup of {}: {}", week_number, file_id, message);
            IntegrityWarning::for_file(file_id, message).with_week(week_number)
        };

        match self.files.catalog().lookup(file_id).await {
            Ok(_) => {}
            Err(StorageError::NotFound(_)) => {
                if let Err(e) = self.files.chunks().delete_all(file_id).await {
                    debug!("Leftover chunks of {} not removed: {}", file_id, e);
                }
                return Err(failure("file record was already missing".to_string()));
            }
            Err(e) => return Err(failure(format!("lookup failed: {}", e))),
        }

        self.files
            .purge(file_id)
            .await
            .map(|_| ())
            .map_err(|e| failure(format!("delete failed: {}", e)))
    }
}

/// A week being assembled upload by upload.
///
/// Nothing is visible to readers until [`WeekDraft::commit`]. Aborting, or a
/// failed commit, deletes every file uploaded through the draft. A draft
/// dropped without either schedules the same cleanup in the background.
pub struct WeekDraft<'a> {
    linker: &'a WeekAssetLinker,
    week_number: u32,
    ctx: RequestContext,
    photos: Vec<FileRecord>,
    report: Option<FileRecord>,
    finished: bool,
}

impl WeekDraft<'_> {
    pub async fn add_photo(&mut self, upload: AssetUpload<'_>) -> Result<&FileRecord, StorageError> {
        let record = self
            .linker
            .upload_asset(self.week_number, FileType::Photo, upload, &self.ctx)
            .await?;
        self.photos.push(record);
        Ok(&self.photos[self.photos.len() - 1])
    }

    /// Set the week's report. A week has at most one.
    pub async fn set_report(&mut self, upload: AssetUpload<'_>) -> Result<&FileRecord, StorageError> {
        if self.report.is_some() {
            return Err(StorageError::InvalidInput(format!(
                "week {} already has a report",
                self.week_number
            )));
        }
        let record = self
            .linker
            .upload_asset(self.week_number, FileType::Report, upload, &self.ctx)
            .await?;
        Ok(self.report.insert(record))
    }

    /// Insert the week record. Rolls back all uploads on failure.
    pub async fn commit(mut self, summary: &str) -> Result<WeekAsset, StorageError> {
        if let Err(e) = validate_summary(summary) {
            self.rollback().await;
            return Err(e);
        }

        let photo_ids: Vec<FileId> = self.photos.iter().map(|r| r.id.clone()).collect();
        let photos = match serde_json::to_string(&photo_ids) {
            Ok(photos) => photos,
            Err(e) => {
                self.rollback().await;
                return Err(StorageError::Io(std::io::Error::other(e)));
            }
        };

        let now = Utc::now();
        let row = DbWeek {
            id: uuid::Uuid::new_v4().to_string(),
            week_number: self.week_number as i64,
            summary: summary.trim().to_string(),
            photo_file_ids: photos,
            report_file_id: self.report.as_ref().map(|r| r.id.to_string()),
            revision: 0,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.linker.db.insert_week(&row).await {
            self.rollback().await;
            return Err(match StorageError::from(e) {
                StorageError::Duplicate(_) => duplicate_week(self.week_number),
                other => other,
            });
        }

        self.finished = true;
        info!(
            "Created week {} with {} photos and {} report by {}",
            self.week_number,
            self.photos.len(),
            if self.report.is_some() { "a" } else { "no" },
            self.ctx.actor()
        );
        row.try_into()
    }

    /// Discard the draft and delete everything uploaded through it.
    pub async fn abort(mut self) {
        self.rollback().await;
    }

    async fn rollback(&mut self) {
        self.finished = true;
        let uploaded: Vec<FileRecord> = self.photos.drain(..).chain(self.report.take()).collect();
        if uploaded.is_empty() {
            return;
        }

        info!(
            "Rolling back {} uploads for week {}",
            uploaded.len(),
            self.week_number
        );
        for record in &uploaded {
            self.linker.rollback_upload(&record.id).await;
        }
    }
}

impl Drop for WeekDraft<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let uploaded: Vec<FileId> = self
            .photos
            .iter()
            .chain(self.report.iter())
            .map(|r| r.id.clone())
            .collect();
        if uploaded.is_empty() {
            return;
        }

        warn!(
            "Draft of week {} dropped with {} uncommitted uploads",
            self.week_number,
            uploaded.len()
        );
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let files = self.linker.files.clone();
        handle.spawn(async move {
            for file_id in uploaded {
                if let Err(e) = files.purge(&file_id).await {
                    error!("Failed to remove abandoned upload {}: {}", file_id, e);
                }
            }
        });
    }
}

fn duplicate_week(week_number: u32) -> StorageError {
    StorageError::Duplicate(format!("week {} already exists", week_number))
}

fn validate_summary(summary: &str) -> Result<(), StorageError> {
    if summary.trim().is_empty() {
        return Err(StorageError::InvalidInput(
            "summary must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn file_metadata(week_number: u32, file_type: FileType, ctx: &RequestContext) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("weekNumber".to_string(), json!(week_number));
    metadata.insert("fileType".to_string(), json!(file_type.as_str()));
    metadata.insert("uploadedBy".to_string(), json!(ctx.actor()));
    if week_number == 0 {
        metadata.insert("bundle".to_string(), json!(CAREER_GUIDANCE_BUNDLE));
    }
    metadata
}
