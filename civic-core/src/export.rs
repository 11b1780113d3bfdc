use crate::storage::{FileId, FileRecord, StorageError};
use crate::weeks::{SortOrder, WeekAsset, WeekAssetLinker};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What was written, as saved to `manifest.json` in the export directory
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    pub exported_at: DateTime<Utc>,
    pub weeks: Vec<ExportedWeek>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedWeek {
    pub week_number: u32,
    pub summary: String,
    pub photos: Vec<ExportedFile>,
    pub report: Option<ExportedFile>,
    /// References whose file record no longer exists
    pub missing: Vec<FileId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFile {
    pub file_id: FileId,
    pub filename: String,
    pub content_type: String,
    pub length: u64,
    pub md5: Option<String>,
    /// Relative to the export directory
    pub path: String,
}

/// Backup of weeks and their files to a plain directory tree
///
/// Layout: `week-NN/NN-filename` per file plus a top-level manifest. Files
/// are streamed chunk by chunk, never held in memory whole.
#[derive(Clone, Debug)]
pub struct ExportService {
    linker: WeekAssetLinker,
}

impl ExportService {
    pub fn new(linker: WeekAssetLinker) -> Self {
        Self { linker }
    }

    pub async fn export_all(&self, target_dir: &Path) -> Result<ExportManifest, ExportError> {
        let weeks = self.linker.list_weeks(SortOrder::Asc).await?;
        self.export_weeks(weeks, target_dir).await
    }

    pub async fn export_week(
        &self,
        week_number: u32,
        target_dir: &Path,
    ) -> Result<ExportManifest, ExportError> {
        let week = self.linker.get_week(week_number).await?;
        self.export_weeks(vec![week], target_dir).await
    }

    async fn export_weeks(
        &self,
        weeks: Vec<WeekAsset>,
        target_dir: &Path,
    ) -> Result<ExportManifest, ExportError> {
        info!(
            "Exporting {} weeks to {}",
            weeks.len(),
            target_dir.display()
        );
        tokio::fs::create_dir_all(target_dir).await?;

        let mut manifest = ExportManifest {
            exported_at: Utc::now(),
            weeks: Vec::with_capacity(weeks.len()),
        };
        let mut file_count = 0;

        for week in weeks {
            let week_dir = format!("week-{:02}", week.week_number);
            tokio::fs::create_dir_all(target_dir.join(&week_dir)).await?;

            let mut exported = ExportedWeek {
                week_number: week.week_number,
                summary: week.summary.clone(),
                photos: Vec::new(),
                report: None,
                missing: Vec::new(),
            };

            for (index, file_id) in week.file_ids().enumerate() {
                let record = match self.linker.files().catalog().lookup(file_id).await {
                    Ok(record) => record,
                    Err(StorageError::NotFound(_)) => {
                        warn!(
                            "Week {} references missing file {}, skipping",
                            week.week_number, file_id
                        );
                        exported.missing.push(file_id.clone());
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };

                let relative: PathBuf = [
                    week_dir.clone(),
                    format!("{:02}-{}", index + 1, export_filename(&record)),
                ]
                .iter()
                .collect();
                self.write_file(&record, &target_dir.join(&relative)).await?;
                file_count += 1;

                let entry = ExportedFile {
                    file_id: record.id.clone(),
                    filename: record.filename.clone(),
                    content_type: record.content_type.to_string(),
                    length: record.length,
                    md5: record.md5.clone(),
                    path: relative.to_string_lossy().replace('\\', "/"),
                };
                if week.report_file_id.as_ref() == Some(file_id) {
                    exported.report = Some(entry);
                } else {
                    exported.photos.push(entry);
                }
            }

            manifest.weeks.push(exported);
        }

        let json = serde_json::to_vec_pretty(&manifest)?;
        tokio::fs::write(target_dir.join(MANIFEST_FILENAME), json).await?;

        info!(
            "Exported {} files from {} weeks to {}",
            file_count,
            manifest.weeks.len(),
            target_dir.display()
        );
        Ok(manifest)
    }

    async fn write_file(&self, record: &FileRecord, path: &Path) -> Result<(), ExportError> {
        let mut out = tokio::fs::File::create(path).await?;
        if record.length > 0 {
            let mut stream = self
                .linker
                .files()
                .chunks()
                .read_range(&record.id, 0, record.length - 1)
                .await?;
            while let Some(bytes) = stream.next().await {
                out.write_all(&bytes?).await?;
            }
        }
        out.flush().await?;

        debug!(
            "Exported {} ({} bytes) to {}",
            record.id,
            record.length,
            path.display()
        );
        Ok(())
    }
}

/// Base name of the stored filename, never a path.
fn export_filename(record: &FileRecord) -> String {
    Path::new(&record.filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| record.id.to_string())
}
