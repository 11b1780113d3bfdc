//! Seed a week from a folder on disk.
//!
//! Images become photos (in filename order); the first PDF or slide deck
//! becomes the report. Everything else is skipped.

use crate::content_type::ContentType;
use crate::retry::retry_with_backoff;
use crate::storage::{RequestContext, StorageError};
use crate::weeks::{AssetUpload, WeekAsset, WeekAssetLinker};
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

const IMPORT_ATTEMPTS: u32 = 3;

/// Files found in a folder, classified for a week
#[derive(Debug, Default)]
pub struct FolderContents {
    pub photos: Vec<PathBuf>,
    pub report: Option<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Sort a folder's files into photos, a report and the rest.
pub async fn scan_folder(folder: &Path) -> Result<FolderContents, StorageError> {
    let mut entries = tokio::fs::read_dir(folder).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut contents = FolderContents::default();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with('.') {
            debug!("Skipping hidden file {}", path.display());
            continue;
        }

        let content_type = ContentType::resolve(None, name);
        if content_type.is_image() {
            contents.photos.push(path);
        } else if content_type.is_report() && contents.report.is_none() {
            contents.report = Some(path);
        } else {
            contents.skipped.push(path);
        }
    }
    Ok(contents)
}

/// Create week `week_number` from the files in `folder`.
///
/// Goes through the same draft as an HTTP upload, so a failure part way
/// leaves nothing behind.
pub async fn import_week_from_folder(
    linker: &WeekAssetLinker,
    week_number: u32,
    summary: &str,
    folder: &Path,
    ctx: &RequestContext,
) -> Result<WeekAsset, StorageError> {
    let contents = scan_folder(folder).await?;
    for path in &contents.skipped {
        warn!("Import of week {}: skipping {}", week_number, path.display());
    }
    info!(
        "Importing week {} from {}: {} photos, {} report",
        week_number,
        folder.display(),
        contents.photos.len(),
        if contents.report.is_some() { "a" } else { "no" }
    );

    let mut draft = linker.begin_week(week_number, ctx).await?;

    for path in &contents.photos {
        let added = match open_upload(path).await {
            Ok(upload) => draft.add_photo(upload).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = added {
            draft.abort().await;
            return Err(e);
        }
    }

    if let Some(path) = &contents.report {
        let added = match open_upload(path).await {
            Ok(upload) => draft.set_report(upload).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = added {
            draft.abort().await;
            return Err(e);
        }
    }

    draft.commit(summary).await
}

/// [`import_week_from_folder`], retried as a whole while the backend is
/// unavailable. Each failed attempt has already rolled itself back.
pub async fn import_week_with_retry(
    linker: &WeekAssetLinker,
    week_number: u32,
    summary: &str,
    folder: &Path,
    ctx: &RequestContext,
) -> Result<WeekAsset, StorageError> {
    let label = format!("Import of week {}", week_number);
    retry_with_backoff(IMPORT_ATTEMPTS, &label, StorageError::is_transient, || {
        import_week_from_folder(linker, week_number, summary, folder, ctx)
    })
    .await
}

async fn open_upload(path: &Path) -> Result<AssetUpload<'static>, StorageError> {
    let file = tokio::fs::File::open(path).await?;
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(AssetUpload::new(filename, None, ReaderStream::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn scan_classifies_by_extension() {
        let tmp = TempDir::new().unwrap();
        for name in ["b.jpg", "a.png", "report.pdf", "slides.pptx", "notes.txt", ".DS_Store"] {
            std::fs::write(tmp.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(tmp.path().join("nested.jpg")).unwrap();

        let contents = scan_folder(tmp.path()).await.unwrap();
        let names = |paths: &[PathBuf]| -> Vec<String> {
            paths
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };

        assert_eq!(names(&contents.photos), vec!["a.png", "b.jpg"]);
        assert_eq!(
            contents.report.unwrap().file_name().unwrap(),
            "report.pdf"
        );
        assert_eq!(names(&contents.skipped), vec!["notes.txt", "slides.pptx"]);
    }

    #[tokio::test]
    async fn missing_folder_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let result = scan_folder(&tmp.path().join("absent")).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
    }
}
