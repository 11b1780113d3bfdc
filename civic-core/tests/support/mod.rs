#![allow(dead_code)]

use axum::body::Bytes;
use civic_core::config::Config;
use civic_core::data_dir::DataDir;
use civic_core::db::Database;
use civic_core::routes::AppState;
use civic_core::storage::RequestContext;
use civic_core::weeks::{AssetUpload, WeekAsset};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true)
        .try_init();
}

pub const KB: usize = 1024;

/// App state over a fresh database in a temp dir.
///
/// Orphan grace is zero so freshly written data shows up in audits.
pub async fn setup_test_environment() -> (Arc<AppState>, TempDir) {
    setup_test_environment_with(|_| {}).await
}

/// Like [`setup_test_environment`], with config overrides applied on top.
pub async fn setup_test_environment_with(
    configure: impl FnOnce(&mut Config),
) -> (Arc<AppState>, TempDir) {
    tracing_init();
    let temp_dir = TempDir::new().unwrap();
    let data_dir = DataDir::new(temp_dir.path());
    let mut config = Config::with_defaults(data_dir.clone());
    config.orphan_grace = Duration::ZERO;
    configure(&mut config);

    let database = Database::open(&data_dir.db_path(), 4)
        .await
        .expect("Failed to create database");
    (Arc::new(AppState::new(database, config)), temp_dir)
}

/// Deterministic test content of `len` bytes.
pub fn test_bytes(len: usize, seed: u8) -> Bytes {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<u8>>()
        .into()
}

pub fn photo(name: &str, len: usize, seed: u8) -> AssetUpload<'static> {
    AssetUpload::from_bytes(name, Some("image/jpeg"), test_bytes(len, seed))
}

pub fn report(name: &str, len: usize) -> AssetUpload<'static> {
    AssetUpload::from_bytes(name, Some("application/pdf"), test_bytes(len, 7))
}

pub fn ctx() -> RequestContext {
    RequestContext::new(Some("tester".to_string()))
}

/// Week 3 with a 200 KB and a 50 KB photo and a 1 MB report.
pub async fn create_week_three(state: &AppState) -> WeekAsset {
    state
        .linker
        .create_week(
            3,
            "Park cleanup",
            vec![photo("a.jpg", 200 * KB, 1), photo("b.jpg", 50 * KB, 2)],
            Some(report("report.pdf", 1024 * KB)),
            &ctx(),
        )
        .await
        .expect("Failed to create week 3")
}
