//! Cross-checks between week records, the file catalog and the chunk store.
//!
//! An audit only reads. Repairs run only through [`IntegrityAuditor::repair`]
//! and only the kinds named in the [`RepairPlan`].

use crate::storage::{ChunkSet, FileId, FileRecord, IntegrityWarning, MetadataFilter, StorageError};
use crate::weeks::{SortOrder, WeekAssetLinker, CAREER_GUIDANCE_BUNDLE};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    /// Re-read every file and compare against its stored MD5
    pub verify_checksums: bool,
    /// Unreferenced data younger than this is left out of the orphan lists
    pub orphan_grace: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RepairPlan {
    pub strip_dangling: bool,
    pub delete_orphans: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DanglingReference {
    pub week_number: u32,
    pub file_ids: Vec<FileId>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairSummary {
    pub stripped_references: u64,
    pub deleted_orphans: u64,
    pub deleted_chunk_sets: u64,
    pub failures: Vec<IntegrityWarning>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub total_files: u64,
    /// Complete, size-consistent chunk set (and matching digest when verified)
    pub valid_files: u64,
    pub incomplete_files: Vec<FileId>,
    pub dangling_references: Vec<DanglingReference>,
    /// Records no week references, excluding the career-guidance bundle
    pub orphaned_files: Vec<FileId>,
    /// Chunks stored under an id that has no record
    pub orphaned_chunk_sets: Vec<FileId>,
    pub warnings: Vec<IntegrityWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repairs: Option<RepairSummary>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.incomplete_files.is_empty()
            && self.dangling_references.is_empty()
            && self.orphaned_files.is_empty()
            && self.orphaned_chunk_sets.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct IntegrityAuditor {
    linker: WeekAssetLinker,
}

impl IntegrityAuditor {
    pub fn new(linker: WeekAssetLinker) -> Self {
        Self { linker }
    }

    /// Report on the current state without changing anything.
    pub async fn audit(&self, options: &AuditOptions) -> Result<AuditReport, StorageError> {
        let files = self.linker.files();
        let weeks = self.linker.list_weeks(SortOrder::Asc).await?;
        let referenced: HashSet<&FileId> = weeks.iter().flat_map(|w| w.file_ids()).collect();
        let mut chunk_sets: HashMap<String, ChunkSet> = files
            .chunks()
            .chunk_sets()
            .await?
            .into_iter()
            .map(|set| (set.file_id.clone(), set))
            .collect();

        let mut report = AuditReport::default();
        let mut catalogued: HashSet<FileId> = HashSet::new();

        let mut records = files.catalog().query_by_metadata(MetadataFilter::any());
        while let Some(record) = records.next().await {
            let record = record?;
            report.total_files += 1;

            let chunk_set = chunk_sets.remove(record.id.as_str());
            match self.check_file(&record, chunk_set.as_ref(), options).await {
                Ok(()) => report.valid_files += 1,
                Err(warning) => {
                    report.incomplete_files.push(record.id.clone());
                    report.warnings.push(warning);
                }
            }

            if !referenced.contains(&record.id)
                && record.metadata_str("bundle") != Some(CAREER_GUIDANCE_BUNDLE)
                && is_older_than(record.uploaded_at, options.orphan_grace)
            {
                report.orphaned_files.push(record.id.clone());
            }
            catalogued.insert(record.id);
        }
        drop(records);

        for week in &weeks {
            let missing: Vec<FileId> = week
                .file_ids()
                .filter(|id| !catalogued.contains(*id))
                .cloned()
                .collect();
            if !missing.is_empty() {
                report.warnings.push(IntegrityWarning::for_week(
                    week.week_number,
                    format!("{} references without a file record", missing.len()),
                ));
                report.dangling_references.push(DanglingReference {
                    week_number: week.week_number,
                    file_ids: missing,
                });
            }
        }

        // whatever is left has no catalog entry
        let mut leftover: Vec<ChunkSet> = chunk_sets.into_values().collect();
        leftover.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        for set in leftover {
            if !is_older_than(set.first_written_at, options.orphan_grace) {
                continue;
            }
            match FileId::parse(&set.file_id) {
                Ok(id) => report.orphaned_chunk_sets.push(id),
                Err(_) => report.warnings.push(IntegrityWarning {
                    file_id: None,
                    week_number: None,
                    message: format!("chunks stored under malformed id {}", set.file_id),
                }),
            }
        }

        info!(
            "Audit: {} files, {} valid, {} incomplete, {} weeks with dangling references, {} orphaned files, {} orphaned chunk sets",
            report.total_files,
            report.valid_files,
            report.incomplete_files.len(),
            report.dangling_references.len(),
            report.orphaned_files.len(),
            report.orphaned_chunk_sets.len()
        );
        Ok(report)
    }

    /// Audit, then apply the repairs `plan` asks for.
    pub async fn repair(
        &self,
        options: &AuditOptions,
        plan: RepairPlan,
    ) -> Result<AuditReport, StorageError> {
        let mut report = self.audit(options).await?;
        let mut summary = RepairSummary::default();
        let files = self.linker.files();

        if plan.strip_dangling {
            for dangling in &report.dangling_references {
                let ids: HashSet<FileId> = dangling.file_ids.iter().cloned().collect();
                match self.linker.strip_references(dangling.week_number, &ids).await {
                    Ok(_) => {
                        info!(
                            "Repair: stripped {} dangling references from week {}",
                            ids.len(),
                            dangling.week_number
                        );
                        summary.stripped_references += ids.len() as u64;
                    }
                    Err(e) => {
                        warn!(
                            "Repair: could not strip references from week {}: {}",
                            dangling.week_number, e
                        );
                        summary.failures.push(IntegrityWarning::for_week(
                            dangling.week_number,
                            format!("strip failed: {}", e),
                        ));
                    }
                }
            }
        }

        if plan.delete_orphans {
            for file_id in &report.orphaned_files {
                match files.purge(file_id).await {
                    Ok(_) => {
                        info!("Repair: deleted orphaned file {}", file_id);
                        summary.deleted_orphans += 1;
                    }
                    Err(e) => {
                        warn!("Repair: could not delete orphaned file {}: {}", file_id, e);
                        summary
                            .failures
                            .push(IntegrityWarning::for_file(file_id, format!("delete failed: {}", e)));
                    }
                }
            }
            for file_id in &report.orphaned_chunk_sets {
                match files.chunks().delete_all(file_id).await {
                    Ok(removed) => {
                        info!(
                            "Repair: deleted {} orphaned chunks of {}",
                            removed, file_id
                        );
                        summary.deleted_chunk_sets += 1;
                    }
                    Err(e) => {
                        warn!("Repair: could not delete chunks of {}: {}", file_id, e);
                        summary
                            .failures
                            .push(IntegrityWarning::for_file(file_id, format!("delete failed: {}", e)));
                    }
                }
            }
        }

        report.repairs = Some(summary);
        Ok(report)
    }

    async fn check_file(
        &self,
        record: &FileRecord,
        chunk_set: Option<&ChunkSet>,
        options: &AuditOptions,
    ) -> Result<(), IntegrityWarning> {
        let Some(set) = chunk_set else {
            if record.length == 0 {
                return Ok(());
            }
            return Err(IntegrityWarning::for_file(&record.id, "no chunks stored"));
        };

        if !set.contiguous || set.total_bytes != record.length {
            return Err(IntegrityWarning::for_file(
                &record.id,
                format!(
                    "{} bytes in {} chunks{}, expected {} bytes",
                    set.total_bytes,
                    set.chunk_count,
                    if set.contiguous { "" } else { " with gaps" },
                    record.length
                ),
            ));
        }

        if options.verify_checksums {
            if let Some(expected) = &record.md5 {
                let actual = self
                    .linker
                    .files()
                    .chunks()
                    .digest(&record.id)
                    .await
                    .map_err(|e| {
                        IntegrityWarning::for_file(&record.id, format!("digest failed: {}", e))
                    })?;
                if &actual != expected {
                    return Err(IntegrityWarning::for_file(
                        &record.id,
                        format!("checksum mismatch: stored {}, computed {}", expected, actual),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn is_older_than(timestamp: DateTime<Utc>, grace: Duration) -> bool {
    Utc::now()
        .signed_duration_since(timestamp)
        .to_std()
        .map(|age| age >= grace)
        .unwrap_or(false)
}
