//! Week records and the files attached to them
mod linker;
mod models;

pub use linker::{WeekAssetLinker, WeekDraft, CAREER_GUIDANCE_BUNDLE};
pub use models::{
    AssetChange, AssetUpload, DeletionReport, FileType, SortOrder, WeekAsset,
};
