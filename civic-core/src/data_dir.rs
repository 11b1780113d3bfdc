use std::ops::Deref;
use std::path::{Path, PathBuf};

/// Typed wrapper for the server's data directory.
///
/// Centralizes the on-disk layout so callers use methods instead of
/// ad-hoc `path.join("civic.db")` etc.
#[derive(Clone, Debug)]
pub struct DataDir {
    path: PathBuf,
}

impl DataDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn db_path(&self) -> PathBuf {
        self.path.join("civic.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.yaml")
    }

    /// Default destination for `export` when no directory is given.
    pub fn exports_dir(&self) -> PathBuf {
        self.path.join("exports")
    }
}

impl Deref for DataDir {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for DataDir {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl From<PathBuf> for DataDir {
    fn from(path: PathBuf) -> Self {
        Self { path }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_relative_to_root() {
        let dir = DataDir::new("/srv/civic");
        assert_eq!(dir.db_path(), PathBuf::from("/srv/civic/civic.db"));
        assert_eq!(dir.config_path(), PathBuf::from("/srv/civic/config.yaml"));
        assert_eq!(dir.exports_dir(), PathBuf::from("/srv/civic/exports"));
    }
}
