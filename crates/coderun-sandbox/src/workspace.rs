//! Private per-run workspace

use crate::error::{Error, Result};
use crate::language::LanguageProfile;
use std::path::Path;
use tempfile::TempDir;

/// Temporary directory holding the source file and build output
///
/// Removed from disk when dropped.
#[derive(Debug)]
pub(crate) struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create the directory and write the source payload into it
    pub(crate) async fn materialize(profile: &LanguageProfile, source: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("coderun-")
            .tempdir()
            .map_err(|e| Error::Workspace(format!("create failed: {e}")))?;

        let path = dir.path().join(&profile.source_file);
        tokio::fs::write(&path, source.as_bytes())
            .await
            .map_err(|e| Error::Workspace(format!("write {} failed: {e}", path.display())))?;

        Ok(Self { dir })
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    pub(crate) fn path_str(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }
}
