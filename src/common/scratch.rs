use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::modules::resource::model::ArtifactKind;

/// Private scratch directory for one job.
///
/// Every local file the pipeline touches lives inside it. The directory is
/// removed by [`ScratchSpace::release`], and by `Drop` if the job unwinds
/// before reaching it, so nothing outlives the job whatever the outcome.
pub struct ScratchSpace {
    dir: TempDir,
}

impl ScratchSpace {
    /// Creates `job-{resource}-{unix_ts}-XXXXXX` under `root`.
    pub fn allocate(root: &Path, resource_id: Uuid) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let prefix = format!(
            "job-{}-{}-",
            resource_id.simple(),
            OffsetDateTime::now_utc().unix_timestamp()
        );
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?;
        debug!(path = %dir.path().display(), "Allocated scratch space");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Local path for the downloaded original. The declared file name only
    /// contributes its extension so ffmpeg can sniff the container.
    pub fn source_path(&self, original_file_name: &str) -> PathBuf {
        let ext = Path::new(original_file_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin");
        self.dir.path().join(format!("source.{ext}"))
    }

    pub fn artifact_path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir
            .path()
            .join(format!("{}.{}", kind.as_str(), kind.extension()))
    }

    /// Removes the directory and everything in it. Failures are logged and
    /// swallowed: cleanup must never block acknowledgment or retry.
    pub fn release(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "Released scratch space"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch space"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_removes_everything() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::allocate(root.path(), Uuid::new_v4()).unwrap();
        let file = scratch.artifact_path(ArtifactKind::Converted);
        std::fs::write(&file, b"data").unwrap();
        let dir = scratch.path().to_path_buf();

        scratch.release();

        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn drop_also_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let dir = {
            let scratch = ScratchSpace::allocate(root.path(), Uuid::new_v4()).unwrap();
            std::fs::write(scratch.source_path("a.mov"), b"data").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!dir.exists());
    }

    #[test]
    fn concurrent_jobs_never_share_a_directory() {
        let root = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let a = ScratchSpace::allocate(root.path(), id).unwrap();
        let b = ScratchSpace::allocate(root.path(), id).unwrap();
        assert_ne!(a.path(), b.path());
        let name = a.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("job-{}-", id.simple())));
    }

    #[test]
    fn source_extension_is_sanitized() {
        let root = tempfile::tempdir().unwrap();
        let scratch = ScratchSpace::allocate(root.path(), Uuid::new_v4()).unwrap();
        assert!(scratch.source_path("My Clip.MOV").ends_with("source.MOV"));
        assert!(scratch.source_path("../../etc/passwd").ends_with("source.bin"));
        assert!(scratch.source_path("noext").ends_with("source.bin"));
    }
}
