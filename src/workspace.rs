//! Per-job scratch directories

use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{ConvertError, Result};

const WORKSPACE_PREFIX: &str = "sticker-job-";

/// Exclusively owned scratch directory for one conversion job.
///
/// The directory tree is removed exactly once: either through [`release`]
/// or, if the handle is dropped first (early return, unwinding, a cancelled
/// future), by the drop of the inner `TempDir`.
///
/// [`release`]: Workspace::release
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh, uniquely named empty directory under `root`
    pub fn acquire(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| {
            ConvertError::resource(format!("creating scratch root {}", root.display()), e)
        })?;

        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(root)
            .map_err(|e| {
                ConvertError::resource(format!("allocating workspace in {}", root.display()), e)
            })?;

        debug!("📂 Workspace acquired: {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Join a relative artifact name onto the workspace root
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        safe_join(self.path(), relative)
    }

    /// Create a sub-directory for an isolated set of artifacts
    pub async fn create_dir(&self, relative: &str) -> Result<PathBuf> {
        let path = self.resolve(relative)?;
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            ConvertError::resource(format!("creating {}", path.display()), e)
        })?;
        Ok(path)
    }

    /// Recursively delete the workspace, reporting any I/O failure
    pub fn release(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => {
                debug!("🧹 Workspace released: {}", path.display());
                Ok(())
            }
            Err(e) => {
                warn!("Failed to remove workspace {}: {}", path.display(), e);
                Err(ConvertError::resource(format!("removing {}", path.display()), e))
            }
        }
    }
}

/// Join `relative` onto `root`, refusing anything that could leave `root`
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    let escapes = rel.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });

    if relative.is_empty() || escapes {
        return Err(ConvertError::resource(
            format!("artifact path '{}' escapes the workspace", relative),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid artifact path"),
        ));
    }

    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_acquire_creates_unique_dirs() {
        let root = TempDir::new().unwrap();
        let a = Workspace::acquire(root.path()).unwrap();
        let b = Workspace::acquire(root.path()).unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(root.path()));
        assert_eq!(entries(a.path()), 0);
        assert_eq!(entries(root.path()), 2);
    }

    #[tokio::test]
    async fn test_release_removes_tree() {
        let root = TempDir::new().unwrap();
        let ws = Workspace::acquire(root.path()).unwrap();
        let frames = ws.create_dir("frames").await.unwrap();
        assert!(ws.create_dir("../frames").await.is_err());
        std::fs::write(frames.join("frame_0001.png"), b"png").unwrap();

        ws.release().unwrap();
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_drop_removes_tree() {
        let root = TempDir::new().unwrap();
        {
            let ws = Workspace::acquire(root.path()).unwrap();
            std::fs::write(ws.path().join("input.tgs"), b"data").unwrap();
        }
        assert_eq!(entries(root.path()), 0);
    }

    #[test]
    fn test_missing_root_is_created() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join("a/b");
        let ws = Workspace::acquire(&nested).unwrap();
        assert!(ws.path().starts_with(&nested));
    }

    #[cfg(unix)]
    #[test]
    fn test_unwritable_root_is_resource_error() {
        use std::os::unix::fs::PermissionsExt;

        let root = TempDir::new().unwrap();
        let locked = root.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o500)).unwrap();

        // root ignores permission bits, nothing to assert there
        if std::fs::write(locked.join("write-check"), b"x").is_ok() {
            return;
        }

        let err = Workspace::acquire(&locked).unwrap_err();
        assert!(matches!(err, ConvertError::Resource { .. }));
    }

    #[test]
    fn test_safe_join_rejects_escapes() {
        let root = Path::new("/tmp/ws");
        assert_eq!(safe_join(root, "frames").unwrap(), root.join("frames"));
        assert!(safe_join(root, "../outside").is_err());
        assert!(safe_join(root, "/etc/passwd").is_err());
        assert!(safe_join(root, "").is_err());
    }
}
