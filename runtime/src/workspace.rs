//! Per-conversion scratch directory.

use std::path::{Path, PathBuf};

use dockboot_core::error::{ConvertError, Result};

use crate::tracker::{ResourceKind, ResourceTracker};

/// Scratch directory holding downloaded blobs, the assembled root and mount points.
///
/// ```text
/// dockboot-XXXXXX/
/// ├── blobs/      (verified layer blobs, one file per digest)
/// ├── rootfs/     (assembled root filesystem)
/// └── mnt/
///     ├── root/   (root partition mount point)
///     └── boot/   (boot partition mount point, separate_boot only)
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create a fresh workspace under `parent` (system temp dir if `None`).
    ///
    /// Unless `preserve` is set, the directory is registered with `tracker`
    /// and removed when the tracker unwinds.
    pub fn create(
        parent: Option<&Path>,
        preserve: bool,
        tracker: &ResourceTracker,
    ) -> Result<Self> {
        let parent = parent
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent)
            .map_err(|e| ConvertError::io(format!("creating {}", parent.display()), e))?;

        let dir = tempfile::Builder::new()
            .prefix("dockboot-")
            .tempdir_in(&parent)
            .map_err(|e| ConvertError::io("creating workspace", e))?;

        let workspace = Self {
            root: dir.path().to_path_buf(),
        };
        for sub in [workspace.blobs_dir(), workspace.rootfs_dir(), workspace.mount_dir()] {
            std::fs::create_dir_all(&sub)
                .map_err(|e| ConvertError::io(format!("creating {}", sub.display()), e))?;
        }

        if preserve {
            let path = dir.into_path();
            tracing::info!(workspace = %path.display(), "Workspace will be preserved");
        } else {
            let label = workspace.root.display().to_string();
            tracker.acquire(ResourceKind::Workspace, label, move || {
                let path = dir.path().to_path_buf();
                dir.close()
                    .map_err(|e| ConvertError::io(format!("removing {}", path.display()), e))
            });
        }

        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Local path of a downloaded blob.
    pub fn blob_path(&self, digest_hex: &str) -> PathBuf {
        self.blobs_dir().join(digest_hex)
    }

    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    pub fn mount_dir(&self) -> PathBuf {
        self.root.join("mnt")
    }
}
