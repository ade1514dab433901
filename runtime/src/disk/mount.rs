//! Tracked mounts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dockboot_core::error::{ConvertError, Result};

use super::backend::DiskBackend;
use super::layout::FilesystemKind;
use crate::tracker::{ResourceId, ResourceKind, ResourceTracker};

/// One mounted filesystem, unmounted by the tracker.
#[derive(Debug)]
pub struct MountSession {
    target: PathBuf,
    id: ResourceId,
}

impl MountSession {
    /// Mount a partition at `target`, creating the directory if needed.
    pub fn mount(
        tracker: &ResourceTracker,
        backend: Arc<dyn DiskBackend>,
        source: &Path,
        target: &Path,
        filesystem: FilesystemKind,
    ) -> Result<Self> {
        ensure_dir(target)?;
        backend.mount(source, target, filesystem)?;
        tracing::info!(source = %source.display(), target = %target.display(), "Mounted");
        Ok(Self::track(tracker, backend, ResourceKind::Mount, target))
    }

    /// Bind mount `source` onto `target`.
    pub fn bind(
        tracker: &ResourceTracker,
        backend: Arc<dyn DiskBackend>,
        source: &Path,
        target: &Path,
    ) -> Result<Self> {
        ensure_dir(target)?;
        backend.bind_mount(source, target)?;
        tracing::debug!(source = %source.display(), target = %target.display(), "Bind mounted");
        Ok(Self::track(tracker, backend, ResourceKind::BindMount, target))
    }

    fn track(
        tracker: &ResourceTracker,
        backend: Arc<dyn DiskBackend>,
        kind: ResourceKind,
        target: &Path,
    ) -> Self {
        let path = target.to_path_buf();
        let id = tracker.acquire(kind, target.display().to_string(), move || {
            backend.unmount(&path)
        });
        Self {
            target: target.to_path_buf(),
            id,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Unmount now instead of at unwind.
    pub fn release(self, tracker: &ResourceTracker) -> Result<()> {
        tracker.release(self.id).map(|_| ())
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .map_err(|e| ConvertError::io(format!("creating mount point {}", path.display()), e))
}
