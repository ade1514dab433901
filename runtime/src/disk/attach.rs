//! Exclusive block attachment of a backing file.
//!
//! At most one attachment may exist per backing file. Within the process a
//! registry of claimed paths enforces it; across processes a non-blocking
//! `flock` on the file does. Contention fails immediately.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dockboot_core::error::{ConvertError, Result};
use nix::fcntl::{Flock, FlockArg};
use parking_lot::Mutex;

use super::backend::{AttachedDevice, DiskBackend};
use crate::tracker::{ResourceId, ResourceKind, ResourceTracker};

static CLAIMED: Mutex<BTreeSet<PathBuf>> = parking_lot::const_mutex(BTreeSet::new());

/// Exclusive claim on a backing file.
#[derive(Debug)]
pub struct AttachmentLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl AttachmentLock {
    /// Claim `image`, failing with `ResourceExhausted` if already claimed.
    pub fn acquire(image: &Path) -> Result<Self> {
        let path = image
            .canonicalize()
            .map_err(|e| ConvertError::io(format!("resolving {}", image.display()), e))?;

        if !CLAIMED.lock().insert(path.clone()) {
            return Err(ConvertError::ResourceExhausted(format!(
                "{} is already attached",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                CLAIMED.lock().remove(&path);
                ConvertError::io(format!("opening {}", path.display()), e)
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Self {
                path,
                _flock: flock,
            }),
            Err((_, errno)) => {
                CLAIMED.lock().remove(&path);
                Err(ConvertError::ResourceExhausted(format!(
                    "{} is locked by another process ({})",
                    path.display(),
                    errno
                )))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AttachmentLock {
    fn drop(&mut self) {
        CLAIMED.lock().remove(&self.path);
    }
}

/// A tracked block attachment.
///
/// Detaching happens through the tracker, which also drops the claim.
#[derive(Debug)]
pub struct BlockAttachment {
    device: AttachedDevice,
    id: ResourceId,
}

impl BlockAttachment {
    /// Claim and attach `image`, registering the detach with `tracker`.
    pub fn acquire(
        tracker: &ResourceTracker,
        backend: Arc<dyn DiskBackend>,
        image: &Path,
        partitions: usize,
    ) -> Result<Self> {
        let lock = AttachmentLock::acquire(image)?;
        let device = backend.attach(image, partitions)?;

        let node = device.device.clone();
        let id = tracker.acquire(
            ResourceKind::BlockAttachment,
            node.display().to_string(),
            move || {
                let result = backend.detach(&node);
                drop(lock);
                result
            },
        );
        Ok(Self { device, id })
    }

    pub fn device(&self) -> &AttachedDevice {
        &self.device
    }

    /// Detach now. Everything mounted from the device must be released first.
    pub fn release(self, tracker: &ResourceTracker) -> Result<()> {
        tracker.release(self.id).map(|_| ())
    }
}
