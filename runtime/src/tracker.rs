//! Scoped-cleanup ledger for OS resources held by one conversion.
//!
//! Every workspace directory, block attachment, mount and partial image is
//! registered here with its release action. Releases run in strict reverse
//! registration order and keep going past individual failures, so a busy
//! mount never prevents the loop device underneath it from being detached.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dockboot_core::error::{ConvertError, Result};
use parking_lot::Mutex;

/// Release action for one resource.
pub type ReleaseFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// Kind of tracked resource, used for logging and leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Workspace,
    PartialImage,
    BlockAttachment,
    Mount,
    BindMount,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Workspace => "workspace",
            ResourceKind::PartialImage => "partial-image",
            ResourceKind::BlockAttachment => "block-attachment",
            ResourceKind::Mount => "mount",
            ResourceKind::BindMount => "bind-mount",
        };
        f.write_str(name)
    }
}

/// Handle to a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(u64);

/// Position in the ledger; see [`ResourceTracker::release_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint(usize);

struct Entry {
    id: ResourceId,
    kind: ResourceKind,
    label: String,
    release: ReleaseFn,
}

/// Reverse-order release ledger.
pub struct ResourceTracker {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a resource and the action that releases it.
    pub fn acquire(
        &self,
        kind: ResourceKind,
        label: impl Into<String>,
        release: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> ResourceId {
        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let label = label.into();
        tracing::debug!(kind = %kind, resource = %label, "Tracking resource");
        self.entries.lock().push(Entry {
            id,
            kind,
            label,
            release: Box::new(release),
        });
        id
    }

    /// Release one resource now, ahead of the unwind.
    ///
    /// Returns `Ok(false)` if the id is no longer tracked.
    pub fn release(&self, id: ResourceId) -> Result<bool> {
        let entry = {
            let mut entries = self.entries.lock();
            match entries.iter().position(|e| e.id == id) {
                Some(pos) => entries.remove(pos),
                None => return Ok(false),
            }
        };
        run_release(entry)?;
        Ok(true)
    }

    /// Stop tracking a resource without releasing it (it has been committed).
    pub fn forget(&self, id: ResourceId) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                let entry = entries.remove(pos);
                tracing::debug!(kind = %entry.kind, resource = %entry.label, "Resource committed");
                true
            }
            None => false,
        }
    }

    /// Mark the current end of the ledger.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.entries.lock().len())
    }

    /// Release everything registered after `mark`, newest first.
    pub fn release_to(&self, mark: Checkpoint) -> Vec<ConvertError> {
        let mut errors = Vec::new();
        loop {
            // Pop under the lock, release outside it.
            let entry = {
                let mut entries = self.entries.lock();
                if entries.len() <= mark.0 {
                    break;
                }
                entries.pop()
            };
            let Some(entry) = entry else { break };
            if let Err(e) = run_release(entry) {
                errors.push(e);
            }
        }
        errors
    }

    /// Release every tracked resource, newest first, collecting failures.
    pub fn release_all(&self) -> Vec<ConvertError> {
        self.release_to(Checkpoint(0))
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracked resources of `kind`, oldest first.
    pub fn active(&self, kind: ResourceKind) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.label.clone())
            .collect()
    }
}

impl Default for ResourceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_list()
            .entries(entries.iter().map(|e| format!("{}:{}", e.kind, e.label)))
            .finish()
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        if self.entries.get_mut().is_empty() {
            return;
        }
        for err in self.release_all() {
            tracing::warn!(error = %err, "Failed to release resource on drop");
        }
    }
}

fn run_release(entry: Entry) -> Result<()> {
    let Entry {
        kind, label, release, ..
    } = entry;
    match release() {
        Ok(()) => {
            tracing::debug!(kind = %kind, resource = %label, "Released resource");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(kind = %kind, resource = %label, error = %e, "Failed to release resource");
            Err(e)
        }
    }
}
