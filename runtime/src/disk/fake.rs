//! Recording disk backend for tests.
//!
//! Attaching hands out fake device names, mounting leaves the target
//! directory as a plain directory, commands are recorded and optionally
//! handed to a hook. Any operation can be made to fail once.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use dockboot_core::error::{ConvertError, Result};
use parking_lot::Mutex;

use super::backend::{AttachedDevice, DiskBackend, HostCommand};
use super::layout::{DiskLayout, FilesystemKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Check,
    Attach,
    Detach,
    Format,
    Mount,
    BindMount,
    Unmount,
    Run,
}

type RunHook = Box<dyn Fn(&HostCommand) -> Result<String> + Send + Sync>;

#[derive(Default)]
struct State {
    calls: Vec<String>,
    /// Queued failures per op; `None` fails with a generic injected error.
    failures: HashMap<Op, VecDeque<Option<ConvertError>>>,
    attached: BTreeSet<PathBuf>,
    mounts: Vec<PathBuf>,
    next_loop: u32,
}

pub struct FakeBackend {
    state: Mutex<State>,
    hook: Option<RunHook>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            hook: None,
        }
    }

    /// Handle `run` calls with `hook`.
    pub fn with_run_hook(
        mut self,
        hook: impl Fn(&HostCommand) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Fail the next call of `op`.
    pub fn fail_on(&self, op: Op) {
        self.state.lock().failures.entry(op).or_default().push_back(None);
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_with(&self, op: Op, error: ConvertError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(Some(error));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Commands passed to `run`, rendered.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("run ").map(str::to_string))
            .collect()
    }

    /// Targets currently mounted.
    pub fn mounts(&self) -> Vec<PathBuf> {
        self.state.lock().mounts.clone()
    }

    /// Devices currently attached.
    pub fn attached(&self) -> Vec<PathBuf> {
        self.state.lock().attached.iter().cloned().collect()
    }

    fn record(&self, op: Op, call: String) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call.clone());
        match state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(Some(error)) => Err(error),
            Some(None) => Err(ConvertError::Internal(format!("injected failure: {}", call))),
            None => Ok(()),
        }
    }
}

impl DiskBackend for FakeBackend {
    fn check(&self, layout: &DiskLayout) -> Result<()> {
        self.record(Op::Check, format!("check {} bytes", layout.total_bytes))
    }

    fn privileged(&self) -> bool {
        false
    }

    fn attach(&self, image: &Path, partitions: usize) -> Result<AttachedDevice> {
        self.record(Op::Attach, format!("attach {}", image.display()))?;
        let mut state = self.state.lock();
        let device = PathBuf::from(format!("/dev/fakeloop{}", state.next_loop));
        state.next_loop += 1;
        state.attached.insert(device.clone());
        let partitions = (1..=partitions)
            .map(|n| PathBuf::from(format!("{}p{}", device.display(), n)))
            .collect();
        Ok(AttachedDevice { device, partitions })
    }

    fn detach(&self, device: &Path) -> Result<()> {
        self.record(Op::Detach, format!("detach {}", device.display()))?;
        self.state.lock().attached.remove(device);
        Ok(())
    }

    fn format(&self, partition: &Path, filesystem: FilesystemKind, label: &str) -> Result<()> {
        self.record(
            Op::Format,
            format!("format {} {} {}", partition.display(), filesystem.mount_type(), label),
        )
    }

    fn mount(&self, source: &Path, target: &Path, filesystem: FilesystemKind) -> Result<()> {
        self.record(
            Op::Mount,
            format!("mount {} {} {}", source.display(), target.display(), filesystem.mount_type()),
        )?;
        self.state.lock().mounts.push(target.to_path_buf());
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.record(
            Op::BindMount,
            format!("bind {} {}", source.display(), target.display()),
        )?;
        self.state.lock().mounts.push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.record(Op::Unmount, format!("unmount {}", target.display()))?;
        self.state.lock().mounts.retain(|m| m != target);
        Ok(())
    }

    fn run(&self, command: &HostCommand) -> Result<String> {
        self.record(Op::Run, format!("run {}", command))?;
        match &self.hook {
            Some(hook) => hook(command),
            None => Ok(String::new()),
        }
    }
}
