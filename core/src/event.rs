//! Conversion phases and progress reporting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Phase of one conversion, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Resolve,
    Download,
    Assemble,
    Plan,
    Partition,
    Format,
    Populate,
    Bootloader,
    Finalize,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 9] = [
        Phase::Resolve,
        Phase::Download,
        Phase::Assemble,
        Phase::Plan,
        Phase::Partition,
        Phase::Format,
        Phase::Populate,
        Phase::Bootloader,
        Phase::Finalize,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Resolve => "resolve",
            Phase::Download => "download",
            Phase::Assemble => "assemble",
            Phase::Plan => "plan",
            Phase::Partition => "partition",
            Phase::Format => "format",
            Phase::Populate => "populate",
            Phase::Bootloader => "bootloader",
            Phase::Finalize => "finalize",
        }
    }

    /// Overall completion fraction when this phase starts.
    pub fn start_fraction(&self) -> f32 {
        match self {
            Phase::Resolve => 0.0,
            Phase::Download => 0.05,
            Phase::Assemble => 0.45,
            Phase::Plan => 0.6,
            Phase::Partition => 0.62,
            Phase::Format => 0.65,
            Phase::Populate => 0.7,
            Phase::Bootloader => 0.88,
            Phase::Finalize => 0.96,
        }
    }

    /// Overall completion fraction when this phase ends.
    pub fn end_fraction(&self) -> f32 {
        match Phase::ALL.iter().position(|p| p == self) {
            Some(i) if i + 1 < Phase::ALL.len() => Phase::ALL[i + 1].start_fraction(),
            _ => 1.0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One progress notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Phase the update belongs to
    pub phase: Phase,

    /// Overall completion in `[0, 1]`
    pub fraction: f32,

    /// Human-readable detail
    pub message: String,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

type ProgressFn = dyn Fn(&ProgressUpdate) + Send + Sync;

/// Progress callback handed in by the front-end.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Option<Arc<ProgressFn>>,
}

impl ProgressReporter {
    /// Create a reporter that invokes `callback` for every update.
    pub fn new(callback: impl Fn(&ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// Create a reporter that drops every update.
    pub fn silent() -> Self {
        Self { callback: None }
    }

    /// Report the start of a phase.
    pub fn phase_started(&self, phase: Phase, message: impl Into<String>) {
        self.emit(phase, phase.start_fraction(), message.into());
    }

    /// Report the end of a phase.
    pub fn phase_finished(&self, phase: Phase, message: impl Into<String>) {
        self.emit(phase, phase.end_fraction(), message.into());
    }

    /// Report progress inside a phase; `within` is the phase-local fraction.
    pub fn phase_progress(&self, phase: Phase, within: f32, message: impl Into<String>) {
        let start = phase.start_fraction();
        let span = phase.end_fraction() - start;
        self.emit(phase, start + span * within.clamp(0.0, 1.0), message.into());
    }

    fn emit(&self, phase: Phase, fraction: f32, message: String) {
        tracing::debug!(phase = %phase, fraction, message = %message, "Progress");
        if let Some(callback) = &self.callback {
            callback(&ProgressUpdate {
                phase,
                fraction: fraction.clamp(0.0, 1.0),
                message,
                timestamp: chrono::Utc::now(),
            });
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::silent()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
