//! Dockboot Core - Foundational Types
//!
//! Error taxonomy, configuration, and conversion phases shared by the
//! dockboot runtime and its front-ends.

pub mod config;
pub mod error;
pub mod event;

// Re-export commonly used types
pub use config::{ConvertConfig, KernelPolicy, Partitioning, RegistryConfig, RetrySettings};
pub use error::{ConversionFailure, ConvertError, ErrorKind, Result};
pub use event::{Phase, ProgressReporter, ProgressUpdate};

/// Dockboot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
