use std::fmt;

use thiserror::Error;

use crate::event::Phase;

/// Flat classification of conversion errors.
///
/// Callers surface this to users; the richer [`ConvertError`] carries context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AuthFailure,
    NotFound,
    IntegrityError,
    TransientNetworkError,
    ProtocolError,
    CorruptArchive,
    PathTraversal,
    InsufficientSpace,
    ResourceExhausted,
    BootloaderInstallFailure,
    InternalIOFailure,
    InvalidReference,
    ConfigError,
    Cancelled,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AuthFailure => "AuthFailure",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::IntegrityError => "IntegrityError",
            ErrorKind::TransientNetworkError => "TransientNetworkError",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::CorruptArchive => "CorruptArchive",
            ErrorKind::PathTraversal => "PathTraversal",
            ErrorKind::InsufficientSpace => "InsufficientSpace",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::BootloaderInstallFailure => "BootloaderInstallFailure",
            ErrorKind::InternalIOFailure => "InternalIOFailure",
            ErrorKind::InvalidReference => "InvalidReference",
            ErrorKind::ConfigError => "ConfigError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

/// Dockboot error types
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Registry rejected the supplied credentials
    #[error("Authentication failed: {registry} - {message}")]
    AuthFailure { registry: String, message: String },

    /// Reference, platform or blob does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Downloaded content does not match its digest
    #[error("Digest mismatch for {digest}: computed {actual}")]
    IntegrityError { digest: String, actual: String },

    /// Network failure worth retrying
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Registry returned something we cannot interpret
    #[error("Registry protocol error: {0}")]
    Protocol(String),

    /// Layer stream is not a valid archive
    #[error("Corrupt layer archive {layer}: {message}")]
    CorruptArchive { layer: String, message: String },

    /// Archive entry escapes the root filesystem
    #[error("Path traversal in layer {layer}: {path}")]
    PathTraversal { layer: String, path: String },

    /// Root filesystem does not fit in the root partition
    #[error("Insufficient space: need {required} bytes, root partition holds {available}")]
    InsufficientSpace { required: u64, available: u64 },

    /// No free attachment or mount slot, or the image is already attached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Kernel discovery or bootloader installation failed
    #[error("Bootloader installation failed: {0}")]
    BootloaderInstall(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Host operation failed outside of plain I/O
    #[error("Internal failure: {0}")]
    Internal(String),

    /// Malformed image reference or platform string
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Conversion was cancelled by the caller
    #[error("Conversion cancelled during {0}")]
    Cancelled(Phase),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl ConvertError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::AuthFailure { .. } => ErrorKind::AuthFailure,
            ConvertError::NotFound(_) => ErrorKind::NotFound,
            ConvertError::IntegrityError { .. } => ErrorKind::IntegrityError,
            ConvertError::TransientNetwork(_) => ErrorKind::TransientNetworkError,
            ConvertError::Protocol(_) => ErrorKind::ProtocolError,
            ConvertError::CorruptArchive { .. } => ErrorKind::CorruptArchive,
            ConvertError::PathTraversal { .. } => ErrorKind::PathTraversal,
            ConvertError::InsufficientSpace { .. } => ErrorKind::InsufficientSpace,
            ConvertError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ConvertError::BootloaderInstall(_) => ErrorKind::BootloaderInstallFailure,
            ConvertError::Io(_) | ConvertError::Internal(_) => ErrorKind::InternalIOFailure,
            ConvertError::InvalidReference(_) => ErrorKind::InvalidReference,
            ConvertError::Config(_) => ErrorKind::ConfigError,
            ConvertError::Cancelled(_) => ErrorKind::Cancelled,
            ConvertError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConvertError::TransientNetwork(_))
    }

    /// Wrap an I/O error with the operation that produced it.
    pub fn io(context: impl fmt::Display, err: std::io::Error) -> Self {
        ConvertError::Io(std::io::Error::new(err.kind(), format!("{}: {}", context, err)))
    }
}

impl From<serde_json::Error> for ConvertError {
    fn from(err: serde_json::Error) -> Self {
        ConvertError::Protocol(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConvertError {
    fn from(err: serde_yaml::Error) -> Self {
        ConvertError::Config(err.to_string())
    }
}

/// Result type alias for dockboot operations
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Terminal error of one conversion attempt.
///
/// Carries the primary cause, the phase it happened in, and any errors hit
/// while releasing resources on the way out.
#[derive(Debug)]
pub struct ConversionFailure {
    pub phase: Phase,
    pub error: ConvertError,
    pub release_errors: Vec<ConvertError>,
}

impl ConversionFailure {
    pub fn new(phase: Phase, error: ConvertError) -> Self {
        Self {
            phase,
            error,
            release_errors: Vec::new(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} during {}: {}", self.error.kind(), self.phase, self.error)?;
        if !self.release_errors.is_empty() {
            write!(f, " ({} cleanup error(s):", self.release_errors.len())?;
            for err in &self.release_errors {
                write!(f, " {};", err)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConversionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
