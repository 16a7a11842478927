use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::glb::FormatError;

/// Classification attached to every failure that crosses a stage or run boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    PathViolation,
    ProcessTimeout,
    ProcessFailure,
    ResourceExceeded,
    InvalidOutput,
    Cancelled,
    Io,
}

impl ErrorKind {
    /// Kinds that abort the run no matter what the fallback policy says.
    pub fn always_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::PathViolation | ErrorKind::ResourceExceeded | ErrorKind::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::PathViolation => "path_violation",
            ErrorKind::ProcessTimeout => "process_timeout",
            ErrorKind::ProcessFailure => "process_failure",
            ErrorKind::ResourceExceeded => "resource_exceeded",
            ErrorKind::InvalidOutput => "invalid_output",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Io => "io",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure captured as data inside a [`crate::pipeline::StageResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{kind}: {detail}")]
pub struct StageError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathViolation {
    #[error("name is empty")]
    Empty,
    #[error("absolute path '{0}' supplied where a relative name is expected")]
    Absolute(String),
    #[error("name '{0}' contains a forbidden character")]
    InvalidName(String),
    #[error("'{0}' traverses outside the sandbox root")]
    Traversal(String),
    #[error("'{}' resolves outside the sandbox root", .0.display())]
    EscapesRoot(PathBuf),
    #[error("symlink '{}' points outside the sandbox root", .0.display())]
    SymlinkEscape(PathBuf),
    #[error("'{}' does not exist", .0.display())]
    Missing(PathBuf),
    #[error("'{}' is not a regular file", .0.display())]
    NotAFile(PathBuf),
    #[error("'{}' is not executable", .0.display())]
    NotExecutable(PathBuf),
    #[error("'{}' changed between check and use", .0.display())]
    Changed(PathBuf),
    #[error("sandbox root '{}' is unusable: {reason}", .root.display())]
    BadRoot { root: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("candidate failed validation: {0}")]
    InvalidOutput(#[from] FormatError),
    #[error(transparent)]
    Path(#[from] PathViolation),
    #[error("publish I/O failed: {0}")]
    Io(#[from] io::Error),
}

impl PublishError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PublishError::InvalidOutput(_) => ErrorKind::InvalidOutput,
            PublishError::Path(_) => ErrorKind::PathViolation,
            PublishError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Errors raised by [`crate::pipeline::Pipeline::start_run`] before any stage executes.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input rejected: {0}")]
    InvalidInput(#[from] FormatError),
    #[error(transparent)]
    Path(#[from] PathViolation),
    #[error("failed to prepare run: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::Path(_) => ErrorKind::PathViolation,
            PipelineError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<PathViolation> for StageError {
    fn from(value: PathViolation) -> Self {
        StageError::new(ErrorKind::PathViolation, value.to_string())
    }
}

impl From<PublishError> for StageError {
    fn from(value: PublishError) -> Self {
        StageError::new(value.kind(), value.to_string())
    }
}

impl From<io::Error> for StageError {
    fn from(value: io::Error) -> Self {
        StageError::new(ErrorKind::Io, value.to_string())
    }
}
