//! Error types for the encryption engine.
//!
//! There are three layers:
//! - `CryptoError`: a primitive (digest, HMAC, cipher) refused to do its job.
//! - `JobError`: everything that can end a single task's transform. These are
//!   recorded on the Task (message + Failed state) and never escape the job.
//! - `EngineError`: a scheduler command was rejected (start while running,
//!   duplicate task, ...).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// What went wrong inside the crypto layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoErrorKind {
    /// An operation that derives a key was called with an empty password
    EmptyPassword,
    /// The underlying primitive failed (bad padding, finalize twice, ...)
    Backend,
}

/// Error raised by the crypto engine.
///
/// Carries a kind and the backend's diagnostic text. The text is what ends up
/// on a task when a transform fails, so it is kept short and lower-case like
/// the backend strings it mimics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CryptoError {
    kind: CryptoErrorKind,
    message: String,
}

impl CryptoError {
    pub fn empty_password() -> Self {
        CryptoError {
            kind: CryptoErrorKind::EmptyPassword,
            message: "The password shouldn't be empty".to_string(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        CryptoError {
            kind: CryptoErrorKind::Backend,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> CryptoErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Reasons a single task's transform can fail.
///
/// The `Display` output is exactly what gets stored as the task's last error.
#[derive(Debug, Error)]
pub enum JobError {
    /// Could not open, read, write or remove a file
    #[error("'{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    /// Signature prefix of an encrypted file does not match the current password
    #[error("Wrong password")]
    WrongPassword,

    /// Cooperative cancellation was observed between chunks
    #[error("Aborted")]
    Aborted,

    /// The cipher failed (most often: bad padding on decrypt)
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl JobError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        JobError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Rejected scheduler commands.
///
/// None of these touch a task; they only mean the command was a no-op.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The task (same input path) is already registered
    #[error("Task already registered: {}", path.display())]
    DuplicateTask { path: PathBuf },

    /// `start` with an empty registry
    #[error("No tasks to run")]
    NoTasks,

    /// `start` before any password was configured
    #[error("Password is not set")]
    PasswordNotSet,

    /// Command is not valid in the scheduler's current state
    #[error("Scheduler is {actual}, expected {expected}")]
    InvalidState {
        expected: crate::scheduler::SchedulerState,
        actual: crate::scheduler::SchedulerState,
    },

    /// `remove_task` with an index past the end of the registry
    #[error("Task index {index} out of range (have {len})")]
    IndexOutOfRange { index: usize, len: usize },
}
