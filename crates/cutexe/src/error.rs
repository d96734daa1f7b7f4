//! Error types for process execution

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::handle::{Output, ProcessHandle};

/// Process execution errors
///
/// Errors are cheap to clone so that repeated awaits of the same handle can
/// hand out the same recorded fault.
#[derive(Debug, Clone, Error)]
pub enum ProcessError {
    /// The OS could not create the process
    #[error("Failed to spawn process `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: Arc<io::Error>,
    },

    /// Waiting on the process or reading its output failed
    #[error("Process I/O failed: {0}")]
    Io(#[source] Arc<io::Error>),

    /// Process exited with a non-zero code while `throw_on_error` was set
    #[error(transparent)]
    NonZeroExit(#[from] NonZeroExit),

    /// Signal identifier not in the portable set
    #[error("Unsupported kill signal: {0}")]
    UnsupportedSignal(String),

    /// The handle was never spawned
    #[error("No process was started")]
    NotStarted,
}

impl ProcessError {
    pub(crate) fn spawn_failed(command: impl Into<String>, source: io::Error) -> Self {
        Self::SpawnFailed {
            command: command.into(),
            source: Arc::new(source),
        }
    }

    /// Returns the non-zero exit details if this is a [`ProcessError::NonZeroExit`]
    pub fn as_non_zero_exit(&self) -> Option<&NonZeroExit> {
        match self {
            Self::NonZeroExit(exit) => Some(exit),
            _ => None,
        }
    }
}

impl From<io::Error> for ProcessError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A process closed cleanly but reported a non-zero exit code
#[derive(Debug, Clone, Error)]
#[error("Process `{}` exited with non-zero code {}", .handle.command(), .exit_code)]
pub struct NonZeroExit {
    handle: ProcessHandle,
    exit_code: i32,
    output: Option<Output>,
}

impl NonZeroExit {
    pub(crate) fn new(handle: ProcessHandle, exit_code: i32, output: Option<Output>) -> Self {
        Self {
            handle,
            exit_code,
            output,
        }
    }

    /// The handle whose process exited
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Get exit code
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Captured output, present when raised from [`ProcessHandle::output`]
    pub fn output(&self) -> Option<&Output> {
        self.output.as_ref()
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;
