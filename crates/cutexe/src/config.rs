//! Execution options

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::handle::ProcessHandle;

/// What the child's stdin is connected to when it is not fed by a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdinMode {
    /// Empty input
    #[default]
    Null,
    /// The parent's stdin
    Inherit,
    /// An open pipe, retrievable with [`ProcessHandle::take_stdin`]
    Piped,
}

/// Platform spawn settings
#[derive(Debug, Clone)]
pub struct SpawnOverrides {
    /// Working directory (None = current dir)
    pub current_dir: Option<PathBuf>,
    /// Environment variables merged over the ambient environment
    pub env: HashMap<String, String>,
    /// Stdin wiring when no upstream handle is configured
    pub stdin: StdinMode,
    /// Suppress console windows on Windows
    pub windows_hide: bool,
}

impl Default for SpawnOverrides {
    fn default() -> Self {
        Self {
            current_dir: None,
            env: HashMap::new(),
            stdin: StdinMode::default(),
            windows_hide: true,
        }
    }
}

impl SpawnOverrides {
    /// Set working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set stdin handling for an unpiped process
    pub fn stdin(mut self, mode: StdinMode) -> Self {
        self.stdin = mode;
        self
    }

    /// Hide the console window on Windows
    pub fn windows_hide(mut self, hide: bool) -> Self {
        self.windows_hide = hide;
        self
    }
}

/// Options for one execution.
///
/// Built once and never mutated by the engine.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Cancel the process after this long (None = no timeout)
    pub timeout: Option<Duration>,
    /// External cancellation token
    pub cancel: Option<CancelToken>,
    /// Start the process in its own process group so it survives the parent
    pub persist: bool,
    /// Upstream handle whose stdout feeds this process
    pub stdin: Option<ProcessHandle>,
    /// Fail completion when the exit code is non-zero
    pub throw_on_error: bool,
    /// Working directory, environment and stdin overrides
    pub spawn: SpawnOverrides,
}

impl ExecOptions {
    /// Create options with no timeout, token or pipe
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout duration
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set timeout in milliseconds
    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    /// Set external cancellation token
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Detach the process into its own process group
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Feed stdin from another handle's stdout
    pub fn stdin(mut self, upstream: ProcessHandle) -> Self {
        self.stdin = Some(upstream);
        self
    }

    /// Fail on non-zero exit codes
    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = throw;
        self
    }

    /// Replace the spawn overrides
    pub fn spawn(mut self, overrides: SpawnOverrides) -> Self {
        self.spawn = overrides;
        self
    }

    /// Set working directory
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spawn.current_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spawn.env.insert(key.into(), value.into());
        self
    }
}
