//! Executor - builds and spawns process handles

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::ExecOptions;
use crate::env::{EnvironmentBuilder, LocalBinEnvironment};
use crate::handle::ProcessHandle;
use crate::resolve::{CommandResolver, PlatformResolver};

/// Holds the environment and command-resolution services used to start
/// processes
#[derive(Clone)]
pub struct Executor {
    environment: Arc<dyn EnvironmentBuilder>,
    resolver: Arc<dyn CommandResolver>,
}

impl Executor {
    /// Create executor with the default services
    pub fn new() -> Self {
        Self {
            environment: Arc::new(LocalBinEnvironment::default()),
            resolver: Arc::new(PlatformResolver),
        }
    }

    /// Use a different environment builder
    pub fn with_environment(mut self, environment: impl EnvironmentBuilder + 'static) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    /// Use a different command resolver
    pub fn with_resolver(mut self, resolver: impl CommandResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn environment(&self) -> &dyn EnvironmentBuilder {
        self.environment.as_ref()
    }

    pub fn resolver(&self) -> &dyn CommandResolver {
        self.resolver.as_ref()
    }

    /// Build a handle without starting it
    pub fn command<I, S>(&self, command: impl Into<String>, args: I, options: ExecOptions) -> ProcessHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ProcessHandle::with_executor(
            self.clone(),
            command.into(),
            args.into_iter().map(Into::into).collect(),
            options,
        )
    }

    /// Build a handle and spawn it immediately
    ///
    /// # Examples
    /// ```no_run
    /// use cutexe::{ExecOptions, Executor};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let executor = Executor::new();
    /// let handle = executor.execute("echo", ["hello"], ExecOptions::default());
    /// let output = handle.output().await?;
    /// assert_eq!(output.stdout, "hello\n");
    /// # Ok(())
    /// # }
    /// ```
    pub fn execute<I, S>(&self, command: impl Into<String>, args: I, options: ExecOptions) -> ProcessHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handle = self.command(command, args, options);
        debug!(command = %handle.command(), "Executing");
        handle.spawn();
        handle
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

/// Spawn `command` with the default executor
///
/// # Examples
/// ```no_run
/// use cutexe::{exec, ExecOptions};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let output = exec("echo", ["foo"], ExecOptions::default()).output().await?;
/// assert_eq!(output.exit_code, Some(0));
/// # Ok(())
/// # }
/// ```
pub fn exec<I, S>(command: impl Into<String>, args: I, options: ExecOptions) -> ProcessHandle
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Executor::default().execute(command, args, options)
}
