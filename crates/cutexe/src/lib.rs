//! # cutexe
//!
//! **Purpose**: Spawn external processes and consume them either as a single
//! awaited result or as a live stream of output lines.
//!
//! ## Features
//!
//! - **Dual consumption**: `output()` for captured stdout/stderr/exit code,
//!   `lines()` for stdout and stderr combined in arrival order
//! - **Cancellation**: Timeouts and external tokens merged first-to-fire-wins
//! - **Abort classification**: Cancelled processes report `aborted()` rather
//!   than failing
//! - **Pipes**: Feed one process's stdout into another and surface upstream
//!   failures at the downstream
//! - **Signal Handling**: Portable signal names mapped per platform
//! - **Bounded buffering**: Output is held until every attached consumer has
//!   read it, and a full buffer pauses the child
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cutexe::{exec, ExecOptions};
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Aggregate result
//! let output = exec("echo", ["foo"], ExecOptions::default()).output().await?;
//! assert_eq!(output.stdout, "foo\n");
//!
//! // Live lines
//! let handle = exec("ls", ["-1"], ExecOptions::default().timeout_ms(5_000));
//! let mut lines = Box::pin(handle.lines());
//! while let Some(line) = lines.next().await {
//!     println!("{}", line?);
//! }
//!
//! // Pipe
//! let filtered = exec("echo", ["foo\nbar"], ExecOptions::default())
//!     .pipe("grep", ["foo"], ExecOptions::default())
//!     .output()
//!     .await?;
//! assert_eq!(filtered.stdout, "foo\n");
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod env;
pub mod error;
pub mod executor;
pub mod handle;
pub mod pipe;
pub mod resolve;
pub mod signal;
pub mod stream;

pub use cancel::{combine, CancelReason, CancelSource, CancelToken, CombinedCancel};
pub use config::{ExecOptions, SpawnOverrides, StdinMode};
pub use env::{Environment, EnvironmentBuilder, LocalBinEnvironment};
pub use error::{NonZeroExit, ProcessError, Result};
pub use executor::{exec, Executor};
pub use handle::{LifecycleState, Output, ProcessHandle};
pub use pipe::PipeLink;
pub use resolve::{CommandResolver, PlatformResolver, ResolvedCommand};
pub use signal::KillSignal;
pub use stream::{combine_streams, split_lines, Chunk, OutputTape, TAPE_HIGH_WATER};
