//! Process handle: spawn, completion, line iteration, kill and pipe

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch, OnceCell};
use tracing::{debug, info, warn};

use crate::cancel::{combine, CancelReason, CancelSource, CombinedCancel};
use crate::config::{ExecOptions, StdinMode};
use crate::error::{NonZeroExit, ProcessError, Result};
use crate::executor::Executor;
use crate::pipe::PipeLink;
use crate::signal::{self, KillSignal};
use crate::stream::{self as streams, combine_streams, split_lines, OutputTape};

/// Aggregate result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    /// None when the process was terminated by a signal
    pub exit_code: Option<i32>,
}

/// Where a handle is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Spawned,
    Closed,
}

#[derive(Debug, Default)]
struct Outcome {
    status: Option<ExitStatus>,
    aborted: Option<CancelReason>,
    error: Option<ProcessError>,
    killed: bool,
}

/// State of a single spawn. Re-spawning a handle creates a new one.
struct Run {
    pid: Option<u32>,
    stdout: OutputTape,
    stderr: OutputTape,
    /// Completion signal, flipped to true exactly once
    closed: watch::Sender<bool>,
    outcome: Mutex<Outcome>,
    /// Aggregate stdout and stderr, collected by the first `output()` call
    captured: OnceCell<(Vec<u8>, Vec<u8>)>,
    stdin: Mutex<Option<ChildStdin>>,
    /// Kill requests for the supervisor, which owns the child
    kill_tx: Option<mpsc::UnboundedSender<KillSignal>>,
    lines_taken: AtomicBool,
}

impl Run {
    fn new(pid: Option<u32>, kill_tx: Option<mpsc::UnboundedSender<KillSignal>>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            pid,
            stdout: OutputTape::new(),
            stderr: OutputTape::new(),
            closed,
            outcome: Mutex::new(Outcome::default()),
            captured: OnceCell::new(),
            stdin: Mutex::new(None),
            kill_tx,
            lines_taken: AtomicBool::new(false),
        }
    }

    /// A run whose spawn failed: no output, already closed
    fn failed(error: ProcessError) -> Arc<Self> {
        let run = Self::new(None, None);
        run.stdout.finish();
        run.stderr.finish();
        run.record_error(error);
        run.close();
        Arc::new(run)
    }

    fn close(&self) {
        self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // only errors if the sender is dropped, and `self` owns it
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn record_error(&self, error: ProcessError) {
        let mut outcome = self.outcome.lock();
        if outcome.aborted.is_none() && outcome.error.is_none() {
            outcome.error = Some(error);
        }
    }

    fn mark_aborted(&self, reason: CancelReason, delivered: bool) {
        let mut outcome = self.outcome.lock();
        if outcome.error.is_none() {
            outcome.aborted = Some(reason);
        }
        outcome.killed |= delivered;
    }

    fn record_exit(&self, status: ExitStatus) {
        let mut outcome = self.outcome.lock();
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            outcome.killed |= status.signal().is_some();
        }
        outcome.status = Some(status);
    }

    fn exit_code(&self) -> Option<i32> {
        self.outcome.lock().status.and_then(|status| status.code())
    }

    fn error(&self) -> Option<ProcessError> {
        self.outcome.lock().error.clone()
    }

    /// Queue `signal` for the supervisor. False once the process was reaped.
    fn signal(&self, signal: KillSignal) -> bool {
        if self.is_closed() {
            return false;
        }
        self.kill_tx
            .as_ref()
            .is_some_and(|tx| tx.send(signal).is_ok())
    }

    fn mark_killed(&self) {
        self.outcome.lock().killed = true;
    }
}

struct HandleInner {
    command: String,
    args: Vec<String>,
    options: ExecOptions,
    executor: Executor,
    link: Option<PipeLink>,
    run: Mutex<Option<Arc<Run>>>,
}

/// Handle to one external process.
///
/// Clones share the same state. The handle offers two ways to consume the
/// process: [`output`](Self::output) for the aggregate result and
/// [`lines`](Self::lines) for a live view of stdout and stderr combined.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl ProcessHandle {
    /// Create an unspawned handle using the default executor services
    pub fn new<I, S>(command: impl Into<String>, args: I, options: ExecOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Executor::default().command(command, args, options)
    }

    pub(crate) fn with_executor(
        executor: Executor,
        command: String,
        args: Vec<String>,
        options: ExecOptions,
    ) -> Self {
        let link = options.stdin.clone().map(PipeLink::new);
        Self {
            inner: Arc::new(HandleInner {
                command,
                args,
                options,
                executor,
                link,
                run: Mutex::new(None),
            }),
        }
    }

    /// Start the process.
    ///
    /// Never fails directly: a spawn failure is recorded and surfaced by
    /// [`output`](Self::output) and [`lines`](Self::lines). Calling it again
    /// starts a fresh process with cleared state. Must be called within a
    /// Tokio runtime.
    pub fn spawn(&self) {
        let run = self.start();
        *self.inner.run.lock() = Some(run);
    }

    fn start(&self) -> Arc<Run> {
        let inner = &*self.inner;
        let options = &inner.options;

        let cwd = match &options.spawn.current_dir {
            Some(dir) => Some(dir.clone()),
            None => match std::env::current_dir() {
                Ok(dir) => Some(dir),
                Err(e) => {
                    warn!(error = %e, "Cannot read working directory, skipping local tool directories");
                    None
                }
            },
        };
        let env = inner
            .executor
            .environment()
            .build_environment(cwd.as_deref(), &options.spawn.env);
        let resolved = inner.executor.resolver().resolve(&inner.command, &inner.args);

        let mut sources = Vec::new();
        if let Some(timeout) = options.timeout {
            sources.push(CancelSource::Timeout(timeout));
        }
        if let Some(token) = &options.cancel {
            sources.push(CancelSource::Token(token.clone()));
        }
        let cancel = (!sources.is_empty()).then(|| combine(sources));

        let mut cmd = resolved.to_command();
        cmd.env_clear()
            .envs(&env)
            .stdin(self.stdin_config())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &options.spawn.current_dir {
            cmd.current_dir(dir);
        }
        apply_platform_flags(&mut cmd, options);

        debug!(
            command = %resolved.program,
            args = ?resolved.args,
            "Spawning process"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %inner.command, error = %e, "Failed to spawn process");
                return Run::failed(ProcessError::spawn_failed(&inner.command, e));
            }
        };

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let run = Arc::new(Run::new(child.id(), Some(kill_tx)));
        info!(pid = ?run.pid, command = %inner.command, "Process spawned");

        capture(&run, &run.stdout, child.stdout.take());
        capture(&run, &run.stderr, child.stderr.take());

        if let Some(stdin) = child.stdin.take() {
            match &inner.link {
                Some(link) => {
                    link.connect(stdin);
                }
                None => *run.stdin.lock() = Some(stdin),
            }
        }

        tokio::spawn(supervise(child, run.clone(), cancel, kill_rx));
        run
    }

    fn stdin_config(&self) -> Stdio {
        if self.inner.link.is_some() {
            return Stdio::piped();
        }
        match self.inner.options.spawn.stdin {
            StdinMode::Null => Stdio::null(),
            StdinMode::Inherit => Stdio::inherit(),
            StdinMode::Piped => Stdio::piped(),
        }
    }

    fn current(&self) -> Option<Arc<Run>> {
        self.inner.run.lock().clone()
    }

    /// Stdout tape of the current process, if one was started
    pub(crate) fn live_stdout(&self) -> Option<OutputTape> {
        self.current()
            .filter(|run| run.pid.is_some())
            .map(|run| run.stdout.clone())
    }

    /// Wait for the process and collect its output.
    ///
    /// Resolves once both output streams have ended, the process has closed
    /// and, for piped handles, the upstream has settled. Safe to call more
    /// than once: the first call captures the output and later calls reuse
    /// it. Output already consumed by another reader before the first call
    /// is not part of the capture.
    pub fn output(&self) -> BoxFuture<'_, Result<Output>> {
        let run = self.current();
        // attach before the first poll so consumers started together see the
        // same bytes
        let readers = run
            .as_ref()
            .filter(|run| !run.captured.initialized())
            .map(|run| (run.stdout.reader(), run.stderr.reader()));

        async move {
            let run = run.ok_or(ProcessError::NotStarted)?;

            let capture = run.captured.get_or_init(|| async move {
                match readers {
                    Some((stdout, stderr)) => tokio::join!(stdout.concat(), stderr.concat()),
                    None => Default::default(),
                }
            });
            // the upstream is drained alongside so its unread output cannot
            // stall the pipe
            let settle = async {
                match &self.inner.link {
                    Some(link) => link.settle().await,
                    None => Ok(()),
                }
            };
            let ((stdout, stderr), settled) = tokio::join!(capture, settle);
            run.wait_closed().await;
            settled?;

            if let Some(err) = run.error() {
                return Err(err);
            }

            let output = Output {
                stdout: String::from_utf8_lossy(stdout).into_owned(),
                stderr: String::from_utf8_lossy(stderr).into_owned(),
                exit_code: run.exit_code(),
            };
            self.check_exit(&run, Some(output.clone()))?;
            Ok(output)
        }
        .boxed()
    }

    /// Lines of stdout and stderr combined, in arrival order.
    ///
    /// Single pass: a second call on the same spawn yields nothing. After the
    /// last line a recorded error, or a non-zero exit with `throw_on_error`,
    /// is yielded as the final item.
    pub fn lines(&self) -> impl Stream<Item = Result<String>> + Send + 'static {
        let handle = self.clone();
        let run = self
            .current()
            .filter(|run| !run.lines_taken.swap(true, Ordering::SeqCst));
        let combined = run
            .as_ref()
            .map(|run| combine_streams(vec![run.stderr.reader(), run.stdout.reader()]));

        async_stream::stream! {
            if let (Some(run), Some(combined)) = (run, combined) {
                let mut lines = Box::pin(split_lines(combined));
                while let Some(line) = lines.next().await {
                    yield Ok(line);
                }

                run.wait_closed().await;
                if let Some(err) = run.error() {
                    yield Err(err);
                } else if let Err(err) = handle.check_exit(&run, None) {
                    yield Err(err);
                }
            }
        }
    }

    fn check_exit(&self, run: &Run, output: Option<Output>) -> Result<()> {
        match run.exit_code() {
            Some(code) if code != 0 && self.inner.options.throw_on_error => {
                Err(NonZeroExit::new(self.clone(), code, output).into())
            }
            _ => Ok(()),
        }
    }

    /// Send `signal` to the running process.
    ///
    /// Returns whether the request reached the live process's supervisor;
    /// [`killed`](Self::killed) turns true once the signal is delivered.
    pub fn kill(&self, signal: KillSignal) -> bool {
        self.current().is_some_and(|run| run.signal(signal))
    }

    /// Like [`kill`](Self::kill) with a signal name such as `"SIGINT"`
    pub fn kill_named(&self, signal: &str) -> Result<bool> {
        let signal = signal.parse::<KillSignal>()?;
        Ok(self.kill(signal))
    }

    /// Spawn `command` with its stdin fed from this handle's stdout
    pub fn pipe<I, S>(&self, command: impl Into<String>, args: I, options: ExecOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner
            .executor
            .execute(command, args, options.stdin(self.clone()))
    }

    /// Take the child's stdin when spawned with [`StdinMode::Piped`]
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.current().and_then(|run| run.stdin.lock().take())
    }

    /// Get the command name as given
    pub fn command(&self) -> &str {
        &self.inner.command
    }

    /// Get the arguments as given
    pub fn args(&self) -> &[String] {
        &self.inner.args
    }

    /// Get the options this handle was built with
    pub fn options(&self) -> &ExecOptions {
        &self.inner.options
    }

    /// Get process ID, None before spawn or when spawning failed
    pub fn pid(&self) -> Option<u32> {
        self.current().and_then(|run| run.pid)
    }

    /// Whether the process was stopped by a timeout or cancellation token
    pub fn aborted(&self) -> bool {
        self.abort_reason().is_some()
    }

    /// What stopped the process, if it was aborted
    pub fn abort_reason(&self) -> Option<CancelReason> {
        self.current()
            .and_then(|run| run.outcome.lock().aborted.clone())
    }

    /// Whether a termination signal reached the process
    pub fn killed(&self) -> bool {
        self.current().is_some_and(|run| run.outcome.lock().killed)
    }

    /// Exit code, available once the process has closed
    pub fn exit_code(&self) -> Option<i32> {
        self.current().and_then(|run| run.exit_code())
    }

    /// Get current lifecycle state
    pub fn state(&self) -> LifecycleState {
        match self.current() {
            None => LifecycleState::Created,
            Some(run) if run.is_closed() => LifecycleState::Closed,
            Some(_) => LifecycleState::Spawned,
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("command", &self.inner.command)
            .field("args", &self.inner.args)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn capture<R>(run: &Arc<Run>, tape: &OutputTape, reader: Option<R>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else {
        tape.finish();
        return;
    };

    let run = run.clone();
    let tape = tape.clone();
    tokio::spawn(async move {
        if let Err(e) = streams::record(reader, &tape).await {
            warn!(pid = ?run.pid, error = %e, "Failed to read process output");
            run.record_error(e.into());
        }
        tape.finish();
    });
}

/// Owns the child: waits for exit, applies cancellation and kill requests,
/// then fires the completion signal.
async fn supervise(
    mut child: Child,
    run: Arc<Run>,
    cancel: Option<CombinedCancel>,
    mut kill_rx: mpsc::UnboundedReceiver<KillSignal>,
) {
    let status = {
        let cancelled = async {
            match &cancel {
                Some(cancel) => cancel.token().cancelled().await,
                None => futures::future::pending().await,
            }
        };
        tokio::pin!(cancelled);
        let mut cancel_seen = false;

        loop {
            tokio::select! {
                biased;
                status = child.wait() => break status,
                Some(signal) = kill_rx.recv() => {
                    match signal::send(&mut child, signal) {
                        Ok(()) => {
                            debug!(pid = ?run.pid, signal = %signal, "Signal delivered");
                            run.mark_killed();
                        }
                        Err(e) => {
                            warn!(pid = ?run.pid, signal = %signal, error = %e, "Failed to deliver signal");
                        }
                    }
                }
                reason = &mut cancelled, if !cancel_seen => {
                    cancel_seen = true;
                    info!(pid = ?run.pid, reason = %reason, "Terminating cancelled process");
                    let delivered = match signal::send(&mut child, KillSignal::Terminate) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(pid = ?run.pid, error = %e, "Failed to terminate cancelled process");
                            false
                        }
                    };
                    run.mark_aborted(reason, delivered);
                }
            }
        }
    };
    drop(cancel);

    match status {
        Ok(status) => {
            debug!(pid = ?run.pid, code = ?status.code(), "Process exited");
            run.record_exit(status);
        }
        Err(e) => {
            warn!(pid = ?run.pid, error = %e, "Failed waiting for process");
            run.record_error(e.into());
        }
    }
    run.close();
}

#[allow(unused_variables)]
fn apply_platform_flags(cmd: &mut Command, options: &ExecOptions) {
    #[cfg(unix)]
    {
        if options.persist {
            cmd.process_group(0);
        }
    }

    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

        let mut flags = 0;
        if options.spawn.windows_hide {
            flags |= CREATE_NO_WINDOW;
        }
        if options.persist {
            flags |= DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP;
        }
        cmd.creation_flags(flags);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::stream::TAPE_HIGH_WATER;

    fn sh(script: &str) -> ProcessHandle {
        Executor::new().execute("sh", ["-c", script], ExecOptions::default())
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let handle = ProcessHandle::new("true", Vec::<String>::new(), ExecOptions::default());
        assert_eq!(handle.state(), LifecycleState::Created);
        assert!(handle.pid().is_none());

        handle.spawn();
        assert!(handle.pid().is_some());
        handle.output().await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Closed);
    }

    #[tokio::test]
    async fn test_output_is_repeatable() {
        let handle = sh("echo foo");
        let first = handle.output().await.unwrap();
        let second = handle.output().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.stdout, "foo\n");
    }

    #[tokio::test]
    async fn test_not_started() {
        let handle = ProcessHandle::new("true", Vec::<String>::new(), ExecOptions::default());
        assert!(matches!(handle.output().await, Err(ProcessError::NotStarted)));
        assert!(handle.lines().collect::<Vec<_>>().await.is_empty());
        assert!(!handle.kill(KillSignal::Terminate));
    }

    #[tokio::test]
    async fn test_lines_single_pass() {
        let handle = sh("echo one; echo two");
        let first: Vec<String> = handle.lines().map(|l| l.unwrap()).collect().await;
        let second: Vec<Result<String>> = handle.lines().collect().await;
        assert_eq!(first, vec!["one", "two"]);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_respawn_resets_state() {
        let handle = ProcessHandle::new(
            "sh",
            ["-c", "exit 4"],
            ExecOptions::default(),
        );
        handle.spawn();
        let first_pid = handle.pid();
        assert_eq!(handle.output().await.unwrap().exit_code, Some(4));

        handle.spawn();
        assert_ne!(handle.pid(), first_pid);
        assert_eq!(handle.exit_code(), None);
        assert_eq!(handle.output().await.unwrap().exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_piped_stdin_mode() {
        use tokio::io::AsyncWriteExt;

        let handle = Executor::new().execute(
            "cat",
            Vec::<String>::new(),
            ExecOptions::default()
                .spawn(crate::config::SpawnOverrides::default().stdin(StdinMode::Piped)),
        );
        let mut stdin = handle.take_stdin().unwrap();
        stdin.write_all(b"hello").await.unwrap();
        drop(stdin);
        assert!(handle.take_stdin().is_none());
        assert_eq!(handle.output().await.unwrap().stdout, "hello");
    }

    #[tokio::test]
    async fn test_lines_consumer_keeps_capture_bounded() {
        let handle = Executor::new().execute("yes", Vec::<String>::new(), ExecOptions::default());
        let run = handle.current().unwrap();
        let limit = TAPE_HIGH_WATER + 8 * 1024;

        let mut lines = Box::pin(handle.lines().take(400_000));
        let mut seen = 0;
        while let Some(line) = lines.next().await {
            assert_eq!(line.unwrap(), "y");
            assert!(run.stdout.retained() <= limit);
            seen += 1;
        }
        assert_eq!(seen, 400_000);
        drop(lines);

        // with no reader left the child is held back instead of buffered
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(run.stdout.retained() <= limit);

        assert!(handle.kill(KillSignal::Kill));
        handle.output().await.unwrap();
        assert!(handle.killed());
    }

    #[tokio::test]
    async fn test_output_after_consumption_is_cached() {
        let handle = sh("echo cached");
        let first = handle.output().await.unwrap();
        let run = handle.current().unwrap();
        assert_eq!(run.stdout.retained(), 0);
        assert_eq!(handle.output().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_kill_named_rejects_unknown_signal() {
        let handle = Executor::new().execute("sleep", ["5"], ExecOptions::default());
        assert!(matches!(
            handle.kill_named("SIGWHATEVER"),
            Err(ProcessError::UnsupportedSignal(_))
        ));
        assert!(handle.kill_named("SIGKILL").unwrap());
        let output = handle.output().await.unwrap();
        assert_eq!(output.exit_code, None);
        assert!(!handle.aborted());
    }
}
