//! Command resolution for the host platform

use std::path::{Component, Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

/// Program and arguments ready to hand to the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Arguments are already escaped and must be passed through verbatim
    pub verbatim_args: bool,
}

impl ResolvedCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            verbatim_args: false,
        }
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);

        #[cfg(windows)]
        {
            if self.verbatim_args {
                for arg in &self.args {
                    cmd.raw_arg(arg);
                }
                return cmd;
            }
        }

        cmd.args(&self.args);
        cmd
    }
}

/// Adjusts a command line for the host's process-creation API
pub trait CommandResolver: Send + Sync {
    fn resolve(&self, command: &str, args: &[String]) -> ResolvedCommand;
}

/// Default resolver.
///
/// Path-like commands are normalised lexically. On Windows the command is
/// looked up on `PATH` and batch scripts are routed through `cmd.exe` with
/// their arguments escaped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformResolver;

impl CommandResolver for PlatformResolver {
    fn resolve(&self, command: &str, args: &[String]) -> ResolvedCommand {
        let program = normalize_command(command);

        #[cfg(windows)]
        {
            if let Some(resolved) = resolve_batch_script(&program, args) {
                return resolved;
            }
        }

        ResolvedCommand::new(program, args.to_vec())
    }
}

/// Collapse `.` and `..` segments and duplicate separators.
///
/// Bare names are returned untouched so they still go through `PATH` lookup,
/// and a leading `./` is kept for the same reason.
pub fn normalize_command(command: &str) -> String {
    if !command.contains(['/', '\\']) {
        return command.to_string();
    }

    let mut out = PathBuf::new();
    for component in Path::new(command).components() {
        match component {
            Component::ParentDir => {
                if out.file_name().is_some() {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }

    let normalized = out.to_string_lossy().into_owned();
    if normalized != command {
        debug!(command = %command, normalized = %normalized, "Normalised command path");
    }
    normalized
}

#[cfg(windows)]
fn resolve_batch_script(program: &str, args: &[String]) -> Option<ResolvedCommand> {
    let found = which::which(program).ok()?;
    let is_batch = found
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("cmd") || ext.eq_ignore_ascii_case("bat"));
    if !is_batch {
        return None;
    }

    let shell = std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string());
    debug!(script = %found.display(), shell = %shell, "Routing batch script through shell");
    Some(ResolvedCommand {
        program: shell,
        args: vec![
            "/d".to_string(),
            "/s".to_string(),
            "/c".to_string(),
            format!(
                "\"{}\"",
                batch_command_line(&found.to_string_lossy(), args)
            ),
        ],
        verbatim_args: true,
    })
}

/// Characters `cmd.exe` interprets unless caret-escaped
const CMD_META_CHARS: &[char] = &[
    '(', ')', '[', ']', '%', '!', '^', '"', '`', '<', '>', '&', '|', ';', ',', ' ', '*', '?',
];

#[cfg_attr(not(windows), allow(dead_code))]
fn escape_meta(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if CMD_META_CHARS.contains(&c) {
            out.push('^');
        }
        out.push(c);
    }
    out
}

/// Quote one argument for `CommandLineToArgvW` and escape it for `cmd.exe`
#[cfg_attr(not(windows), allow(dead_code))]
fn escape_batch_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat('\\').take(backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat('\\').take(backslashes * 2));
    quoted.push('"');
    escape_meta(&quoted)
}

#[cfg_attr(not(windows), allow(dead_code))]
fn batch_command_line(script: &str, args: &[String]) -> String {
    std::iter::once(escape_meta(script))
        .chain(args.iter().map(|arg| escape_batch_arg(arg)))
        .collect::<Vec<_>>()
        .join(" ")
}
