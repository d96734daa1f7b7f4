//! Portable termination signals
//!
//! Unix hosts receive the matching POSIX signal. Windows has a single
//! termination primitive, so every signal maps to `TerminateProcess`.

use std::fmt;
use std::io;
use std::str::FromStr;

use tokio::process::Child;

use crate::error::ProcessError;

/// Termination signals accepted by [`crate::ProcessHandle::kill`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KillSignal {
    #[default]
    Terminate,
    Kill,
    Interrupt,
    Hangup,
    Quit,
}

impl KillSignal {
    /// Conventional signal name, e.g. `SIGTERM`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Terminate => "SIGTERM",
            Self::Kill => "SIGKILL",
            Self::Interrupt => "SIGINT",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
        }
    }

    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        match self {
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
            Self::Interrupt => Signal::SIGINT,
            Self::Hangup => Signal::SIGHUP,
            Self::Quit => Signal::SIGQUIT,
        }
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KillSignal {
    type Err = ProcessError;

    /// Accepts `SIGTERM`, `TERM`, `term` or the POSIX number (`15`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "TERM" | "15" => Ok(Self::Terminate),
            "KILL" | "9" => Ok(Self::Kill),
            "INT" | "2" => Ok(Self::Interrupt),
            "HUP" | "1" => Ok(Self::Hangup),
            "QUIT" | "3" => Ok(Self::Quit),
            _ => Err(ProcessError::UnsupportedSignal(s.to_string())),
        }
    }
}

/// Deliver `signal` to a live pid
#[cfg(unix)]
pub(crate) fn deliver(pid: u32, signal: KillSignal) -> io::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), signal.to_nix()).map_err(io::Error::from)
}

/// Deliver `signal` to a child that has not been reaped yet
pub(crate) fn send(child: &mut Child, signal: KillSignal) -> io::Result<()> {
    #[cfg(unix)]
    {
        match child.id() {
            Some(pid) => deliver(pid, signal),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process already reaped",
            )),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal;
        child.start_kill()
    }
}
