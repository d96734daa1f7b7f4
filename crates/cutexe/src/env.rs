//! Child environment construction

use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Key used for the executable search path when none exists yet
pub const DEFAULT_PATH_KEY: &str = "PATH";

/// Child environment. Keys and values may hold non-Unicode data.
pub type Environment = HashMap<OsString, OsString>;

/// Builds the environment a child process is started with
pub trait EnvironmentBuilder: Send + Sync {
    /// `cwd` is the child's working directory, or None if it could not be
    /// determined.
    fn build_environment(
        &self,
        cwd: Option<&Path>,
        overrides: &HashMap<String, String>,
    ) -> Environment;
}

/// Ambient environment plus overrides, with project-local tool directories
/// prepended to the search path.
///
/// For every ancestor of the working directory (nearest first) and every
/// configured directory name, `<ancestor>/<name>` is placed in front of the
/// existing search path.
#[derive(Debug, Clone)]
pub struct LocalBinEnvironment {
    bin_dirs: Vec<PathBuf>,
}

impl LocalBinEnvironment {
    /// Create a builder searching `node_modules/.bin` in each ancestor
    pub fn new() -> Self {
        Self {
            bin_dirs: vec![Path::new("node_modules").join(".bin")],
        }
    }

    /// Replace the tool directory names searched in each ancestor
    pub fn with_bin_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.bin_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Build from an explicit ambient environment instead of the process one
    pub fn build_from<I, K, V>(
        &self,
        ambient: I,
        cwd: Option<&Path>,
        overrides: &HashMap<String, String>,
    ) -> Environment
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut env: Environment = ambient
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        let key = path_key(overrides.keys())
            .or_else(|| path_key(env.keys()))
            .unwrap_or_else(|| OsString::from(DEFAULT_PATH_KEY));
        env.extend(
            overrides
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );

        let local = match cwd {
            Some(cwd) => self.local_dirs(cwd),
            None => {
                debug!("No working directory, skipping local tool directories");
                return env;
            }
        };

        let existing = env.get(&key).cloned().unwrap_or_default();
        let mut search: Vec<OsString> = local.into_iter().map(PathBuf::into_os_string).collect();
        search.extend(
            env::split_paths(&existing)
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::into_os_string),
        );

        match env::join_paths(search) {
            Ok(joined) => {
                debug!(key = ?key, "Prepended local tool directories to search path");
                env.insert(key, joined);
            }
            Err(e) => {
                warn!(key = ?key, error = %e, "Could not extend search path, leaving it unchanged");
                env.entry(key).or_insert(existing);
            }
        }

        env
    }

    fn local_dirs(&self, cwd: &Path) -> Vec<PathBuf> {
        cwd.ancestors()
            .flat_map(|ancestor| self.bin_dirs.iter().map(move |dir| ancestor.join(dir)))
            .collect()
    }
}

impl Default for LocalBinEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentBuilder for LocalBinEnvironment {
    fn build_environment(
        &self,
        cwd: Option<&Path>,
        overrides: &HashMap<String, String>,
    ) -> Environment {
        self.build_from(env::vars_os(), cwd, overrides)
    }
}

/// Find the search path key, ignoring case
pub fn path_key<I, K>(keys: I) -> Option<OsString>
where
    I: IntoIterator<Item = K>,
    K: AsRef<OsStr>,
{
    keys.into_iter()
        .find(|k| {
            k.as_ref()
                .to_str()
                .is_some_and(|k| k.eq_ignore_ascii_case(DEFAULT_PATH_KEY))
        })
        .map(|k| k.as_ref().to_os_string())
}
