use std::collections::HashMap;
use std::env as stdenv;
use std::path::{Path, PathBuf};

/// Per-session view of the process environment.
///
/// - `vars`: exported variables, passed to every external command.
/// - `current_dir`: working directory used for external commands and for
///   resolving relative paths (redirection targets, script files).
/// - `should_exit`: set by `exit`; the session stops reading input.
///
/// Background commands receive a clone, so changes they make never reach
/// the foreground session.
#[derive(Debug, Clone)]
pub struct Environment {
    pub vars: HashMap<String, String>,
    pub current_dir: PathBuf,
    pub should_exit: bool,
}

impl Environment {
    /// Snapshot the process environment and working directory.
    pub fn new() -> Self {
        let vars = stdenv::vars().collect();
        let current_dir = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            vars,
            current_dir,
            should_exit: false,
        }
    }

    /// An environment with no variables, rooted at `dir`.
    pub fn empty(dir: impl Into<PathBuf>) -> Self {
        Self {
            vars: HashMap::new(),
            current_dir: dir.into(),
            should_exit: false,
        }
    }

    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn has_var(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    pub fn remove_var(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    /// Resolve `path` against the session working directory.
    pub fn full_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.current_dir.join(path)
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}
