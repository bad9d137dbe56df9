use std::path::PathBuf;

/// Optional parts of the command language.
///
/// A disabled feature turns its keyword or marker into an ordinary word: with
/// `background` off, a trailing `&` is just another argument; with `loops` off,
/// `while` is looked up as a command like any other name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Features {
    pub background: bool,
    pub loops: bool,
    pub if_then_else: bool,
    pub command_substitution: bool,
    pub variables: bool,
    pub redirection: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            background: true,
            loops: true,
            if_then_else: true,
            command_substitution: true,
            variables: true,
            redirection: true,
        }
    }
}

/// Immutable settings shared by the parser and the dispatcher.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Prefix of every diagnostic line, e.g. `emsh: cd: no such directory: /x`.
    pub name: String,
    /// Interactive prompt.
    pub prompt: String,
    /// Printed once when an interactive session starts.
    pub greeting: Option<String>,
    /// Maximum number of arguments after the command name.
    pub max_arguments: usize,
    /// Maximum depth of nested if-then-else-fi and while/until-do-done.
    pub nest_depth: usize,
    pub features: Features,
    /// Abort a running script at the first failing statement (`set -e`).
    pub exit_on_error: bool,
    /// Echo every variable expansion as `  NAME=value` (`set -x`).
    pub trace: bool,
    /// Script executed when a session starts, if it exists.
    pub init_script: Option<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            name: "emsh".to_string(),
            prompt: "emsh> ".to_string(),
            greeting: Some("\nEmbedded Shell (emsh)\n".to_string()),
            max_arguments: 11,
            nest_depth: 3,
            features: Features::default(),
            exit_on_error: true,
            trace: false,
            init_script: None,
        }
    }
}

impl ShellConfig {
    /// Room for the command name plus `>`, the redirection target and `&`.
    pub fn max_argv_entries(&self) -> usize {
        self.max_arguments + 4
    }

    pub fn with_nest_depth(mut self, depth: usize) -> Self {
        self.nest_depth = depth;
        self
    }

    pub fn with_max_arguments(mut self, max: usize) -> Self {
        self.max_arguments = max;
        self
    }

    pub fn with_features(mut self, features: Features) -> Self {
        self.features = features;
        self
    }

    pub fn with_exit_on_error(mut self, exit_on_error: bool) -> Self {
        self.exit_on_error = exit_on_error;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_init_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.init_script = Some(path.into());
        self
    }

    pub fn without_greeting(mut self) -> Self {
        self.greeting = None;
        self
    }
}
