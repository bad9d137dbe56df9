use crate::apps::AppRegistry;
use crate::command::{CommandFactory, CommandTable, ExitCode, Stdout};
use crate::config::ShellConfig;
use crate::dispatch::{JobStatus, JobTable};
use crate::env::Environment;
use crate::error::{ShellError, ShellResult};
use crate::io_adapters::{ConsoleStderr, ConsoleStdout};
use crate::parser::{self, ParserState};
use crate::script::ScriptStream;
use crate::vars::VariableStore;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Factory allows creating instances of ExecutableCommand.
///
/// Only supports commands defined in this crate: every [`BuiltinCommand`]
/// and [`ExternalCommand`].
///
/// [`BuiltinCommand`]: crate::builtin::BuiltinCommand
/// [`ExternalCommand`]: crate::external::ExternalCommand
pub(crate) struct Factory<T> {
    _phantom: std::marker::PhantomData<fn() -> T>,
}

impl<T> Default for Factory<T> {
    fn default() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

/// Session options that `set` can change at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub trace: bool,
    pub exit_on_error: bool,
}

/// One shell session.
///
/// A session owns everything a statement can change: the exported
/// environment, shell variables, the control-flow state and its output
/// sinks. Background commands run on a [`fork`](Interpreter::fork) of the
/// session that started them.
///
/// Example
/// ```
/// use emsh::{AppRegistry, Interpreter, MemWriter, ShellConfig};
/// let (out, err) = (MemWriter::new(), MemWriter::new());
/// let mut sh = Interpreter::with_apps(ShellConfig::default(), AppRegistry::new())
///     .with_output(out.clone(), err.clone());
/// assert_eq!(sh.parse("set WHO world; echo hello $WHO"), 0);
/// assert_eq!(out.contents_lossy(), "hello world\n");
/// ```
pub struct Interpreter {
    config: Arc<ShellConfig>,
    commands: Arc<CommandTable>,
    env: Environment,
    vars: VariableStore,
    state: ParserState,
    options: Options,
    stdout: Box<dyn Stdout>,
    stderr: Box<dyn Stdout>,
    jobs: JobTable,
    exit_code: ExitCode,
}

impl Interpreter {
    /// Create a session with a custom command table, writing to the
    /// terminal.
    pub fn new(config: ShellConfig, commands: CommandTable) -> Self {
        let options = Options {
            trace: config.trace,
            exit_on_error: config.exit_on_error,
        };
        Self {
            state: ParserState::new(config.nest_depth),
            config: Arc::new(config),
            commands: Arc::new(commands),
            env: Environment::new(),
            vars: VariableStore::new(),
            options,
            stdout: Box::new(ConsoleStdout),
            stderr: Box::new(ConsoleStderr),
            jobs: JobTable::default(),
            exit_code: 0,
        }
    }

    /// A session with the shell's own commands, programs on `PATH`, and
    /// `apps` as the last resort.
    pub fn with_apps(config: ShellConfig, apps: AppRegistry) -> Self {
        Self::new(config, default_commands(apps))
    }

    /// Replace both output sinks.
    pub fn with_output(
        mut self,
        stdout: impl Stdout + 'static,
        stderr: impl Stdout + 'static,
    ) -> Self {
        self.stdout = Box::new(stdout);
        self.stderr = Box::new(stderr);
        self
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn commands(&self) -> Arc<CommandTable> {
        Arc::clone(&self.commands)
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn vars(&self) -> &VariableStore {
        &self.vars
    }

    pub fn vars_mut(&mut self) -> &mut VariableStore {
        &mut self.vars
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ParserState {
        &mut self.state
    }

    pub fn jobs_mut(&mut self) -> &mut JobTable {
        &mut self.jobs
    }

    /// Whether the last statement that was not a condition failed.
    pub fn last_failed(&self) -> bool {
        self.state.last_failed
    }

    /// Where command output goes right now.
    pub fn stdout(&mut self) -> &mut dyn Write {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut dyn Write {
        &mut self.stderr
    }

    pub fn stdout_sink(&self) -> &dyn Stdout {
        self.stdout.as_ref()
    }

    pub fn stderr_sink(&self) -> &dyn Stdout {
        self.stderr.as_ref()
    }

    /// Swap the output sink, returning the previous one.
    pub fn replace_stdout(&mut self, stdout: Box<dyn Stdout>) -> Box<dyn Stdout> {
        std::mem::replace(&mut self.stdout, stdout)
    }

    /// Stop reading input once the current statement is done.
    pub fn request_exit(&mut self, code: ExitCode) {
        self.env.should_exit = true;
        self.exit_code = code;
    }

    /// The status passed to `exit`, if the session was asked to stop.
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.env.should_exit.then_some(self.exit_code)
    }

    /// Write a one-line diagnostic to the error sink.
    pub fn report(&mut self, err: &ShellError) {
        debug!(class = ?err.class(), error = %err, "diagnostic");
        let _ = writeln!(self.stderr, "{}: {err}", self.config.name);
    }

    pub fn report_anyhow(&mut self, err: &anyhow::Error) {
        match err.downcast_ref::<ShellError>() {
            Some(err) => self.report(err),
            None => {
                debug!(error = %err, "command error");
                let _ = writeln!(self.stderr, "{}: {err:#}", self.config.name);
            }
        }
    }

    /// A copy of the session for a background command writing to `stdout`.
    ///
    /// The copy starts with fresh control-flow state and no jobs of its own.
    pub fn fork(&self, stdout: Box<dyn Stdout>) -> ShellResult<Interpreter> {
        let stderr = self
            .stderr
            .try_clone()
            .map_err(|e| ShellError::failed("fork", "dup", e))?;
        let mut state = ParserState::new(self.config.nest_depth);
        state.redirect_active = self.state.redirect_active;
        Ok(Interpreter {
            config: Arc::clone(&self.config),
            commands: Arc::clone(&self.commands),
            env: self.env.clone(),
            vars: self.vars.clone(),
            state,
            options: self.options,
            stdout,
            stderr,
            jobs: JobTable::default(),
            exit_code: 0,
        })
    }

    /// Run one line of input. Returns 1 if any statement on it failed.
    pub fn parse(&mut self, line: &str) -> ExitCode {
        parser::parse_line(self, line)
    }

    /// Run `cmdline` and return its output instead of printing it.
    pub fn capture(&mut self, cmdline: &str) -> ShellResult<String> {
        parser::parse_substitution(self, cmdline)
    }

    /// Run a script to its end, or to the first failure when exit-on-error
    /// is set.
    pub fn run_stream(&mut self, stream: ScriptStream) -> ExitCode {
        let outer_stream = self.state.script_stream.replace(stream);
        let outer_line = self.state.script_line.take();
        let (if_depth, loop_depth) = (self.state.flow.if_depth(), self.state.flow.loop_depth());
        let mut status = 0;
        let mut reached_end = false;

        loop {
            let next = match self.state.script_stream.as_mut() {
                Some(stream) => stream.read_line(),
                None => Ok(None),
            };
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    reached_end = true;
                    break;
                }
                Err(e) => {
                    self.report(&ShellError::failed("sh", "read", e));
                    status = 1;
                    break;
                }
            };
            let (offset, text) = (line.offset, line.text.clone());
            self.state.script_line = Some(line);
            let failed = self.parse(&text) != 0;
            if let Some(code) = self.exit_code() {
                status = code;
                break;
            }
            if failed {
                status = 1;
                if self.options.exit_on_error {
                    debug!(offset = offset.0, "script stopped at failing line");
                    break;
                }
            }
        }

        // Frames opened by this script point into its stream and must not
        // reach the caller.
        let flow = &self.state.flow;
        if flow.if_depth() > if_depth || flow.loop_depth() > loop_depth {
            if reached_end {
                warn!("script ended inside an unfinished if or loop");
                self.report(&ShellError::Context("sh".into()));
                status = 1;
            }
            self.state.flow.truncate_to(if_depth, loop_depth);
        }
        self.state.script_stream = outer_stream;
        self.state.script_line = outer_line;
        status
    }

    /// Run the script at `path`, relative to the session directory.
    pub fn run_script(&mut self, path: impl AsRef<Path>) -> ShellResult<ExitCode> {
        let path = self.env.full_path(path);
        let stream = ScriptStream::open(&path).map_err(|e| ShellError::failed("sh", "open", e))?;
        info!(path = %path.display(), "running script");
        Ok(self.run_stream(stream))
    }

    /// Wait for every background command still running.
    pub fn wait_background(&mut self) -> Vec<JobStatus> {
        self.jobs.wait_all()
    }

    /// Read and run lines from `source` until it is exhausted or `exit` is
    /// called. Returns the status of the last line.
    pub fn run_interactive(&mut self, source: &mut dyn LineSource) -> ExitCode {
        let mut status = 0;
        loop {
            let prompt = self.config.prompt.clone();
            match source.read_line(&prompt) {
                Ok(Some(line)) => status = self.parse(&line),
                Ok(None) => break,
                Err(e) => {
                    let name = self.config.name.clone();
                    self.report(&ShellError::failed(name, "read", e));
                    status = 1;
                    break;
                }
            }
            if let Some(code) = self.exit_code() {
                status = code;
                break;
            }
        }
        status
    }

    /// Interactive read-eval-print loop on the terminal.
    ///
    /// Prints the greeting, runs the init script if it exists, then reads
    /// lines with history until end of input or `exit`.
    pub fn repl(&mut self) -> anyhow::Result<ExitCode> {
        if let Some(greeting) = self.config.greeting.clone() {
            writeln!(self.stdout, "{greeting}")?;
        }
        if let Some(init) = self.config.init_script.clone() {
            if self.env.full_path(&init).exists() {
                match self.run_script(&init) {
                    Ok(status) => debug!(status, "init script finished"),
                    Err(err) => self.report(&err),
                }
                if let Some(code) = self.exit_code() {
                    return Ok(code);
                }
            }
        }
        let mut editor = DefaultEditor::new()?;
        Ok(self.run_interactive(&mut editor))
    }
}

impl Default for Interpreter {
    /// A terminal session with the default configuration and no
    /// applications.
    fn default() -> Self {
        Self::with_apps(ShellConfig::default(), AppRegistry::new())
    }
}

/// The commands every session knows, in lookup order: the shell's own
/// commands, programs found on `PATH`, then `apps`.
pub fn default_commands(apps: AppRegistry) -> CommandTable {
    use crate::builtin::*;
    use crate::external::ExternalCommand;
    let factories: Vec<Box<dyn CommandFactory>> = vec![
        Box::new(Factory::<Echo>::default()),
        Box::new(Factory::<Pwd>::default()),
        Box::new(Factory::<Cd>::default()),
        Box::new(Factory::<Cat>::default()),
        Box::new(Factory::<Grep>::default()),
        Box::new(Factory::<Sleep>::default()),
        Box::new(Factory::<True>::default()),
        Box::new(Factory::<False>::default()),
        Box::new(Factory::<Exit>::default()),
        Box::new(Factory::<Env>::default()),
        Box::new(Factory::<Unset>::default()),
        Box::new(Factory::<Export>::default()),
        Box::new(Factory::<Source>::default()),
        Box::new(Factory::<Break>::default()),
        Box::new(Factory::<SetCommand>::default()),
        Box::new(Factory::<TestCommand>::default()),
        Box::new(Factory::<ExternalCommand>::default()),
        Box::new(apps),
    ];
    CommandTable::new(factories)
}

/// Where an interactive session gets its lines from.
pub trait LineSource {
    /// The next line without its terminator. `None` at end of input.
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>>;
}

impl LineSource for DefaultEditor {
    fn read_line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        match self.readline(prompt) {
            Ok(line) => {
                if let Err(e) = self.add_history_entry(line.as_str()) {
                    warn!(error = %e, "history update failed");
                }
                Ok(Some(line))
            }
            // Ctrl-C abandons the line being typed, not the session.
            Err(ReadlineError::Interrupted) => Ok(Some(String::new())),
            Err(ReadlineError::Eof) => Ok(None),
            Err(ReadlineError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

/// Lines from any buffered reader, for piped input. The prompt is not
/// shown.
pub struct ReaderLines<R>(pub R);

impl<R: BufRead> LineSource for ReaderLines<R> {
    fn read_line(&mut self, _prompt: &str) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.0.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }
}

#[cfg(test)]
pub(crate) fn test_session() -> (Interpreter, crate::MemWriter, crate::MemWriter) {
    let (out, err) = (crate::MemWriter::new(), crate::MemWriter::new());
    let sh = Interpreter::with_apps(ShellConfig::default().without_greeting(), AppRegistry::new())
        .with_output(out.clone(), err.clone());
    (sh, out, err)
}
