use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::env::Environment;
use crate::error::ShellError;
use crate::interpreter::{Factory, Interpreter};
use anyhow::{Context, Result};
use argh::{EarlyExit, FromArgs};
use regex::{Regex, RegexBuilder};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed directly
/// in-process against the session that dispatched them.
pub(crate) trait BuiltinCommand: Sized + FromArgs {
    /// Canonical name of the command, e.g. "echo" or "cd".
    fn name() -> &'static str;

    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode>;
}

impl<T: BuiltinCommand + Send> ExecutableCommand for T {
    fn execute(self: Box<Self>, sh: &mut Interpreter) -> Result<ExitCode> {
        <T as BuiltinCommand>::execute(*self, sh)
    }
}

/// Usage text or a parse error from `argh`.
struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableCommand for InvalidArgs {
    fn execute(self: Box<Self>, sh: &mut Interpreter) -> Result<ExitCode> {
        if self.is_error {
            sh.stderr().write_all(self.output.as_bytes())?;
            writeln!(sh.stderr())?;
            Ok(1)
        } else {
            writeln!(sh.stdout(), "{}", self.output)?;
            Ok(0)
        }
    }
}

impl<T: BuiltinCommand + Send + 'static> CommandFactory for Factory<T> {
    fn try_create(
        &self,
        _env: &Environment,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        if name == T::name() {
            Some(match T::from_args(&[name], args) {
                Ok(cmd) => Box::new(cmd),
                Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                    output,
                    is_error: status.is_err(),
                }),
            })
        } else {
            None
        }
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        let dir = sh.env().current_dir.to_string_lossy().into_owned();
        writeln!(sh.stdout(), "{dir}")?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Change the session working directory.
/// If no target is provided, changes to the directory specified by the HOME environment variable.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute or relative to the current directory. Defaults to $HOME when omitted.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        let env = sh.env_mut();
        let target = match &self.target {
            Some(t) if !t.is_empty() => PathBuf::from(t),
            _ => match env.get_var("HOME") {
                Some(home) => PathBuf::from(home),
                None => return Err(ShellError::ArgRequired("cd".into()).into()),
            },
        };

        let new_dir = env.full_path(&target);
        let canonical = fs::canonicalize(&new_dir).map_err(|_| ShellError::NoSuch {
            cmd: "cd".into(),
            kind: "directory",
            name: target.to_string_lossy().into_owned(),
        })?;
        if !canonical.is_dir() {
            return Err(ShellError::NoSuch {
                cmd: "cd".into(),
                kind: "directory",
                name: target.to_string_lossy().into_owned(),
            }
            .into());
        }

        env.set_var("PWD", canonical.to_string_lossy().into_owned());
        env.current_dir = canonical;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Stop the session after the current statement.
pub struct Exit {
    #[argh(positional)]
    /// status to exit with, 0 when omitted
    pub code: Option<i32>,
}

impl BuiltinCommand for Exit {
    fn name() -> &'static str {
        "exit"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        let code = self.code.unwrap_or(0);
        sh.request_exit(code);
        Ok(code)
    }
}

#[derive(FromArgs)]
/// write the arguments to standard output, separated by spaces.
/// by default, a trailing newline is printed.
pub struct Echo {
    #[argh(switch, short = 'n')]
    /// do not output the trailing newline.
    pub no_newline: bool,

    #[argh(positional, greedy)]
    /// values to print as-is, separated by spaces.
    pub args: Vec<String>,
}

impl BuiltinCommand for Echo {
    fn name() -> &'static str {
        "echo"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        let s = self.args.join(" ");
        let stdout = sh.stdout();
        if self.no_newline {
            write!(stdout, "{}", s)?;
        } else {
            writeln!(stdout, "{}", s)?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print file(s) to stdout
pub struct Cat {
    #[argh(positional, greedy)]
    /// files to print, relative to the current directory
    pub files: Vec<String>,
}

impl BuiltinCommand for Cat {
    fn name() -> &'static str {
        "cat"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        if self.files.is_empty() {
            return Err(ShellError::ArgRequired("cat".into()).into());
        }
        for fname in self.files {
            let path = sh.env().full_path(&fname);
            let mut f = fs::File::open(&path).map_err(|e| ShellError::failed("cat", "open", e))?;
            std::io::copy(&mut f, sh.stdout())?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// print lines matching a pattern
pub struct Grep {
    #[argh(positional)]
    /// the pattern to search for (a regular expression)
    pub pattern: String,

    #[argh(positional, greedy)]
    /// files to search, relative to the current directory
    pub files: Vec<String>,

    #[argh(switch, short = 'w')]
    /// match only whole words (using non-word characters as boundaries)
    pub word_regexp: bool,

    #[argh(switch, short = 'i')]
    /// ignore case distinctions
    pub ignore_case: bool,

    #[argh(option, short = 'A', default = "0")]
    /// print NUM lines of trailing context after matching lines
    pub after_context: usize,
}

impl Grep {
    /// Print the matching lines of one source. Returns whether anything
    /// matched.
    fn process_source(
        &self,
        reader: &mut dyn Read,
        stdout: &mut dyn Write,
        file_name: Option<&str>,
        re: &Regex,
    ) -> Result<bool> {
        let lines = BufReader::new(reader)
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .context("read error")?;

        let mut to_print = vec![false; lines.len()];
        let mut matched = false;
        for (i, line) in lines.iter().enumerate() {
            if re.is_match(line) {
                matched = true;
                let end = (i + self.after_context + 1).min(lines.len());
                to_print[i..end].fill(true);
            }
        }

        let prefix = file_name.map(|name| format!("{name}:")).unwrap_or_default();
        let mut last_printed: Option<usize> = None;
        for (i, line) in lines.iter().enumerate().filter(|(i, _)| to_print[*i]) {
            if self.after_context > 0 && last_printed.is_some_and(|last| i > last + 1) {
                writeln!(stdout, "--")?;
            }
            writeln!(stdout, "{prefix}{line}")?;
            last_printed = Some(i);
        }
        Ok(matched)
    }
}

impl BuiltinCommand for Grep {
    fn name() -> &'static str {
        "grep"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        if self.files.is_empty() {
            return Err(ShellError::ArgRequired("grep".into()).into());
        }

        let pattern = if self.word_regexp {
            format!(r"\b({})\b", self.pattern)
        } else {
            self.pattern.clone()
        };
        let re = RegexBuilder::new(&pattern)
            .case_insensitive(self.ignore_case)
            .build()
            .with_context(|| format!("grep: invalid pattern {pattern}"))?;

        let prefix_names = self.files.len() > 1;
        let mut matched = false;
        let mut failed = false;
        for file_name in &self.files {
            let path = sh.env().full_path(file_name);
            match fs::File::open(&path) {
                Ok(mut f) => {
                    let name = prefix_names.then_some(file_name.as_str());
                    matched |= self.process_source(&mut f, sh.stdout(), name, &re)?;
                }
                Err(e) => {
                    sh.report(&ShellError::failed("grep", "open", e));
                    failed = true;
                }
            }
        }
        Ok(if failed {
            2
        } else if matched {
            0
        } else {
            1
        })
    }
}

#[derive(FromArgs)]
/// pause for the given number of seconds
pub struct Sleep {
    #[argh(positional)]
    /// seconds to sleep; fractions are allowed
    pub seconds: f64,
}

impl BuiltinCommand for Sleep {
    fn name() -> &'static str {
        "sleep"
    }

    fn execute(self, _sh: &mut Interpreter) -> Result<ExitCode> {
        let duration = Duration::try_from_secs_f64(self.seconds)
            .map_err(|_| ShellError::ArgRange("sleep".into()))?;
        thread::sleep(duration);
        Ok(0)
    }
}

#[derive(FromArgs)]
/// do nothing, successfully
pub struct True {}

impl BuiltinCommand for True {
    fn name() -> &'static str {
        "true"
    }

    fn execute(self, _sh: &mut Interpreter) -> Result<ExitCode> {
        Ok(0)
    }
}

#[derive(FromArgs)]
/// do nothing, unsuccessfully
pub struct False {}

impl BuiltinCommand for False {
    fn name() -> &'static str {
        "false"
    }

    fn execute(self, _sh: &mut Interpreter) -> Result<ExitCode> {
        Ok(1)
    }
}

#[derive(FromArgs)]
/// print the exported environment
pub struct Env {}

impl BuiltinCommand for Env {
    fn name() -> &'static str {
        "env"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        let mut vars: Vec<String> = sh
            .env()
            .vars
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        vars.sort();
        let stdout = sh.stdout();
        for var in vars {
            writeln!(stdout, "{var}")?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// remove shell or environment variables
pub struct Unset {
    #[argh(positional, greedy)]
    /// names of the variables to remove
    pub names: Vec<String>,
}

impl BuiltinCommand for Unset {
    fn name() -> &'static str {
        "unset"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        if self.names.is_empty() {
            return Err(ShellError::ArgRequired("unset".into()).into());
        }
        for name in self.names {
            if sh.vars_mut().unset(&name).is_ok() {
                continue;
            }
            if sh.env_mut().remove_var(&name).is_none() {
                return Err(ShellError::NoSuch {
                    cmd: "unset".into(),
                    kind: "variable",
                    name,
                }
                .into());
            }
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// move a shell variable into the environment, or set an environment variable
pub struct Export {
    #[argh(positional)]
    /// variable name
    pub name: String,

    #[argh(positional)]
    /// new value; without it the shell variable of that name is exported
    pub value: Option<String>,
}

impl BuiltinCommand for Export {
    fn name() -> &'static str {
        "export"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        let value = match self.value {
            Some(value) => {
                let _ = sh.vars_mut().take(&self.name);
                value
            }
            None => match sh.vars_mut().take(&self.name) {
                Some(value) => value,
                None if sh.env().has_var(&self.name) => return Ok(0),
                None => {
                    return Err(ShellError::NoSuch {
                        cmd: "export".into(),
                        kind: "variable",
                        name: self.name,
                    }
                    .into());
                }
            },
        };
        sh.env_mut().set_var(self.name, value);
        Ok(0)
    }
}

#[derive(FromArgs)]
/// run a script file in the current session
pub struct Source {
    #[argh(positional)]
    /// script path, relative to the current directory
    pub path: String,
}

impl BuiltinCommand for Source {
    fn name() -> &'static str {
        "sh"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        Ok(sh.run_script(&self.path)?)
    }
}

#[derive(FromArgs)]
/// leave the innermost loop at its `done`
pub struct Break {}

impl BuiltinCommand for Break {
    fn name() -> &'static str {
        "break"
    }

    fn execute(self, sh: &mut Interpreter) -> Result<ExitCode> {
        sh.state_mut().flow.break_loop();
        Ok(0)
    }
}

/// `set` takes `+x`-style flags, which `argh` cannot express.
///
/// - no arguments: list shell variables as `NAME=value`
/// - `-x`/`+x`: turn expansion tracing on/off
/// - `-e`/`+e`: turn exit-on-error on/off
/// - `NAME VALUE...`: assign (the environment if `NAME` is exported there)
pub struct SetCommand {
    args: Vec<String>,
}

impl CommandFactory for Factory<SetCommand> {
    fn try_create(
        &self,
        _env: &Environment,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        (name == "set").then(|| {
            Box::new(SetCommand {
                args: args.iter().map(|a| a.to_string()).collect(),
            }) as Box<dyn ExecutableCommand>
        })
    }
}

impl ExecutableCommand for SetCommand {
    fn execute(self: Box<Self>, sh: &mut Interpreter) -> Result<ExitCode> {
        let Some((first, rest)) = self.args.split_first() else {
            let mut listing = String::new();
            sh.vars().for_each(|name, value| {
                listing.push_str(&format!("{name}={value}\n"));
                0
            });
            sh.stdout().write_all(listing.as_bytes())?;
            return Ok(0);
        };

        let options = sh.options_mut();
        match first.as_str() {
            "-x" => options.trace = true,
            "+x" => options.trace = false,
            "-e" => options.exit_on_error = true,
            "+e" => options.exit_on_error = false,
            flag if flag.starts_with(['-', '+']) => {
                return Err(ShellError::ArgInvalid("set".into()).into());
            }
            name => {
                let value = rest.join(" ");
                if sh.env().has_var(name) {
                    sh.env_mut().set_var(name, value);
                } else {
                    sh.vars_mut().set(name, value);
                }
            }
        }
        Ok(0)
    }
}

/// `test EXPR` and `[ EXPR ]`.
///
/// Supports `-n`, `-z`, `-e`, `-f`, `-d`, `-s`, string `=`/`!=`, the integer
/// comparisons `-eq`, `-ne`, `-lt`, `-le`, `-gt`, `-ge` and a leading `!`.
/// Exits 0 when the expression holds, 1 when it does not and 2 on a
/// malformed expression.
pub struct TestCommand {
    name: String,
    args: Vec<String>,
}

impl CommandFactory for Factory<TestCommand> {
    fn try_create(
        &self,
        _env: &Environment,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        if name != "test" && name != "[" {
            return None;
        }
        Some(Box::new(TestCommand {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }))
    }
}

impl ExecutableCommand for TestCommand {
    fn execute(self: Box<Self>, sh: &mut Interpreter) -> Result<ExitCode> {
        let mut args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        if self.name == "[" {
            if args.last() != Some(&"]") {
                sh.report(&ShellError::no_matching("[", "]"));
                return Ok(2);
            }
            args.pop();
        }
        match evaluate(sh.env(), &args) {
            Some(true) => Ok(0),
            Some(false) => Ok(1),
            None => {
                sh.report(&ShellError::ArgInvalid(self.name.clone()));
                Ok(2)
            }
        }
    }
}

/// `None` for a malformed expression.
fn evaluate(env: &Environment, args: &[&str]) -> Option<bool> {
    match args {
        [] => Some(false),
        ["!", rest @ ..] => evaluate(env, rest).map(|b| !b),
        [s] => Some(!s.is_empty()),
        ["-n", s] => Some(!s.is_empty()),
        ["-z", s] => Some(s.is_empty()),
        ["-e", path] => Some(env.full_path(path).exists()),
        ["-f", path] => Some(env.full_path(path).is_file()),
        ["-d", path] => Some(env.full_path(path).is_dir()),
        ["-s", path] => Some(fs::metadata(env.full_path(path)).is_ok_and(|m| m.len() > 0)),
        [a, "=", b] => Some(a == b),
        [a, "!=", b] => Some(a != b),
        [a, op, b] => {
            let (a, b) = (a.parse::<i64>().ok()?, b.parse::<i64>().ok()?);
            match *op {
                "-eq" => Some(a == b),
                "-ne" => Some(a != b),
                "-lt" => Some(a < b),
                "-le" => Some(a <= b),
                "-gt" => Some(a > b),
                "-ge" => Some(a >= b),
                _ => None,
            }
        }
        _ => None,
    }
}
