use argh::FromArgs;
use emsh::{AppRegistry, Features, Interpreter, ReaderLines, ShellConfig};
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(FromArgs)]
/// Embedded command shell.
struct Cli {
    #[argh(option, short = 'c')]
    /// run this command line and exit
    command: Option<String>,

    #[argh(positional)]
    /// script to run instead of reading commands interactively
    script: Option<PathBuf>,

    #[argh(option, default = "3")]
    /// maximum nesting depth of if and loop constructs
    nest_depth: usize,

    #[argh(option, default = "11")]
    /// maximum number of arguments after the command name
    max_args: usize,

    #[argh(switch, short = 'x')]
    /// print every variable expansion
    trace: bool,

    #[argh(switch)]
    /// keep running a script after a failing statement
    keep_going: bool,

    #[argh(switch)]
    /// treat a trailing `&` and `nice` as ordinary words
    no_background: bool,

    #[argh(option)]
    /// script to run before the first interactive prompt
    init: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> ShellConfig {
        let features = Features {
            background: !self.no_background,
            ..Features::default()
        };
        let config = ShellConfig::default()
            .with_nest_depth(self.nest_depth)
            .with_max_arguments(self.max_args)
            .with_features(features)
            .with_exit_on_error(!self.keep_going)
            .with_trace(self.trace);
        match &self.init {
            Some(path) => config.with_init_script(path),
            None => config,
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("EMSH_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(sh: &mut Interpreter, cli: Cli) -> anyhow::Result<i32> {
    if let Some(command) = cli.command {
        let status = sh.parse(&command);
        return Ok(sh.exit_code().unwrap_or(status));
    }
    if let Some(script) = cli.script {
        return Ok(sh.run_script(&script)?);
    }
    if io::stdin().is_terminal() {
        return sh.repl();
    }
    Ok(sh.run_interactive(&mut ReaderLines(io::stdin().lock())))
}

fn main() -> ExitCode {
    init_logging();
    let cli: Cli = argh::from_env();
    let mut sh = Interpreter::with_apps(cli.config(), AppRegistry::new());

    let status = match run(&mut sh, cli) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("emsh: {err:#}");
            1
        }
    };
    for job in sh.wait_background() {
        debug!(id = job.id, name = job.name.as_str(), status = job.status, "job finished");
    }
    ExitCode::from((status & 0xff) as u8)
}
