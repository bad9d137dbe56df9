use crate::env::Environment;
use crate::interpreter::Interpreter;
use anyhow::Result;
use std::io::{self, Write};
use std::process::Stdio;
use tracing::trace;

/// Conventional process exit code type used by this crate.
///
/// 0 is success, anything else is failure.
pub type ExitCode = i32;

/// An output sink the session can write to and hand to child processes.
///
/// The same dispatcher drives a terminal, a redirection file or an in-memory
/// capture buffer; this trait is the only thing it knows about them.
pub trait Stdout: Write + Send {
    /// A handle a spawned process can write to directly. `None` means the
    /// caller has to pipe the child's output and copy it here.
    fn stdio(&self) -> Option<Stdio>;

    /// An independent handle to the same destination, used by background
    /// commands so they never share the foreground's sink.
    fn try_clone(&self) -> io::Result<Box<dyn Stdout>>;
}

/// Object-safe trait for any command that can be executed by the shell.
///
/// Commands run against the session that dispatched them. Output goes to
/// [`Interpreter::stdout`], which is already redirected when the statement
/// used `>` or `>>`.
pub trait ExecutableCommand: Send {
    fn execute(self: Box<Self>, sh: &mut Interpreter) -> Result<ExitCode>;
}

/// Factory that tries to create a command from a name and its arguments.
///
/// Returns `None` when the factory doesn't recognize the `name`.
pub trait CommandFactory: Send + Sync {
    fn try_create(
        &self,
        env: &Environment,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>>;
}

/// Ordered list of factories consulted by the dispatcher.
///
/// The default table asks, in order: the shell's own commands, programs
/// found on `PATH`, and finally applications registered by the embedder.
#[derive(Default)]
pub struct CommandTable {
    factories: Vec<Box<dyn CommandFactory>>,
}

impl CommandTable {
    pub fn new(factories: Vec<Box<dyn CommandFactory>>) -> Self {
        Self { factories }
    }

    pub fn push(&mut self, factory: Box<dyn CommandFactory>) {
        self.factories.push(factory);
    }

    pub fn lookup(
        &self,
        env: &Environment,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        let found = self
            .factories
            .iter()
            .find_map(|factory| factory.try_create(env, name, args));
        trace!(name, found = found.is_some(), "command lookup");
        found
    }
}
