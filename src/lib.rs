//! An embeddable command shell.
//!
//! A session reads lines of text, splits them into `;`- or newline-separated
//! statements and runs each one: shell variables and back-quoted commands are
//! expanded, `if`/`then`/`else`/`fi` and `while`/`until`/`do`/`done` decide
//! which statements run, and `>`/`>>` and a trailing `&` control where and how
//! the command runs.
//!
//! The main entry point is [`Interpreter`]. Commands are found through a
//! [`CommandTable`] of pluggable factories: the shell's own commands,
//! programs on `PATH`, and applications the embedder registers in an
//! [`AppRegistry`]. The public modules [`command`] and [`env`] expose the
//! traits and types for implementing your own commands.

mod apps;
mod builtin;
pub mod command;
mod config;
mod dispatch;
pub mod env;
mod error;
mod expand;
mod external;
mod flow;
mod interpreter;
mod io_adapters;
mod lexer;
mod parser;
mod script;
mod vars;

pub use apps::{AppMain, AppRegistry};
pub use command::CommandTable;
pub use config::{Features, ShellConfig};
pub use dispatch::JobStatus;
pub use error::{ErrorClass, ShellError, ShellResult};
pub use interpreter::{Interpreter, LineSource, Options, ReaderLines, default_commands};
pub use io_adapters::MemWriter;
pub use script::ScriptStream;
