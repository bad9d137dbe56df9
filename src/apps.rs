use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::env::Environment;
use crate::interpreter::Interpreter;
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

pub type AppMain = Arc<dyn Fn(&[String], &mut dyn Write) -> ExitCode + Send + Sync>;

/// Applications registered by the embedding program. The dispatcher tries
/// them last, before reporting "command not found".
#[derive(Default, Clone)]
pub struct AppRegistry {
    apps: BTreeMap<String, AppMain>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, main: F)
    where
        F: Fn(&[String], &mut dyn Write) -> ExitCode + Send + Sync + 'static,
    {
        self.apps.insert(name.into(), Arc::new(main));
    }

    pub fn with_app<F>(mut self, name: impl Into<String>, main: F) -> Self
    where
        F: Fn(&[String], &mut dyn Write) -> ExitCode + Send + Sync + 'static,
    {
        self.register(name, main);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.apps.keys().map(String::as_str)
    }
}

struct AppCommand {
    main: AppMain,
    argv: Vec<String>,
}

impl ExecutableCommand for AppCommand {
    fn execute(self: Box<Self>, sh: &mut Interpreter) -> anyhow::Result<ExitCode> {
        let status = (self.main)(&self.argv, sh.stdout());
        sh.stdout().flush()?;
        Ok(status)
    }
}

impl CommandFactory for AppRegistry {
    fn try_create(
        &self,
        _env: &Environment,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        let main = self.apps.get(name)?;
        let argv = std::iter::once(name)
            .chain(args.iter().copied())
            .map(String::from)
            .collect();
        Some(Box::new(AppCommand {
            main: Arc::clone(main),
            argv,
        }))
    }
}
