use crate::command::{CommandFactory, ExecutableCommand, ExitCode};
use crate::env::Environment;
use crate::error::ShellError;
use crate::interpreter::{Factory, Interpreter};
use anyhow::Result;
use std::borrow::Cow;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Command that is not a builtin: a program on `PATH` or named by path.
pub struct ExternalCommand {
    name: String,
    path: PathBuf,
    args: Vec<OsString>,
}

impl ExternalCommand {
    pub fn new(name: String, path: PathBuf, args: Vec<OsString>) -> Self {
        Self { name, path, args }
    }
}

impl CommandFactory for Factory<ExternalCommand> {
    fn try_create(
        &self,
        env: &Environment,
        name: &str,
        args: &[&str],
    ) -> Option<Box<dyn ExecutableCommand>> {
        let search_paths = env.get_var("PATH").unwrap_or_default();
        // Paths with a directory part are relative to the session, not the process.
        let candidate = if Path::new(name).components().count() > 1 {
            env.full_path(name)
        } else {
            PathBuf::from(name)
        };
        let executable = find_command_path(OsStr::new(search_paths), &candidate)?;
        Some(Box::new(ExternalCommand::new(
            name.to_string(),
            executable.into_owned(),
            args.iter().map(OsString::from).collect(),
        )))
    }
}

impl ExecutableCommand for ExternalCommand {
    fn execute(self: Box<Self>, sh: &mut Interpreter) -> Result<ExitCode> {
        let env = sh.env();
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .env_clear()
            .envs(env.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&env.current_dir)
            .stderr(sh.stderr_sink().stdio().unwrap_or_else(Stdio::inherit));

        let direct = sh.stdout_sink().stdio();
        let piped = direct.is_none();
        command.stdout(direct.unwrap_or_else(Stdio::piped));

        let mut child = command
            .spawn()
            .map_err(|e| ShellError::failed(self.name.as_str(), "exec", e))?;
        debug!(name = self.name.as_str(), pid = child.id(), piped, "spawned");

        if let Some(mut output) = child.stdout.take() {
            io::copy(&mut output, sh.stdout())?;
            sh.stdout().flush()?;
        }
        let exit_status = child
            .wait()
            .map_err(|e| ShellError::failed(self.name.as_str(), "wait", e))?;
        match exit_status.code() {
            Some(x) => Ok(x),
            None => Ok(terminated_by_signal(exit_status)),
        }
    }
}

#[cfg(unix)]
fn terminated_by_signal(exit_status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = ExitStatusExt::signal(&exit_status) {
        128 + signal
    } else if ExitStatusExt::core_dumped(&exit_status) {
        255
    } else {
        -1
    }
}

#[cfg(not(unix))]
fn terminated_by_signal(_exit_status: ExitStatus) -> i32 {
    -1
}

/// Resolve a command path the way a typical shell would.
///
/// Behavior:
/// - Absolute path: returns it if it names a file.
/// - `./foo` on Unix or any `./`-prefixed path on other platforms: returns it if it exists.
/// - Single path component (no separators): search each directory in `search_paths` (PATH)
///   and return the first existing match.
/// - Relative with multiple components (e.g., `bin/sh`): returns it if it names a file.
/// - Empty path: returns `None`.
///
/// Returns either a borrowed reference to the provided `path` or an owned `PathBuf`
/// when the result is discovered via PATH lookup.
pub fn find_command_path<'a>(search_paths: &OsStr, path: &'a Path) -> Option<Cow<'a, Path>> {
    if path.is_absolute() {
        return find_by_path(path).map(Cow::Borrowed);
    }

    let search_in_current_dir = cfg!(not(unix)) || path.starts_with("./");
    if search_in_current_dir && path.is_file() {
        return Some(Cow::Borrowed(path));
    }

    let mut components = path.components();
    let first = components.next();
    let second = components.next();
    match (first, second) {
        (None, None) => None,
        (Some(x), None) => find_in_path(search_paths, x.as_os_str()).map(Cow::Owned),
        _ => find_by_path(path).map(Cow::Borrowed),
    }
}

fn find_in_path(search_paths: &OsStr, cmd: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_paths)
        .map(|dir| dir.join(cmd))
        .find(|path| find_by_path(path).is_some())
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if path.is_file() { Some(path) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::test_session;
    use std::fs;
    use std::fs::File;

    #[cfg(unix)]
    fn osstr(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    #[test]
    #[cfg(unix)]
    fn absolute_existing_true() {
        let path = Path::new("/bin/sh");
        let res = find_command_path(osstr("/bin"), path);
        assert!(res.is_some(), "Expected to find /bin/sh via absolute path");
        assert_eq!(res.unwrap().as_ref(), path);
    }

    #[test]
    #[cfg(unix)]
    fn absolute_nonexisting() {
        let path = Path::new("/bin/nonexisting");
        let res = find_command_path(osstr("/bin"), path);
        assert!(
            res.is_none(),
            "Expected not to find /bin/nonexisting via absolute path"
        );
    }

    #[test]
    #[cfg(unix)]
    fn directory_is_not_a_command() {
        assert!(find_command_path(osstr("/"), Path::new("/bin")).is_none());
        assert!(find_command_path(osstr("/"), Path::new("bin")).is_none());
    }

    #[test]
    #[cfg(unix)]
    fn single_component_found_in_path() {
        let res = find_command_path(osstr("/nonexistent-dir:/bin"), Path::new("sh"));
        let found = res.expect("Expected to find 'sh' in /bin via PATH search");
        assert_eq!(found.as_ref(), Path::new("/bin/sh"));
    }

    #[test]
    #[cfg(unix)]
    fn single_component_not_found_in_path() {
        let res = find_command_path(osstr("/bin"), Path::new("nonexisting"));
        assert!(res.is_none(), "Expected not to find 'nonexisting' in PATH");
    }

    #[test]
    #[cfg(unix)]
    fn empty_path_is_none() {
        let res = find_command_path(osstr("/bin"), Path::new(""));
        assert!(res.is_none(), "Empty path should not resolve to anything");
    }

    #[test]
    #[cfg(unix)]
    fn relative_path_resolves_against_session_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        File::create(dir.path().join("bin").join("tool")).unwrap();

        let env = Environment::empty(dir.path());
        let factory = Factory::<ExternalCommand>::default();
        assert!(factory.try_create(&env, "bin/tool", &[]).is_some());
        assert!(factory.try_create(&env, "bin/missing", &[]).is_none());
    }

    #[test]
    #[cfg(unix)]
    fn output_is_captured_when_sink_has_no_descriptor() {
        let (mut sh, out, _) = test_session();
        assert_eq!(sh.parse("/bin/sh -c \"echo from child\""), 0);
        assert_eq!(out.contents_lossy(), "from child\n");
    }

    #[test]
    #[cfg(unix)]
    fn exit_status_is_reported() {
        let (mut sh, _, _) = test_session();
        assert_eq!(sh.parse("/bin/sh -c \"exit 3\""), 1);
        assert!(sh.last_failed());
    }

    #[test]
    #[cfg(unix)]
    fn child_sees_session_environment_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = fs::canonicalize(dir.path()).unwrap();
        let (mut sh, out, _) = test_session();
        sh.vars_mut().set("DIR", canonical.to_string_lossy());

        sh.parse("export EMSH_CHILD_VAR visible; cd $DIR");
        sh.parse("/bin/sh -c \"echo \\$EMSH_CHILD_VAR; pwd\"");
        assert_eq!(
            out.contents_lossy(),
            format!("visible\n{}\n", canonical.to_string_lossy())
        );
    }

    #[test]
    #[cfg(unix)]
    fn redirected_child_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("child.txt");
        let (mut sh, out, _) = test_session();
        sh.vars_mut().set("OUT", path.to_string_lossy());

        assert_eq!(sh.parse("/bin/sh -c \"echo direct\" > $OUT"), 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "direct\n");
        assert!(out.contents().is_empty());
    }
}
