use crate::command::{ExecutableCommand, ExitCode, Stdout};
use crate::error::{ShellError, ShellResult};
use crate::interpreter::Interpreter;
use crate::lexer::RedirectMode;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 19;

/// Output redirection of one statement. The path is already resolved
/// against the session working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub path: PathBuf,
    pub mode: RedirectMode,
}

/// Run `argv` and return its exit status.
///
/// For a background launch the status only says whether the task was
/// started; the command's own result is collected by the job table.
pub fn execute(
    sh: &mut Interpreter,
    argv: Vec<String>,
    redirect: Option<Redirect>,
    background: bool,
    nice_delta: i32,
) -> ShellResult<ExitCode> {
    let Some((name, args)) = argv.split_first() else {
        return Err(ShellError::Internal("exec".into()));
    };
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let commands = sh.commands();
    let cmd = commands
        .lookup(sh.env(), name, &args)
        .ok_or_else(|| ShellError::CommandNotFound(name.clone()))?;

    let target = redirect
        .as_ref()
        .map(|r| open_redirect(name, r))
        .transpose()?;

    debug!(
        name = name.as_str(),
        args = args.len(),
        redirect = ?redirect,
        background,
        "dispatch"
    );

    if background {
        launch(sh, name, cmd, target, nice_delta)
    } else {
        Ok(run_foreground(sh, name, cmd, target))
    }
}

fn open_redirect(name: &str, redirect: &Redirect) -> ShellResult<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true);
    match redirect.mode {
        RedirectMode::Truncate => options.truncate(true),
        RedirectMode::Append => options.append(true),
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o666);
    }
    options
        .open(&redirect.path)
        .map_err(|e| ShellError::failed(name, "open", e))
}

fn run_foreground(
    sh: &mut Interpreter,
    name: &str,
    cmd: Box<dyn ExecutableCommand>,
    target: Option<File>,
) -> ExitCode {
    let saved = target.map(|file| sh.replace_stdout(Box::new(file)));
    let status = run_guarded(sh, name, cmd);
    if let Some(previous) = saved {
        let mut file = sh.replace_stdout(previous);
        if let Err(e) = file.flush() {
            warn!(name, error = %e, "flushing redirection target failed");
        }
    }
    status
}

/// Runs a command, turning errors and panics into a diagnostic and a
/// failing status.
pub(crate) fn run_guarded(
    sh: &mut Interpreter,
    name: &str,
    cmd: Box<dyn ExecutableCommand>,
) -> ExitCode {
    let result = panic::catch_unwind(AssertUnwindSafe(|| cmd.execute(&mut *sh)));
    let status = match result {
        Ok(Ok(status)) => status,
        Ok(Err(err)) => {
            sh.report_anyhow(&err);
            1
        }
        Err(_) => {
            sh.report(&ShellError::Internal(name.to_string()));
            1
        }
    };
    let _ = sh.stdout().flush();
    status
}

fn launch(
    sh: &mut Interpreter,
    name: &str,
    cmd: Box<dyn ExecutableCommand>,
    target: Option<File>,
    nice_delta: i32,
) -> ShellResult<ExitCode> {
    let stdout: Box<dyn Stdout> = match target {
        Some(file) => Box::new(file),
        None => sh
            .stdout_sink()
            .try_clone()
            .map_err(|e| ShellError::failed(name, "dup", e))?,
    };
    let mut child = sh.fork(stdout)?;

    let niceness = effective_niceness(nice_delta);
    let id = sh.jobs_mut().next_id();
    let window = LaunchWindow::open();
    let gate = window.gate();
    let task_name = name.to_string();

    let handle = thread::Builder::new()
        .name(format!("bg-{id}-{name}"))
        .spawn(move || {
            gate.wait();
            if nice_delta != 0 {
                apply_niceness(niceness);
            }
            debug!(name = task_name.as_str(), "background start");
            let status = run_guarded(&mut child, &task_name, cmd);
            debug!(name = task_name.as_str(), status, "background complete");
            status
        })
        .map_err(|e| ShellError::failed(name, "spawn", e))?;

    sh.jobs_mut().register(id, name, handle);
    window.close();

    writeln!(sh.stdout(), "{name} [{id}:{niceness}]")
        .map_err(|e| ShellError::failed(name, "write", e))?;
    Ok(0)
}

/// The niceness a background task runs at: the current value moved by
/// `delta`, clamped to the valid range.
pub fn effective_niceness(delta: i32) -> i32 {
    (current_niceness() + delta).clamp(NICE_MIN, NICE_MAX)
}

#[cfg(unix)]
fn current_niceness() -> i32 {
    // SAFETY: getpriority only reads scheduler state. On Linux who=0 is the
    // calling thread, elsewhere the process.
    unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) }
}

#[cfg(not(unix))]
fn current_niceness() -> i32 {
    0
}

#[cfg(target_os = "linux")]
fn apply_niceness(niceness: i32) {
    // SAFETY: on Linux setpriority with who=0 targets the calling thread only,
    // so the shell keeps its own priority.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, niceness) };
    if ret != 0 {
        warn!(
            niceness,
            error = %io::Error::last_os_error(),
            "could not change background priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_niceness(niceness: i32) {
    warn!(niceness, "priority adjustment is not supported on this platform");
}

/// Keeps a newly spawned background task from running until the launcher
/// has registered its join handle, so a task can never finish before the
/// job table knows about it.
///
/// The window closes when [`LaunchWindow::close`] is called or the window
/// is dropped.
pub struct LaunchWindow {
    shared: Arc<(Mutex<bool>, Condvar)>,
}

/// The child's side of a [`LaunchWindow`].
pub struct LaunchGate {
    shared: Arc<(Mutex<bool>, Condvar)>,
}

impl LaunchWindow {
    pub fn open() -> Self {
        Self {
            shared: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn gate(&self) -> LaunchGate {
        LaunchGate {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn close(self) {}
}

impl Drop for LaunchWindow {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.shared;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }
}

impl LaunchGate {
    /// Blocks until the window has closed.
    pub fn wait(self) {
        let (lock, cvar) = &*self.shared;
        let mut closed = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*closed {
            closed = cvar.wait(closed).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Job {
    id: usize,
    name: String,
    handle: JoinHandle<ExitCode>,
}

/// Result of a background command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: usize,
    pub name: String,
    pub status: ExitCode,
}

/// Background tasks started by one session.
#[derive(Default)]
pub struct JobTable {
    jobs: Vec<Job>,
    last_id: usize,
}

impl JobTable {
    pub fn next_id(&mut self) -> usize {
        self.last_id += 1;
        self.last_id
    }

    fn register(&mut self, id: usize, name: &str, handle: JoinHandle<ExitCode>) {
        self.jobs.push(Job {
            id,
            name: name.to_string(),
            handle,
        });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Collects the tasks that have already finished.
    pub fn reap(&mut self) -> Vec<JobStatus> {
        let (finished, running): (Vec<Job>, Vec<Job>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|job| job.handle.is_finished());
        self.jobs = running;
        finished.into_iter().map(Self::join).collect()
    }

    /// Waits for every task.
    pub fn wait_all(&mut self) -> Vec<JobStatus> {
        std::mem::take(&mut self.jobs)
            .into_iter()
            .map(Self::join)
            .collect()
    }

    fn join(job: Job) -> JobStatus {
        // A task whose status cannot be collected counts as a success.
        let status = job.handle.join().unwrap_or_else(|_| {
            debug!(id = job.id, "background status lost");
            0
        });
        JobStatus {
            id: job.id,
            name: job.name,
            status,
        }
    }
}
