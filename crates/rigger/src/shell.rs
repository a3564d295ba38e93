//! The virtual shell every job command runs through.
//!
//! A [`Shell`] owns the working directory, the job environment, and the
//! output writers (normally redacted streams), and drives the process
//! supervisor for each invocation. It also carries the cross-process
//! lock primitive and injects the encoded trace context into child
//! environments.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use rigger_env::Environment;
use rigger_lock::{LockError, LockHandle};
use rigger_process::{Process, ProcessConfig, ProcessError, Signal, WaitStatus};
use thiserror::Error;
use tracing::debug;

use crate::trace::TRACE_CONTEXT_ENV;

/// A writer that can be duplicated for each spawned child. Redacted
/// stream handles are cheap clones over a shared replacer.
pub trait SharedWriter: Write + Send {
    fn box_clone(&self) -> Box<dyn SharedWriter>;
}

impl<T> SharedWriter for T
where
    T: Write + Send + Clone + 'static,
{
    fn box_clone(&self) -> Box<dyn SharedWriter> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn SharedWriter> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("command exited with status {code}")]
    Exit { code: i32 },
    #[error("command killed by signal {signal}")]
    Signaled { signal: i32 },
    #[error("command not found: {name}")]
    NotFound { name: String },
    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl RunError {
    /// Exit code for error reporting: the child's code, −1 for signal
    /// deaths, 1 when the child never ran.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Exit { code } => *code,
            RunError::Signaled { .. } => -1,
            RunError::NotFound { .. } | RunError::Process(_) => 1,
        }
    }
}

/// One invocation through the shell.
#[derive(Debug, Default)]
pub struct Exec {
    pub name: String,
    pub args: Vec<String>,
    pub extra_env: Environment,
    /// Run under a PTY; stderr merges into stdout.
    pub pty: bool,
    /// Capture stdout into [`ExecResult::output`] instead of forwarding.
    pub capture: bool,
    /// Capture stdout while also forwarding it, for callers that need
    /// to classify output the user still sees.
    pub tee: bool,
}

impl Exec {
    pub fn new(name: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct ExecResult {
    pub status: WaitStatus,
    /// Captured stdout (empty unless `capture` or `tee` was set).
    pub output: String,
}

#[derive(Clone, Default)]
struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl Write for CaptureSink {
    fn write(&mut self, d: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("capture poisoned").extend_from_slice(d);
        Ok(d.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
struct TeeSink {
    capture: CaptureSink,
    forward: Box<dyn SharedWriter>,
}

impl Write for TeeSink {
    fn write(&mut self, d: &[u8]) -> std::io::Result<usize> {
        self.capture.write_all(d)?;
        self.forward.write_all(d)?;
        Ok(d.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.forward.flush()
    }
}

/// The stateful shell facade.
pub struct Shell {
    cwd: PathBuf,
    pub env: Environment,
    stdout: Box<dyn SharedWriter>,
    stderr: Box<dyn SharedWriter>,
    /// The most recent spawn; replaced on every invocation so interrupt
    /// and terminate reach the right child from any thread.
    current: Arc<Mutex<Option<Arc<Process>>>>,
    commands: Arc<Mutex<Vec<Vec<String>>>>,
    dry_run: bool,
    stdin: Option<Vec<u8>>,
    interrupt_signal: Signal,
    grace_period: Duration,
    trace_context: Option<String>,
    cancel: Arc<AtomicBool>,
}

impl Shell {
    pub fn new(
        cwd: impl Into<PathBuf>,
        env: Environment,
        stdout: Box<dyn SharedWriter>,
        stderr: Box<dyn SharedWriter>,
    ) -> Self {
        Self {
            cwd: cwd.into(),
            env,
            stdout,
            stderr,
            current: Arc::default(),
            commands: Arc::default(),
            dry_run: false,
            stdin: None,
            interrupt_signal: Signal::Term,
            grace_period: Duration::from_secs(9),
            trace_context: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_signal(mut self, signal: Signal, grace_period: Duration) -> Self {
        self.interrupt_signal = signal;
        self.grace_period = grace_period;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Change the working directory for subsequent commands. The target
    /// must exist.
    pub fn chdir(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let path = if path.is_absolute() { path } else { self.cwd.join(path) };
        if !path.is_dir() {
            bail!("directory does not exist: {}", path.display());
        }
        self.cwd = path;
        Ok(())
    }

    /// Resolve a program name against the shell's PATH (and PATHEXT on
    /// Windows) to an absolute path.
    pub fn absolute_path(&self, name: &str) -> Result<PathBuf, RunError> {
        if name.contains(std::path::MAIN_SEPARATOR) || name.contains('/') {
            let p = Path::new(name);
            let p = if p.is_absolute() { p.to_path_buf() } else { self.cwd.join(p) };
            if p.is_file() {
                return Ok(p);
            }
            return Err(RunError::NotFound { name: name.to_string() });
        }
        let path_var = self.env.get("PATH").unwrap_or_default().to_string();
        which::which_in(name, Some(path_var), &self.cwd)
            .map_err(|_| RunError::NotFound { name: name.to_string() })
    }

    /// Export the encoded trace context to all subsequent children.
    pub fn set_trace_context(&mut self, encoded: Option<String>) {
        self.trace_context = encoded;
    }

    /// Shallow clone with a replacement stdin, for one-shot commands
    /// that need piped input. The current-process slot is shared.
    pub fn clone_with_stdin(&self, stdin: Vec<u8>) -> Shell {
        Shell {
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            current: self.current.clone(),
            commands: self.commands.clone(),
            dry_run: self.dry_run,
            stdin: Some(stdin),
            interrupt_signal: self.interrupt_signal,
            grace_period: self.grace_period,
            trace_context: self.trace_context.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Acquire an exclusive cross-process lock on `path`. An `.f`
    /// suffix is appended to avoid colliding with legacy lock files;
    /// acquisition polls every second until the timeout or job
    /// cancellation.
    pub fn lock_file(&self, path: impl AsRef<Path>, timeout: Duration) -> Result<LockHandle, LockError> {
        let mut locked = path.as_ref().as_os_str().to_os_string();
        locked.push(".f");
        rigger_lock::acquire(PathBuf::from(locked), timeout, Some(self.cancel.clone()))
    }

    /// Interrupt the currently-running child, if any.
    pub fn interrupt(&self) {
        if let Some(p) = self.current.lock().expect("slot poisoned").as_ref() {
            p.interrupt();
        }
    }

    /// A handle that can interrupt whatever the shell is running, from
    /// another thread, observing the most recent spawn.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            current: self.current.clone(),
        }
    }

    /// Hard-kill the currently-running child, if any.
    pub fn terminate(&self) {
        if let Some(p) = self.current.lock().expect("slot poisoned").as_ref() {
            p.terminate();
        }
    }

    /// Run a command, forwarding output to the shell's writers; errors
    /// on non-zero exit.
    pub fn run(&mut self, name: &str, args: &[&str]) -> Result<(), RunError> {
        let result = self.execute(Exec::new(name, args))?;
        check(result.status)
    }

    /// Run with additional environment entries for this invocation.
    pub fn run_with_env(&mut self, name: &str, args: &[&str], extra: &Environment) -> Result<(), RunError> {
        let mut exec = Exec::new(name, args);
        exec.extra_env = extra.clone();
        let result = self.execute(exec)?;
        check(result.status)
    }

    /// Run and capture stdout (trimmed); stderr still goes to the job
    /// log. Errors on non-zero exit.
    pub fn run_and_capture(&mut self, name: &str, args: &[&str]) -> Result<String, RunError> {
        let mut exec = Exec::new(name, args);
        exec.capture = true;
        let result = self.execute(exec)?;
        check(result.status)?;
        Ok(result.output.trim().to_string())
    }

    /// Run an invocation. Non-zero exits are not errors here; callers
    /// inspect [`ExecResult::status`].
    pub fn execute(&mut self, exec: Exec) -> Result<ExecResult, RunError> {
        let mut argv = vec![exec.name.clone()];
        argv.extend(exec.args.iter().cloned());

        if self.dry_run {
            debug!(?argv, "dry-run: recording command");
            self.commands.lock().expect("log poisoned").push(argv);
            return Ok(ExecResult {
                status: WaitStatus::Exited(0),
                output: String::new(),
            });
        }

        let path = self.absolute_path(&exec.name)?;

        let mut env = self.env.clone();
        env.merge(&exec.extra_env);
        if let Some(ctx) = &self.trace_context {
            env.set(TRACE_CONTEXT_ENV, ctx.clone());
        }

        let process = Arc::new(Process::new(ProcessConfig {
            path,
            args: exec.args.clone(),
            env: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            dir: Some(self.cwd.clone()),
            stdin: self.stdin.clone(),
            pty: exec.pty,
            interrupt_signal: self.interrupt_signal,
            grace_period: self.grace_period,
        }));
        *self.current.lock().expect("slot poisoned") = Some(process.clone());

        let capture = CaptureSink::default();
        let stdout: Box<dyn Write + Send> = if exec.tee {
            Box::new(TeeSink {
                capture: capture.clone(),
                forward: self.stdout.clone(),
            })
        } else if exec.capture {
            Box::new(capture.clone())
        } else {
            Box::new(self.stdout.clone())
        };
        let stderr: Option<Box<dyn Write + Send>> = if exec.pty {
            None
        } else if exec.tee {
            Some(Box::new(TeeSink {
                capture: capture.clone(),
                forward: self.stderr.clone(),
            }))
        } else {
            Some(Box::new(self.stderr.clone()))
        };

        let status = process.run(stdout, stderr)?;
        let output = String::from_utf8_lossy(&capture.0.lock().expect("capture poisoned")).into_owned();
        Ok(ExecResult { status, output })
    }

    /// Commands recorded in dry-run mode, in invocation order.
    pub fn command_log(&self) -> Vec<Vec<String>> {
        self.commands.lock().expect("log poisoned").clone()
    }
}

/// Cross-thread view of the shell's current-process slot.
#[derive(Clone)]
pub struct InterruptHandle {
    current: Arc<Mutex<Option<Arc<Process>>>>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        if let Some(p) = self.current.lock().expect("slot poisoned").as_ref() {
            p.interrupt();
        }
    }

    pub fn terminate(&self) {
        if let Some(p) = self.current.lock().expect("slot poisoned").as_ref() {
            p.terminate();
        }
    }
}

fn check(status: WaitStatus) -> Result<(), RunError> {
    match status {
        WaitStatus::Exited(0) => Ok(()),
        WaitStatus::Exited(code) => Err(RunError::Exit { code }),
        WaitStatus::Signaled(signal) => Err(RunError::Signaled { signal }),
        WaitStatus::Running => Ok(()),
    }
}
