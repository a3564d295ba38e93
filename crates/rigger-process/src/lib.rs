//! Child process supervision for job commands and hooks.
//!
//! Every spawn gets its own process group (POSIX) or kill-on-close job
//! object (Windows), so signalling reaches the whole tree a build
//! script may have forked. The supervisor pumps the child's output into
//! caller-supplied writers, optionally through a pseudo-terminal, and
//! enforces the interrupt → grace period → kill discipline.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use rigger_process::{Process, ProcessConfig, Signal};
//!
//! let proc = Process::new(ProcessConfig {
//!     path: "sh".into(),
//!     args: vec!["-c".into(), "echo hello".into()],
//!     interrupt_signal: Signal::Term,
//!     grace_period: Duration::from_secs(9),
//!     ..ProcessConfig::default()
//! });
//! let status = proc.run(Box::new(std::io::stdout()), Some(Box::new(std::io::stderr())))?;
//! assert_eq!(status.exit_code(), 0);
//! # Ok::<(), rigger_process::ProcessError>(())
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows_sys;

#[derive(Debug, Error)]
pub enum ProcessError {
    /// fork/exec level failure: the child never started. Distinguishable
    /// from exit errors so callers can retry (a hook written an instant
    /// ago may still be "text file busy").
    #[error("failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pty mode is not supported on this platform")]
    PtyUnsupported,
}

impl ProcessError {
    /// True for fork/exec failures, which higher layers may retry.
    pub fn is_spawn_error(&self) -> bool {
        matches!(self, ProcessError::Spawn { .. })
    }
}

/// Signal delivered by [`Process::interrupt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Signal {
    #[default]
    Term,
    Int,
    Hup,
    Quit,
    Kill,
}

impl Signal {
    /// Parse a signal name, with or without the `SIG` prefix.
    pub fn parse(name: &str) -> Option<Self> {
        let n = name.trim().to_ascii_uppercase();
        let n = n.strip_prefix("SIG").unwrap_or(&n);
        match n {
            "TERM" => Some(Signal::Term),
            "INT" => Some(Signal::Int),
            "HUP" => Some(Signal::Hup),
            "QUIT" => Some(Signal::Quit),
            "KILL" => Some(Signal::Kill),
            _ => None,
        }
    }

    #[cfg(unix)]
    fn as_raw(self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Int => libc::SIGINT,
            Signal::Hup => libc::SIGHUP,
            Signal::Quit => libc::SIGQUIT,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Signal::Term => "SIGTERM",
            Signal::Int => "SIGINT",
            Signal::Hup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
        };
        f.write_str(name)
    }
}

/// Completion state of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Still running (or never started).
    Running,
    /// Exited normally with this code.
    Exited(i32),
    /// Killed by this signal number.
    Signaled(i32),
}

impl WaitStatus {
    /// Exit code as seen by higher layers: the child's code, or −1 for
    /// a signal death.
    pub fn exit_code(&self) -> i32 {
        match self {
            WaitStatus::Exited(code) => *code,
            WaitStatus::Signaled(_) | WaitStatus::Running => -1,
        }
    }

    pub fn finished(&self) -> bool {
        !matches!(self, WaitStatus::Running)
    }

    pub fn signaled(&self) -> bool {
        matches!(self, WaitStatus::Signaled(_))
    }
}

/// Configuration for one supervised spawn.
#[derive(Debug)]
pub struct ProcessConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// Full environment for the child; the parent environment is not
    /// inherited.
    pub env: Vec<(String, String)>,
    pub dir: Option<PathBuf>,
    /// Bytes piped to the child's stdin; closed after writing. Ignored
    /// in PTY mode.
    pub stdin: Option<Vec<u8>>,
    /// Run the child under a pseudo-terminal; stdout and stderr collapse
    /// into the single stdout writer.
    pub pty: bool,
    pub interrupt_signal: Signal,
    pub grace_period: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            args: Vec::new(),
            env: Vec::new(),
            dir: None,
            stdin: None,
            pty: false,
            interrupt_signal: Signal::Term,
            grace_period: Duration::from_secs(9),
        }
    }
}

/// A supervised child process.
///
/// `run` is called once, from the owning thread; `interrupt`,
/// `terminate` and `wait_status` are safe to call from any thread
/// concurrently with `run`.
pub struct Process {
    config: ProcessConfig,
    stdin: Mutex<Option<Vec<u8>>>,
    pid: AtomicI32,
    exited: Arc<AtomicBool>,
    status: Mutex<WaitStatus>,
}

impl Process {
    pub fn new(mut config: ProcessConfig) -> Self {
        let stdin = config.stdin.take();
        Self {
            config,
            stdin: Mutex::new(stdin),
            pid: AtomicI32::new(0),
            exited: Arc::new(AtomicBool::new(false)),
            status: Mutex::new(WaitStatus::Running),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    /// Latest observed completion state.
    pub fn wait_status(&self) -> WaitStatus {
        *self.status.lock().expect("status poisoned")
    }

    /// Spawn the child, pump its output into the writers, and wait for
    /// completion. With PTY enabled, `stderr` is unused and both streams
    /// arrive merged in `stdout`.
    pub fn run(
        &self,
        stdout: Box<dyn Write + Send>,
        stderr: Option<Box<dyn Write + Send>>,
    ) -> Result<WaitStatus, ProcessError> {
        let status = if self.config.pty {
            self.run_pty(stdout)?
        } else {
            self.run_piped(stdout, stderr)?
        };

        self.exited.store(true, Ordering::SeqCst);
        *self.status.lock().expect("status poisoned") = status;
        debug!(path = %self.config.path.display(), ?status, "process finished");
        Ok(status)
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.path);
        cmd.args(&self.config.args);
        cmd.env_clear();
        cmd.envs(self.config.env.iter().map(|(k, v)| (k, v)));
        if let Some(dir) = &self.config.dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn run_piped(
        &self,
        stdout: Box<dyn Write + Send>,
        stderr: Option<Box<dyn Write + Send>>,
    ) -> Result<WaitStatus, ProcessError> {
        let mut cmd = self.base_command();
        let input = self.stdin.lock().expect("stdin poisoned").take();
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        // An unread pipe would wedge a chatty child; without a sink the
        // stream goes to the void instead.
        cmd.stderr(if stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Fresh process group so signals reach the whole tree.
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            path: self.config.path.display().to_string(),
            source,
        })?;
        self.pid.store(child.id() as i32, Ordering::SeqCst);

        if let (Some(bytes), Some(mut sink)) = (input, child.stdin.take()) {
            // Written from a separate thread so a child that never reads
            // cannot deadlock the supervisor.
            std::thread::spawn(move || {
                let _ = sink.write_all(&bytes);
            });
        }

        let out_pump = child.stdout.take().map(|src| pump(src, stdout));
        let err_pump = match (child.stderr.take(), stderr) {
            (Some(src), Some(sink)) => Some(pump(src, sink)),
            _ => None,
        };

        let exit = child.wait()?;
        for handle in [out_pump, err_pump].into_iter().flatten() {
            let _ = handle.join();
        }
        Ok(convert_exit(exit))
    }

    #[cfg(unix)]
    fn run_pty(&self, stdout: Box<dyn Write + Send>) -> Result<WaitStatus, ProcessError> {
        let mut cmd = self.base_command();
        let (master, replica) = unix::open_pty()?;

        // The replica becomes the child's stdio inside pre_exec; these
        // are placeholders that the dup2 calls replace.
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        unix::wire_pty(&mut cmd, &replica);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            path: self.config.path.display().to_string(),
            source,
        })?;
        self.pid.store(child.id() as i32, Ordering::SeqCst);
        // The parent's replica handle must close so the master sees EOF
        // when the child exits.
        drop(replica);

        let reader = unix::master_reader(master);
        let pump_handle = pump(reader, stdout);
        let exit = child.wait()?;
        let _ = pump_handle.join();
        Ok(convert_exit(exit))
    }

    #[cfg(not(unix))]
    fn run_pty(&self, _stdout: Box<dyn Write + Send>) -> Result<WaitStatus, ProcessError> {
        Err(ProcessError::PtyUnsupported)
    }

    /// Send the configured interrupt signal to the process group, then
    /// escalate to a hard kill if the child outlives the grace period.
    pub fn interrupt(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 || self.exited.load(Ordering::SeqCst) {
            return;
        }
        debug!(pid, signal = %self.config.interrupt_signal, "interrupting process group");

        #[cfg(unix)]
        unix::signal_group(pid, self.config.interrupt_signal.as_raw());
        #[cfg(windows)]
        windows_sys::send_ctrl_break(pid as u32);

        let exited = self.exited.clone();
        let grace = self.config.grace_period;
        std::thread::spawn(move || {
            let deadline = std::time::Instant::now() + grace;
            while std::time::Instant::now() < deadline {
                if exited.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            if !exited.load(Ordering::SeqCst) {
                debug!(pid, "grace period expired, killing process group");
                hard_kill(pid);
            }
        });
    }

    /// Immediate hard kill of the process group, skipping the grace
    /// period.
    pub fn terminate(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 || self.exited.load(Ordering::SeqCst) {
            return;
        }
        debug!(pid, "terminating process group");
        hard_kill(pid);
    }
}

fn hard_kill(pid: i32) {
    #[cfg(unix)]
    unix::signal_group(pid, libc::SIGKILL);
    #[cfg(windows)]
    windows_sys::terminate_tree(pid as u32);
}

fn convert_exit(exit: std::process::ExitStatus) -> WaitStatus {
    if let Some(code) = exit.code() {
        return WaitStatus::Exited(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = exit.signal() {
            return WaitStatus::Signaled(sig);
        }
    }
    WaitStatus::Signaled(-1)
}

/// Copy a child stream into a writer until EOF, on its own thread.
fn pump<R: std::io::Read + Send + 'static>(
    mut src: R,
    mut sink: Box<dyn Write + Send>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match src.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if sink.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
                // A PTY master reports EIO once the replica side closes;
                // both cases mean the stream is done.
                Err(_) => break,
            }
        }
        let _ = sink.flush();
    })
}
