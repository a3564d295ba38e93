//! Hook discovery, classification, and execution.
//!
//! Hooks are executable files found by convention in known directories.
//! A shell hook is *sourced* inside a generated wrapper so its exported
//! variables and working-directory changes survive into the rest of the
//! job: the wrapper dumps the environment before and after, and the
//! runner diffs the two. Script hooks (non-shell shebang) and binary
//! hooks run directly and cannot mutate the job environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rigger_env::{Diff, Environment};
use rigger_process::WaitStatus;
use rigger_retry::{Attempt, Retrier, RetryConfig};
use tracing::debug;

use crate::shell::{Exec, RunError, Shell};

/// The hook names the executor invokes, in lifecycle order.
pub const HOOK_NAMES: [&str; 10] = [
    "environment",
    "pre-checkout",
    "checkout",
    "post-checkout",
    "pre-command",
    "command",
    "post-command",
    "pre-artifact",
    "post-artifact",
    "pre-exit",
];

/// Variables whose changes are shell bookkeeping, not hook intent.
const DIFF_IGNORED: [&str; 7] = [
    "_",
    "SHLVL",
    "PWD",
    "OLDPWD",
    "SHELLOPTS",
    "BASH_SUBSHELL",
    "BUILDKITE_HOOK_EXIT_STATUS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookScope {
    Global,
    Local,
    Plugin,
}

impl std::fmt::Display for HookScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookScope::Global => f.write_str("global"),
            HookScope::Local => f.write_str("local"),
            HookScope::Plugin => f.write_str("plugin"),
        }
    }
}

/// A hook that exists on disk and is ready to run.
#[derive(Debug, Clone)]
pub struct HookDescriptor {
    pub scope: HookScope,
    pub name: String,
    pub path: PathBuf,
    pub plugin_name: Option<String>,
}

/// How a hook file gets executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookKind {
    /// Sourced through the wrapper; `shebang` is the interpreter to run
    /// the wrapper with, when the hook named one.
    Shell { shebang: Option<String> },
    /// Non-shell interpreter; executed directly via its shebang.
    Script { interpreter: String },
    /// Native executable.
    Binary,
}

/// Everything a finished hook reports back.
#[derive(Debug)]
pub struct HookOutput {
    pub status: WaitStatus,
    pub diff: Diff,
    pub changed_dir: Option<PathBuf>,
    /// The post-hook environment dump never appeared: the hook left via
    /// `exit()` inside the sourced script. Changes must not be applied.
    pub early_exit: bool,
}

/// Locate a hook called `name` in `dir`. Zero-length files are treated
/// as absent.
pub fn find_hook(dir: &Path, name: &str) -> Option<PathBuf> {
    let mut candidates = vec![dir.join(name)];
    if cfg!(windows) {
        for ext in ["bat", "cmd", "ps1", "exe"] {
            candidates.push(dir.join(format!("{name}.{ext}")));
        }
    }
    candidates.into_iter().find(|p| {
        p.is_file() && std::fs::metadata(p).map(|m| m.len() > 0).unwrap_or(false)
    })
}

const POSIX_SHELLS: [&str; 5] = ["sh", "bash", "dash", "ksh", "zsh"];

/// Classify a hook file by its first line.
pub fn classify(path: &Path) -> Result<HookKind> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read hook {}", path.display()))?;

    if let Some(rest) = bytes.strip_prefix(b"#!") {
        let line_end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        let line = String::from_utf8_lossy(&rest[..line_end]).trim().to_string();
        let mut tokens = line.split_whitespace();
        let first = tokens.next().unwrap_or_default();
        let mut interpreter = first.rsplit('/').next().unwrap_or_default().to_string();
        if interpreter == "env" {
            interpreter = tokens.next().unwrap_or_default().to_string();
        }
        if POSIX_SHELLS.contains(&interpreter.as_str()) {
            return Ok(HookKind::Shell { shebang: Some(line) });
        }
        return Ok(HookKind::Script { interpreter });
    }

    // No shebang: a NUL early in the file means a native executable;
    // anything else is a plain shell fragment.
    if bytes.iter().take(256).any(|&b| b == 0) {
        return Ok(HookKind::Binary);
    }
    Ok(HookKind::Shell { shebang: None })
}

/// Execute `hook`, returning its status and any captured environment
/// and working-directory changes. Missing hooks are the caller's
/// concern; `hook.path` must exist.
pub fn run_hook(
    shell: &mut Shell,
    hook: &HookDescriptor,
    extra_env: &Environment,
    pty: bool,
) -> Result<HookOutput> {
    let mut env = extra_env.clone();
    env.set("BUILDKITE_HOOK_PHASE", hook.name.clone());
    env.set("BUILDKITE_HOOK_PATH", hook.path.display().to_string());
    env.set("BUILDKITE_HOOK_SCOPE", hook.scope.to_string());

    match classify(&hook.path)? {
        HookKind::Shell { shebang } => run_wrapped(shell, hook, &env, pty, shebang),
        HookKind::Script { interpreter } => {
            if cfg!(windows) {
                anyhow::bail!(
                    "hook {} has a {} shebang; script hooks are not supported on Windows",
                    hook.path.display(),
                    interpreter
                );
            }
            run_direct(shell, hook, &env, pty)
        }
        HookKind::Binary => run_direct(shell, hook, &env, pty),
    }
}

fn run_direct(
    shell: &mut Shell,
    hook: &HookDescriptor,
    env: &Environment,
    pty: bool,
) -> Result<HookOutput> {
    let status = spawn_with_retry(shell, &hook.path, env, pty)?;
    Ok(HookOutput {
        status,
        diff: Diff::default(),
        changed_dir: None,
        early_exit: false,
    })
}

fn run_wrapped(
    shell: &mut Shell,
    hook: &HookDescriptor,
    env: &Environment,
    pty: bool,
    shebang: Option<String>,
) -> Result<HookOutput> {
    let scratch = tempfile::Builder::new()
        .prefix("hook-wrapper")
        .tempdir()
        .context("failed to create hook wrapper dir")?;
    let before_path = scratch.path().join("before.env");
    let after_path = scratch.path().join("after.env");
    let wd_path = scratch.path().join("wd");
    let wrapper_path = scratch.path().join(wrapper_file_name());

    write_wrapper(
        &wrapper_path,
        &hook.path,
        &before_path,
        &after_path,
        &wd_path,
        shebang.as_deref(),
    )?;

    debug!(hook = %hook.path.display(), wrapper = %wrapper_path.display(), "running wrapped shell hook");
    let status = spawn_with_retry(shell, &wrapper_path, env, pty)?;

    let after_dump = std::fs::read_to_string(&after_path).unwrap_or_default();
    if after_dump.is_empty() {
        // The sourced hook called exit(); the wrapper never reached its
        // post-hook dumps.
        return Ok(HookOutput {
            status,
            diff: Diff::default(),
            changed_dir: None,
            early_exit: true,
        });
    }

    let before_dump = std::fs::read_to_string(&before_path).unwrap_or_default();
    let before = Environment::parse_dump(&before_dump);
    let after = Environment::parse_dump(&after_dump);
    let mut diff = after.diff(&before);
    diff.added.retain(|(k, _)| !DIFF_IGNORED.contains(&k.as_str()));
    diff.changed.retain(|(k, _)| !DIFF_IGNORED.contains(&k.as_str()));
    diff.removed.retain(|k| !DIFF_IGNORED.contains(&k.as_str()));

    let changed_dir = std::fs::read_to_string(&wd_path)
        .ok()
        .map(|s| PathBuf::from(s.trim()))
        .filter(|p| !p.as_os_str().is_empty() && p != shell.cwd());

    Ok(HookOutput {
        status,
        diff,
        changed_dir,
        early_exit: false,
    })
}

/// Spawn, retrying fork/exec failures: a hook file written a moment ago
/// can race the close of its writer ("text file busy").
fn spawn_with_retry(
    shell: &mut Shell,
    path: &Path,
    env: &Environment,
    pty: bool,
) -> Result<WaitStatus> {
    let retrier = Retrier::new(RetryConfig::constant(3, Duration::from_secs(1)));
    let status = retrier.run(|attempt| {
        if attempt > 1 {
            debug!(attempt, path = %path.display(), "retrying hook spawn");
        }
        let mut exec = Exec::new(path.display().to_string(), &[]);
        exec.extra_env = env.clone();
        exec.pty = pty;
        match shell.execute(exec) {
            Ok(result) => Attempt::Done(result.status),
            Err(e) => {
                if matches!(&e, RunError::Process(p) if p.is_spawn_error()) {
                    Attempt::Retry(e)
                } else {
                    Attempt::Break(e)
                }
            }
        }
    });
    status.map_err(|e| anyhow::Error::new(e).context(format!("failed to run hook {}", path.display())))
}

#[cfg(windows)]
fn wrapper_file_name() -> &'static str {
    "wrapper.bat"
}

#[cfg(not(windows))]
fn wrapper_file_name() -> &'static str {
    "wrapper"
}

#[cfg(windows)]
fn write_wrapper(
    wrapper: &Path,
    hook: &Path,
    before: &Path,
    after: &Path,
    wd: &Path,
    _shebang: Option<&str>,
) -> Result<()> {
    let content = format!(
        "@echo off\r\n\
         SET > \"{before}\"\r\n\
         CALL \"{hook}\"\r\n\
         SET BUILDKITE_HOOK_EXIT_STATUS=%ERRORLEVEL%\r\n\
         SET > \"{after}\"\r\n\
         CD > \"{wd}\"\r\n\
         EXIT %BUILDKITE_HOOK_EXIT_STATUS%\r\n",
        before = before.display(),
        hook = hook.display(),
        after = after.display(),
        wd = wd.display(),
    );
    std::fs::write(wrapper, content).context("failed to write hook wrapper")
}

#[cfg(not(windows))]
fn write_wrapper(
    wrapper: &Path,
    hook: &Path,
    before: &Path,
    after: &Path,
    wd: &Path,
    shebang: Option<&str>,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let shebang = shebang.unwrap_or("/bin/bash");
    let content = format!(
        "#!{shebang}\n\
         env > \"{before}\"\n\
         . \"{hook}\"\n\
         __hook_exit_status=$?\n\
         env > \"{after}\"\n\
         pwd > \"{wd}\"\n\
         exit $__hook_exit_status\n",
        before = before.display(),
        hook = hook.display(),
        after = after.display(),
        wd = wd.display(),
    );
    std::fs::write(wrapper, &content).context("failed to write hook wrapper")?;
    let mut perms = std::fs::metadata(wrapper)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(wrapper, perms).context("failed to chmod hook wrapper")?;
    Ok(())
}
