//! Git invocation helpers shared by the mirror manager and the
//! checkout engine: error classification, flag tokenisation, and remote
//! host handling for `ssh-keyscan`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rigger_lock::LockError;
use thiserror::Error;

use crate::shell::{RunError, Shell};

/// Classified git failures. The checkout retrier's routing table keys
/// off these variants.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git child died from a signal; the job is being interrupted.
    #[error("git interrupted by signal {signal}")]
    Signaled { signal: i32 },
    /// A git subcommand exited non-zero, with no finer classification.
    #[error("git {op} failed with exit status {code}")]
    Command { op: &'static str, code: i32 },
    /// Fetch failed because the requested ref does not exist (yet);
    /// handled by the fallback fetch rather than cleanup.
    #[error("git fetch failed: reference not found")]
    FetchBadReference { code: i32 },
    /// Fetch failed on a corrupt or missing object; checkout removal
    /// and re-clone is the cure.
    #[error("git fetch failed: bad object")]
    FetchBadObject { code: i32 },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    /// Wrapper marking an error that already consumed an inner retry;
    /// the outer retrier must not try again.
    #[error("{inner} (already retried)")]
    AlreadyRetried { inner: Box<GitError> },
}

impl GitError {
    /// Map a shell-level failure of a git subcommand.
    pub fn from_run(op: &'static str, err: RunError) -> Self {
        match err {
            RunError::Signaled { signal } => GitError::Signaled { signal },
            RunError::Exit { code } => GitError::Command { op, code },
            other => GitError::Other(anyhow::Error::new(other).context(format!("git {op}"))),
        }
    }

    /// Exit code the job reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            GitError::Lock(LockError::TimedOut { .. }) => 94,
            GitError::Signaled { .. } => -1,
            GitError::AlreadyRetried { inner } => inner.exit_code(),
            _ => 1,
        }
    }

    pub fn already_retried(self) -> Self {
        match self {
            already @ GitError::AlreadyRetried { .. } => already,
            other => GitError::AlreadyRetried { inner: Box::new(other) },
        }
    }

    pub fn is_already_retried(&self) -> bool {
        matches!(self, GitError::AlreadyRetried { .. })
    }
}

/// Classify a failed fetch from its combined output.
pub fn classify_fetch(output: &str, err: RunError) -> GitError {
    let code = match &err {
        RunError::Exit { code } => *code,
        _ => return GitError::from_run("fetch", err),
    };
    let lower = output.to_lowercase();
    if lower.contains("couldn't find remote ref")
        || lower.contains("unknown revision or path not in the working tree")
        || (lower.contains("remote branch") && lower.contains("not found"))
    {
        GitError::FetchBadReference { code }
    } else if lower.contains("bad object") {
        GitError::FetchBadObject { code }
    } else {
        GitError::Command { op: "fetch", code }
    }
}

/// What to fetch for the main repository. The same selection drives
/// both the mirror update and the working-tree fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    /// An explicitly configured refspec.
    Refspec(String),
    /// GitHub pull-request head; creation is asynchronous upstream, so
    /// a missing ref is worth retrying.
    PullRequestHead { number: u64 },
    /// GitHub pull-request merge ref; either it exists or it never
    /// will, so no retry.
    PullRequestMerge { number: u64 },
    Branch(String),
}

impl FetchTarget {
    pub fn from_config(config: &crate::config::JobConfig) -> Self {
        if !config.refspec.is_empty() {
            return FetchTarget::Refspec(config.refspec.clone());
        }
        if let Some(number) = config.pull_request
            && config.pipeline_provider.to_lowercase().contains("github")
        {
            return if config.pull_request_merge {
                FetchTarget::PullRequestMerge { number }
            } else {
                FetchTarget::PullRequestHead { number }
            };
        }
        FetchTarget::Branch(config.branch.clone())
    }

    /// The refspec argument handed to `git fetch`.
    pub fn refspec(&self) -> String {
        match self {
            FetchTarget::Refspec(r) => r.clone(),
            FetchTarget::PullRequestHead { number } => format!("refs/pull/{number}/head"),
            FetchTarget::PullRequestMerge { number } => format!("refs/pull/{number}/merge"),
            FetchTarget::Branch(b) => b.clone(),
        }
    }

    /// Whether a bad-reference failure should be retried before falling
    /// back.
    pub fn retry_on_bad_reference(&self) -> bool {
        matches!(self, FetchTarget::PullRequestHead { .. })
    }
}

/// Split a flag string into argv tokens, honouring single and double
/// quotes: `-v --depth=1 --config 'a b'` → three tokens plus `a b`.
pub fn split_flags(flags: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut pending = false;

    for c in flags.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    pending = true;
                }
                c if c.is_whitespace() => {
                    if pending || !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                        pending = false;
                    }
                }
                c => current.push(c),
            },
        }
    }
    if pending || !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// SSH host (and optional port) of a git remote, when one is reachable
/// over SSH. HTTP(S) and local remotes need no key scanning.
pub fn repository_host(url: &str) -> Option<(String, Option<u16>)> {
    if let Some(rest) = url
        .strip_prefix("ssh://")
        .or_else(|| url.strip_prefix("git://"))
    {
        let authority = rest.split('/').next()?;
        let host_port = authority.rsplit('@').next()?;
        return match host_port.split_once(':') {
            Some((host, port)) => {
                let port = port.parse().ok()?;
                Some((host.to_string(), Some(port)))
            }
            None => Some((host_port.to_string(), None)),
        };
    }
    if url.contains("://") {
        return None;
    }
    // scp-like syntax: [user@]host:path
    let (authority, _path) = url.split_once(':')?;
    let host = authority.rsplit('@').next()?;
    if host.is_empty() || host.contains('/') {
        return None;
    }
    Some((host.to_string(), None))
}

/// Scan the remote's host key and append it to `known_hosts` when the
/// host is not already listed. Concurrent jobs serialise on a file
/// lock next to the known_hosts file.
pub fn add_host_to_known_hosts(shell: &mut Shell, repository: &str, known_hosts: PathBuf) -> Result<()> {
    let Some((host, port)) = repository_host(repository) else {
        return Ok(());
    };

    let _lock = shell
        .lock_file(&known_hosts, Duration::from_secs(30))
        .context("failed to lock known_hosts")?;

    let existing = std::fs::read_to_string(&known_hosts).unwrap_or_default();
    if existing.lines().any(|l| l.split_whitespace().next().is_some_and(|h| host_entry_matches(h, &host))) {
        return Ok(());
    }

    let port_arg = port.map(|p| p.to_string());
    let mut args: Vec<&str> = Vec::new();
    if let Some(p) = &port_arg {
        args.push("-p");
        args.push(p);
    }
    args.push(&host);

    let keys = shell
        .run_and_capture("ssh-keyscan", &args)
        .with_context(|| format!("ssh-keyscan failed for {host}"))?;
    if keys.is_empty() {
        return Ok(());
    }

    if let Some(parent) = known_hosts.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut contents = existing;
    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    contents.push_str(&keys);
    contents.push('\n');
    std::fs::write(&known_hosts, contents)
        .with_context(|| format!("failed to write {}", known_hosts.display()))?;
    Ok(())
}

fn host_entry_matches(entry: &str, host: &str) -> bool {
    entry
        .split(',')
        .any(|e| e == host || e.strip_prefix('[').and_then(|e| e.split(']').next()).is_some_and(|e| e == host))
}
