//! The local mirror cache of remote repositories.
//!
//! Every worker process on a host shares one mirror tree; a bare
//! `--mirror` clone per remote makes later fetches and submodule
//! updates near-instant. Creation and mutation are serialised across
//! processes with a pair of lock files per mirror, and a mirror that
//! already contains the wanted commit is used as-is without touching
//! the network.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rigger_retry::{Attempt, Retrier, RetryConfig};
use tracing::debug;

use crate::git::{FetchTarget, GitError, classify_fetch, split_flags};
use crate::logger::JobLogger;
use crate::shell::{Exec, Shell};

/// Stable directory name for a remote URL: every non-alphanumeric rune
/// becomes `-`.
pub fn stable_dir_name(url: &str) -> String {
    url.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect()
}

/// What a mirror is being prepared for.
#[derive(Debug)]
pub enum MirrorTarget<'a> {
    /// The job's main repository: skip the update when `commit` is
    /// already present, otherwise fetch `target`.
    Main {
        commit: &'a str,
        target: &'a FetchTarget,
    },
    /// A submodule mirror: fetch everything origin advertises.
    Submodule,
}

/// Manages the mirror directory tree for one job.
pub struct MirrorManager {
    root: PathBuf,
    lock_timeout: Duration,
    skip_update: bool,
    clone_mirror_flags: String,
}

impl MirrorManager {
    pub fn new(root: PathBuf, config: &crate::config::JobConfig) -> Self {
        Self {
            root,
            lock_timeout: config.mirror_lock_timeout,
            skip_update: config.git_mirrors_skip_update,
            clone_mirror_flags: config.git_clone_mirror_flags.clone(),
        }
    }

    /// Path a mirror of `url` would live at.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.root.join(stable_dir_name(url))
    }

    /// Ensure a mirror of `repository` exists and is fresh enough,
    /// returning its path. `None` means no usable mirror (skip-update
    /// mode with nothing cached); the caller falls back to a plain
    /// clone.
    pub fn get_or_update(
        &self,
        shell: &mut Shell,
        logger: &mut dyn JobLogger,
        repository: &str,
        target: MirrorTarget<'_>,
    ) -> Result<Option<PathBuf>, GitError> {
        let dir = self.path_for(repository);

        if self.skip_update {
            return Ok(dir.is_dir().then_some(dir));
        }

        if !dir.is_dir() {
            self.clone_mirror(shell, repository, &dir)?;
            return Ok(Some(dir));
        }

        match target {
            MirrorTarget::Main { commit, target } => {
                if has_commit(shell, &dir, commit) {
                    debug!(mirror = %dir.display(), commit, "mirror already has commit");
                    return Ok(Some(dir));
                }
                self.update_mirror(shell, logger, repository, &dir, commit, target)?;
                Ok(Some(dir))
            }
            MirrorTarget::Submodule => {
                let lock_path = lock_name(&dir, "updatelock");
                let _lock = shell.lock_file(&lock_path, self.lock_timeout)?;
                fetch_with_retry(shell, &dir, &["origin".to_string()])?;
                Ok(Some(dir))
            }
        }
    }

    fn clone_mirror(&self, shell: &mut Shell, repository: &str, dir: &Path) -> Result<(), GitError> {
        let lock_path = lock_name(dir, "clonelock");
        let _lock = shell.lock_file(&lock_path, self.lock_timeout)?;

        // Another process may have cloned while this one waited.
        if dir.is_dir() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.root)
            .map_err(|e| GitError::Other(anyhow::Error::new(e).context("creating mirrors root")))?;

        let mut args = vec!["clone".to_string(), "--mirror".to_string()];
        args.extend(split_flags(&self.clone_mirror_flags));
        args.push("--".to_string());
        args.push(repository.to_string());
        args.push(dir.display().to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        if let Err(e) = shell.run("git", &arg_refs) {
            // A partial clone would poison every later job on this host.
            let _ = std::fs::remove_dir_all(dir);
            return Err(GitError::from_run("clone --mirror", e));
        }
        Ok(())
    }

    fn update_mirror(
        &self,
        shell: &mut Shell,
        logger: &mut dyn JobLogger,
        repository: &str,
        dir: &Path,
        commit: &str,
        target: &FetchTarget,
    ) -> Result<(), GitError> {
        let lock_path = lock_name(dir, "updatelock");
        let _lock = shell.lock_file(&lock_path, self.lock_timeout)?;

        // Another process may have fetched the commit while this one
        // waited on the lock.
        if has_commit(shell, dir, commit) {
            return Ok(());
        }

        let git_dir = dir.display().to_string();
        let current_url = shell
            .run_and_capture("git", &["--git-dir", &git_dir, "remote", "get-url", "origin"])
            .unwrap_or_default();
        let rewritten = !current_url.is_empty() && current_url != repository;
        if rewritten {
            logger.info(&format!(
                "Mirror remote moved from {current_url} to {repository}, updating"
            ));
            shell
                .run("git", &["--git-dir", &git_dir, "remote", "set-url", "origin", repository])
                .map_err(|e| GitError::from_run("remote set-url", e))?;
        }

        let refspec = target.refspec();
        match fetch_with_retry(shell, dir, &["origin".to_string(), refspec.clone()]) {
            Ok(()) => {}
            Err(GitError::FetchBadReference { .. }) if target.retry_on_bad_reference() => {
                // Pull-request head refs appear asynchronously; give the
                // remote a few more chances before falling back.
                let retrier = Retrier::new(RetryConfig::constant(3, Duration::from_secs(1)));
                let refetch = retrier.run(|attempt| {
                    debug!(attempt, %refspec, "re-fetching pull request ref");
                    match fetch_once(shell, dir, &["origin".to_string(), refspec.clone()]) {
                        Ok(()) => Attempt::Done(()),
                        Err(e @ GitError::FetchBadReference { .. }) => Attempt::Retry(e),
                        Err(e) => Attempt::Break(e),
                    }
                });
                match refetch {
                    Ok(()) => {}
                    Err(GitError::FetchBadReference { .. }) => {
                        self.fetch_default_refspec(shell, logger, dir)?;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(GitError::FetchBadReference { .. }) => {
                self.fetch_default_refspec(shell, logger, dir)?;
            }
            Err(e) => return Err(e),
        }

        if rewritten {
            // Self-check after pointing at a different remote; failures
            // are survivable.
            if let Err(e) = shell.run("git", &["--git-dir", &git_dir, "fsck"]) {
                logger.warn(&format!("git fsck on rewritten mirror failed: {e}"));
            }
            if let Err(e) = shell.run("git", &["--git-dir", &git_dir, "gc"]) {
                logger.warn(&format!("git gc on rewritten mirror failed: {e}"));
            }
        }
        Ok(())
    }

    /// Bad-reference fallback: fetch the remote's configured default
    /// refspec plus all tags.
    fn fetch_default_refspec(
        &self,
        shell: &mut Shell,
        logger: &mut dyn JobLogger,
        dir: &Path,
    ) -> Result<(), GitError> {
        let git_dir = dir.display().to_string();
        let default_refspec = shell
            .run_and_capture("git", &["--git-dir", &git_dir, "config", "remote.origin.fetch"])
            .map_err(|e| GitError::from_run("config remote.origin.fetch", e))?;
        logger.info(&format!(
            "Fetch of requested ref failed, falling back to {default_refspec} and tags"
        ));
        fetch_with_retry(
            shell,
            dir,
            &[
                "origin".to_string(),
                default_refspec,
                "+refs/tags/*:refs/tags/*".to_string(),
            ],
        )
    }
}

fn lock_name(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// True when the mirror already contains `commit` as a commit object.
fn has_commit(shell: &mut Shell, dir: &Path, commit: &str) -> bool {
    if commit.is_empty() || commit == "HEAD" {
        return false;
    }
    let git_dir = dir.display().to_string();
    let spec = format!("{commit}^{{commit}}");
    matches!(
        shell.run_and_capture("git", &["--git-dir", &git_dir, "cat-file", "-t", &spec]),
        Ok(kind) if kind == "commit"
    )
}

fn fetch_once(shell: &mut Shell, dir: &Path, refspecs: &[String]) -> Result<(), GitError> {
    let git_dir = dir.display().to_string();
    let mut args = vec!["--git-dir".to_string(), git_dir, "fetch".to_string(), "--".to_string()];
    args.extend(refspecs.iter().cloned());

    let mut exec = Exec::new("git", &[]);
    exec.args = args;
    exec.tee = true;
    let result = shell.execute(exec).map_err(|e| GitError::from_run("fetch", e))?;
    match result.status {
        rigger_process::WaitStatus::Signaled(signal) => Err(GitError::Signaled { signal }),
        rigger_process::WaitStatus::Exited(code) if code != 0 => {
            Err(classify_fetch(&result.output, crate::shell::RunError::Exit { code }))
        }
        _ => Ok(()),
    }
}

/// Fetch with constant one-second backoff on transient errors.
/// Bad-reference and bad-object classifications are not transient; they
/// surface immediately for the caller to route. A transient error that
/// exhausts its attempts here is marked already-retried so the outer
/// checkout retrier does not multiply the attempts.
fn fetch_with_retry(
    shell: &mut Shell,
    dir: &Path,
    refspecs: &[String],
) -> Result<(), GitError> {
    let retrier = Retrier::new(RetryConfig::constant(3, Duration::from_secs(1)));
    retrier
        .run(|attempt| {
            if attempt > 1 {
                debug!(attempt, mirror = %dir.display(), "retrying mirror fetch");
            }
            match fetch_once(shell, dir, refspecs) {
                Ok(()) => Attempt::Done(()),
                Err(e @ (GitError::FetchBadReference { .. } | GitError::FetchBadObject { .. })) => {
                    Attempt::Break(e)
                }
                Err(e @ GitError::Signaled { .. }) => Attempt::Break(e),
                Err(e) => Attempt::Retry(e),
            }
        })
        .map_err(|e| match e {
            e @ (GitError::FetchBadReference { .. }
            | GitError::FetchBadObject { .. }
            | GitError::Signaled { .. }
            | GitError::Lock(_)) => e,
            other => other.already_retried(),
        })
}
