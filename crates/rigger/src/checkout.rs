//! The working-tree checkout engine.
//!
//! Drives clone/fetch/checkout against the job's checkout directory,
//! referencing the shared mirror cache when one is configured. A
//! corrupted tree is healed by removing the directory and retrying;
//! interrupts, lock timeouts, and errors that already consumed their
//! retry break out immediately.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use rigger_retry::{Attempt, Retrier, RetryConfig};
use rigger_lock::LockError;
use tracing::debug;

use crate::config::JobConfig;
use crate::control::ControlPlane;
use crate::git::{self, FetchTarget, GitError, classify_fetch, split_flags};
use crate::logger::JobLogger;
use crate::mirror::{MirrorManager, MirrorTarget};
use crate::shell::{Exec, RunError, Shell};

/// Key commit metadata is pushed under, guarded by an existence check
/// so retried jobs do not duplicate it.
const COMMIT_METADATA_KEY: &str = "buildkite:git:commit";

pub struct CheckoutEngine<'a> {
    pub config: &'a JobConfig,
    pub mirrors: Option<&'a MirrorManager>,
    pub cancel: Arc<AtomicBool>,
}

impl CheckoutEngine<'_> {
    /// Run the full checkout: precondition is that the checkout
    /// directory exists and the shell is inside it.
    pub fn run(
        &self,
        shell: &mut Shell,
        logger: &mut dyn JobLogger,
        control: &dyn ControlPlane,
    ) -> Result<(), GitError> {
        let dir = self.config.checkout_dir();
        let retrier = Retrier::new(RetryConfig::constant(3, Duration::from_secs(2)))
            .with_cancel(self.cancel.clone());

        retrier.run(|attempt| {
            if attempt > 1 {
                logger.info(&format!("Retrying checkout (attempt {attempt})"));
            }
            match self.checkout_once(shell, logger, control) {
                Ok(()) => Attempt::Done(()),
                Err(e @ GitError::Signaled { .. }) => {
                    logger.warn("Checkout was interrupted by a signal");
                    Attempt::Break(e)
                }
                Err(e @ GitError::Lock(LockError::TimedOut { .. })) => {
                    logger.warn(&format!("{e}"));
                    Attempt::Break(e)
                }
                Err(e @ GitError::Lock(LockError::Cancelled { .. })) => {
                    logger.warn("Checkout was cancelled");
                    Attempt::Break(e)
                }
                Err(e) if e.is_already_retried() => Attempt::Break(e),
                Err(e) => {
                    logger.warn(&format!("Checkout failed ({e}), removing {} and retrying", dir.display()));
                    if let Err(remove_err) = remove_and_recreate(shell, &dir) {
                        logger.warn(&format!("Could not reset checkout dir: {remove_err}"));
                    }
                    Attempt::Retry(e)
                }
            }
        })
    }

    fn checkout_once(
        &self,
        shell: &mut Shell,
        logger: &mut dyn JobLogger,
        control: &dyn ControlPlane,
    ) -> Result<(), GitError> {
        let config = self.config;
        let repository = config.repository.as_str();

        if config.ssh_keyscan
            && let Some(home) = shell.env.get("HOME").map(PathBuf::from)
            && let Err(e) = git::add_host_to_known_hosts(shell, repository, home.join(".ssh/known_hosts"))
        {
            logger.warn(&format!("Could not scan repository host key: {e:#}"));
        }

        let target = FetchTarget::from_config(config);

        let mirror = match self.mirrors {
            Some(mirrors) => {
                let got = mirrors.get_or_update(
                    shell,
                    logger,
                    repository,
                    MirrorTarget::Main { commit: &config.commit, target: &target },
                )?;
                if let Some(path) = &got {
                    shell.env.set("BUILDKITE_REPO_MIRROR", path.display().to_string());
                }
                got
            }
            None => None,
        };

        if shell.cwd().join(".git").exists() {
            // Existing checkout; repoint origin in case the pipeline's
            // repository moved.
            shell
                .run("git", &["remote", "set-url", "origin", repository])
                .map_err(|e| GitError::from_run("remote set-url", e))?;
        } else {
            self.clone_repository(shell, repository, mirror.as_deref())?;
        }

        self.clean(shell)?;
        self.fetch(shell, logger, &target)?;
        self.checkout_commit(shell)?;

        if config.git_submodules && shell.cwd().join(".gitmodules").exists() {
            self.update_submodules(shell, logger)?;
        }

        // Submodule updates can dirty the tree again.
        self.clean(shell)?;

        if let Err(e) = self.push_commit_metadata(shell, control) {
            logger.warn(&format!("Could not push commit metadata: {e}"));
        }
        Ok(())
    }

    fn clone_repository(
        &self,
        shell: &mut Shell,
        repository: &str,
        mirror: Option<&Path>,
    ) -> Result<(), GitError> {
        let mut args = vec!["clone".to_string()];
        args.extend(split_flags(&self.config.git_clone_flags));
        if let Some(mirror) = mirror {
            args.push("--reference".to_string());
            args.push(mirror.display().to_string());
        }
        args.push("--".to_string());
        args.push(repository.to_string());
        args.push(".".to_string());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        shell.run("git", &refs).map_err(|e| GitError::from_run("clone", e))
    }

    fn clean(&self, shell: &mut Shell) -> Result<(), GitError> {
        let mut args = vec!["clean".to_string()];
        args.extend(split_flags(&self.config.git_clean_flags));
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        shell.run("git", &refs).map_err(|e| GitError::from_run("clean", e))?;

        if self.config.git_submodules && shell.cwd().join(".gitmodules").exists() {
            let mut sub = vec![
                "submodule".to_string(),
                "foreach".to_string(),
                "--recursive".to_string(),
                "git".to_string(),
                "clean".to_string(),
            ];
            sub.extend(split_flags(&self.config.git_clean_flags));
            let refs: Vec<&str> = sub.iter().map(String::as_str).collect();
            shell
                .run("git", &refs)
                .map_err(|e| GitError::from_run("clean submodules", e))?;
        }
        Ok(())
    }

    /// What the working-tree fetch asks origin for. Same enumeration as
    /// the mirror's, except a pinned non-HEAD commit is fetched
    /// directly.
    fn fetch_refspec(&self, target: &FetchTarget) -> String {
        match target {
            FetchTarget::Branch(_) if self.config.commit != "HEAD" && !self.config.commit.is_empty() => {
                self.config.commit.clone()
            }
            other => other.refspec(),
        }
    }

    fn fetch(
        &self,
        shell: &mut Shell,
        logger: &mut dyn JobLogger,
        target: &FetchTarget,
    ) -> Result<(), GitError> {
        let refspec = self.fetch_refspec(target);
        match self.fetch_origin(shell, &[refspec.clone()]) {
            Ok(()) => Ok(()),
            Err(GitError::FetchBadReference { .. }) => {
                // The named ref (often a short or freshly-pushed commit)
                // is not directly fetchable; fall back to the remote's
                // default refspec plus tags and let checkout resolve it.
                let default_refspec = shell
                    .run_and_capture("git", &["config", "remote.origin.fetch"])
                    .map_err(|e| GitError::from_run("config remote.origin.fetch", e))?;
                logger.info(&format!(
                    "{refspec} is not directly fetchable, falling back to {default_refspec} and tags"
                ));
                self.fetch_origin(shell, &[default_refspec, "+refs/tags/*:refs/tags/*".to_string()])
            }
            Err(e) => Err(e),
        }
    }

    fn fetch_origin(&self, shell: &mut Shell, refspecs: &[String]) -> Result<(), GitError> {
        let mut args = vec!["fetch".to_string()];
        args.extend(split_flags(&self.config.git_fetch_flags));
        args.push("--".to_string());
        args.push("origin".to_string());
        args.extend(refspecs.iter().cloned());

        let mut exec = Exec::new("git", &[]);
        exec.args = args;
        exec.tee = true;
        let result = shell.execute(exec).map_err(|e| GitError::from_run("fetch", e))?;
        match result.status {
            rigger_process::WaitStatus::Signaled(signal) => Err(GitError::Signaled { signal }),
            rigger_process::WaitStatus::Exited(code) if code != 0 => {
                Err(classify_fetch(&result.output, RunError::Exit { code }))
            }
            _ => Ok(()),
        }
    }

    fn checkout_commit(&self, shell: &mut Shell) -> Result<(), GitError> {
        let commit = if self.config.commit == "HEAD" {
            "FETCH_HEAD".to_string()
        } else {
            self.config.commit.clone()
        };
        let mut args = vec!["checkout".to_string()];
        args.extend(split_flags(&self.config.git_checkout_flags));
        args.push(commit);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        shell.run("git", &refs).map_err(|e| GitError::from_run("checkout", e))
    }

    fn update_submodules(&self, shell: &mut Shell, logger: &mut dyn JobLogger) -> Result<(), GitError> {
        shell
            .run("git", &["submodule", "sync", "--recursive"])
            .map_err(|e| GitError::from_run("submodule sync", e))?;

        let listing = shell
            .run_and_capture(
                "git",
                &["config", "--file", ".gitmodules", "--get-regexp", r"submodule\..+\.url"],
            )
            .map_err(|e| GitError::from_run("submodule config", e))?;

        for (name, url) in parse_submodule_urls(&listing) {
            let mirror = match self.mirrors {
                Some(mirrors) => mirrors.get_or_update(shell, logger, &url, MirrorTarget::Submodule)?,
                None => None,
            };

            let path = shell
                .run_and_capture(
                    "git",
                    &["config", "--file", ".gitmodules", "--get", &format!("submodule.{name}.path")],
                )
                .unwrap_or_default();

            let mut args: Vec<String> = Vec::new();
            for entry in &self.config.git_submodule_clone_config {
                args.push("-c".to_string());
                args.push(entry.clone());
            }
            args.extend(
                ["submodule", "update", "--init", "--recursive", "--force"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            if let Some(mirror) = &mirror {
                args.push("--reference".to_string());
                args.push(mirror.display().to_string());
            }
            if !path.is_empty() {
                args.push("--".to_string());
                args.push(path);
            }
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            shell
                .run("git", &refs)
                .map_err(|e| GitError::from_run("submodule update", e))?;
        }

        shell
            .run("git", &["submodule", "foreach", "--recursive", "git", "reset", "--hard"])
            .map_err(|e| GitError::from_run("submodule reset", e))
    }

    /// Send `git show` details for the checked-out commit to the
    /// control plane, once per commit.
    fn push_commit_metadata(&self, shell: &mut Shell, control: &dyn ControlPlane) -> Result<(), GitError> {
        if control
            .meta_data_exists(COMMIT_METADATA_KEY)
            .map_err(GitError::Other)?
        {
            debug!("commit metadata already present, skipping");
            return Ok(());
        }
        let summary = shell
            .run_and_capture(
                "git",
                &["--no-pager", "show", "HEAD", "-s", "--no-color", "--format=fuller"],
            )
            .map_err(|e| GitError::from_run("show", e))?;
        control
            .meta_data_set(COMMIT_METADATA_KEY, &summary)
            .map_err(GitError::Other)
    }
}

fn remove_and_recreate(shell: &mut Shell, dir: &Path) -> anyhow::Result<()> {
    std::fs::remove_dir_all(dir)?;
    std::fs::create_dir_all(dir)?;
    shell.chdir(dir)?;
    Ok(())
}

/// Parse `git config --get-regexp submodule\..+\.url` output into
/// `(name, url)` pairs.
fn parse_submodule_urls(listing: &str) -> Vec<(String, String)> {
    listing
        .lines()
        .filter_map(|line| {
            let (key, url) = line.split_once(char::is_whitespace)?;
            let name = key.strip_prefix("submodule.")?.strip_suffix(".url")?;
            Some((name.to_string(), url.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::RecordingControlPlane;
    use crate::logger::MemoryLogger;
    use rigger_env::Environment;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);
    impl Write for Sink {
        fn write(&mut self, d: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(d);
            Ok(d.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn submodule_listing_parses_names_and_urls() {
        let listing = "submodule.libfoo.url git@example.com:acme/libfoo.git\n\
                       submodule.vendor/bar.url https://example.com/bar.git\n";
        let parsed = parse_submodule_urls(listing);
        assert_eq!(
            parsed,
            vec![
                ("libfoo".to_string(), "git@example.com:acme/libfoo.git".to_string()),
                ("vendor/bar".to_string(), "https://example.com/bar.git".to_string()),
            ]
        );
    }

    #[test]
    fn submodule_listing_ignores_noise() {
        assert!(parse_submodule_urls("").is_empty());
        assert!(parse_submodule_urls("unrelated line\n").is_empty());
    }

    fn dry_run_fixture(
        config: JobConfig,
    ) -> (JobConfig, Shell, MemoryLogger, RecordingControlPlane, tempfile::TempDir) {
        let td = tempfile::tempdir().expect("tempdir");
        let dir = td.path().join("checkout");
        std::fs::create_dir_all(&dir).expect("mkdir");

        let config = JobConfig {
            checkout_path: Some(dir.clone()),
            ssh_keyscan: false,
            ..config
        };
        let mut env = Environment::from_process();
        env.remove("HOME");
        let mut shell = Shell::new(
            dir,
            env,
            Box::new(Sink::default()),
            Box::new(Sink::default()),
        )
        .with_dry_run(true);
        shell.chdir(config.checkout_dir()).expect("chdir");
        (config, shell, MemoryLogger::new(), RecordingControlPlane::default(), td)
    }

    /// Scenario: fresh branch checkout at HEAD issues the canonical
    /// subcommand sequence.
    #[test]
    fn branch_checkout_issues_expected_git_sequence() {
        let (config, mut shell, mut logger, control, _td) = dry_run_fixture(JobConfig {
            repository: "/srv/git/app.git".to_string(),
            branch: "main".to_string(),
            commit: "HEAD".to_string(),
            git_clone_flags: "-v".to_string(),
            git_clean_flags: "-fdq".to_string(),
            git_fetch_flags: "-v".to_string(),
            git_checkout_flags: "-f".to_string(),
            git_submodules: false,
            ..JobConfig::default()
        });

        let engine = CheckoutEngine {
            config: &config,
            mirrors: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        engine.run(&mut shell, &mut logger, &control).expect("checkout");

        let log: Vec<String> = shell.command_log().iter().map(|argv| argv.join(" ")).collect();
        assert_eq!(
            log,
            vec![
                "git clone -v -- /srv/git/app.git .",
                "git clean -fdq",
                "git fetch -v -- origin main",
                "git checkout -f FETCH_HEAD",
                "git clean -fdq",
                "git --no-pager show HEAD -s --no-color --format=fuller",
            ]
        );
        // Commit metadata reached the control plane.
        assert_eq!(control.meta_data.lock().unwrap().len(), 1);
    }

    /// Scenario: a pinned commit is fetched directly instead of the
    /// branch.
    #[test]
    fn pinned_commit_is_fetched_directly() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let (config, mut shell, mut logger, control, _td) = dry_run_fixture(JobConfig {
            repository: "/srv/git/app.git".to_string(),
            branch: "update-test-txt".to_string(),
            commit: sha.to_string(),
            git_submodules: false,
            ..JobConfig::default()
        });

        let engine = CheckoutEngine {
            config: &config,
            mirrors: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        engine.run(&mut shell, &mut logger, &control).expect("checkout");

        let log: Vec<String> = shell.command_log().iter().map(|argv| argv.join(" ")).collect();
        assert!(log.iter().any(|l| l.contains(&format!("origin {sha}"))), "{log:?}");
        assert!(log.iter().any(|l| l.contains(&format!("checkout -f {sha}"))), "{log:?}");
    }

    /// Scenario: GitHub pull request fetches the PR head ref.
    #[test]
    fn github_pull_request_fetches_pull_ref() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let (config, mut shell, mut logger, control, _td) = dry_run_fixture(JobConfig {
            repository: "/srv/git/app.git".to_string(),
            branch: "update-test-txt".to_string(),
            commit: sha.to_string(),
            pull_request: Some(123),
            pipeline_provider: "github".to_string(),
            git_submodules: false,
            ..JobConfig::default()
        });

        let engine = CheckoutEngine {
            config: &config,
            mirrors: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        engine.run(&mut shell, &mut logger, &control).expect("checkout");

        let log: Vec<String> = shell.command_log().iter().map(|argv| argv.join(" ")).collect();
        assert!(
            log.iter().any(|l| l.contains("origin refs/pull/123/head")),
            "{log:?}"
        );
        assert!(log.iter().any(|l| l.contains(&format!("checkout -f {sha}"))), "{log:?}");
    }

    /// Scenario: an existing `.git` repoints origin instead of
    /// recloning.
    #[test]
    fn existing_checkout_repoints_origin() {
        let (config, mut shell, mut logger, control, _td) = dry_run_fixture(JobConfig {
            repository: "/srv/git/renamed.git".to_string(),
            branch: "main".to_string(),
            commit: "HEAD".to_string(),
            git_submodules: false,
            ..JobConfig::default()
        });
        std::fs::create_dir_all(config.checkout_dir().join(".git")).expect("fake .git");

        let engine = CheckoutEngine {
            config: &config,
            mirrors: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        engine.run(&mut shell, &mut logger, &control).expect("checkout");

        let log: Vec<String> = shell.command_log().iter().map(|argv| argv.join(" ")).collect();
        assert_eq!(log[0], "git remote set-url origin /srv/git/renamed.git");
        assert!(log.iter().all(|l| !l.starts_with("git clone")), "{log:?}");
    }
}
