//! CLI adapter for the rigger job executor.
//!
//! Maps command-line flags (and the `BUILDKITE_*` environment the
//! worker passes down) into a [`rigger::JobConfig`], runs the executor,
//! and reports the job's exit code. All the real work happens in the
//! `rigger` crate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rigger::config::Phase;
use rigger::{Executor, JobConfig, NoopControlPlane, NoopTraceRecorder};
use rigger_process::Signal;

#[derive(Parser, Debug)]
#[command(name = "rigger", version)]
#[command(about = "Run a single CI job: hooks, checkout, command, artifacts, teardown")]
struct Cli {
    /// Repository to check out; empty skips all git operations.
    #[arg(long, env = "BUILDKITE_REPO", default_value = "")]
    repository: String,

    /// Branch to fetch.
    #[arg(long, env = "BUILDKITE_BRANCH", default_value = "")]
    branch: String,

    /// Commit to check out (HEAD fetches the branch tip).
    #[arg(long, env = "BUILDKITE_COMMIT", default_value = "HEAD")]
    commit: String,

    /// Custom refspec overriding branch/pull-request selection.
    #[arg(long, env = "BUILDKITE_REFSPEC", default_value = "")]
    refspec: String,

    /// Pull request number when building one; `false` or empty
    /// otherwise.
    #[arg(long, env = "BUILDKITE_PULL_REQUEST", default_value = "")]
    pull_request: String,

    /// Provider hint (e.g. github) used for pull-request refs.
    #[arg(long, env = "BUILDKITE_PIPELINE_PROVIDER", default_value = "")]
    pipeline_provider: String,

    /// The command to run.
    #[arg(long, env = "BUILDKITE_COMMAND", default_value = "")]
    command: String,

    /// Phases to run (plugin, checkout, command); repeatable. Empty
    /// runs all.
    #[arg(long = "phase")]
    phases: Vec<String>,

    /// Agent name namespacing plugin checkouts.
    #[arg(long, env = "BUILDKITE_AGENT_NAME", default_value = "")]
    agent_name: String,

    #[arg(long, env = "BUILDKITE_ORGANIZATION_SLUG", default_value = "")]
    org_slug: String,

    #[arg(long, env = "BUILDKITE_PIPELINE_SLUG", default_value = "")]
    pipeline_slug: String,

    /// Root for build checkouts.
    #[arg(long, env = "BUILDKITE_BUILD_PATH", default_value = ".")]
    build_path: PathBuf,

    /// Root for repository mirrors; omit to disable mirrors.
    #[arg(long, env = "BUILDKITE_GIT_MIRRORS_PATH")]
    git_mirrors_path: Option<PathBuf>,

    /// Root for plugin checkouts.
    #[arg(long, env = "BUILDKITE_PLUGINS_PATH", default_value = "plugins")]
    plugins_path: PathBuf,

    /// Directory holding global hooks.
    #[arg(long, env = "BUILDKITE_HOOKS_PATH", default_value = "hooks")]
    hooks_path: PathBuf,

    /// Plugin specification JSON.
    #[arg(long, env = "BUILDKITE_PLUGINS", default_value = "")]
    plugins: String,

    /// Run the command under a PTY.
    #[arg(long, env = "BUILDKITE_PTY")]
    pty: bool,

    /// Signal sent on interrupt (TERM, INT, HUP, QUIT, KILL).
    #[arg(long, env = "BUILDKITE_CANCEL_SIGNAL", default_value = "SIGTERM")]
    cancel_signal: String,

    /// How long a child may outlive the interrupt signal before a hard
    /// kill (e.g. 9s, 500ms).
    #[arg(long, env = "BUILDKITE_SIGNAL_GRACE_PERIOD", default_value = "9s")]
    signal_grace_period: String,

    /// Deadline for acquiring mirror locks.
    #[arg(long, default_value = "300s")]
    mirror_lock_timeout: String,

    /// Disallow evaluating the command through the shell; command lines
    /// must name script files instead.
    #[arg(long)]
    no_command_eval: bool,

    /// Disable hooks checked in to the repository.
    #[arg(long)]
    no_local_hooks: bool,

    /// Record git commands instead of running anything.
    #[arg(long)]
    dry_run: bool,
}

/// Parse arguments, run one job, and return its exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut phases = Vec::new();
    for name in &cli.phases {
        phases.push(
            Phase::parse(name).with_context(|| format!("unknown phase: {name}"))?,
        );
    }

    let config = JobConfig {
        repository: cli.repository,
        branch: cli.branch,
        commit: cli.commit,
        refspec: cli.refspec,
        pull_request: cli.pull_request.parse().ok(),
        pipeline_provider: cli.pipeline_provider,
        command: cli.command,
        phases,
        agent_name: cli.agent_name,
        org_slug: cli.org_slug,
        pipeline_slug: cli.pipeline_slug,
        build_path: cli.build_path,
        mirrors_path: cli.git_mirrors_path,
        plugins_path: cli.plugins_path,
        hooks_path: cli.hooks_path,
        plugins: cli.plugins,
        run_in_pty: cli.pty,
        interrupt_signal: Signal::parse(&cli.cancel_signal)
            .with_context(|| format!("unknown signal: {}", cli.cancel_signal))?,
        signal_grace_period: humantime::parse_duration(&cli.signal_grace_period)
            .context("invalid --signal-grace-period")?,
        mirror_lock_timeout: humantime::parse_duration(&cli.mirror_lock_timeout)
            .context("invalid --mirror-lock-timeout")?,
        command_eval: !cli.no_command_eval,
        local_hooks_enabled: !cli.no_local_hooks,
        dry_run: cli.dry_run,
        ..JobConfig::default()
    };

    let mut executor = Executor::new(
        config,
        Box::new(std::io::stdout()),
        Box::new(NoopControlPlane),
        Box::new(NoopTraceRecorder),
    );
    let code = executor.run();
    tracing::debug!(code, "job finished");
    Ok(code)
}
