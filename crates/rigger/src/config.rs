//! Job configuration: a flat record fixed at job acceptance, plus the
//! environment overlay that lets hooks adjust a recognised subset of it
//! mid-job.
//!
//! The overlay is a single explicit match over known variable names and
//! returns the list of keys it changed, so the executor can log what a
//! hook reconfigured.

use std::path::PathBuf;
use std::time::Duration;

use rigger_env::Environment;
use rigger_process::Signal;

/// A top-level phase that can be switched off per job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Plugin,
    Checkout,
    Command,
}

impl Phase {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "plugin" | "plugins" => Some(Phase::Plugin),
            "checkout" => Some(Phase::Checkout),
            "command" => Some(Phase::Command),
            _ => None,
        }
    }
}

/// Immutable-for-the-job configuration record.
///
/// `apply_env_overlay` is the only sanctioned mutation path after boot.
#[derive(Debug, Clone)]
pub struct JobConfig {
    // Job identity.
    pub job_id: String,
    pub build_id: String,
    pub agent_name: String,
    pub org_slug: String,
    pub pipeline_slug: String,
    pub branch: String,
    pub commit: String,
    pub tag: String,
    /// Custom refspec overriding branch/PR fetch selection.
    pub refspec: String,
    pub pull_request: Option<u64>,
    /// Fetch `refs/pull/<n>/merge` instead of `/head`.
    pub pull_request_merge: bool,
    /// Provider hint, e.g. `github`.
    pub pipeline_provider: String,

    pub repository: String,
    pub command: String,
    /// Phases to run; empty means all.
    pub phases: Vec<Phase>,

    // Behaviour flags.
    pub clean_checkout: bool,
    pub skip_checkout: bool,
    pub command_eval: bool,
    pub local_hooks_enabled: bool,
    pub strict_single_hooks: bool,
    pub run_in_pty: bool,
    pub git_submodules: bool,
    pub ssh_keyscan: bool,
    pub git_mirrors_skip_update: bool,
    pub plugins_always_clone_fresh: bool,
    pub plugin_validation: bool,
    pub dry_run: bool,

    // Git invocation flags.
    pub git_clone_flags: String,
    pub git_clone_mirror_flags: String,
    pub git_clean_flags: String,
    pub git_fetch_flags: String,
    pub git_checkout_flags: String,
    /// `-c key=value` entries passed to `git submodule update`.
    pub git_submodule_clone_config: Vec<String>,

    // Path roots.
    pub build_path: PathBuf,
    /// Explicit checkout dir; derived from build path when unset.
    pub checkout_path: Option<PathBuf>,
    pub sockets_path: PathBuf,
    /// Mirror cache root; `None` disables mirrors.
    pub mirrors_path: Option<PathBuf>,
    pub plugins_path: PathBuf,
    pub hooks_path: PathBuf,
    pub additional_hooks_paths: Vec<PathBuf>,
    pub bin_path: PathBuf,

    // Job API endpoint handed to hooks, when the worker provides one.
    pub job_api_socket: String,
    pub job_api_token: String,

    // Durations.
    pub signal_grace_period: Duration,
    pub mirror_lock_timeout: Duration,
    pub plugin_lock_timeout: Duration,

    /// Shell invocation template, e.g. `["/bin/bash", "-e", "-c"]`.
    pub shell_command: Vec<String>,
    pub interrupt_signal: Signal,

    /// Glob patterns over variable names whose values are redacted.
    pub redacted_vars: Vec<String>,

    // Artifact phase inputs.
    pub artifact_paths: String,
    pub artifact_upload_destination: String,

    /// Plugin specification, as the JSON document the pipeline carries.
    pub plugins: String,

    // Tracing.
    pub trace_backend: String,
    pub service_name: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            build_id: String::new(),
            agent_name: String::new(),
            org_slug: String::new(),
            pipeline_slug: String::new(),
            branch: String::new(),
            commit: String::new(),
            tag: String::new(),
            refspec: String::new(),
            pull_request: None,
            pull_request_merge: false,
            pipeline_provider: String::new(),
            repository: String::new(),
            command: String::new(),
            phases: Vec::new(),
            clean_checkout: false,
            skip_checkout: false,
            command_eval: true,
            local_hooks_enabled: true,
            strict_single_hooks: false,
            run_in_pty: false,
            git_submodules: true,
            ssh_keyscan: true,
            git_mirrors_skip_update: false,
            plugins_always_clone_fresh: false,
            plugin_validation: false,
            dry_run: false,
            git_clone_flags: "-v".to_string(),
            git_clone_mirror_flags: "-v".to_string(),
            git_clean_flags: "-ffxdq".to_string(),
            git_fetch_flags: "-v --prune".to_string(),
            git_checkout_flags: "-f".to_string(),
            git_submodule_clone_config: Vec::new(),
            build_path: PathBuf::new(),
            checkout_path: None,
            sockets_path: PathBuf::new(),
            mirrors_path: None,
            plugins_path: PathBuf::new(),
            hooks_path: PathBuf::new(),
            additional_hooks_paths: Vec::new(),
            bin_path: PathBuf::new(),
            job_api_socket: String::new(),
            job_api_token: String::new(),
            signal_grace_period: Duration::from_secs(9),
            mirror_lock_timeout: Duration::from_secs(300),
            plugin_lock_timeout: Duration::from_secs(15),
            shell_command: default_shell(),
            interrupt_signal: Signal::Term,
            redacted_vars: default_redacted_vars(),
            artifact_paths: String::new(),
            artifact_upload_destination: String::new(),
            plugins: String::new(),
            trace_backend: String::new(),
            service_name: String::new(),
        }
    }
}

#[cfg(windows)]
fn default_shell() -> Vec<String> {
    vec!["C:\\Windows\\System32\\CMD.exe".to_string(), "/S".to_string(), "/C".to_string()]
}

#[cfg(not(windows))]
fn default_shell() -> Vec<String> {
    vec!["/bin/bash".to_string(), "-e".to_string(), "-c".to_string()]
}

fn default_redacted_vars() -> Vec<String> {
    [
        "*_PASSWORD",
        "*_SECRET",
        "*_TOKEN",
        "*_PRIVATE_KEY",
        "*_ACCESS_KEY",
        "*_SECRET_KEY",
        "*_CONNECTION_STRING",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl JobConfig {
    /// Directory the job's working tree lives in:
    /// `<buildPath>/<agentSlug>/<orgSlug>/<pipelineSlug>`, unless an
    /// explicit checkout path was configured.
    pub fn checkout_dir(&self) -> PathBuf {
        if let Some(explicit) = &self.checkout_path {
            return explicit.clone();
        }
        self.build_path
            .join(slugify(&self.agent_name))
            .join(slugify(&self.org_slug))
            .join(slugify(&self.pipeline_slug))
    }

    /// True when `phase` should run for this job.
    pub fn phase_enabled(&self, phase: Phase) -> bool {
        self.phases.is_empty() || self.phases.contains(&phase)
    }
}

fn slugify(s: &str) -> String {
    let slug: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c.to_ascii_lowercase() } else { '-' })
        .collect();
    if slug.is_empty() { "default".to_string() } else { slug }
}

/// Apply every recognised `BUILDKITE_*` variable in `env` onto
/// `config`, returning the names that changed a field. Runs at boot and
/// again after each hook.
pub fn apply_env_overlay(config: &mut JobConfig, env: &Environment) -> Vec<String> {
    let mut changed = Vec::new();

    macro_rules! overlay {
        ($key:literal, $field:expr, $convert:expr) => {
            if let Some(raw) = env.get($key)
                && let Some(value) = $convert(raw)
                && $field != value
            {
                $field = value;
                changed.push($key.to_string());
            }
        };
    }

    let string = |raw: &str| Some(raw.to_string());
    let boolean = parse_bool;
    let list = |raw: &str| {
        Some(
            raw.split('\n')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>(),
        )
    };

    overlay!("BUILDKITE_REPO", config.repository, string);
    overlay!("BUILDKITE_REFSPEC", config.refspec, string);
    overlay!("BUILDKITE_GIT_SUBMODULES", config.git_submodules, boolean);
    overlay!("BUILDKITE_CLEAN_CHECKOUT", config.clean_checkout, boolean);
    overlay!("BUILDKITE_SKIP_CHECKOUT", config.skip_checkout, boolean);
    overlay!("BUILDKITE_GIT_CHECKOUT_FLAGS", config.git_checkout_flags, string);
    overlay!("BUILDKITE_GIT_CLONE_FLAGS", config.git_clone_flags, string);
    overlay!("BUILDKITE_GIT_FETCH_FLAGS", config.git_fetch_flags, string);
    overlay!(
        "BUILDKITE_GIT_CLONE_MIRROR_FLAGS",
        config.git_clone_mirror_flags,
        string
    );
    overlay!("BUILDKITE_GIT_CLEAN_FLAGS", config.git_clean_flags, string);
    overlay!(
        "BUILDKITE_GIT_SUBMODULE_CLONE_CONFIG",
        config.git_submodule_clone_config,
        list
    );
    overlay!(
        "BUILDKITE_GIT_MIRRORS_SKIP_UPDATE",
        config.git_mirrors_skip_update,
        boolean
    );
    overlay!(
        "BUILDKITE_PLUGINS_ALWAYS_CLONE_FRESH",
        config.plugins_always_clone_fresh,
        boolean
    );
    overlay!("BUILDKITE_ARTIFACT_PATHS", config.artifact_paths, string);
    overlay!(
        "BUILDKITE_ARTIFACT_UPLOAD_DESTINATION",
        config.artifact_upload_destination,
        string
    );

    changed
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Some(true),
        "false" | "0" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Shell-style wildcard match over variable names: `*` matches any run
/// of characters, `?` a single one. Comparison is case-sensitive, as
/// variable names are.
pub fn name_matches_glob(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..])),
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(pc), Some(nc)) if pc == nc => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Values of every variable whose name matches one of the redacted-var
/// globs. These become the redactor's needles.
pub fn redacted_values(env: &Environment, globs: &[String]) -> Vec<String> {
    let mut values = Vec::new();
    for (name, value) in env.iter() {
        if value.trim().is_empty() {
            continue;
        }
        if globs.iter().any(|g| name_matches_glob(g, name)) {
            values.push(value.to_string());
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn overlay_updates_repository_and_reports_key() {
        let mut config = JobConfig::default();
        let changed = apply_env_overlay(
            &mut config,
            &env(&[("BUILDKITE_REPO", "git@example.com:org/repo.git")]),
        );
        assert_eq!(config.repository, "git@example.com:org/repo.git");
        assert_eq!(changed, vec!["BUILDKITE_REPO".to_string()]);
    }

    #[test]
    fn overlay_ignores_unchanged_values() {
        let mut config = JobConfig {
            repository: "same".to_string(),
            ..JobConfig::default()
        };
        let changed = apply_env_overlay(&mut config, &env(&[("BUILDKITE_REPO", "same")]));
        assert!(changed.is_empty());
    }

    #[test]
    fn overlay_parses_booleans() {
        let mut config = JobConfig::default();
        let changed = apply_env_overlay(
            &mut config,
            &env(&[
                ("BUILDKITE_CLEAN_CHECKOUT", "true"),
                ("BUILDKITE_GIT_SUBMODULES", "false"),
                ("BUILDKITE_SKIP_CHECKOUT", "not-a-bool"),
            ]),
        );
        assert!(config.clean_checkout);
        assert!(!config.git_submodules);
        assert!(!config.skip_checkout);
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn overlay_splits_submodule_clone_config_on_newlines() {
        let mut config = JobConfig::default();
        apply_env_overlay(
            &mut config,
            &env(&[(
                "BUILDKITE_GIT_SUBMODULE_CLONE_CONFIG",
                "protocol.version=2\n\ncore.fsmonitor=false\n",
            )]),
        );
        assert_eq!(
            config.git_submodule_clone_config,
            vec!["protocol.version=2".to_string(), "core.fsmonitor=false".to_string()]
        );
    }

    #[test]
    fn checkout_dir_follows_layout() {
        let config = JobConfig {
            build_path: PathBuf::from("/var/lib/rigger/builds"),
            agent_name: "worker-1".to_string(),
            org_slug: "acme".to_string(),
            pipeline_slug: "web-app".to_string(),
            ..JobConfig::default()
        };
        assert_eq!(
            config.checkout_dir(),
            PathBuf::from("/var/lib/rigger/builds/worker-1/acme/web-app")
        );
    }

    #[test]
    fn explicit_checkout_path_wins() {
        let config = JobConfig {
            checkout_path: Some(PathBuf::from("/tmp/elsewhere")),
            build_path: PathBuf::from("/builds"),
            ..JobConfig::default()
        };
        assert_eq!(config.checkout_dir(), PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn phase_filter_empty_means_all() {
        let config = JobConfig::default();
        assert!(config.phase_enabled(Phase::Plugin));
        assert!(config.phase_enabled(Phase::Checkout));
        assert!(config.phase_enabled(Phase::Command));

        let config = JobConfig {
            phases: vec![Phase::Command],
            ..JobConfig::default()
        };
        assert!(!config.phase_enabled(Phase::Checkout));
        assert!(config.phase_enabled(Phase::Command));
    }

    #[test]
    fn glob_matching_covers_star_and_question() {
        assert!(name_matches_glob("*_TOKEN", "API_TOKEN"));
        assert!(name_matches_glob("*_TOKEN", "_TOKEN"));
        assert!(!name_matches_glob("*_TOKEN", "TOKEN"));
        assert!(name_matches_glob("SECRET_*", "SECRET_A"));
        assert!(name_matches_glob("A?C", "ABC"));
        assert!(!name_matches_glob("A?C", "AC"));
        assert!(name_matches_glob("*", "ANYTHING"));
        assert!(!name_matches_glob("*_token", "API_TOKEN"));
    }

    #[test]
    fn redacted_values_picks_matching_names() {
        let e = env(&[
            ("DEPLOY_TOKEN", "tok-123"),
            ("DB_PASSWORD", "hunter2"),
            ("HARMLESS", "visible"),
            ("EMPTY_SECRET", "  "),
        ]);
        let globs = vec!["*_TOKEN".to_string(), "*_PASSWORD".to_string(), "*_SECRET".to_string()];
        let mut values = redacted_values(&e, &globs);
        values.sort();
        assert_eq!(values, vec!["hunter2".to_string(), "tok-123".to_string()]);
    }

    #[test]
    fn phase_names_parse() {
        assert_eq!(Phase::parse("plugin"), Some(Phase::Plugin));
        assert_eq!(Phase::parse("plugins"), Some(Phase::Plugin));
        assert_eq!(Phase::parse("CHECKOUT"), Some(Phase::Checkout));
        assert_eq!(Phase::parse("command"), Some(Phase::Command));
        assert_eq!(Phase::parse("teardown"), None);
    }
}
