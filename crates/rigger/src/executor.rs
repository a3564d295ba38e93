//! The phase scheduler: drives one job from environment setup through
//! plugins, checkout, command execution, artifact upload, and teardown.
//!
//! Phase order (subject to the configured include-list):
//!
//! ```text
//! setup → plugin → checkout → vendored-plugin →
//!     command (pre-command → command → post-command → artifact) →
//! teardown (pre-exit hooks + cleanup dirs)
//! ```
//!
//! Teardown always runs, even when an earlier phase fails. The final
//! exit code is the command's, unless a non-command hook failed first,
//! in which case that hook's exit code wins.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rigger_env::Environment;
use rigger_process::WaitStatus;
use rigger_redact::Mux;
use thiserror::Error;
use tracing::debug;

use crate::checkout::CheckoutEngine;
use crate::config::{self, JobConfig, Phase, apply_env_overlay};
use crate::control::ControlPlane;
use crate::git::GitError;
use crate::hook::{self, HookDescriptor, HookScope};
use crate::logger::{JobLogger, WriterLogger};
use crate::mirror::MirrorManager;
use crate::plugin::{PluginCheckout, PluginLoader};
use crate::shell::Shell;
use crate::trace::{JsonCodec, TraceCodec, TraceRecorder};

/// Failures that end the job with a specific exit code.
#[derive(Debug, Error)]
enum JobError {
    #[error("{scope} {name} hook exited with status {code}")]
    Hook {
        scope: HookScope,
        name: String,
        code: i32,
    },
    #[error(transparent)]
    Checkout(#[from] GitError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("job was cancelled")]
    Cancelled,
}

impl JobError {
    fn exit_code(&self) -> i32 {
        match self {
            JobError::Hook { code, .. } if *code > 0 => *code,
            JobError::Hook { .. } => 1,
            JobError::Checkout(e) => match e.exit_code() {
                94 => 94,
                code if code > 0 => code,
                _ => 1,
            },
            JobError::Other(_) | JobError::Cancelled => 1,
        }
    }
}

/// The per-job executor.
pub struct Executor {
    config: JobConfig,
    shell: Shell,
    logger: Box<dyn JobLogger>,
    mux: Mux,
    control: Box<dyn ControlPlane>,
    tracer: Box<dyn TraceRecorder>,
    plugins: Vec<PluginCheckout>,
    cleanup_dirs: Vec<PathBuf>,
    cancel: Arc<AtomicBool>,
    command_exit: i32,
    warned_legacy_plugin_env: bool,
}

impl Executor {
    /// Build an executor over a raw job-log sink. The sink is wrapped in
    /// the redaction mux; everything the job prints, including the
    /// runtime's own log lines, passes through it.
    pub fn new(
        mut config: JobConfig,
        output: Box<dyn Write + Send>,
        control: Box<dyn ControlPlane>,
        tracer: Box<dyn TraceRecorder>,
    ) -> Self {
        let mut env = Environment::from_process();
        let changed = apply_env_overlay(&mut config, &env);
        if !changed.is_empty() {
            debug!(?changed, "applied environment overlay at boot");
        }

        env.set("GIT_TERMINAL_PROMPT", "0");
        if !config.bin_path.as_os_str().is_empty() {
            env.set("BUILDKITE_BIN_PATH", config.bin_path.display().to_string());
            let path = env.get("PATH").unwrap_or_default().to_string();
            env.set("PATH", format!("{}{}{path}", config.bin_path.display(), PATH_SEP));
        }
        if !config.job_api_socket.is_empty() {
            env.set("BUILDKITE_AGENT_JOB_API_SOCKET", config.job_api_socket.clone());
            env.set("BUILDKITE_AGENT_JOB_API_TOKEN", config.job_api_token.clone());
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let mux = Mux::new();
        let needles = config::redacted_values(&env, &config.redacted_vars);
        let writer = mux.wrap(output, &needles);
        let logger = Box::new(WriterLogger::new(writer.clone()));

        let cwd = std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir());
        let mut shell = Shell::new(cwd, env, Box::new(writer.clone()), Box::new(writer))
            .with_signal(config.interrupt_signal, config.signal_grace_period)
            .with_cancel(cancel.clone())
            .with_dry_run(config.dry_run);

        if let Some(ctx) = tracer.current_context() {
            match JsonCodec.encode(&ctx) {
                Ok(encoded) => shell.set_trace_context(Some(encoded)),
                Err(e) => debug!("could not encode trace context: {e:#}"),
            }
        }

        Self {
            config,
            shell,
            logger,
            mux,
            control,
            tracer,
            plugins: Vec::new(),
            cleanup_dirs: Vec::new(),
            cancel,
            command_exit: 0,
            warned_legacy_plugin_env: false,
        }
    }

    /// Flag that cancels the job when set; share it with whatever
    /// listens for cancellation from the control plane.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Commands recorded by the shell in dry-run mode.
    pub fn command_log(&self) -> Vec<Vec<String>> {
        self.shell.command_log()
    }

    /// Run the job to completion and return its exit code. Teardown
    /// always runs, whatever earlier phases did.
    pub fn run(&mut self) -> i32 {
        let stop_watcher = Arc::new(AtomicBool::new(false));
        let watcher = {
            let handle = self.shell.interrupt_handle();
            let cancel = self.cancel.clone();
            let stop = stop_watcher.clone();
            std::thread::spawn(move || {
                let mut fired = false;
                while !stop.load(Ordering::Relaxed) {
                    if !fired && cancel.load(Ordering::Relaxed) {
                        handle.interrupt();
                        fired = true;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            })
        };

        let result = self.run_phases();
        let exit = match &result {
            Ok(()) => self.command_exit,
            Err(e) => {
                self.logger.error(&format!("{e}"));
                e.exit_code()
            }
        };

        self.teardown();

        stop_watcher.store(true, Ordering::Relaxed);
        let _ = watcher.join();
        let _ = self.mux.flush();
        exit
    }

    fn run_phases(&mut self) -> Result<(), JobError> {
        self.setup()?;
        if self.config.phase_enabled(Phase::Plugin) {
            self.check_cancelled()?;
            self.plugin_phase()?;
        }
        if self.config.phase_enabled(Phase::Checkout) {
            self.check_cancelled()?;
            self.checkout_phase()?;
        }
        if self.config.phase_enabled(Phase::Plugin) {
            self.check_cancelled()?;
            self.vendored_plugin_phase()?;
        }
        if self.config.phase_enabled(Phase::Command) {
            self.check_cancelled()?;
            self.command_phase()?;
        }
        Ok(())
    }

    fn check_cancelled(&self) -> Result<(), JobError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    // ----- phases ------------------------------------------------------

    fn setup(&mut self) -> Result<(), JobError> {
        self.tracer.phase_started("environment");
        let result = self.run_hooks("environment");
        self.tracer.phase_finished("environment", result.is_ok());
        result
    }

    fn plugin_phase(&mut self) -> Result<(), JobError> {
        if self.config.plugins.trim().is_empty() {
            return Ok(());
        }
        self.tracer.phase_started("plugin");
        self.logger.header("Preparing plugins");

        let loader = PluginLoader { config: &self.config };
        let result = loader.load(&mut self.shell, self.logger.as_mut());
        let checkouts = match result {
            Ok(c) => c,
            Err(e) => {
                self.tracer.phase_finished("plugin", false);
                return Err(JobError::Other(e));
            }
        };
        self.plugins.extend(checkouts);

        // Newly-registered plugins may carry environment hooks of their
        // own.
        let result = self.run_plugin_environment_hooks(0);
        self.tracer.phase_finished("plugin", result.is_ok());
        result
    }

    fn vendored_plugin_phase(&mut self) -> Result<(), JobError> {
        if self.config.plugins.trim().is_empty() {
            return Ok(());
        }
        let checkout_dir = self.config.checkout_dir();
        if !checkout_dir.is_dir() {
            return Ok(());
        }
        self.tracer.phase_started("vendored-plugin");

        let loader = PluginLoader { config: &self.config };
        let result = loader.resolve_vendored(self.logger.as_mut(), &checkout_dir);
        let vendored = match result {
            Ok(v) => v,
            Err(e) => {
                self.tracer.phase_finished("vendored-plugin", false);
                return Err(JobError::Other(e));
            }
        };
        let first_new = self.plugins.len();
        self.plugins.extend(vendored);

        let result = self.run_plugin_environment_hooks(first_new);
        self.tracer.phase_finished("vendored-plugin", result.is_ok());
        result
    }

    fn checkout_phase(&mut self) -> Result<(), JobError> {
        if self.config.skip_checkout {
            self.logger.info("Skipping checkout");
            return Ok(());
        }
        self.tracer.phase_started("checkout");
        let result = self.checkout_phase_inner();
        self.tracer.phase_finished("checkout", result.is_ok());
        result
    }

    fn checkout_phase_inner(&mut self) -> Result<(), JobError> {
        self.run_hooks("pre-checkout")?;

        // No repository: hooks do all the work in a scratch build dir.
        if self.config.repository.is_empty() {
            let scratch = tempfile::Builder::new()
                .prefix("job-build")
                .tempdir()
                .map_err(|e| JobError::Other(e.into()))?
                .keep();
            self.cleanup_dirs.push(scratch.clone());
            self.config.checkout_path = Some(scratch.clone());
            self.enter_checkout_dir(&scratch)?;
            self.run_hooks("post-checkout")?;
            return Ok(());
        }

        let dir = self.config.checkout_dir();
        if self.config.clean_checkout && dir.exists() {
            self.logger.info("Cleaning checkout directory");
            std::fs::remove_dir_all(&dir).map_err(|e| JobError::Other(e.into()))?;
        }
        std::fs::create_dir_all(&dir).map_err(|e| JobError::Other(e.into()))?;
        self.enter_checkout_dir(&dir)?;

        // A checkout hook replaces the built-in engine; plugins win over
        // local, local over global.
        let overrides = self.single_winner_hooks("checkout");
        if overrides.is_empty() {
            self.logger.header("Preparing working directory");
            let mirrors = self
                .config
                .mirrors_path
                .clone()
                .map(|root| MirrorManager::new(root, &self.config));
            let engine = CheckoutEngine {
                config: &self.config,
                mirrors: mirrors.as_ref(),
                cancel: self.cancel.clone(),
            };
            engine
                .run(&mut self.shell, self.logger.as_mut(), self.control.as_ref())
                .map_err(JobError::Checkout)?;
        } else {
            self.run_single_winner(overrides)?;
            // Hook-driven checkouts may have recreated the directory;
            // refresh the shell's handle on it.
            if dir.is_dir() {
                self.shell.chdir(&dir).map_err(JobError::Other)?;
            }
        }

        self.run_hooks("post-checkout")
    }

    fn enter_checkout_dir(&mut self, dir: &std::path::Path) -> Result<(), JobError> {
        self.shell.chdir(dir).map_err(JobError::Other)?;
        self.shell
            .env
            .set("BUILDKITE_BUILD_CHECKOUT_PATH", dir.display().to_string());
        Ok(())
    }

    fn command_phase(&mut self) -> Result<(), JobError> {
        self.tracer.phase_started("command");

        // A pre-command hook failure aborts the phase: no command, no
        // post-command hooks.
        self.run_hooks("pre-command")?;

        let command_result = self.run_command();
        self.shell
            .env
            .set("BUILDKITE_COMMAND_EXIT_STATUS", self.command_exit.to_string());

        // A failed command still gets its post-command hooks and the
        // artifact phase.
        self.run_hooks("post-command")?;
        self.artifact_phase()?;

        self.tracer
            .phase_finished("command", command_result.is_ok() && self.command_exit == 0);
        command_result
    }

    fn run_command(&mut self) -> Result<(), JobError> {
        let winners = self.single_winner_hooks("command");
        if !winners.is_empty() {
            return self.run_single_winner(winners);
        }

        if self.config.command.trim().is_empty() {
            return Ok(());
        }
        self.logger.header("Running commands");

        let status = if self.config.command_eval {
            let template = &self.config.shell_command;
            let Some((program, fixed)) = template.split_first() else {
                return Err(JobError::Other(anyhow::anyhow!("shell command template is empty")));
            };
            let mut exec = crate::shell::Exec::new(program.clone(), &[]);
            exec.args = fixed.to_vec();
            exec.args.push(self.config.command.clone());
            exec.pty = self.config.run_in_pty;
            self.shell
                .execute(exec)
                .map_err(|e| JobError::Other(anyhow::Error::new(e).context("failed to run command")))?
                .status
        } else {
            // Evaluation disabled: the command names script files in the
            // checkout, run directly, one per line.
            let mut last = WaitStatus::Exited(0);
            for line in self.config.command.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let mut exec = crate::shell::Exec::new(line.to_string(), &[]);
                exec.pty = self.config.run_in_pty;
                last = self
                    .shell
                    .execute(exec)
                    .map_err(|e| JobError::Other(anyhow::Error::new(e).context("failed to run command")))?
                    .status;
                if last != WaitStatus::Exited(0) {
                    break;
                }
            }
            last
        };

        match status {
            WaitStatus::Signaled(signal) => {
                // Historical behaviour: the raw status is published in
                // the exit-status variable, but the phase itself does
                // not fail on a signal-terminated command.
                self.logger
                    .warn(&format!("The command was interrupted by signal {signal}"));
                self.command_exit = -1;
            }
            WaitStatus::Exited(code) => {
                self.command_exit = code;
                if code != 0 {
                    self.logger.error(&format!("The command exited with status {code}"));
                }
            }
            WaitStatus::Running => {}
        }
        Ok(())
    }

    fn artifact_phase(&mut self) -> Result<(), JobError> {
        if self.config.artifact_paths.trim().is_empty() {
            return Ok(());
        }
        self.tracer.phase_started("artifact");
        self.run_hooks("pre-artifact")?;

        self.logger.header("Uploading artifacts");
        if let Err(e) = self
            .control
            .upload_artifacts(&self.config.artifact_paths, &self.config.artifact_upload_destination)
        {
            // Upload problems never mask the command result.
            self.logger.warn(&format!("Artifact upload failed: {e:#}"));
        }

        let result = self.run_hooks("post-artifact");
        self.tracer.phase_finished("artifact", result.is_ok());
        result
    }

    fn teardown(&mut self) {
        self.tracer.phase_started("pre-exit");
        for descriptor in self.hooks_for("pre-exit") {
            if let Err(e) = self.execute_hook(&descriptor) {
                // Too late to change the job's fate; log and move on.
                self.logger.warn(&format!("{e}"));
            }
        }
        self.tracer.phase_finished("pre-exit", true);

        for dir in std::mem::take(&mut self.cleanup_dirs) {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                debug!(dir = %dir.display(), "could not remove cleanup dir: {e}");
            }
        }
    }

    // ----- hooks -------------------------------------------------------

    /// All hooks named `name`, in {global, local, plugin} order.
    fn hooks_for(&self, name: &str) -> Vec<HookDescriptor> {
        let mut found = Vec::new();

        let mut global_roots = vec![self.config.hooks_path.clone()];
        global_roots.extend(self.config.additional_hooks_paths.iter().cloned());
        for root in global_roots {
            if let Some(path) = hook::find_hook(&root, name) {
                found.push(HookDescriptor {
                    scope: HookScope::Global,
                    name: name.to_string(),
                    path,
                    plugin_name: None,
                });
            }
        }

        if self.config.local_hooks_enabled {
            let local_root = self.config.checkout_dir().join(".buildkite/hooks");
            if let Some(path) = hook::find_hook(&local_root, name) {
                found.push(HookDescriptor {
                    scope: HookScope::Local,
                    name: name.to_string(),
                    path,
                    plugin_name: None,
                });
            }
        }

        for plugin in &self.plugins {
            if let Some(path) = hook::find_hook(&plugin.hooks_dir(), name) {
                found.push(HookDescriptor {
                    scope: HookScope::Plugin,
                    name: name.to_string(),
                    path,
                    plugin_name: Some(plugin.plugin.name()),
                });
            }
        }
        found
    }

    /// Run every hook named `name`, in {global, local, plugins} order.
    fn run_hooks(&mut self, name: &str) -> Result<(), JobError> {
        for descriptor in self.hooks_for(name) {
            self.execute_hook(&descriptor)?;
        }
        Ok(())
    }

    /// Environment hooks for plugins registered at or after
    /// `first_index`.
    fn run_plugin_environment_hooks(&mut self, first_index: usize) -> Result<(), JobError> {
        let descriptors: Vec<HookDescriptor> = self.plugins[first_index..]
            .iter()
            .filter_map(|p| {
                hook::find_hook(&p.hooks_dir(), "environment").map(|path| HookDescriptor {
                    scope: HookScope::Plugin,
                    name: "environment".to_string(),
                    path,
                    plugin_name: Some(p.plugin.name()),
                })
            })
            .collect();
        for descriptor in descriptors {
            self.execute_hook(&descriptor)?;
        }
        Ok(())
    }

    /// Occurrences of a single-winner hook name, in precedence order:
    /// plugins (registration order), then local, then global.
    fn single_winner_hooks(&self, name: &str) -> Vec<HookDescriptor> {
        let mut ordered: Vec<HookDescriptor> = Vec::new();
        let all = self.hooks_for(name);
        for scope in [HookScope::Plugin, HookScope::Local, HookScope::Global] {
            ordered.extend(all.iter().filter(|d| d.scope == scope).cloned());
        }
        ordered
    }

    /// Run the first-found occurrence; warn about the rest. In strict
    /// mode the rest are skipped, otherwise they run with a deprecation
    /// warning.
    fn run_single_winner(&mut self, descriptors: Vec<HookDescriptor>) -> Result<(), JobError> {
        let mut iter = descriptors.into_iter();
        let Some(winner) = iter.next() else {
            return Ok(());
        };
        self.execute_hook(&winner)?;

        for extra in iter {
            if self.config.strict_single_hooks {
                self.logger.warn(&format!(
                    "Skipping {} {} hook at {}: a {} hook already ran",
                    extra.scope,
                    extra.name,
                    extra.path.display(),
                    winner.scope,
                ));
            } else {
                self.logger.warn(&format!(
                    "Running additional {} {} hook at {}; multiple {} hooks are deprecated and will not run in future versions",
                    extra.scope,
                    extra.name,
                    extra.path.display(),
                    extra.name,
                ));
                self.execute_hook(&extra)?;
            }
        }
        Ok(())
    }

    /// Run one hook and apply whatever it changed: environment diff,
    /// recognised config overlay, redactor needles, working directory.
    fn execute_hook(&mut self, descriptor: &HookDescriptor) -> Result<(), JobError> {
        match &descriptor.plugin_name {
            Some(plugin) => self.logger.header(&format!(
                "Running {} hook for plugin {plugin}",
                descriptor.name
            )),
            None => self
                .logger
                .header(&format!("Running {} {} hook", descriptor.scope, descriptor.name)),
        }

        let extra_env = match &descriptor.plugin_name {
            Some(_) => {
                let plugin = self
                    .plugins
                    .iter()
                    .find(|p| descriptor.path.starts_with(&p.checkout_dir));
                match plugin {
                    Some(p) => {
                        let (env, legacy) = p.plugin.configuration_env();
                        if legacy && !self.warned_legacy_plugin_env {
                            self.logger.warn(
                                "Plugin configuration is exported under both the legacy and the current variable scheme; the legacy names will stop being set in a future version",
                            );
                            self.warned_legacy_plugin_env = true;
                        }
                        env
                    }
                    None => Environment::new(),
                }
            }
            None => Environment::new(),
        };

        let output = hook::run_hook(
            &mut self.shell,
            descriptor,
            &extra_env,
            self.config.run_in_pty,
        )
        .map_err(JobError::Other)?;

        self.shell
            .env
            .set("BUILDKITE_LAST_HOOK_EXIT_STATUS", output.status.exit_code().to_string());

        if output.early_exit {
            self.logger.info(&format!(
                "The {} hook exited via exit(); environment changes were not captured",
                descriptor.name
            ));
        } else {
            if !output.diff.is_empty() {
                self.shell.env.apply(&output.diff);
                let changed = apply_env_overlay(&mut self.config, &self.shell.env);
                for key in changed {
                    self.logger.info(&format!("{key} changed by {} hook", descriptor.name));
                }
                let needles = config::redacted_values(&self.shell.env, &self.config.redacted_vars);
                if let Err(e) = self.mux.reset(&needles) {
                    debug!("could not re-key redactors: {e}");
                }
            }
            if let Some(dir) = output.changed_dir
                && dir.is_dir()
            {
                self.shell.chdir(&dir).map_err(JobError::Other)?;
            }
        }

        match output.status {
            WaitStatus::Exited(0) | WaitStatus::Running => Ok(()),
            WaitStatus::Exited(code) => Err(JobError::Hook {
                scope: descriptor.scope,
                name: descriptor.name.clone(),
                code,
            }),
            WaitStatus::Signaled(signal) => {
                self.logger
                    .warn(&format!("The {} hook was killed by signal {signal}", descriptor.name));
                Err(JobError::Hook {
                    scope: descriptor.scope,
                    name: descriptor.name.clone(),
                    code: -1,
                })
            }
        }
    }
}

#[cfg(windows)]
const PATH_SEP: &str = ";";
#[cfg(not(windows))]
const PATH_SEP: &str = ":";
