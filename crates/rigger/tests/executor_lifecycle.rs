//! End-to-end lifecycle tests: a real executor driving real hooks and
//! commands through bash, asserting phase ordering, environment
//! propagation, exit-code policy, and teardown guarantees.

#![cfg(unix)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use rigger::config::Phase;
use rigger::{Executor, JobConfig, NoopControlPlane, NoopTraceRecorder};

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Sink {
    fn write(&mut self, d: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(d);
        Ok(d.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Fixture {
    config: JobConfig,
    _root: tempfile::TempDir,
    hooks: PathBuf,
    scratch: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let hooks = root.path().join("hooks");
        let scratch = root.path().join("scratch");
        std::fs::create_dir_all(&hooks).expect("mkdir hooks");
        std::fs::create_dir_all(&scratch).expect("mkdir scratch");
        let config = JobConfig {
            hooks_path: hooks.clone(),
            phases: vec![Phase::Command],
            ..JobConfig::default()
        };
        Self {
            config,
            _root: root,
            hooks,
            scratch,
        }
    }

    fn hook(&self, name: &str, content: &str) {
        write_executable(&self.hooks.join(name), &format!("#!/bin/bash\n{content}\n"));
    }

    /// Run the job; the fixture (and its temp tree) stays alive so
    /// callers can assert on files the hooks wrote.
    fn run(&mut self) -> (i32, String) {
        let sink = Sink::default();
        let mut executor = Executor::new(
            std::mem::take(&mut self.config),
            Box::new(sink.clone()),
            Box::new(NoopControlPlane),
            Box::new(NoopTraceRecorder),
        );
        let code = executor.run();
        (code, sink.contents())
    }
}

fn write_executable(path: &Path, content: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, content).expect("write hook");
    let mut perms = std::fs::metadata(path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod");
}

#[test]
fn environment_hook_changes_reach_the_command() {
    let mut fixture = Fixture::new();
    fixture.hook("environment", "export GREETING=from-env-hook");
    fixture.config.command = "echo greeting=$GREETING".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 0);
    assert!(log.contains("greeting=from-env-hook"), "{log}");
}

#[test]
fn hook_changes_are_visible_to_later_hooks() {
    let mut fixture = Fixture::new();
    fixture.hook("environment", "export HANDOFF=one");
    fixture.hook("pre-command", "echo handoff=$HANDOFF");
    fixture.config.command = "true".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 0);
    assert!(log.contains("handoff=one"), "{log}");
}

#[test]
fn output_appears_in_lifecycle_order() {
    let mut fixture = Fixture::new();
    fixture.hook("pre-command", "echo stage-pre");
    fixture.hook("post-command", "echo stage-post");
    fixture.config.command = "echo stage-command".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 0);
    let pre = log.find("stage-pre").expect("pre ran");
    let cmd = log.find("stage-command").expect("command ran");
    let post = log.find("stage-post").expect("post ran");
    assert!(pre < cmd && cmd < post, "{log}");
}

#[test]
fn failing_pre_command_hook_wins_and_skips_the_command() {
    let mut fixture = Fixture::new();
    let scratch = fixture.scratch.clone();
    fixture.hook("pre-command", "(exit 9)");
    fixture.hook(
        "post-command",
        &format!("touch \"{}/post-ran\"", scratch.display()),
    );
    fixture.hook(
        "pre-exit",
        &format!("touch \"{}/pre-exit-ran\"", scratch.display()),
    );
    fixture.config.command = "echo should-not-run".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 9);
    assert!(!log.contains("should-not-run"), "{log}");
    // Post-command is skipped after a pre-command failure, but
    // teardown still runs.
    assert!(!fixture.scratch.join("post-ran").exists());
    assert!(fixture.scratch.join("pre-exit-ran").exists());
}

#[test]
fn failed_command_still_runs_post_command_and_reports_its_code() {
    let mut fixture = Fixture::new();
    fixture.hook(
        "post-command",
        "echo observed-status=$BUILDKITE_COMMAND_EXIT_STATUS",
    );
    fixture.config.command = "exit 7".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 7);
    assert!(log.contains("observed-status=7"), "{log}");
}

#[test]
fn pre_exit_runs_after_successful_jobs_too() {
    let mut fixture = Fixture::new();
    let scratch = fixture.scratch.clone();
    fixture.hook(
        "pre-exit",
        &format!("touch \"{}/pre-exit-ran\"", scratch.display()),
    );
    fixture.config.command = "true".to_string();

    let (code, _) = fixture.run();
    assert_eq!(code, 0);
    assert!(fixture.scratch.join("pre-exit-ran").exists());
}

#[test]
fn pre_exit_failures_do_not_change_the_exit_code() {
    let mut fixture = Fixture::new();
    fixture.hook("pre-exit", "(exit 50)");
    fixture.config.command = "true".to_string();

    let (code, _) = fixture.run();
    assert_eq!(code, 0);
}

#[test]
fn hook_directory_change_applies_to_the_command() {
    let mut fixture = Fixture::new();
    let scratch = fixture.scratch.clone();
    fixture.hook("pre-command", &format!("cd \"{}\"", scratch.display()));
    fixture.config.command = "pwd".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 0);
    let canonical = fixture.scratch.canonicalize().expect("canon");
    assert!(
        log.contains(canonical.to_str().expect("utf8")),
        "{log} missing {}",
        canonical.display()
    );
}

#[test]
fn secrets_exported_by_hooks_are_redacted() {
    let mut fixture = Fixture::new();
    fixture.hook("environment", "export DEPLOY_TOKEN=super-sensitive-1234");
    fixture.config.command = "echo token is $DEPLOY_TOKEN".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 0);
    assert!(!log.contains("super-sensitive-1234"), "{log}");
    assert!(log.contains("token is [REDACTED]"), "{log}");
}

#[test]
fn hook_env_overlay_reconfigures_the_job() {
    let mut fixture = Fixture::new();
    fixture.hook("environment", "export BUILDKITE_ARTIFACT_PATHS='logs/**/*'");
    fixture.config.command = "true".to_string();

    let (code, log) = fixture.run();
    assert_eq!(code, 0);
    assert!(log.contains("BUILDKITE_ARTIFACT_PATHS changed by environment hook"), "{log}");
    // The artifact phase now runs (header visible) even though the
    // upload target is a no-op control plane.
    assert!(log.contains("Uploading artifacts"), "{log}");
}

#[test]
fn cancellation_interrupts_the_command_and_still_tears_down() {
    let mut fixture = Fixture::new();
    let scratch = fixture.scratch.clone();
    fixture.hook(
        "pre-exit",
        &format!("touch \"{}/pre-exit-ran\"", scratch.display()),
    );
    fixture.config.command = "sleep 60".to_string();
    fixture.config.signal_grace_period = std::time::Duration::from_millis(500);

    let sink = Sink::default();
    let mut executor = Executor::new(
        fixture.config,
        Box::new(sink.clone()),
        Box::new(NoopControlPlane),
        Box::new(NoopTraceRecorder),
    );
    let cancel = executor.cancel_flag();
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(300));
        cancel.store(true, Ordering::Relaxed);
    });

    let started = std::time::Instant::now();
    let code = executor.run();
    canceller.join().expect("join");

    // The command died from the interrupt signal, well before its
    // sixty seconds were up.
    assert_eq!(code, -1);
    assert!(started.elapsed() < std::time::Duration::from_secs(30));
    assert!(sink.contents().contains("interrupted by signal"), "{}", sink.contents());
    assert!(fixture.scratch.join("pre-exit-ran").exists());
}
