//! Checkout engine scenarios against a real local git repository, plus
//! failure-injection runs against a scripted fake git.

#![cfg(unix)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rigger::checkout::CheckoutEngine;
use rigger::config::JobConfig;
use rigger::control::RecordingControlPlane;
use rigger::git::GitError;
use rigger::logger::MemoryLogger;
use rigger::mirror::{MirrorManager, stable_dir_name};
use rigger::shell::Shell;
use rigger_env::Environment;
use rigger_lock::LockError;

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

fn real_shell(cwd: &Path) -> Shell {
    Shell::new(
        cwd.to_path_buf(),
        Environment::from_process(),
        Box::new(Sink::default()),
        Box::new(Sink::default()),
    )
}

/// Build a local origin repository with one commit on `main`.
fn seed_origin(root: &Path) -> PathBuf {
    let origin = root.join("origin");
    std::fs::create_dir_all(&origin).expect("mkdir origin");
    git_in(&origin, &["init", "-q", "--initial-branch=main"]);
    std::fs::write(origin.join("README.md"), "# seeded\n").expect("write file");
    git_in(&origin, &["add", "README.md"]);
    git_in(
        &origin,
        &[
            "-c",
            "user.name=Test",
            "-c",
            "user.email=test@example.com",
            "commit",
            "-q",
            "-m",
            "seed",
        ],
    );
    origin
}

fn git_in(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

fn engine_config(origin: &Path, checkout: &Path) -> JobConfig {
    JobConfig {
        repository: origin.display().to_string(),
        branch: "main".to_string(),
        commit: "HEAD".to_string(),
        checkout_path: Some(checkout.to_path_buf()),
        ssh_keyscan: false,
        git_submodules: false,
        git_clone_flags: "-v".to_string(),
        git_clean_flags: "-fdq".to_string(),
        git_fetch_flags: "-v".to_string(),
        ..JobConfig::default()
    }
}

#[test]
fn branch_checkout_against_a_real_repository() {
    let td = tempfile::tempdir().expect("tempdir");
    let origin = seed_origin(td.path());
    let checkout = td.path().join("checkout");
    std::fs::create_dir_all(&checkout).expect("mkdir");

    let config = engine_config(&origin, &checkout);
    let mut shell = real_shell(&checkout);
    shell.chdir(&checkout).expect("chdir");
    let mut logger = MemoryLogger::new();
    let control = RecordingControlPlane::default();

    let engine = CheckoutEngine {
        config: &config,
        mirrors: None,
        cancel: Arc::new(AtomicBool::new(false)),
    };
    engine.run(&mut shell, &mut logger, &control).expect("checkout succeeds");

    assert!(checkout.join("README.md").is_file());
    let origin_head = git_in(&origin, &["rev-parse", "HEAD"]);
    let checked_out = git_in(&checkout, &["rev-parse", "HEAD"]);
    assert_eq!(origin_head, checked_out);

    // Commit metadata reached the control plane, once.
    let meta = control.meta_data.lock().unwrap();
    assert_eq!(meta.len(), 1);
    assert_eq!(meta[0].0, "buildkite:git:commit");
    assert!(meta[0].1.contains("seed"));
}

#[test]
fn rerunning_checkout_is_idempotent() {
    let td = tempfile::tempdir().expect("tempdir");
    let origin = seed_origin(td.path());
    let checkout = td.path().join("checkout");
    std::fs::create_dir_all(&checkout).expect("mkdir");

    let config = engine_config(&origin, &checkout);
    let mut shell = real_shell(&checkout);
    shell.chdir(&checkout).expect("chdir");
    let mut logger = MemoryLogger::new();
    let control = RecordingControlPlane::default();

    for _ in 0..2 {
        let engine = CheckoutEngine {
            config: &config,
            mirrors: None,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        engine.run(&mut shell, &mut logger, &control).expect("checkout succeeds");
    }

    let origin_head = git_in(&origin, &["rev-parse", "HEAD"]);
    assert_eq!(git_in(&checkout, &["rev-parse", "HEAD"]), origin_head);
}

#[test]
fn mirrored_checkout_references_the_mirror() {
    let td = tempfile::tempdir().expect("tempdir");
    let origin = seed_origin(td.path());
    let checkout = td.path().join("checkout");
    let mirrors = td.path().join("mirrors");
    std::fs::create_dir_all(&checkout).expect("mkdir");

    let mut config = engine_config(&origin, &checkout);
    config.mirrors_path = Some(mirrors.clone());
    let mut shell = real_shell(&checkout);
    shell.chdir(&checkout).expect("chdir");
    let mut logger = MemoryLogger::new();
    let control = RecordingControlPlane::default();

    let manager = MirrorManager::new(mirrors.clone(), &config);
    let engine = CheckoutEngine {
        config: &config,
        mirrors: Some(&manager),
        cancel: Arc::new(AtomicBool::new(false)),
    };
    engine.run(&mut shell, &mut logger, &control).expect("checkout succeeds");

    let mirror_dir = mirrors.join(stable_dir_name(&config.repository));
    assert!(mirror_dir.is_dir(), "mirror created");
    assert_eq!(
        shell.env.get("BUILDKITE_REPO_MIRROR"),
        Some(mirror_dir.display().to_string().as_str())
    );
    assert!(checkout.join("README.md").is_file());
}

/// Scripted git for failure injection: logs argv, fails `clean` while
/// `.git/index.lock` exists, creates directories on `clone`.
fn install_fake_git(bin: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let script = r#"#!/bin/sh
echo "git $*" >> "$FAKE_GIT_LOG"
cmd="$1"
if [ "$1" = "--git-dir" ]; then cmd="$3"; fi
case "$cmd" in
  clone)
    for last; do :; done
    mkdir -p "$last/.git"
    ;;
  clean)
    if [ -f .git/index.lock ]; then
      echo "fatal: Unable to create index.lock: File exists." >&2
      exit 1
    fi
    ;;
  cat-file)
    exit 1
    ;;
esac
exit 0
"#;
    let path = bin.join("git");
    std::fs::write(&path, script).expect("write fake git");
    let mut perms = std::fs::metadata(&path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
}

fn fake_shell(bin: &Path, cwd: &Path, log: &Path) -> Shell {
    let mut env = Environment::from_process();
    env.set(
        "PATH",
        format!("{}:{}", bin.display(), env.get("PATH").unwrap_or_default()),
    );
    env.set("FAKE_GIT_LOG", log.display().to_string());
    Shell::new(
        cwd.to_path_buf(),
        env,
        Box::new(Sink::default()),
        Box::new(Sink::default()),
    )
}

/// Scenario: a stale index.lock fails the first clean; the engine
/// removes the checkout dir, re-clones, and succeeds.
#[test]
fn stale_index_lock_heals_by_removal_and_reclone() {
    let td = tempfile::tempdir().expect("tempdir");
    let bin = td.path().join("bin");
    std::fs::create_dir_all(&bin).expect("mkdir");
    install_fake_git(&bin);
    let log = td.path().join("git.log");

    let checkout = td.path().join("checkout");
    std::fs::create_dir_all(checkout.join(".git")).expect("mkdir checkout");
    std::fs::write(checkout.join(".git/index.lock"), "").expect("stale lock");

    let config = JobConfig {
        repository: "/srv/git/app.git".to_string(),
        branch: "main".to_string(),
        commit: "HEAD".to_string(),
        checkout_path: Some(checkout.clone()),
        ssh_keyscan: false,
        git_submodules: false,
        ..JobConfig::default()
    };
    let mut shell = fake_shell(&bin, &checkout, &log);
    shell.chdir(&checkout).expect("chdir");
    let mut logger = MemoryLogger::new();
    let control = RecordingControlPlane::default();

    let engine = CheckoutEngine {
        config: &config,
        mirrors: None,
        cancel: Arc::new(AtomicBool::new(false)),
    };
    engine.run(&mut shell, &mut logger, &control).expect("self-heals");

    // The stale lock went with the removed checkout dir.
    assert!(!checkout.join(".git/index.lock").exists());
    let log_lines = std::fs::read_to_string(&log).expect("log");
    let cleans_failed = logger.contains("Checkout failed");
    assert!(cleans_failed, "{:?}", logger.lines());
    // Second attempt recloned into the fresh dir.
    assert!(log_lines.contains("git clone"), "{log_lines}");
}

/// Scenario: a short commit hash is not directly fetchable; the engine
/// falls back to the remote's default refspec plus tags and then
/// checks the commit out.
#[test]
fn unfetchable_commit_falls_back_to_default_refspec() {
    use std::os::unix::fs::PermissionsExt;

    let td = tempfile::tempdir().expect("tempdir");
    let bin = td.path().join("bin");
    std::fs::create_dir_all(&bin).expect("mkdir");
    let script = r#"#!/bin/sh
echo "git $*" >> "$FAKE_GIT_LOG"
case "$1" in
  clone)
    for last; do :; done
    mkdir -p "$last/.git"
    ;;
  fetch)
    for arg; do
      if [ "$arg" = "abc1234" ]; then
        echo "fatal: couldn't find remote ref abc1234" >&2
        exit 128
      fi
    done
    ;;
  config)
    if [ "$2" = "remote.origin.fetch" ]; then
      echo "+refs/heads/*:refs/remotes/origin/*"
    fi
    ;;
esac
exit 0
"#;
    let fake = bin.join("git");
    std::fs::write(&fake, script).expect("write fake git");
    let mut perms = std::fs::metadata(&fake).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&fake, perms).expect("chmod");
    let log = td.path().join("git.log");

    let checkout = td.path().join("checkout");
    std::fs::create_dir_all(&checkout).expect("mkdir");

    let config = JobConfig {
        repository: "/srv/git/app.git".to_string(),
        branch: "main".to_string(),
        commit: "abc1234".to_string(),
        checkout_path: Some(checkout.clone()),
        ssh_keyscan: false,
        git_submodules: false,
        ..JobConfig::default()
    };
    let mut shell = fake_shell(&bin, &checkout, &log);
    shell.chdir(&checkout).expect("chdir");
    let mut logger = MemoryLogger::new();
    let control = RecordingControlPlane::default();

    let engine = CheckoutEngine {
        config: &config,
        mirrors: None,
        cancel: Arc::new(AtomicBool::new(false)),
    };
    engine.run(&mut shell, &mut logger, &control).expect("falls back");

    let log_lines = std::fs::read_to_string(&log).expect("log");
    assert!(log_lines.contains("origin abc1234"), "{log_lines}");
    assert!(
        log_lines.contains("origin +refs/heads/*:refs/remotes/origin/* +refs/tags/*:refs/tags/*"),
        "{log_lines}"
    );
    assert!(log_lines.contains("checkout -f abc1234"), "{log_lines}");
}

/// A held mirror update lock times out and surfaces the dedicated exit
/// code.
#[test]
fn mirror_lock_timeout_maps_to_exit_code_94() {
    let td = tempfile::tempdir().expect("tempdir");
    let bin = td.path().join("bin");
    std::fs::create_dir_all(&bin).expect("mkdir");
    install_fake_git(&bin);
    let log = td.path().join("git.log");

    let checkout = td.path().join("checkout");
    std::fs::create_dir_all(&checkout).expect("mkdir checkout");
    let mirrors = td.path().join("mirrors");
    let repository = "/srv/git/app.git";
    let mirror_dir = mirrors.join(stable_dir_name(repository));
    std::fs::create_dir_all(&mirror_dir).expect("mkdir mirror");

    // Another process holds the update lock.
    let mut held_path = mirror_dir.as_os_str().to_os_string();
    held_path.push(".updatelock.f");
    let _held = rigger_lock::acquire(PathBuf::from(held_path), Duration::from_secs(5), None)
        .expect("hold lock");

    let config = JobConfig {
        repository: repository.to_string(),
        branch: "main".to_string(),
        commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
        checkout_path: Some(checkout.clone()),
        mirrors_path: Some(mirrors.clone()),
        mirror_lock_timeout: Duration::from_millis(100),
        ssh_keyscan: false,
        git_submodules: false,
        ..JobConfig::default()
    };
    let mut shell = fake_shell(&bin, &checkout, &log);
    shell.chdir(&checkout).expect("chdir");
    let mut logger = MemoryLogger::new();
    let control = RecordingControlPlane::default();

    let manager = MirrorManager::new(mirrors.clone(), &config);
    let engine = CheckoutEngine {
        config: &config,
        mirrors: Some(&manager),
        cancel: Arc::new(AtomicBool::new(false)),
    };
    let err = engine
        .run(&mut shell, &mut logger, &control)
        .expect_err("lock is held");

    assert!(matches!(err, GitError::Lock(LockError::TimedOut { .. })), "{err}");
    assert_eq!(err.exit_code(), 94);
}
