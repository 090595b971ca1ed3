use overseer::config::{ProgramSpec, RuntimeKind, Settings};
use overseer::manager::Manager;
use overseer::paths::Paths;
use overseer::protocol::{ProgramEdit, ProgramInfo, ProgramStatus, Response, UploadOptions};
use regex::Regex;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

/// Stands in for a Python interpreter: pip calls fail when requirements.txt
/// mentions FAIL and hang on SLOW, everything else runs as a shell script.
const FAKE_PYTHON: &str = r#"#!/bin/sh
if [ "$1" = "-m" ] && [ "$2" = "pip" ]; then
  if grep -q SLOW requirements.txt; then sleep 30; fi
  if grep -q FAIL requirements.txt; then echo "ERROR: no matching distribution"; exit 1; fi
  echo "Successfully installed everything"
  exit 0
fi
exec /bin/sh "$@"
"#;

fn setup() -> (TempDir, Paths) {
    let dir = TempDir::new().unwrap();
    let bin = dir.path().join(".venv/bin");
    std::fs::create_dir_all(&bin).unwrap();
    std::os::unix::fs::symlink("/bin/sh", bin.join("python")).unwrap();
    let paths = Paths::with_base(dir.path().to_path_buf());
    (dir, paths)
}

fn write_script(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

fn fast_settings() -> Settings {
    Settings {
        restart_delay: Duration::from_millis(20),
        max_failures: 3,
        ..Settings::default()
    }
}

fn spec(name: &str, script: &str) -> ProgramSpec {
    ProgramSpec::new(name, script, RuntimeKind::Python)
}

async fn info(manager: &Manager, name: &str) -> ProgramInfo {
    match manager.list().await {
        Response::ProgramList { programs } => programs
            .into_iter()
            .find(|p| p.spec.name == name)
            .unwrap_or_else(|| panic!("program '{name}' not listed")),
        other => panic!("expected ProgramList, got {other:?}"),
    }
}

async fn names(manager: &Manager) -> Vec<String> {
    match manager.list().await {
        Response::ProgramList { programs } => programs.into_iter().map(|p| p.spec.name).collect(),
        other => panic!("expected ProgramList, got {other:?}"),
    }
}

/// Ticks the monitor until `done` holds for the program or the deadline
/// passes.
async fn tick_until(
    manager: &Manager,
    name: &str,
    timeout: Duration,
    done: impl Fn(&ProgramInfo) -> bool,
) -> ProgramInfo {
    let deadline = Instant::now() + timeout;
    loop {
        manager.tick().await;
        let current = info(manager, name).await;
        if done(&current) || Instant::now() > deadline {
            return current;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn zip_of(entries: &[(&str, &str, u32)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body, mode) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default().unix_permissions(*mode))
            .unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn upload_options(name: &str, enabled: bool) -> UploadOptions {
    UploadOptions {
        name: name.to_string(),
        script: "app.sh".to_string(),
        kind: RuntimeKind::Python,
        enabled,
        comment: None,
        args: Vec::new(),
        environment: Vec::new(),
    }
}

fn assert_error(response: &Response, pattern: &str) {
    let re = Regex::new(pattern).unwrap();
    match response {
        Response::Error { message } => assert!(
            re.is_match(message),
            "error '{message}' does not match /{pattern}/"
        ),
        other => panic!("expected error matching /{pattern}/, got {other:?}"),
    }
}

async fn stop_and_wait(manager: &Manager, name: &str) {
    manager.stop(name).await;
    manager.wait_for_tasks().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crash_loop_trips_breaker_after_max_failures() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "echo boom\nexit 1\n");
    let manager = Manager::new(paths, fast_settings(), vec![spec("svc-a", "app.sh")]);

    let svc = tick_until(&manager, "svc-a", Duration::from_secs(15), |p| p.is_broken).await;
    assert!(svc.is_broken, "breaker never tripped: {svc:?}");
    assert_eq!(svc.status, ProgramStatus::Broken);
    assert_eq!(svc.consecutive_failures, 3);
    assert_eq!(svc.total_restarts, 3);
    assert_eq!(svc.pid, None);

    // A broken program stays down.
    for _ in 0..3 {
        manager.tick().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let svc = info(&manager, "svc-a").await;
    assert_eq!(svc.status, ProgramStatus::Broken);
    assert_eq!(svc.total_restarts, 3);

    // Output of every attempt went to the program's log.
    let log = std::fs::read_to_string(manager.paths().log_file("svc-a")).unwrap();
    assert!(log.matches("boom").count() >= 3, "log: {log}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_clears_broken_state() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exit 1\n");
    let manager = Manager::new(paths, fast_settings(), vec![spec("svc", "app.sh")]);

    let svc = tick_until(&manager, "svc", Duration::from_secs(15), |p| p.is_broken).await;
    assert!(svc.is_broken);

    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    assert!(manager.start("svc").await.is_success());
    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Running);
    assert!(!svc.is_broken);
    assert_eq!(svc.consecutive_failures, 0);
    assert_eq!(svc.total_restarts, 3, "lifetime count survives a manual start");
    assert!(svc.pid.is_some());

    stop_and_wait(&manager, "svc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stable_uptime_resets_failure_counter() {
    let (dir, paths) = setup();
    // Crashes on the first run only.
    write_script(
        dir.path(),
        "app.sh",
        "if [ -f ran ]; then exec sleep 30; fi\ntouch ran\nexit 1\n",
    );
    let settings = Settings {
        failure_reset: Duration::from_millis(300),
        ..fast_settings()
    };
    let manager = Manager::new(paths, settings, vec![spec("svc", "app.sh")]);

    let svc = tick_until(&manager, "svc", Duration::from_secs(10), |p| {
        p.consecutive_failures == 1 && p.status == ProgramStatus::Running
    })
    .await;
    assert_eq!(svc.consecutive_failures, 1);
    assert_eq!(svc.total_restarts, 1);

    let svc = tick_until(&manager, "svc", Duration::from_secs(10), |p| {
        p.consecutive_failures == 0
    })
    .await;
    assert_eq!(svc.consecutive_failures, 0);
    assert_eq!(svc.total_restarts, 1);
    assert_eq!(svc.status, ProgramStatus::Running);

    stop_and_wait(&manager, "svc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_disables_and_restart_relaunches() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    let manager = Manager::new(paths, fast_settings(), vec![spec("svc", "app.sh")]);

    assert!(manager.start("svc").await.is_success());
    let first_pid = info(&manager, "svc").await.pid.unwrap();

    assert!(manager.restart("svc").await.is_success());
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Restarting);
    manager.wait_for_tasks().await;
    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Running);
    let second_pid = svc.pid.unwrap();
    assert_ne!(first_pid, second_pid);
    assert!(!overseer::sys::is_pid_alive(first_pid));
    assert_eq!(svc.total_restarts, 0, "a manual restart is not a crash");

    assert!(manager.stop("svc").await.is_success());
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Stopping);
    // A second stop while stopping is a no-op.
    assert!(manager.stop("svc").await.is_success());
    manager.wait_for_tasks().await;

    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Stopped);
    assert_eq!(svc.pid, None);
    assert!(!overseer::sys::is_pid_alive(second_pid));

    // The monitor leaves a stopped program alone.
    manager.tick().await;
    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Stopped);
    assert_eq!(svc.pid, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_during_restart_wins() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    let settings = Settings {
        restart_delay: Duration::from_millis(300),
        ..fast_settings()
    };
    let manager = Manager::new(paths, settings, vec![spec("svc", "app.sh")]);

    assert!(manager.start("svc").await.is_success());
    let pid = info(&manager, "svc").await.pid.unwrap();

    assert!(manager.restart("svc").await.is_success());
    let response = manager.stop("svc").await;
    assert!(response.is_success(), "{response:?}");
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Stopping);

    // The monitor does not interfere while the restart worker winds down.
    manager.tick().await;
    manager.wait_for_tasks().await;

    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Stopped);
    assert_eq!(svc.pid, None);
    assert!(!svc.spec.enabled);
    assert!(!overseer::sys::is_pid_alive(pid));

    manager.tick().await;
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_is_not_counted_as_crash() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    let manager = Manager::new(paths, fast_settings(), vec![spec("svc", "app.sh")]);

    manager.tick().await;
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Running);

    manager.stop("svc").await;
    // The monitor keeps ticking while the stop is in flight.
    manager.tick().await;
    manager.wait_for_tasks().await;
    manager.tick().await;

    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Stopped);
    assert_eq!(svc.consecutive_failures, 0);
    assert_eq!(svc.total_restarts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_adopts_processes_from_previous_run() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    let first = Manager::new(paths.clone(), fast_settings(), vec![spec("svc", "app.sh")]);
    first.tick().await;
    let pid = info(&first, "svc").await.pid.unwrap();
    first.shutdown().await;
    assert!(paths.pid_table_file().exists());

    let second = Manager::new(paths.clone(), fast_settings(), vec![spec("svc", "app.sh")]);
    assert_eq!(second.restore_pids().await, vec!["svc".to_string()]);
    let svc = info(&second, "svc").await;
    assert_eq!(svc.pid, Some(pid));
    assert!(!svc.owned);
    assert_eq!(svc.status, ProgramStatus::Running);

    // No duplicate launch for an adopted program.
    second.tick().await;
    assert_eq!(info(&second, "svc").await.pid, Some(pid));

    stop_and_wait(&second, "svc").await;
    assert!(!overseer::sys::is_pid_alive(pid));
    drop(first);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dead_pid_table_entries_are_not_adopted() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead = child.id();
    child.wait().unwrap();
    std::fs::write(
        paths.pid_table_file(),
        format!(r#"{{"svc": {{"pid": {dead}, "total_restarts": 4}}}}"#),
    )
    .unwrap();

    let manager = Manager::new(paths.clone(), fast_settings(), vec![spec("svc", "app.sh")]);
    assert!(manager.restore_pids().await.is_empty());
    assert_eq!(info(&manager, "svc").await.pid, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversized_upload_is_rejected_before_extraction() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), Settings::default(), Vec::new());

    let bytes = vec![0u8; 60 * 1024 * 1024];
    let response = manager.upload(upload_options("big", true), bytes).await;
    assert_error(&response, r"archive too large \(62914560 bytes, limit is 52428800 bytes\)");
    assert!(!paths.program_dir("big").exists());
    assert!(names(&manager).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_with_traversal_entry_is_rejected() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), Settings::default(), Vec::new());

    let archive = zip_of(&[("app.sh", "exit 0\n", 0o644), ("../escape.sh", "x", 0o644)]);
    let response = manager.upload(upload_options("evil", false), archive).await;
    assert_error(&response, "unsafe path");
    assert!(!paths.program_dir("evil").exists());
    assert!(!paths.upload_dir().join("escape.sh").exists());
    assert_eq!(std::fs::read_dir(paths.upload_dir()).unwrap().count(), 0);
    assert!(names(&manager).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_upload_installs_and_starts() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), fast_settings(), Vec::new());

    let archive = zip_of(&[
        ("bundle/app.sh", "exec sleep 30\n", 0o644),
        ("bundle/requirements.txt", "requests\n", 0o644),
        ("bundle/.venv/bin/python", FAKE_PYTHON, 0o755),
    ]);
    let response = manager.upload(upload_options("web", true), archive).await;
    assert!(response.is_success(), "{response:?}");
    assert_eq!(info(&manager, "web").await.status, ProgramStatus::Installing);
    manager.wait_for_tasks().await;

    let web = info(&manager, "web").await;
    assert_eq!(web.status, ProgramStatus::Running);
    assert!(web.spec.uploaded);
    let program_dir = paths.program_dir("web");
    assert!(program_dir.join("app.sh").is_file(), "single top-level folder is flattened");
    assert_eq!(web.spec.cwd.as_deref(), Some(program_dir.as_path()));

    let log = std::fs::read_to_string(paths.log_file("web")).unwrap();
    assert!(log.contains("Using existing environment"), "log: {log}");
    assert!(log.contains("[OK] Install completed"), "log: {log}");

    // The program list on disk now carries the uploaded program.
    let saved = std::fs::read_to_string(paths.programs_file()).unwrap();
    assert!(saved.contains("uploaded = true"), "{saved}");

    stop_and_wait(&manager, "web").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_update_restores_previous_version() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), fast_settings(), Vec::new());

    let v1 = zip_of(&[
        ("app.sh", "echo v1\nexec sleep 30\n", 0o644),
        ("requirements.txt", "requests==1.0\n", 0o644),
        (".venv/bin/python", FAKE_PYTHON, 0o755),
    ]);
    assert!(manager.upload(upload_options("svc", false), v1).await.is_success());
    manager.wait_for_tasks().await;
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Stopped);

    let program_dir = paths.program_dir("svc");
    let app_before = std::fs::read(program_dir.join("app.sh")).unwrap();
    let reqs_before = std::fs::read(program_dir.join("requirements.txt")).unwrap();

    let v2 = zip_of(&[
        ("app.sh", "echo v2\nexec sleep 30\n", 0o644),
        ("requirements.txt", "FAIL\n", 0o644),
        ("extra.txt", "new file\n", 0o644),
    ]);
    let response = manager.update("svc", v2).await;
    assert!(response.is_success(), "{response:?}");
    manager.wait_for_tasks().await;

    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Error);
    assert_eq!(std::fs::read(program_dir.join("app.sh")).unwrap(), app_before);
    assert_eq!(
        std::fs::read(program_dir.join("requirements.txt")).unwrap(),
        reqs_before
    );
    assert!(!program_dir.join("extra.txt").exists());
    assert!(program_dir.join(".venv/bin/python").exists());
    assert!(!paths.program_backup_dir("svc").exists());

    let log = std::fs::read_to_string(paths.log_file("svc")).unwrap();
    assert!(log.contains("no matching distribution"), "log: {log}");
    assert!(log.contains("[FAILED] Update"), "log: {log}");
    assert!(log.contains("Restoring previous version"), "log: {log}");

    // The restored version still starts.
    assert!(manager.start("svc").await.is_success());
    stop_and_wait(&manager, "svc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_successful_update_keeps_environment() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), fast_settings(), Vec::new());

    let v1 = zip_of(&[
        ("app.sh", "exec sleep 30\n", 0o644),
        (".venv/bin/python", FAKE_PYTHON, 0o755),
    ]);
    assert!(manager.upload(upload_options("svc", false), v1).await.is_success());
    manager.wait_for_tasks().await;

    let v2 = zip_of(&[("app.sh", "echo v2\nexec sleep 30\n", 0o644)]);
    assert!(manager.update("svc", v2).await.is_success());
    manager.wait_for_tasks().await;

    let program_dir = paths.program_dir("svc");
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Stopped);
    assert_eq!(
        std::fs::read_to_string(program_dir.join("app.sh")).unwrap(),
        "echo v2\nexec sleep 30\n"
    );
    assert!(program_dir.join(".venv/bin/python").exists());
    assert!(!paths.program_backup_dir("svc").exists());
    let leftovers: Vec<_> = std::fs::read_dir(paths.upload_dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("svc")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_update_rejects_running_program() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), fast_settings(), Vec::new());

    let v1 = zip_of(&[
        ("app.sh", "exec sleep 30\n", 0o644),
        (".venv/bin/python", FAKE_PYTHON, 0o755),
    ]);
    assert!(manager.upload(upload_options("svc", true), v1).await.is_success());
    manager.wait_for_tasks().await;
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Running);

    let v2 = zip_of(&[("app.sh", "exit 0\n", 0o644)]);
    assert_error(&manager.update("svc", v2).await, "must be stopped");

    stop_and_wait(&manager, "svc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dependency_install_timeout_marks_error() {
    let (_dir, paths) = setup();
    let settings = Settings {
        dependency_timeout: Duration::from_millis(500),
        ..fast_settings()
    };
    let manager = Manager::new(paths.clone(), settings, Vec::new());

    let archive = zip_of(&[
        ("app.sh", "exec sleep 30\n", 0o644),
        ("requirements.txt", "SLOW\n", 0o644),
        (".venv/bin/python", FAKE_PYTHON, 0o755),
    ]);
    let started = Instant::now();
    assert!(manager.upload(upload_options("svc", true), archive).await.is_success());
    manager.wait_for_tasks().await;
    assert!(started.elapsed() < Duration::from_secs(20));

    let svc = info(&manager, "svc").await;
    assert_eq!(svc.status, ProgramStatus::Error);
    assert_eq!(svc.pid, None);
    let log = std::fs::read_to_string(paths.log_file("svc")).unwrap();
    assert!(log.contains("timed out"), "log: {log}");

    // The monitor does not retry a failed install.
    manager.tick().await;
    assert_eq!(info(&manager, "svc").await.status, ProgramStatus::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rename_moves_logs_and_upload_dir() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), fast_settings(), Vec::new());

    let archive = zip_of(&[
        ("app.sh", "echo hello\nexec sleep 30\n", 0o644),
        (".venv/bin/python", FAKE_PYTHON, 0o755),
    ]);
    assert!(manager.upload(upload_options("old", false), archive).await.is_success());
    manager.wait_for_tasks().await;
    assert!(paths.log_file("old").exists());

    let response = manager
        .edit(
            "old",
            ProgramEdit {
                new_name: Some("new".to_string()),
                comment: Some("renamed".to_string()),
                ..ProgramEdit::default()
            },
        )
        .await;
    assert!(response.is_success(), "{response:?}");

    assert_eq!(names(&manager).await, vec!["new".to_string()]);
    assert!(!paths.log_file("old").exists());
    assert!(paths.log_file("new").exists());
    assert!(!paths.program_dir("old").exists());
    assert!(paths.program_dir("new").join("app.sh").is_file());

    let renamed = info(&manager, "new").await;
    assert_eq!(renamed.spec.comment.as_deref(), Some("renamed"));
    assert_eq!(
        renamed.spec.cwd.as_deref(),
        Some(paths.program_dir("new").as_path())
    );
    assert_eq!(
        renamed.spec.venv.as_deref(),
        Some(paths.program_dir("new").join(".venv").as_path())
    );

    // The renamed program still launches from its moved directory.
    let response = manager.start("new").await;
    assert!(response.is_success(), "{response:?}");
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut content = String::new();
    while Instant::now() < deadline {
        content = std::fs::read_to_string(paths.log_file("new")).unwrap();
        if content.contains("hello") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(content.contains("hello"), "log: {content}");
    stop_and_wait(&manager, "new").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rename_requires_stopped_program() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    let manager = Manager::new(
        paths,
        fast_settings(),
        vec![spec("svc", "app.sh"), spec("other", "app.sh")],
    );
    assert!(manager.start("svc").await.is_success());

    let rename = |to: &str| ProgramEdit {
        new_name: Some(to.to_string()),
        ..ProgramEdit::default()
    };
    assert_error(&manager.edit("svc", rename("moved")).await, "must be stopped");
    assert_error(&manager.edit("other", rename("svc")).await, "already exists");

    // Non-rename edits on a running program only take effect on restart.
    let response = manager
        .edit(
            "svc",
            ProgramEdit {
                args: Some(vec!["-x".to_string()]),
                ..ProgramEdit::default()
            },
        )
        .await;
    assert!(
        response
            .message()
            .is_some_and(|m| m.contains("restart required")),
        "{response:?}"
    );

    stop_and_wait(&manager, "svc").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_deletes_program_and_files() {
    let (_dir, paths) = setup();
    let manager = Manager::new(paths.clone(), fast_settings(), Vec::new());

    let archive = zip_of(&[
        ("app.sh", "exec sleep 30\n", 0o644),
        (".venv/bin/python", FAKE_PYTHON, 0o755),
    ]);
    assert!(manager.upload(upload_options("svc", true), archive).await.is_success());
    manager.wait_for_tasks().await;

    assert_error(&manager.remove("svc").await, "must be stopped");
    stop_and_wait(&manager, "svc").await;

    assert!(manager.remove("svc").await.is_success());
    assert!(names(&manager).await.is_empty());
    assert!(!paths.log_file("svc").exists());
    assert!(!paths.program_dir("svc").exists());
    let saved = std::fs::read_to_string(paths.programs_file()).unwrap();
    assert!(!saved.contains("svc"), "{saved}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reload_adds_programs_and_keeps_running_ones() {
    let (dir, paths) = setup();
    write_script(dir.path(), "app.sh", "exec sleep 30\n");
    std::fs::write(paths.settings_file(), "[restart]\ndelay_seconds = 0.02\n").unwrap();
    std::fs::write(
        paths.programs_file(),
        "[[programs]]\nname = \"svc\"\nscript = \"app.sh\"\ntype = \"python\"\n",
    )
    .unwrap();
    let manager = Manager::load(paths.clone()).unwrap();
    manager.tick().await;
    let pid = info(&manager, "svc").await.pid.unwrap();

    std::fs::write(
        paths.programs_file(),
        "[[programs]]\nname = \"svc\"\nscript = \"app.sh\"\ntype = \"python\"\ncomment = \"edited\"\n\n\
         [[programs]]\nname = \"extra\"\nscript = \"app.sh\"\ntype = \"python\"\nenabled = false\n",
    )
    .unwrap();
    let response = manager.reload().await;
    assert!(response.is_success(), "{response:?}");

    let svc = info(&manager, "svc").await;
    assert_eq!(svc.pid, Some(pid), "reload leaves running processes alone");
    assert_eq!(svc.spec.comment.as_deref(), Some("edited"));
    let extra = info(&manager, "extra").await;
    assert_eq!(extra.status, ProgramStatus::Stopped);

    // A broken file keeps what is loaded.
    std::fs::write(paths.programs_file(), "[[programs]\n").unwrap();
    assert!(!manager.reload().await.is_success());
    assert_eq!(names(&manager).await.len(), 2);

    stop_and_wait(&manager, "svc").await;
}
