use assert_cmd::Command;
use cip_testkit::buggy_add_repo_with_check;
use std::fs;

fn write_task(dir: &std::path::Path) -> std::path::PathBuf {
    let task_path = dir.join("task.json");
    fs::write(
        &task_path,
        r#"{"instance_id": "cli-1", "failing_tests": [], "test_cmd": "python3 check_add.py"}"#,
    )
    .expect("write task");
    task_path
}

#[test]
fn missing_required_arguments_exit_nonzero() {
    Command::cargo_bin("cip")
        .expect("binary")
        .assert()
        .failure();
}

#[test]
fn unreadable_task_file_exits_nonzero() {
    let scratch = tempfile::tempdir().expect("scratch");
    Command::cargo_bin("cip")
        .expect("binary")
        .args([
            "--repo",
            scratch.path().to_str().expect("utf8"),
            "--task",
            scratch.path().join("absent.json").to_str().expect("utf8"),
            "--out",
            scratch.path().join("patch.diff").to_str().expect("utf8"),
            "--test-cmd",
            "true",
        ])
        .assert()
        .failure();
}

#[test]
fn unconfigured_model_still_writes_an_empty_patch_and_exits_zero() {
    let repo = buggy_add_repo_with_check();
    let scratch = tempfile::tempdir().expect("scratch");
    let task_path = write_task(scratch.path());
    let out_path = scratch.path().join("patch.diff");
    // No model section configured: the completion client fails loudly and
    // the run errors, but a patch file was produced, so the exit is 0.
    let config_path = scratch.path().join("config.yaml");
    fs::write(
        &config_path,
        format!("logging:\n  dir: {}\n", scratch.path().join("runs").display()),
    )
    .expect("write config");

    Command::cargo_bin("cip")
        .expect("binary")
        .args([
            "--repo",
            repo.path().to_str().expect("utf8"),
            "--task",
            task_path.to_str().expect("utf8"),
            "--out",
            out_path.to_str().expect("utf8"),
            "--test-cmd",
            "python3 check_add.py",
            "--config",
            config_path.to_str().expect("utf8"),
        ])
        .assert()
        .success();

    assert!(out_path.exists(), "patch file is written on every path");
    assert_eq!(fs::read_to_string(&out_path).expect("read patch"), "");
}
