//! Integration tests for the navindex CLI.
//!
//! Indexing tests run real worker threads and worker processes against a
//! temporary source tree.

use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{TempDir, tempdir};

/// Get a command for the navindex binary with an isolated data directory.
fn navindex(data_dir: &Path) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("navindex").unwrap();
    cmd.env("NAVINDEX_DATA_DIR", data_dir)
        .env_remove("NAVINDEX_JOBS")
        .env_remove("NAVINDEX_LOG")
        .env_remove("RUST_LOG");
    cmd
}

/// Creates a small mixed C++/Java tree with one file that is not a source.
fn create_source_tree() -> TempDir {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("native")).unwrap();
    fs::create_dir_all(root.join("java/app")).unwrap();
    fs::write(root.join("native/main.cpp"), "int main() { return 0; }\n").unwrap();
    fs::write(root.join("native/util.h"), "#pragma once\nint util();\n").unwrap();
    fs::write(root.join("native/util.cc"), "int util() { return 1; }\n").unwrap();
    fs::write(
        root.join("java/app/Main.java"),
        "class Main { public static void main(String[] a) {} }\n",
    )
    .unwrap();
    fs::write(root.join("README.md"), "# sample\n").unwrap();
    dir
}

#[test]
fn test_help_displays() {
    let data = tempdir().unwrap();
    navindex(data.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("index"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("gc"))
        .stdout(predicate::str::contains("completions"))
        .stdout(predicate::str::contains("Run as an indexing worker").not());
}

#[test]
fn test_version_displays() {
    let data = tempdir().unwrap();
    navindex(data.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("navindex"))
        .stdout(predicate::str::is_match(r"\d+\.\d+\.\d+").unwrap());
}

#[test]
fn test_completions_bash() {
    let data = tempdir().unwrap();
    navindex(data.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("navindex"));
}

#[test]
fn test_check_shared_memory() {
    let data = tempdir().unwrap();
    navindex(data.path())
        .args(["--no-color", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Shared memory check passed"));
}

#[test]
fn test_gc_runs() {
    let data = tempdir().unwrap();
    navindex(data.path())
        .args(["--no-color", "gc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("abandoned segment(s)"));
}

#[test]
fn test_index_with_threads() {
    let data = tempdir().unwrap();
    let sources = create_source_tree();
    navindex(data.path())
        .args(["--no-color", "index", "--threads", "-j", "2"])
        .arg(sources.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("Indexing 4 files with 2 workers"))
        .stderr(predicate::str::contains("Indexing complete!"))
        .stderr(predicate::str::contains("Files indexed: 4/4"))
        .stderr(predicate::str::contains("Errors: 0"));
}

#[test]
fn test_index_with_worker_processes() {
    let data = tempdir().unwrap();
    let sources = create_source_tree();
    navindex(data.path())
        .args(["--no-color", "index", "-j", "2", "--poll-interval-ms", "50"])
        .arg(sources.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("Indexing complete!"))
        .stderr(predicate::str::contains("Files indexed: 4/4"))
        .stderr(predicate::str::contains("Crashed files").not());

    // Worker processes log to per-slot files under the data directory.
    assert!(data.path().join("logs/worker_1.log").exists());
}

#[test]
fn test_index_single_file() {
    let data = tempdir().unwrap();
    let sources = create_source_tree();
    navindex(data.path())
        .args(["--no-color", "index", "--threads"])
        .arg(sources.path().join("java/app/Main.java"))
        .assert()
        .success()
        .stderr(predicate::str::contains("Files indexed: 1/1"));
}

#[test]
fn test_index_without_sources() {
    let data = tempdir().unwrap();
    let empty = tempdir().unwrap();
    fs::write(empty.path().join("notes.txt"), "nothing to index").unwrap();
    navindex(data.path())
        .args(["--no-color", "index", "--threads"])
        .arg(empty.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("No C, C++ or Java sources found."));
}

#[test]
fn test_index_missing_path_fails() {
    let data = tempdir().unwrap();
    navindex(data.path())
        .args(["--no-color", "index", "/nonexistent/navindex/sources"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_index_quiet_prints_nothing() {
    let data = tempdir().unwrap();
    let sources = create_source_tree();
    navindex(data.path())
        .args(["-q", "index", "--threads"])
        .arg(sources.path())
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
}

#[test]
fn test_worker_without_owner_fails() {
    let data = tempdir().unwrap();
    let instance = uuid_like();
    navindex(data.path())
        .args(["--no-color", "worker", "1", &instance, "/", "/tmp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Worker 1 failed"));
}

#[test]
fn test_worker_rejects_orchestrator_slot() {
    let data = tempdir().unwrap();
    let instance = uuid_like();
    navindex(data.path())
        .args(["--no-color", "worker", "0", &instance, "/", "/tmp"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

/// A run id no orchestrator owns.
fn uuid_like() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{:032x}", nanos ^ u128::from(std::process::id()))
}
