//! Smoke tests -- verify the binary runs and the offline subcommands work.

use std::path::Path;
use std::sync::Arc;

use assert_cmd::Command;
use culprit_finder::bisect::Verdict;
use culprit_finder::storage::{ResultCache, SessionState, SessionStore, SqliteStore, WorkflowKey};
use predicates::prelude::*;

/// The binary with a private HOME and no ambient config or credentials.
fn cli(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("culprit-finder").unwrap();
    cmd.env("HOME", home)
        .env_remove("CULPRIT_FINDER_CONFIG")
        .env_remove("GH_TOKEN")
        .env_remove("GITHUB_TOKEN")
        .env_remove("CULPRIT_FINDER_DB")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    let home = tempfile::tempdir().unwrap();
    cli(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Find the commit that broke"))
        .stdout(predicate::str::contains("bisect"));
}

#[test]
fn test_cli_version() {
    let home = tempfile::tempdir().unwrap();
    cli(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("culprit-finder"));
}

#[test]
fn test_bisect_subcommand_exists() {
    let home = tempfile::tempdir().unwrap();
    cli(home.path())
        .args(["bisect", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--repo"))
        .stdout(predicate::str::contains("--no-cache"));
}

#[test]
fn test_bisect_requires_boundaries() {
    let home = tempfile::tempdir().unwrap();
    cli(home.path())
        .args(["bisect", "--repo", "o/r"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--start"));
}

#[test]
fn test_bisect_url_conflicts_with_repo() {
    let home = tempfile::tempdir().unwrap();
    cli(home.path())
        .args([
            "bisect",
            "--url",
            "https://github.com/o/r/actions/runs/1",
            "--repo",
            "o/r",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_resume_conflicts_with_fresh() {
    let home = tempfile::tempdir().unwrap();
    cli(home.path())
        .args([
            "bisect", "-r", "o/r", "-s", "a", "-e", "b", "-w", "ci.yml", "--resume", "--fresh",
        ])
        .assert()
        .failure();
}

#[test]
fn test_bisect_without_token_fails() {
    let home = tempfile::tempdir().unwrap();
    let db = home.path().join("state.db");
    cli(home.path())
        .env("PATH", "")
        .args(["--db", db.to_str().unwrap()])
        .args(["bisect", "-r", "o/r", "-s", "a", "-e", "b", "-w", "ci.yml"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not authenticated"));
}

#[test]
fn test_cache_list_empty() {
    let home = tempfile::tempdir().unwrap();
    let db = home.path().join("state.db");
    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["cache", "list", "-r", "o/r", "-w", "ci.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No cached verdicts."));
}

#[test]
fn test_cache_list_and_clear() {
    let home = tempfile::tempdir().unwrap();
    let db = home.path().join("state.db");
    {
        let cache = ResultCache::new(Arc::new(SqliteStore::open(&db).unwrap()));
        let key = WorkflowKey::new("o/r", "ci.yml", None);
        cache.put(&key, "deadbeef", Verdict::Bad).unwrap();
        cache.put(&key, "cafef00d", Verdict::Good).unwrap();
    }

    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["cache", "list", "-r", "o/r", "-w", "ci.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("deadbeef"))
        .stdout(predicate::str::contains("BAD"))
        .stdout(predicate::str::contains("2 cached verdict(s)"));

    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["cache", "clear", "-r", "o/r", "-w", "ci.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 2 cached verdict(s)."));

    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["cache", "list", "-r", "o/r", "-w", "ci.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No cached verdicts."));
}

#[test]
fn test_session_show_and_clear() {
    let home = tempfile::tempdir().unwrap();
    let db = home.path().join("state.db");

    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["session", "show", "-r", "o/r", "-w", "ci.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No saved session."));

    {
        let sessions = SessionStore::new(Arc::new(SqliteStore::open(&db).unwrap()));
        let key = WorkflowKey::new("o/r", "ci.yml", Some("build".into()));
        let mut state = SessionState::new(&key, vec!["g".into(), "x".into(), "b".into()]);
        sessions.save(&mut state).unwrap();
    }

    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["session", "show", "-r", "o/r", "-w", "ci.yml", "-j", "build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ACTIVE"))
        .stdout(predicate::str::contains("[0, 2] g..b"));

    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["session", "clear", "-r", "o/r", "-w", "ci.yml", "-j", "build"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Session cleared."));
}

#[test]
fn test_session_unlock_without_lock() {
    let home = tempfile::tempdir().unwrap();
    let db = home.path().join("state.db");
    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["session", "unlock", "-r", "o/r", "-w", "ci.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No lock held."));
}

#[test]
fn test_invalid_repository_rejected() {
    let home = tempfile::tempdir().unwrap();
    let db = home.path().join("state.db");
    cli(home.path())
        .args(["--db", db.to_str().unwrap()])
        .args(["session", "show", "-r", "not-a-repo", "-w", "ci.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid repository"));
}
