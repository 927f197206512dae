//! Integration tests for the bizimatch CLI.
//!
//! Every test works in its own temp directory with its own run database and
//! no AI key, so nothing reaches the network.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A bizimatch command isolated to `dir`.
fn bizimatch(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("bizimatch");
    cmd.current_dir(dir.path())
        .env_remove("ANTHROPIC_API_KEY")
        .env_remove("RUST_LOG")
        .env("BIZIMATCH_DB_PATH", dir.path().join("runs.db"));
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("approve"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir).arg("--version").assert().success();
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("max_retries = 3"));
    }

    #[test]
    fn test_config_init_writes_file_once() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created bizimatch.toml"));

        let path = dir.path().join(".bizimatch/bizimatch.toml");
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[pipeline]"));

        bizimatch(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_reports_missing_key() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_explicit_config_path_is_used() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[pipeline]\nmax_retries = 7\n").unwrap();

        bizimatch(&dir)
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_retries = 7"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[pipeline]\nrollback_stage = \"compile\"\n").unwrap();

        bizimatch(&dir)
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("bizimatch.toml"));
    }
}

mod pipeline_commands {
    use super::*;

    #[test]
    fn test_status_with_no_runs() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs yet"));
    }

    #[test]
    fn test_run_rejects_empty_prompt() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["run", "   "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Prompt must not be empty"));
    }

    #[test]
    fn test_run_without_key_fails_at_first_stage() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["run", "Build a todo app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Started run"))
            .stdout(predicate::str::contains("Pipeline failed"))
            .stdout(predicate::str::contains("API key"));

        // The failed run is persisted and visible to later invocations.
        bizimatch(&dir)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("failed"))
            .stdout(predicate::str::contains("prd_generation"));
    }

    #[test]
    fn test_status_unknown_run() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["status", "no-such-run"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_approve_unknown_run() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["approve", "no-such-run"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_cancel_finished_run_fails() {
        let dir = TempDir::new().unwrap();
        bizimatch(&dir)
            .args(["run", "Build a todo app"])
            .assert()
            .success();

        let db = dir.path().join("runs.db");
        let conn = rusqlite::Connection::open(&db).unwrap();
        let run_id: String = conn
            .query_row("SELECT run_id FROM pipeline_runs LIMIT 1", [], |row| row.get(0))
            .unwrap();

        bizimatch(&dir)
            .args(["cancel", &run_id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already failed"));
    }
}
