//! Integration tests for the conductor CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{Repository, Signature};
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const CREDENTIAL_VARS: [&str; 4] = [
    "CLINE_PROVIDER",
    "CLINE_API_KEY",
    "CLINE_MODEL_ID",
    "CLINE_BASE_URL",
];

/// A conductor command isolated from the caller's environment.
fn conductor(project: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.current_dir(project.path())
        .env("CONDUCTOR_DB", project.path().join("runs.db"))
        .env("CONDUCTOR_WORKSPACE_DIR", project.path().join("workspaces"))
        .env_remove("CLINE_CMD")
        .env_remove("RUST_LOG");
    for var in CREDENTIAL_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// A git repository with one commit on `main`.
fn source_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let repo = Repository::init(dir.path()).unwrap();
    fs::write(dir.path().join("README.md"), "# widgets\n").unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@localhost").unwrap();
    repo.commit(Some("refs/heads/main"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
    repo.set_head("refs/heads/main").unwrap();
    dir
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("sweep"));
    }

    #[test]
    fn test_version() {
        let project = TempDir::new().unwrap();
        conductor(&project).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_config() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized conductor project"));
        assert!(project.path().join(".conductor/conductor.toml").exists());

        conductor(&project)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Conductor Configuration"))
            .stdout(predicate::str::contains("No conductor.toml found"))
            .stdout(predicate::str::contains("cancel_grace_secs = 10"));
    }

    #[test]
    fn test_config_show_env_overrides() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .env("CLINE_CMD", "/opt/cline/bin/cline")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("agent_command = \"/opt/cline/bin/cline\""));
    }

    #[test]
    fn test_config_init_then_validate() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created conductor.toml"));

        conductor(&project)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let project = TempDir::new().unwrap();
        let dir = project.path().join(".conductor");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("conductor.toml"),
            "[agent]\nread_timeout_secs = 0\n\n[workspace]\ngit_user_name = \"bot\"\n",
        )
        .unwrap();

        conductor(&project)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings:"))
            .stdout(predicate::str::contains("read_timeout_secs"));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let project = TempDir::new().unwrap();
        let dir = project.path().join(".conductor");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("conductor.toml"), "[agent]\ndriver = \"docker\"\n").unwrap();

        conductor(&project).args(["config", "show"]).assert().failure();
    }
}

mod run_history {
    use super::*;

    #[test]
    fn test_runs_on_empty_database() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs recorded."));
        assert!(project.path().join("runs.db").exists());
    }

    #[test]
    fn test_stats_on_empty_database() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .arg("stats")
            .assert()
            .success()
            .stdout(predicate::str::contains("total:     0"));
    }

    #[test]
    fn test_show_unknown_run_fails() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .args(["show", "7d0c8a5e-8f3b-4a65-9a55-2f0f9b8d1c11"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn test_show_rejects_malformed_id() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .args(["show", "not-a-uuid"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid run id"));
    }

    #[test]
    fn test_runs_rejects_unknown_status() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .args(["runs", "--status", "done"])
            .assert()
            .failure();
    }

    #[test]
    fn test_sweep_removes_orphan_workspaces() {
        let project = TempDir::new().unwrap();
        let orphan = project.path().join("workspaces/run-deadbeef-widgets");
        fs::create_dir_all(&orphan).unwrap();

        conductor(&project)
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("removed 1 orphan workspace(s)"));
        assert!(!orphan.exists());
    }
}

mod run_command {
    use super::*;

    #[test]
    fn test_run_without_credentials_fails() {
        let project = TempDir::new().unwrap();
        conductor(&project)
            .args(["run", "--repo", "https://example.com/acme/widgets.git", "--task", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("credentials missing"));
    }

    #[test]
    fn test_dry_run_end_to_end() {
        let project = TempDir::new().unwrap();
        let src = source_repo();

        conductor(&project)
            .args([
                "run",
                "--dry-run",
                "--yes",
                "--repo",
                &src.path().to_string_lossy(),
                "--ref",
                "main",
                "--task",
                "add unit tests",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Proposed plan"))
            .stdout(predicate::str::contains("Auto-approved"))
            .stdout(predicate::str::contains("succeeded"));

        let workspaces = project.path().join("workspaces");
        let leftover = fs::read_dir(&workspaces)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("run-"))
                    .count()
            })
            .unwrap_or(0);
        assert_eq!(leftover, 0, "workspace should be removed after the run");
        let leases = fs::read_dir(workspaces.join(".leases"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leases, 0, "run lease should be released after the run");
    }

    #[test]
    fn test_dry_run_with_missing_ref_fails() {
        let project = TempDir::new().unwrap();
        let src = source_repo();

        conductor(&project)
            .args([
                "run",
                "--dry-run",
                "--yes",
                "--repo",
                &src.path().to_string_lossy(),
                "--ref",
                "no-such-branch",
                "--task",
                "x",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("setup failed"));
    }
}
