//! CLI surface checks: argument parsing, exit codes, and the init/validate
//! flows against a scratch configuration directory.

use assert_cmd::Command;
use predicates::prelude::*;

fn ashep() -> Command {
    Command::cargo_bin("ashep").unwrap()
}

#[test]
fn help_lists_subcommands() {
    ashep()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker"))
        .stdout(predicate::str::contains("monitor"))
        .stdout(predicate::str::contains("validate-policy-chain"))
        .stdout(predicate::str::contains("show-policy-tree"));
}

#[test]
fn version_flag_works() {
    ashep()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ashep"));
}

#[test]
fn missing_policies_fails_with_exit_code_one() {
    let dir = tempfile::tempdir().unwrap();
    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("validate-policy-chain")
        .assert()
        .failure()
        .code(1);
}

#[test]
fn init_seeds_config_files() {
    let dir = tempfile::tempdir().unwrap();
    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("init")
        .assert()
        .success();

    assert!(dir.path().join("config").join("config.yaml").exists());
    assert!(dir.path().join("config").join("policies.yaml").exists());
    assert!(dir.path().join("config").join("agents.yaml").exists());

    // Re-running keeps existing files.
    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("keeping existing"));
}

#[test]
fn policy_chain_validates_after_init() {
    let dir = tempfile::tempdir().unwrap();
    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("init")
        .assert()
        .success();

    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("validate-policy-chain")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 error(s)"));
}

#[test]
fn show_policy_tree_renders_phases() {
    let dir = tempfile::tempdir().unwrap();
    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("init")
        .assert()
        .success();

    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("show-policy-tree")
        .assert()
        .success()
        .stdout(predicate::str::contains("simple (default)"))
        .stdout(predicate::str::contains("implement"));

    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .args(["show-policy-tree", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"default\": true"));
}

#[test]
fn dead_end_capability_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let config_dir = dir.path().join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("policies.yaml"),
        "default_policy: simple\npolicies:\n  simple:\n    phases:\n      - name: review\n        capabilities: [review]\n",
    )
    .unwrap();
    std::fs::write(
        config_dir.join("agents.yaml"),
        "agents:\n  - id: build\n    capabilities: [code]\n",
    )
    .unwrap();

    ashep()
        .args(["--config-dir", dir.path().to_str().unwrap()])
        .arg("validate-policy-chain")
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("review"));
}
