//! CLI integration tests for odin-migrate.
//!
//! These tests cover argument parsing, help output, and the exit codes of
//! failures that happen before any database connection is attempted.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

/// Get a command for the odin-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("odin-migrate").unwrap()
}

/// A config that parses and validates but points at unreachable databases.
fn valid_config() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "source:\n  host: 127.0.0.1\n  port: 1\n  database: heimdall\ntarget:\n  host: 127.0.0.1\n  port: 1\n  database: odin"
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("validate"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--entities"))
        .stdout(predicate::str::contains("--force"))
        .stdout(predicate::str::contains("--fail-fast"))
        .stdout(predicate::str::contains("--filter"))
        .stdout(predicate::str::contains("--validate"))
        .stdout(predicate::str::contains("--preflight"))
        .stdout(predicate::str::contains("--strict"))
        .stdout(predicate::str::contains("--batch-size"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("odin-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--state-file"))
        .stdout(predicate::str::contains("--log-file"))
        .stdout(predicate::str::contains("--verbose"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

// =============================================================================
// Exit Code Tests - Config Errors (Exit Code 1) and IO Errors (Exit Code 7)
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = NamedTempFile::new().unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_missing_target_section_exits_with_code_1() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "source:\n  host: localhost\n  database: heimdall").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_unknown_entity_exits_with_code_1() {
    let config = valid_config();
    cmd()
        .args(["-c", config.path().to_str().unwrap(), "run", "--entities", "teachers,staff"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("staff"));
}

#[test]
fn test_bad_filter_exits_with_code_1() {
    let config = valid_config();
    cmd()
        .args(["-c", config.path().to_str().unwrap(), "run", "--filter", "colour=blue"])
        .assert()
        .code(1);
}

#[test]
fn test_zero_batch_size_exits_with_code_1() {
    let config = valid_config();
    cmd()
        .args(["-c", config.path().to_str().unwrap(), "run", "--batch-size", "0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("batch_size"));
}

#[test]
fn test_unreachable_database_exits_with_code_4() {
    let config = valid_config();
    cmd()
        .args(["-c", config.path().to_str().unwrap(), "health-check"])
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .code(4);
}

// =============================================================================
// Subcommand Existence Tests
// =============================================================================

#[test]
fn test_health_check_command_exists() {
    cmd()
        .args(["health-check", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Test database connections"));
}

#[test]
fn test_validate_command_exists() {
    cmd()
        .args(["validate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Validate a finished run"));
}

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
