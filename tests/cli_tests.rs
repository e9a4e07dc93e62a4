// Tests for the command line surface of the backup binary

use assert_cmd::Command;
use predicates::prelude::*;

fn backup() -> Command {
    Command::cargo_bin("backup").unwrap()
}

#[test]
fn test_help_lists_flags() {
    backup()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--foreground"))
        .stdout(predicate::str::contains("--source"))
        .stdout(predicate::str::contains("--profile"));
}

#[test]
fn test_version() {
    backup()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_flag_is_rejected() {
    backup()
        .arg("--no-such-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--no-such-flag"));
}

#[test]
fn test_invalid_environment_exits_with_failure() {
    backup()
        .env_clear()
        .env("OFFEN_BACKUP_COMPRESSION", "brotli")
        .assert()
        .failure()
        .code(1);
}
