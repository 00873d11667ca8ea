//! Shared test harness for git-cli integration tests.
//!
//! Provides process runners and assertion helpers used by the storage-engine
//! test suite. Environment variables are pinned for deterministic output
//! across machines and CI runners.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Captured output from running a command.
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Discover the path to the compiled `gitr` binary.
pub fn gitr_bin() -> PathBuf {
    let mut path = std::env::current_exe()
        .unwrap()
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .to_path_buf();
    path.push("gitr");
    path
}

fn pin_env(cmd: &mut Command, dir: &Path) {
    cmd.env("GIT_AUTHOR_NAME", "Test Author")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_AUTHOR_DATE", "1234567890 +0000")
        .env("GIT_COMMITTER_NAME", "Test Committer")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_DATE", "1234567890 +0000")
        .env("TZ", "UTC")
        .env("LC_ALL", "C")
        .env("LANG", "C")
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("HOME", dir.parent().unwrap_or(dir));
}

/// Run C git in `dir` with the given arguments. Returns a `CommandResult`.
pub fn git(dir: &Path, args: &[&str]) -> CommandResult {
    let mut cmd = Command::new("git");
    cmd.args(args).current_dir(dir);
    pin_env(&mut cmd, dir);
    let output = cmd.output().expect("failed to run git");
    CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(128),
    }
}

/// Run the gitr binary in `dir` with the given arguments. Returns a `CommandResult`.
pub fn gitr(dir: &Path, args: &[&str]) -> CommandResult {
    let mut cmd = Command::new(gitr_bin());
    cmd.args(args).current_dir(dir);
    pin_env(&mut cmd, dir);
    let output = cmd.output().expect("failed to run gitr");
    CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(128),
    }
}

/// Run the gitr binary in `dir` with piped stdin. Returns a `CommandResult`.
pub fn gitr_stdin(dir: &Path, args: &[&str], stdin_bytes: &[u8]) -> CommandResult {
    let mut cmd = Command::new(gitr_bin());
    cmd.args(args)
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    pin_env(&mut cmd, dir);
    let mut child = cmd.spawn().expect("failed to spawn gitr");
    {
        use std::io::Write;
        child.stdin.take().unwrap().write_all(stdin_bytes).unwrap();
    }
    let output = child.wait_with_output().expect("failed to wait on gitr");
    CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(128),
    }
}

/// Initialize a repo with real git (used purely as a fixture generator for
/// tests that exercise gitr's plumbing against objects/refs git itself wrote).
pub fn setup_test_repo(dir: &Path) {
    git(dir, &["init"]);
    git(dir, &["config", "user.name", "Test Author"]);
    git(dir, &["config", "user.email", "test@example.com"]);

    std::fs::write(dir.join("hello.txt"), "hello world\n").unwrap();
    std::fs::write(dir.join("foo.txt"), "foo content\n").unwrap();

    git(dir, &["add", "hello.txt", "foo.txt"]);
    git(dir, &["commit", "-m", "initial commit"]);
}

/// Assert that stdout and exit_code are identical between two results.
pub fn assert_output_eq(expected: &CommandResult, actual: &CommandResult) {
    assert_exit_code_eq(expected, actual);
    if expected.stdout != actual.stdout {
        panic!(
            "Stdout mismatch (exit codes both {}):\n--- expected ---\n{}\n--- actual ---\n{}\n--- end ---",
            expected.exit_code, expected.stdout, actual.stdout,
        );
    }
}

/// Assert that only exit codes match.
pub fn assert_exit_code_eq(expected: &CommandResult, actual: &CommandResult) {
    if expected.exit_code != actual.exit_code {
        panic!(
            "Exit code mismatch:\n  expected: {} (stdout: {:?})\n  actual:   {} (stdout: {:?})",
            expected.exit_code,
            expected.stdout.chars().take(200).collect::<String>(),
            actual.exit_code,
            actual.stdout.chars().take(200).collect::<String>(),
        );
    }
}
