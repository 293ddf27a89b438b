//! End-to-end tests against the built `tesserad` binary.
//!
//! Every test gets its own config home so identities and config files
//! never leak between runs. Each test is responsible for any processes it
//! spawns.

use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use tessera_core::ref_file::{load_ref_file, root_of};

fn tesserad(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tesserad"));
    cmd.env("XDG_CONFIG_HOME", home)
        .env_remove("TESSERA_CONFIG")
        .env("RUST_LOG", "warn");
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    tesserad(home)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run tesserad {args:?}: {e}"))
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn spawn_server(home: &Path, ref_file: &Path) -> Child {
    tesserad(home)
        .args(["serve", &ref_file.to_string_lossy()])
        .stdout(Stdio::null())
        .spawn()
        .expect("failed to spawn tesserad serve")
}

fn wait_for_file(path: &Path, timeout_secs: u64) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    while Instant::now() < deadline {
        if path.exists() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(50));
    }
    bail!("{} did not appear within {timeout_secs}s", path.display())
}

fn wait_for_exit(child: &mut Child, timeout_secs: u64) -> Result<std::process::ExitStatus> {
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().context("try_wait failed")? {
            return Ok(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    bail!("process still running after {timeout_secs}s")
}

// ── TCP ───────────────────────────────────────────────────────────────────────

#[test]
fn serve_then_call_over_ref_file() {
    let home = tempfile::tempdir().unwrap();
    let ref_file = home.path().join("server.ref");
    let mut server = spawn_server(home.path(), &ref_file);

    let result = (|| -> Result<()> {
        wait_for_file(&ref_file, 20)?;
        let output = run(home.path(), &["call", &ref_file.to_string_lossy(), "hello"]);
        if !output.status.success() {
            bail!("call failed: {}", stderr(&output));
        }
        assert_eq!(stdout(&output), "hello to you too");
        Ok(())
    })();

    server.kill().ok();
    server.wait().ok();
    result.unwrap();
}

#[test]
fn server_identity_survives_restart() {
    let home = tempfile::tempdir().unwrap();
    let first = home.path().join("first.ref");
    let second = home.path().join("second.ref");

    let mut server = spawn_server(home.path(), &first);
    let waited = wait_for_file(&first, 20);
    server.kill().ok();
    server.wait().ok();
    waited.unwrap();
    assert!(home.path().join("tessera/identity.key").exists());

    let mut server = spawn_server(home.path(), &second);
    let waited = wait_for_file(&second, 20);
    server.kill().ok();
    server.wait().ok();
    waited.unwrap();

    let a = root_of(&load_ref_file(&first).unwrap()).unwrap();
    let b = root_of(&load_ref_file(&second).unwrap()).unwrap();
    assert_eq!(a, b);
}

#[test]
fn call_without_ref_file_fails() {
    let home = tempfile::tempdir().unwrap();
    let missing = home.path().join("nobody.ref");
    let output = run(home.path(), &["call", &missing.to_string_lossy(), "hello"]);
    assert!(!output.status.success());
    assert!(stdout(&output).is_empty());
}

#[test]
fn unknown_command_prints_usage() {
    let home = tempfile::tempdir().unwrap();
    let output = run(home.path(), &["dance"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("usage:"));
}

// ── Pipes ─────────────────────────────────────────────────────────────────────

#[test]
fn spawned_child_answers_echo() {
    let home = tempfile::tempdir().unwrap();
    let output = run(home.path(), &["spawn", "echo", "hi there"]);
    assert!(output.status.success(), "spawn failed: {}", stderr(&output));
    assert_eq!(stdout(&output), "hi there to you too");
}

#[test]
fn servant_error_crosses_the_pipe() {
    let home = tempfile::tempdir().unwrap();
    let output = run(home.path(), &["spawn", "fail", "not today"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("requested"), "unexpected stderr: {err}");
    assert!(err.contains("not today"), "unexpected stderr: {err}");
}

#[test]
fn child_panic_is_reported_as_exception() {
    let home = tempfile::tempdir().unwrap();
    let output = run(home.path(), &["spawn", "crash", "now"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("remote exception"), "unexpected stderr: {err}");
    assert!(err.contains("crash requested"), "unexpected stderr: {err}");
}

#[test]
fn child_exits_when_parent_hangs_up() {
    let home = tempfile::tempdir().unwrap();
    let mut child = tesserad(home.path())
        .arg("child")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to spawn tesserad child");

    drop(child.stdin.take());
    let status = wait_for_exit(&mut child, 20);
    if status.is_err() {
        child.kill().ok();
    }
    assert!(status.unwrap().success());
}
