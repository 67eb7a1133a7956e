#![cfg(unix)]

use assert_cmd::Command;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;

fn procpipe() -> Command {
    Command::new(env!("CARGO_BIN_EXE_procpipe"))
}

#[test]
fn stdin_is_relayed_to_the_child_and_back() -> anyhow::Result<()> {
    procpipe()
        .args(["--queue-capacity", "2", "--buffer-size", "3", "--", "cat"])
        .write_stdin("hello through the bridge\n")
        .assert()
        .success()
        .stdout("hello through the bridge\n");
    Ok(())
}

#[test]
fn stderr_and_exit_code_are_preserved() -> anyhow::Result<()> {
    procpipe()
        .args(["--", "/bin/sh", "-c", "printf out; printf err >&2; exit 3"])
        .assert()
        .code(3)
        .stdout("out")
        .stderr(contains("err"));
    Ok(())
}

#[test]
fn signal_exit_maps_to_shell_status() -> anyhow::Result<()> {
    procpipe()
        .args(["--", "/bin/sh", "-c", "kill -TERM $$"])
        .assert()
        .code(128 + 15);
    Ok(())
}

#[test]
fn missing_program_reports_the_launch_error() -> anyhow::Result<()> {
    procpipe()
        .args(["--", "/nonexistent/procpipe-test-binary"])
        .assert()
        .code(1)
        .stderr(contains("procpipe: failed to spawn `/nonexistent/procpipe-test-binary`"));
    Ok(())
}

#[test]
fn pty_mode_merges_output() -> anyhow::Result<()> {
    procpipe()
        .args(["--pty", "--", "/bin/sh", "-c", "printf pty-out; printf pty-err >&2"])
        .write_stdin("")
        .assert()
        .success()
        .stdout(contains("pty-out").and(contains("pty-err")));
    Ok(())
}
