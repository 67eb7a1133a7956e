#![cfg(unix)]

use std::fs;

use assert_cmd::Command;
use predicates::prelude::PredicateBooleanExt;
use predicates::str::contains;
use tempfile::tempdir;

fn procpipe() -> Command {
    Command::new(env!("CARGO_BIN_EXE_procpipe"))
}

#[test]
fn config_file_settings_are_applied() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("procpipe.toml");
    fs::write(
        &path,
        "queue_capacity = 1\nread_buffer_size = 1\n\n[overflow]\nmode = \"block\"\n",
    )?;

    procpipe()
        .arg("--config")
        .arg(&path)
        .args(["--", "/bin/sh", "-c", "printf abcdef"])
        .assert()
        .success()
        .stdout("abcdef");
    Ok(())
}

#[test]
fn invalid_config_is_reported() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("procpipe.toml");
    fs::write(&path, "queue_capacity = 0\n")?;

    procpipe()
        .arg("--config")
        .arg(&path)
        .args(["--", "cat"])
        .write_stdin("")
        .assert()
        .code(1)
        .stderr(contains("queue_capacity must be at least 1"));
    Ok(())
}

#[test]
fn malformed_config_names_the_file() -> anyhow::Result<()> {
    let tmp = tempdir()?;
    let path = tmp.path().join("broken.toml");
    fs::write(&path, "queue_capacity = \"many\"\n")?;

    procpipe()
        .arg("--config")
        .arg(&path)
        .args(["--", "cat"])
        .assert()
        .code(1)
        .stderr(contains("failed to parse config file").and(contains("broken.toml")));
    Ok(())
}
