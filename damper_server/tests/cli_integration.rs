use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("damper_server").unwrap()
}

#[test]
fn help_names_the_subcommands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("self-check"));
}

#[test]
fn self_check_passes_on_the_simulated_bench() {
    cmd()
        .arg("self-check")
        .assert()
        .success()
        .stdout(predicate::str::contains("self-check: ok"));
}

#[test]
fn self_check_accepts_a_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(
        f,
        r#"
        [adc]
        host = "127.0.0.1"
        port = 1502

        [logging]
        dir = "{}"
        "#,
        dir.path().display()
    )
    .unwrap();
    drop(f);

    cmd()
        .arg("--config")
        .arg(&path)
        .arg("self-check")
        .assert()
        .success();
}

#[test]
fn invalid_config_exits_with_code_two() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    std::fs::write(&path, "[control]\nload_min = 99.0\n").unwrap();

    cmd()
        .arg("--config")
        .arg(&path)
        .arg("self-check")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("load_min"));
}

#[test]
fn missing_config_file_is_an_error() {
    cmd()
        .arg("--config")
        .arg("/nonexistent/damper.toml")
        .arg("self-check")
        .assert()
        .code(2);
}
