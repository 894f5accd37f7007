//! `pfupdate` commands that run without any update server.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn pfupdate(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pfupdate").unwrap();
    cmd.arg("--home").arg(home.path()).env("PFUPDATE_NO_PROGRESS", "1").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_config_set_and_show() {
    let home = TempDir::new().unwrap();

    pfupdate(&home)
        .args(["config", "set", "channel", "beta"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set channel = beta"));
    pfupdate(&home)
        .args([
            "config",
            "set",
            "endpoints",
            "cdn=https://cdn.example.com,backup=https://backup.example.com",
        ])
        .assert()
        .success();

    pfupdate(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("channel = \"beta\""))
        .stdout(predicate::str::contains("https://backup.example.com"));

    let saved = std::fs::read_to_string(home.path().join("settings.toml")).unwrap();
    assert!(saved.contains("beta"));
}

#[test]
fn test_config_rejects_invalid_values() {
    let home = TempDir::new().unwrap();

    pfupdate(&home)
        .args(["config", "set", "check_interval_hours", "500"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("check_interval_hours"));
    pfupdate(&home).args(["config", "set", "channel", "nightly"]).assert().failure();
    pfupdate(&home).args(["config", "set", "colour", "blue"]).assert().failure();

    assert!(!home.path().join("settings.toml").exists());
}

#[test]
fn test_manifest_command_describes_artifact() {
    let home = TempDir::new().unwrap();
    let artifact = home.path().join("PersonalFinanceDashboard-2.0.0.zip");
    std::fs::write(&artifact, b"Hello, World!").unwrap();

    pfupdate(&home)
        .arg("manifest")
        .arg(&artifact)
        .args([
            "--version",
            "2.0.0",
            "--channel",
            "dev",
            "--url",
            "https://updates.example.com/dev/PersonalFinanceDashboard-2.0.0.zip",
            "--change",
            "feature: Budget forecasts",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f",
        ))
        .stdout(predicate::str::contains("\"build_number\": 20000"))
        .stdout(predicate::str::contains("\"channel\": \"dev\""));
}

#[test]
fn test_manifest_command_rejects_relative_url() {
    let home = TempDir::new().unwrap();
    let artifact = home.path().join("app.zip");
    std::fs::write(&artifact, b"zip").unwrap();

    pfupdate(&home)
        .arg("manifest")
        .arg(&artifact)
        .args(["--version", "2.0.0", "--url", "dev/app.zip"])
        .assert()
        .failure();
}

#[test]
fn test_backups_and_rollback_without_history() {
    let home = TempDir::new().unwrap();

    pfupdate(&home)
        .args(["backups", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups"));
    pfupdate(&home)
        .args(["rollback"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("latest"));
}

#[test]
fn test_check_without_endpoints_explains_setup() {
    let home = TempDir::new().unwrap();

    pfupdate(&home)
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no update endpoints configured"));
}

#[test]
fn test_skip_and_unskip() {
    let home = TempDir::new().unwrap();

    pfupdate(&home).args(["skip", "1.4.0"]).assert().success();
    pfupdate(&home)
        .args(["unskip", "1.4.0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("will be offered again"));
    pfupdate(&home)
        .args(["unskip", "1.4.0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("was not skipped"));
}
