use std::process::Command;

use eyre::Context as _;

#[test]
fn doctor_json_runs_and_returns_valid_json() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("meshward");

    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(exe)
        .env("MESHWARD_CONFIG_DIR", cfg_dir.path())
        .env("MESHWARD_DATA_DIR", data_dir.path())
        .args(["doctor", "--json"])
        .output()
        .context("run meshward doctor --json")?;

    assert!(
        out.status.success(),
        "doctor exited non-zero: status={:?}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse doctor json")?;
    assert_eq!(v.get("ok").and_then(serde_json::Value::as_bool), Some(true));
    assert!(v.get("version").and_then(|x| x.as_str()).is_some());
    assert!(v.get("paths").and_then(|x| x.as_object()).is_some());
    assert_eq!(
        v.get("vault").and_then(|x| x.get("initialized")).and_then(serde_json::Value::as_bool),
        Some(false)
    );
    Ok(())
}

#[test]
fn doctor_human_runs_without_touching_secrets() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("meshward");

    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(exe)
        .env("MESHWARD_CONFIG_DIR", cfg_dir.path())
        .env("MESHWARD_DATA_DIR", data_dir.path())
        .arg("doctor")
        .output()
        .context("run meshward doctor")?;

    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("meshward doctor"));
    assert!(stdout.contains("Vault:"));
    assert!(stdout.contains("Admin API:"));
    Ok(())
}

#[test]
fn paths_prints_resolved_directories_as_json() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("meshward");

    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(exe)
        .env("MESHWARD_CONFIG_DIR", cfg_dir.path())
        .env("MESHWARD_DATA_DIR", data_dir.path())
        .arg("paths")
        .output()
        .context("run meshward paths")?;

    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse paths json")?;
    assert_eq!(
        v.get("config_dir").and_then(|x| x.as_str()),
        Some(cfg_dir.path().to_str().unwrap())
    );
    Ok(())
}
