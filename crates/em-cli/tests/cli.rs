//! CLI command integration tests.
//! Each test clears EM_CONFIG so the host environment cannot leak in.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn em_cmd() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("em").unwrap();
    cmd.env_remove("EM_CONFIG");
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("em.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn config_prints_defaults() {
    em_cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[detector]"))
        .stdout(predicate::str::contains("sensitivity = 0.1"))
        .stdout(predicate::str::contains("[cross]"));
}

#[test]
fn config_flag_overrides_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[detector]\nsensitivity = 0.25\n");
    em_cmd()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("sensitivity = 0.25"))
        .stdout(predicate::str::contains("pattern_threshold = 0.3"));
}

#[test]
fn config_from_env() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[rules]\nmax_rules = 7\n");
    em_cmd()
        .env("EM_CONFIG", &path)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("max_rules = 7"));
}

#[test]
fn invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[detector]\nsensitivity = 2.0\n");
    em_cmd()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("detector.sensitivity"));
}

#[test]
fn unparsable_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "[detector\n");
    em_cmd()
        .arg("--config")
        .arg(&path)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to parse config"));
}

#[test]
fn detect_prints_pattern_json() {
    let output = em_cmd().args(["detect", "--seed", "1"]).output().unwrap();
    assert!(output.status.success());
    let patterns: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let patterns = patterns.as_array().expect("pattern array");
    for p in patterns {
        let strength = p["strength"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&strength));
        assert!(p["id"].as_str().is_some());
    }
}

#[test]
fn detect_is_deterministic_for_a_seed() {
    let ids = |out: &[u8]| -> Vec<String> {
        let v: serde_json::Value = serde_json::from_slice(out).unwrap();
        v.as_array()
            .unwrap()
            .iter()
            .map(|p| p["id"].as_str().unwrap().to_string())
            .collect()
    };
    let a = em_cmd().args(["detect", "--seed", "9"]).output().unwrap();
    let b = em_cmd().args(["detect", "--seed", "9"]).output().unwrap();
    assert_eq!(ids(&a.stdout), ids(&b.stdout));
}

#[test]
fn run_reports_every_component() {
    let output = em_cmd()
        .args(["run", "--duration-secs", "1", "--seed", "3"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let names: Vec<&str> = report["components"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["component"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        ["field", "detector", "generator", "rules", "amplifier", "matcher", "cross_resonance"]
    );
    assert!(report["started_at"].as_str().unwrap().ends_with('Z'));
}
