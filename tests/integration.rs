//! Integration tests for the `rootguard` binary.
//!
//! These invoke the compiled binary end-to-end and check output, exit codes
//! and the files it writes.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Returns the path to the compiled `rootguard` binary.
fn rootguard_bin() -> PathBuf {
    if let Some(p) = std::env::var_os("CARGO_BIN_EXE_rootguard") {
        PathBuf::from(p)
    } else {
        let mut path = std::env::current_exe()
            .expect("cannot determine test binary path")
            .parent()
            .expect("no parent directory")
            .parent()
            .expect("no grandparent directory")
            .to_path_buf();
        path.push("rootguard");
        path
    }
}

/// Runs the binary with `--root <root>` and a clean environment.
fn run(root: &Path, args: &[&str]) -> Output {
    Command::new(rootguard_bin())
        .current_dir(root)
        .env_remove("RUST_LOG")
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("failed to execute rootguard")
}

fn stdout(o: &Output) -> String {
    String::from_utf8_lossy(&o.stdout).to_string()
}

fn stderr(o: &Output) -> String {
    String::from_utf8_lossy(&o.stderr).to_string()
}

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("dist")).unwrap();
    fs::write(dir.path().join("dist/app.bin"), b"hello").unwrap();
    dir
}

// -------------------------------------------------------------------------
// resolve
// -------------------------------------------------------------------------

#[test]
fn test_resolve_prints_canonical_path() {
    let dir = workspace();
    let out = run(dir.path(), &["resolve", "dist/app.bin"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let expected = dir.path().canonicalize().unwrap().join("dist/app.bin");
    assert_eq!(stdout(&out).trim(), expected.display().to_string());
}

#[test]
fn test_resolve_rejects_traversal_with_nonzero_exit() {
    let dir = workspace();
    let out = run(dir.path(), &["resolve", "dist/app.bin", "../../etc/passwd"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("1 of 2 path(s) rejected"), "{}", stderr(&out));
    // The good path is still printed.
    assert!(stdout(&out).contains("app.bin"));
}

#[test]
fn test_resolve_heals_missing_parent_directories() {
    let dir = workspace();
    let config = dir.path().join("rootguard.json");
    fs::write(
        &config,
        r#"{ "recovery": { "materialize_leaf": true }, "snapshots": { "interval_secs": 0 } }"#,
    )
    .unwrap();

    let out = run(dir.path(), &["resolve", "build/out/cache"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert!(dir.path().join("build/out/cache").is_dir());
}

#[test]
fn test_resolve_fails_when_root_missing() {
    let dir = TempDir::new().unwrap();
    let out = Command::new(rootguard_bin())
        .current_dir(dir.path())
        .args(["--root", "does-not-exist", "resolve", "x"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("safe root"), "{}", stderr(&out));
}

// -------------------------------------------------------------------------
// digest / attest
// -------------------------------------------------------------------------

#[test]
fn test_digest_file() {
    let dir = workspace();
    let out = run(dir.path(), &["digest", "dist/app.bin"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(
        stdout(&out).trim(),
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824  dist/app.bin"
    );
}

#[test]
fn test_digest_outside_root_is_not_found() {
    let dir = workspace();
    let out = run(dir.path(), &["digest", "../secret"]);
    assert!(!out.status.success());
    let err = stderr(&out);
    assert!(err.contains("not found: ../secret"), "{err}");
    let root = dir.path().canonicalize().unwrap();
    assert!(!err.contains(&*root.to_string_lossy()), "{err}");
}

#[test]
fn test_attest_writes_slsa_statement() {
    let dir = workspace();
    let statement = dir.path().join("provenance.json");
    let out = run(
        dir.path(),
        &[
            "attest",
            "dist",
            "--builder-id",
            "https://ci.example/runner",
            "--out",
            statement.to_str().unwrap(),
        ],
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let st: serde_json::Value = serde_json::from_slice(&fs::read(&statement).unwrap()).unwrap();
    assert_eq!(st["_type"], "https://in-toto.io/Statement/v1");
    assert_eq!(st["predicateType"], "https://slsa.dev/provenance/v1");
    assert_eq!(st["subject"][0]["name"], "dist");
    assert_eq!(
        st["predicate"]["runDetails"]["builder"]["id"],
        "https://ci.example/runner"
    );
}

#[test]
fn test_sign_requires_out() {
    let dir = workspace();
    let out = run(
        dir.path(),
        &["attest", "dist/app.bin", "--builder-id", "b", "--sign"],
    );
    assert!(!out.status.success());
}

// -------------------------------------------------------------------------
// audit / report
// -------------------------------------------------------------------------

#[test]
fn test_audit_prints_report() {
    let dir = workspace();
    let out = run(dir.path(), &["audit", "dist/app.bin", "../../etc/passwd"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));

    let report: serde_json::Value = serde_json::from_str(&stdout(&out)).unwrap();
    assert_eq!(report["report_schema"], "rootguard/audit-report/v1");
    assert_eq!(report["metrics"]["total_validations"], 2);
    assert_eq!(report["metrics"]["total_failures"], 1);
    assert_eq!(report["metrics"]["total_recoveries"], 0);
    assert!(report["rootguard_version"].as_str().is_some());

    let err = stderr(&out);
    assert!(err.contains("✓ dist/app.bin"), "{err}");
    assert!(err.contains("✗ "), "{err}");
}

#[test]
fn test_report_flag_writes_file_even_on_failure() {
    let dir = workspace();
    let report_path = dir.path().join("audit.json");
    let out = run(
        dir.path(),
        &[
            "--report",
            report_path.to_str().unwrap(),
            "resolve",
            "../escape",
        ],
    );
    assert!(!out.status.success());

    let report: serde_json::Value =
        serde_json::from_slice(&fs::read(&report_path).unwrap()).unwrap();
    assert_eq!(report["metrics"]["total_failures"], 1);
    assert_eq!(report["compliance"]["total_events"], 2);
}

#[test]
fn test_invalid_config_is_an_error() {
    let dir = workspace();
    let config = dir.path().join("bad.json");
    fs::write(&config, "not json").unwrap();
    let out = run(
        dir.path(),
        &["--config", config.to_str().unwrap(), "resolve", "dist"],
    );
    assert!(!out.status.success());
}
