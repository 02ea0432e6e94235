//! Tests of the `ptxsmoke` binary

use std::path::Path;
use std::process::{Command, Output};

use pretty_assertions::assert_eq;

fn ptxsmoke(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ptxsmoke"))
        .args(args)
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run ptxsmoke")
}

#[test]
fn test_no_file_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = ptxsmoke(dir.path(), &["--backend", "simulated"]);

    assert!(output.status.success());
    assert!(output.stdout.is_empty());
    assert!(output.stderr.is_empty());
}

#[test]
fn test_reads_test_ptx_from_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("test.ptx"), "// kernel\n").unwrap();

    let output = ptxsmoke(dir.path(), &["--backend", "simulated"]);

    assert!(output.status.success());
    assert_eq!(
        String::from_utf8(output.stdout).unwrap(),
        "// kernel\nHello world 9\n"
    );
}

#[test]
fn test_ptx_flag() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("other.ptx"), "x\n").unwrap();

    let output = ptxsmoke(dir.path(), &["--ptx", "other.ptx", "--backend", "simulated"]);
    assert_eq!(output.stdout, b"x\nHello world 9\n");
}

#[test]
fn test_strict_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = ptxsmoke(dir.path(), &["--strict", "--backend", "simulated"]);

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn test_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("k.ptx"), "k\n").unwrap();
    std::fs::write(
        dir.path().join("smoke.toml"),
        "ptx = \"k.ptx\"\nbackend = \"simulated\"\n",
    )
    .unwrap();

    let output = ptxsmoke(dir.path(), &["--config", "smoke.toml"]);
    assert!(output.status.success());
    assert_eq!(output.stdout, b"k\nHello world 9\n");
}

#[test]
fn test_bad_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("smoke.toml"), "devise = 3\n").unwrap();

    let output = ptxsmoke(dir.path(), &["--config", "smoke.toml"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("devise"));
}

#[test]
fn test_emit_then_run() {
    let dir = tempfile::tempdir().unwrap();
    let emit = ptxsmoke(dir.path(), &["emit", "-o", "test.ptx", "--sm", "86"]);
    assert!(emit.status.success());

    let ptx = std::fs::read_to_string(dir.path().join("test.ptx")).unwrap();
    assert!(ptx.contains(".target sm_86"));

    let output = ptxsmoke(dir.path(), &["--backend", "simulated"]);
    assert_eq!(
        String::from_utf8(output.stdout).unwrap(),
        format!("{ptx}Hello world 9\n")
    );
}

#[test]
fn test_emit_rejects_bad_sm() {
    let dir = tempfile::tempdir().unwrap();
    let output = ptxsmoke(dir.path(), &["emit", "--sm", "abc"]);
    assert!(!output.status.success());
}

#[test]
fn test_info() {
    let dir = tempfile::tempdir().unwrap();
    let output = ptxsmoke(dir.path(), &["info", "--backend", "simulated"]);

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("Selected: Simulated device 0"));
    assert!(stdout.contains("Simulated GPU"));
}
