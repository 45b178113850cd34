//! Command line tests for `dsync` and `dsyncd`

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::BufRead;

#[test]
fn help_and_version_run() {
    for bin in ["dsync", "dsyncd"] {
        Command::cargo_bin(bin).unwrap().arg("--help").assert().success();
        Command::cargo_bin(bin)
            .unwrap()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }
}

#[test]
fn mode_is_required() {
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--local", "a", "--remote", "b"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--mode"));
}

#[test]
fn value_formats_parse() {
    Command::cargo_bin("dsync")
        .unwrap()
        .args([
            "--mode", "upload", "--chunk", "64KiB", "--timeout", "2min", "--digest", "SHA256",
            "--integrity", "only-file-metadata", "--help",
        ])
        .assert()
        .success();
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--mode", "upload", "--local", "a", "--remote", "b", "--chunk", "lots"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("lots"));
}

#[test]
fn auth_token_needs_server() {
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--mode", "download", "--local", "a", "--remote", "b", "--auth-token", "t"])
        .assert()
        .failure();
}

#[test]
fn empty_auth_token_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--mode", "download", "--server", "127.0.0.1:1", "--auth-token", ""])
        .arg("--local")
        .arg(tmp.path().join("a"))
        .arg("--remote")
        .arg(tmp.path().join("b"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("auth token must not be empty"));
}

#[test]
fn tiny_chunks_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--mode", "download", "--chunk", "1"])
        .arg("--local")
        .arg(tmp.path().join("a"))
        .arg("--remote")
        .arg(tmp.path().join("b"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("chunk size"));
}

#[test]
fn local_sync_with_summary() {
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    std::fs::create_dir(source.path().join("dir")).unwrap();
    std::fs::write(source.path().join("dir/file.txt"), "payload").unwrap();
    let copy = destination.path().join("copy");
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--mode", "download", "--summary"])
        .arg("--local")
        .arg(&copy)
        .arg("--remote")
        .arg(source.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
    assert_eq!(
        std::fs::read_to_string(copy.join("dir/file.txt")).unwrap(),
        "payload"
    );
}

#[test]
fn local_sync_refuses_nested_directories() {
    let source = tempfile::tempdir().unwrap();
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--mode", "upload"])
        .arg("--local")
        .arg(source.path())
        .arg("--remote")
        .arg(source.path().join("inner"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("overlap"));
}

#[test]
fn generate_auth_conflicts_with_auth_token() {
    Command::cargo_bin("dsyncd")
        .unwrap()
        .args(["--generate-auth", "--auth-token", "secret"])
        .assert()
        .failure();
}

struct Daemon(std::process::Child);

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_daemon(auth_token: &str) -> (Daemon, String) {
    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("dsyncd"))
        .args(["--bind", "127.0.0.1", "--port", "0", "--auth-token", auth_token])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .unwrap();
    let stderr = child.stderr.take().unwrap();
    let daemon = Daemon(child);
    let prefix = format!("{} ", remote::SERVER_READY_PREFIX);
    let (sender, receiver) = std::sync::mpsc::channel();
    // stderr is drained for the daemon's whole lifetime
    std::thread::spawn(move || {
        for line in std::io::BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if let Some(address) = line.strip_prefix(&prefix) {
                let _ = sender.send(address.trim().to_string());
            }
        }
    });
    let address = receiver
        .recv_timeout(std::time::Duration::from_secs(30))
        .expect("dsyncd did not announce its address");
    (daemon, address)
}

#[test]
fn sync_through_daemon() {
    let (_daemon, address) = start_daemon("secret");
    let source = tempfile::tempdir().unwrap();
    let destination = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("a.txt"), "over the wire").unwrap();
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--server", &address, "--auth-token", "secret", "--mode", "upload"])
        .arg("--local")
        .arg(source.path())
        .arg("--remote")
        .arg(destination.path())
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(destination.path().join("a.txt")).unwrap(),
        "over the wire"
    );
    Command::cargo_bin("dsync")
        .unwrap()
        .args(["--server", &address, "--auth-token", "wrong", "--mode", "upload"])
        .arg("--local")
        .arg(source.path())
        .arg("--remote")
        .arg(destination.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid auth token"));
}
