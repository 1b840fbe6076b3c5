//! Smoke tests -- verify the binary runs and the subcommands are wired up.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_help() {
    Command::cargo_bin("proxysieve")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("ranked by latency"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("proxysieve")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("proxysieve"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["verify", "prefilter", "render-config"] {
        Command::cargo_bin("proxysieve")
            .unwrap()
            .args([sub, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_render_config_for_trojan_link() {
    Command::cargo_bin("proxysieve")
        .unwrap()
        .args([
            "render-config",
            "trojan://secret@edge.example.org:443#edge",
            "--port",
            "41000",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"listen_port\": 41000"))
        .stdout(predicate::str::contains("\"type\": \"trojan\""))
        .stdout(predicate::str::contains("\"password\": \"secret\""));
}

#[test]
fn test_render_config_rejects_unknown_scheme() {
    Command::cargo_bin("proxysieve")
        .unwrap()
        .args(["render-config", "hysteria2://x@h:1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to decode share link"));
}

#[test]
fn test_prefilter_drops_unreachable() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    Command::cargo_bin("proxysieve")
        .unwrap()
        .args(["prefilter", "--timeout-ms", "500", "-"])
        .write_stdin(format!("trojan://pw@127.0.0.1:{port}#closed\n"))
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_verify_without_engine_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    Command::cargo_bin("proxysieve")
        .unwrap()
        .current_dir(dir.path())
        .args(["verify", "--engine", "/nonexistent/proxysieve-smoke/no-such-engine", "-"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("probe engine not found"));
}

#[test]
fn test_broken_env_config_is_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    Command::cargo_bin("proxysieve")
        .unwrap()
        .current_dir(dir.path())
        .env("PROXYSIEVE_CONFIG", dir.path().join("missing.toml"))
        .env_remove("RUST_LOG")
        .args(["render-config", "trojan://secret@edge.example.org:443"])
        .assert()
        .success()
        .stderr(predicate::str::contains("PROXYSIEVE_CONFIG set but file could not be loaded"));
}
