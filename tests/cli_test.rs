//! CLI Tests
//!
//! Drives the diagnostics binary end to end: argument parsing, config
//! validation, override precedence, and a full smoke delivery against a
//! mock ingest endpoint.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;
use tokio::runtime::Runtime;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn test_help_describes_tool() {
    Command::cargo_bin("kodama-telemetry")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("smoke-test"));
}

#[test]
fn test_missing_config_file_fails() {
    Command::cargo_bin("kodama-telemetry")
        .unwrap()
        .args(["--config", "/nonexistent/kodama.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn test_check_accepts_valid_config() {
    let file = config_file(
        "endpoint: \"https://ingest.example.com/v1\"\nservice_key: \"sk-test\"\n",
    );

    Command::cargo_bin("kodama-telemetry")
        .unwrap()
        .args(["--config"])
        .arg(file.path())
        .arg("--check")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn test_check_rejects_config_without_endpoint() {
    let file = config_file("enabled: true\n");

    Command::cargo_bin("kodama-telemetry")
        .unwrap()
        .args(["--config"])
        .arg(file.path())
        .arg("--check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("endpoint must be set"));
}

#[test]
fn test_disabled_config_refuses_probe() {
    let file = config_file("enabled: false\n");

    Command::cargo_bin("kodama-telemetry")
        .unwrap()
        .args(["--config"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("telemetry is disabled"));
}

#[test]
fn test_smoke_trace_delivers_and_endpoint_override_wins() {
    let rt = Runtime::new().unwrap();
    let server = rt.block_on(MockServer::start());
    rt.block_on(
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server),
    );

    // The file points at a dead endpoint; the flag must win.
    let file = config_file(
        "endpoint: \"https://unreachable.invalid\"\nservice_key: \"sk-test\"\nbuffer:\n  flush_interval_millis: 60000\n",
    );

    Command::cargo_bin("kodama-telemetry")
        .unwrap()
        .args(["--config"])
        .arg(file.path())
        .args(["--endpoint", &server.uri()])
        .assert()
        .success();

    let requests = rt.block_on(server.received_requests()).unwrap();
    let paths: Vec<&str> = requests.iter().map(|r| r.url.path()).collect();
    assert!(paths.contains(&"/traces"), "paths: {paths:?}");
    assert!(paths.contains(&"/logs"), "paths: {paths:?}");
}
