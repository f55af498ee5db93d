use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::mpsc;
use std::thread;

use serial_test::serial;

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_pagetrace")
}

/// Runs the binary with an isolated config directory and no inherited overrides.
fn run(config_dir: &Path, args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(bin());
    for (key, _) in std::env::vars() {
        if key.starts_with("PAGETRACE_") {
            cmd.env_remove(key);
        }
    }
    cmd.env("XDG_CONFIG_HOME", config_dir)
        .env_remove("RUST_LOG")
        .args(args);
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Accepts one request, answers with `status_line` plus `extra_headers`, and
/// hands back the raw request body.
fn one_shot_collector(status_line: &'static str, extra_headers: &'static str) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/api/1/store/", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':')
                && name.eq_ignore_ascii_case("content-length")
            {
                content_length = value.trim().parse().unwrap();
            }
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).unwrap();

        let mut stream = stream;
        write!(
            stream,
            "{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n{extra_headers}\r\n"
        )
        .unwrap();
        stream.flush().unwrap();
        tx.send(String::from_utf8(body).unwrap()).unwrap();
    });

    (url, rx)
}

#[test]
fn parse_header_prints_fields() {
    let temp = tempfile::tempdir().unwrap();
    let output = run(
        temp.path(),
        &[
            "parse-header",
            "126de09502ae4e0fb26c6967190756a4-b6e54397b12a2a0f-1",
        ],
        &[],
    );

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("trace_id=126de09502ae4e0fb26c6967190756a4"));
    assert!(out.contains("parent_span_id=b6e54397b12a2a0f"));
    assert!(out.contains("sampled=true"));
}

#[test]
fn parse_header_rejects_malformed_value() {
    let temp = tempfile::tempdir().unwrap();
    let output = run(temp.path(), &["parse-header", "not-a-trace"], &[]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("malformed trace header"));
}

#[test]
fn config_reflects_file_and_env_overrides() {
    let temp = tempfile::tempdir().unwrap();
    let config_path = temp.path().join("pagetrace.toml");
    std::fs::write(
        &config_path,
        "idle_timeout = \"2s\"\ntransport_buffer_size = 0\n",
    )
    .unwrap();

    let output = run(
        temp.path(),
        &["config", "--json"],
        &[
            ("PAGETRACE_CONFIG", config_path.to_str().unwrap()),
            ("PAGETRACE_MAX_SPANS", "50"),
        ],
    );

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let cfg: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(cfg["idle_timeout"], "2s");
    assert_eq!(cfg["max_spans"], 50);
    assert_eq!(cfg["transport_buffer_size"], 30);
    assert_eq!(cfg["default_retry_after"], "1m");
}

#[test]
fn demo_dry_run_prints_transaction() {
    let temp = tempfile::tempdir().unwrap();
    let output = run(
        temp.path(),
        &[
            "demo",
            "--dry-run",
            "--json",
            "--location",
            "/checkout",
            "--spans",
            "2",
            "--span-duration",
            "10ms",
            "--idle-timeout",
            "50ms",
            "--trace-header",
            "126de09502ae4e0fb26c6967190756a4-b6e54397b12a2a0f-1",
        ],
        &[],
    );

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let event: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(event["transaction"], "/checkout");
    assert_eq!(event["contexts"]["trace"]["op"], "pageload");
    assert_eq!(
        event["contexts"]["trace"]["trace_id"],
        "126de09502ae4e0fb26c6967190756a4"
    );
    assert_eq!(event["spans"].as_array().map(Vec::len), Some(2));
}

#[test]
fn demo_without_endpoint_fails() {
    let temp = tempfile::tempdir().unwrap();
    let output = run(temp.path(), &["demo", "--idle-timeout", "10ms"], &[]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("endpoint"));
}

#[test]
#[serial]
fn demo_delivers_to_collector() {
    let temp = tempfile::tempdir().unwrap();
    let (url, bodies) = one_shot_collector("HTTP/1.1 200 OK", "");

    let output = run(
        temp.path(),
        &[
            "demo",
            "--location",
            "/orders",
            "--spans",
            "1",
            "--span-duration",
            "5ms",
            "--idle-timeout",
            "20ms",
            "--endpoint",
            &url,
        ],
        &[],
    );

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("delivered status=success"));
    let body: serde_json::Value = serde_json::from_str(&bodies.recv().unwrap()).unwrap();
    assert_eq!(body["type"], "transaction");
    assert_eq!(body["transaction"], "/orders");
}

#[test]
#[serial]
fn demo_reports_rate_limit() {
    let temp = tempfile::tempdir().unwrap();
    let (url, _bodies) = one_shot_collector("HTTP/1.1 429 Too Many Requests", "retry-after: 30\r\n");

    let output = run(
        temp.path(),
        &[
            "demo",
            "--spans",
            "0",
            "--idle-timeout",
            "10ms",
            "--endpoint",
            &url,
        ],
        &[],
    );

    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("deliver transaction"), "stderr: {err}");
    assert!(err.contains("HTTP 429"), "stderr: {err}");
}
