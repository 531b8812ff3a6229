//! Smoke integration tests for courierd.
//!
//! Spawns the actual courierd binary on a random port with a minimal config
//! (orchestrator disabled, temp SQLite store), then verifies the HTTP
//! surface. No Docker, no Telegram — pure endpoint validation.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

/// Find a free port by binding to :0 and reading the assigned port.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to :0");
    listener.local_addr().unwrap().port()
}

/// Write a minimal config TOML to a temp dir.
fn write_test_config(dir: &tempfile::TempDir, port: u16) -> PathBuf {
    let config_path = dir.path().join("test.toml");
    let db_path = dir.path().join("courier.db");
    let groups_dir = dir.path().join("groups");
    let data_dir = dir.path().join("data");
    let toml = format!(
        r#"
[server]
bind = "127.0.0.1:{port}"

[storage]
db_path = "{}"
groups_dir = "{}"
data_dir = "{}"

[orchestrator]
enabled = false

[scheduler]
enabled = false
"#,
        db_path.display(),
        groups_dir.display(),
        data_dir.display(),
    );
    std::fs::write(&config_path, toml).expect("write test config");
    config_path
}

/// Build the courierd binary (debug mode) and return its path.
fn courierd_binary() -> PathBuf {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new("cargo")
        .args(["build", "--bin", "courierd", "--workspace"])
        .current_dir(&workspace_root)
        .output()
        .expect("cargo build");
    assert!(
        output.status.success(),
        "cargo build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    workspace_root.join("target/debug/courierd")
}

struct TestServer {
    child: Child,
    base_url: String,
}

impl TestServer {
    fn start(config_path: &PathBuf, port: u16) -> Self {
        let binary = courierd_binary();
        let child = Command::new(&binary)
            .args(["serve", "--config", config_path.to_str().unwrap()])
            .env("RUST_LOG", "warn")
            .env_remove("TELEGRAM_BOT_TOKEN")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn courierd");

        let base_url = format!("http://127.0.0.1:{port}");
        let server = TestServer { child, base_url };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        let client = reqwest::blocking::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/healthz", self.base_url))
                .timeout(Duration::from_millis(200))
                .send()
                .is_ok()
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("courierd did not become ready within 5 seconds");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGTERM);
            }
        }
        let _ = self.child.wait();
    }
}

#[test]
fn healthz_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("{}/healthz", server.base_url))
        .send()
        .expect("GET /healthz");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "courierd");
    assert!(body["uptime_seconds"].is_number());
}

#[test]
fn readyz_reports_disabled_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("{}/readyz", server.base_url))
        .send()
        .expect("GET /readyz");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["orchestrator_enabled"], false);
    assert_eq!(body["channel_connected"], false);
    assert_eq!(body["active_containers"], 0);
    assert_eq!(body["registered_groups"], 0);
}

#[test]
fn ingress_persists_messages() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .post(format!("{}/v1/messages/ingress", server.base_url))
        .json(&serde_json::json!({
            "id": "m1",
            "chat_jid": "tg:12345",
            "chat_name": "Test Group",
            "sender": "u1",
            "sender_name": "Alice",
            "content": "hello courier",
            "timestamp": "2024-01-15T12:00:00.000Z"
        }))
        .send()
        .expect("POST /v1/messages/ingress");

    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["ok"], true);

    // Idempotent upsert: the same id again is fine.
    let resp = client
        .post(format!("{}/v1/messages/ingress", server.base_url))
        .json(&serde_json::json!({
            "id": "m1",
            "chat_jid": "tg:12345",
            "content": "hello courier (edited)",
            "timestamp": "2024-01-15T12:00:00.000Z"
        }))
        .send()
        .expect("POST /v1/messages/ingress (again)");
    let body: serde_json::Value = resp.json().unwrap();
    assert_eq!(body["ok"], true);
}
