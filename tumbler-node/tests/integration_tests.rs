//! Builds and spawns the real `tumbler-node` binary and talks to its admin
//! HTTP surface over the wire, the same shape as the teacher's
//! `rusty-node/tests/integration_tests.rs` (spawn the binary under `cargo
//! run`, poll until it answers, assert against its HTTP responses).

use std::process::{Child, Command, Stdio};
use std::time::Duration;

struct NodeProcess(Child);

impl Drop for NodeProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn write_minimal_config(path: &std::path::Path) {
    std::fs::write(
        path,
        r#"
[currencies.BTC]
min_amount = "0.001"
max_amount = "10"
required_confirmations = 2
min_pool_size = "0"
max_pool_size = "100"
target_pool_size = "1"
poll_interval_ms = 500
underpayment_tolerance = "0.0001"
address_format_rules = []
"#,
    )
    .expect("writing test config");
}

async fn start_node(bind: &str, data_dir: &std::path::Path, config_path: &std::path::Path) -> NodeProcess {
    let child = Command::new(env!("CARGO_BIN_EXE_tumbler-node"))
        .arg("--config")
        .arg(config_path)
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--bind")
        .arg(bind)
        .env("TUMBLER_KEYSTORE_DEK", "11".repeat(32))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawning tumbler-node binary");
    NodeProcess(child)
}

async fn wait_for_health(bind: &str) -> bool {
    let client = reqwest::Client::new();
    for _ in 0..40 {
        if let Ok(resp) = client.get(format!("http://{bind}/health")).send().await {
            if resp.status().is_success() {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    false
}

#[tokio::test]
async fn node_serves_health_and_status_after_startup() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config_path = temp.path().join("tumbler.toml");
    let data_dir = temp.path().join("data");
    write_minimal_config(&config_path);

    let bind = "127.0.0.1:18790";
    let _node = start_node(bind, &data_dir, &config_path).await;

    assert!(wait_for_health(bind).await, "node did not become healthy in time");

    let client = reqwest::Client::new();
    let status: serde_json::Value = client
        .get(format!("http://{bind}/status"))
        .send()
        .await
        .expect("GET /status")
        .json()
        .await
        .expect("parsing /status JSON");

    assert!(status.get("scheduler").is_some(), "status payload missing scheduler section: {status}");
    assert!(status.get("confirmation").is_some(), "status payload missing confirmation section: {status}");
    assert_eq!(status["scheduler"]["scheduled"], 0);
    assert_eq!(status["confirmation"]["watched_addresses"], 0);
}

#[tokio::test]
async fn node_restart_reopens_existing_sled_database() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config_path = temp.path().join("tumbler.toml");
    let data_dir = temp.path().join("data");
    write_minimal_config(&config_path);

    let bind = "127.0.0.1:18791";
    {
        let _node = start_node(bind, &data_dir, &config_path).await;
        assert!(wait_for_health(bind).await, "first startup did not become healthy");
    }

    // Second startup against the same data dir must not fail to open sled.
    let _node = start_node(bind, &data_dir, &config_path).await;
    assert!(wait_for_health(bind).await, "restart against existing data dir did not become healthy");
}
