//! Integration tests for the site manager
//!
//! These tests run real managers on temporary work directories and talk to
//! them over their TCP control channel.

use serde_json::{json, Value};
use site_frontier::config::{parse_config, SiteConfig};
use site_frontier::control::{Publication, REGISTRY_KEY};
use site_frontier::manager::{ControlStatus, InitStage, InitWarning, RecoveryOutcome};
use site_frontier::storage::{DocidAllocator, TaskQueue};
use site_frontier::{ManagerState, SiteError, SiteManager};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Creates a test configuration rooted at `work_dir` with an ephemeral control port
fn create_test_config(work_dir: &Path) -> SiteConfig {
    let mut config = parse_config(
        r#"
[site]
site-id = "example"
seed-url = "https://example.com/"
work-dir = "unused"

[queue]
job-timeout-ms = 60000
cleaner-period-ms = 60000
backup-period-ms = 60000

[control]
listen-port = 0
"#,
    )
    .expect("Failed to parse test config");
    config.site.work_dir = work_dir.to_path_buf();
    config
}

/// Line-oriented JSON client for the control channel
struct ControlClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl ControlClient {
    async fn connect(manager: &SiteManager) -> Self {
        let port = manager.local_addr().expect("Control server not bound").port();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let (reader, writer) = TcpStream::connect(addr)
            .await
            .expect("Failed to connect to control server")
            .into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn call(&mut self, request: Value) -> Value {
        let line = format!("{}\n", request);
        self.writer.write_all(line.as_bytes()).await.expect("Failed to send request");

        let mut response = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut response))
            .await
            .expect("Timed out waiting for response")
            .expect("Failed to read response");
        serde_json::from_str(&response).expect("Response is not JSON")
    }
}

async fn started(config: SiteConfig) -> Arc<SiteManager> {
    let manager = SiteManager::new(config);
    manager.init().await.expect("Failed to initialize manager");
    manager.start().expect("Failed to start manager");
    manager
}

#[tokio::test]
async fn test_bootstrap_seeds_empty_work_dir() {
    let dir = tempfile::tempdir().unwrap();
    let manager = started(create_test_config(dir.path())).await;

    assert_eq!(manager.state(), ManagerState::Running);
    let RecoveryOutcome::Seeded { docid } = *manager.recovery().unwrap() else {
        panic!("expected a fresh work dir to be seeded");
    };

    let seed = manager.todo().unwrap().get(docid).unwrap().expect("seed not queued");
    assert_eq!(seed.url, "https://example.com/");
    assert_eq!(seed.depth, 1);
    assert_eq!(manager.working().unwrap().len().unwrap(), 0);
    assert_eq!(manager.failed().unwrap().len().unwrap(), 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_claim_and_complete_over_control_channel() {
    let dir = tempfile::tempdir().unwrap();
    let manager = started(create_test_config(dir.path())).await;
    let mut client = ControlClient::connect(&manager).await;

    let pong = client.call(json!({"command": "ping"})).await;
    assert_eq!(pong, json!({"ok": true, "result": "pong"}));

    let claimed = client.call(json!({"command": "claim"})).await;
    assert_eq!(claimed["ok"], true);
    let docid = claimed["result"]["docid"].as_u64().unwrap();
    assert_eq!(claimed["result"]["attempt"], 1);
    assert_eq!(manager.working().unwrap().len().unwrap(), 1);

    let done = client
        .call(json!({"command": "complete", "args": {"docid": docid, "attempt": 1}}))
        .await;
    assert_eq!(done["result"]["completed"], true);

    let status = client.call(json!({"command": "status"})).await;
    assert_eq!(status["result"]["state"], "running");
    assert_eq!(status["result"]["statistics"]["todo"], 0);
    assert_eq!(status["result"]["statistics"]["working"], 0);

    let empty = client.call(json!({"command": "claim"})).await;
    assert_eq!(empty, json!({"ok": true, "result": null}));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_commands_are_answered_with_errors() {
    let dir = tempfile::tempdir().unwrap();
    let manager = started(create_test_config(dir.path())).await;
    let mut client = ControlClient::connect(&manager).await;

    let unknown = client.call(json!({"command": "explode"})).await;
    assert_eq!(unknown["ok"], false);
    assert!(unknown["error"].is_string());

    let missing = client.call(json!({"command": "complete", "args": {"docid": 1}})).await;
    assert_eq!(missing["ok"], false);

    let bad_url = client
        .call(json!({"command": "submit", "args": {"url": "not a url"}}))
        .await;
    assert_eq!(bad_url["ok"], false);

    // The connection survives rejected requests
    let pong = client.call(json!({"command": "ping"})).await;
    assert_eq!(pong["ok"], true);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_reschedules_in_flight_work() {
    let dir = tempfile::tempdir().unwrap();

    let first = started(create_test_config(dir.path())).await;
    let claimed = first.frontier().unwrap().claim(chrono::Duration::seconds(60)).unwrap().unwrap();
    let docid = claimed.task.docid;
    first
        .frontier()
        .unwrap()
        .submit(first.docids().unwrap().as_ref(), "example", "https://example.com/broken", 2)
        .unwrap();
    let broken = first.frontier().unwrap().claim(chrono::Duration::seconds(60)).unwrap().unwrap();
    assert!(first.frontier().unwrap().fail(broken.task.docid, broken.attempt()).unwrap());
    first.shutdown().await.unwrap();

    let second = started(create_test_config(dir.path())).await;
    assert!(matches!(
        second.recovery().unwrap(),
        RecoveryOutcome::Resumed { rescheduled: 2, .. }
    ));
    assert_eq!(second.working().unwrap().len().unwrap(), 0);
    assert_eq!(second.failed().unwrap().len().unwrap(), 0);

    let back = second.todo().unwrap().get(docid).unwrap().expect("claimed task lost");
    assert_eq!(back.docid, docid);
    assert!(back.last_tried_at.is_none());
    assert!(back.lease_deadline.is_none());
    assert_eq!(back.attempts, 1);

    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_docids_stay_monotonic_across_restarts() {
    let dir = tempfile::tempdir().unwrap();

    let first = started(create_test_config(dir.path())).await;
    let mut client = ControlClient::connect(&first).await;
    let submitted = client
        .call(json!({"command": "submit", "args": {"url": "https://example.com/a", "depth": 2}}))
        .await;
    let before = submitted["result"]["docid"].as_u64().unwrap();
    drop(client);
    first.shutdown().await.unwrap();

    let second = started(create_test_config(dir.path())).await;
    let mut client = ControlClient::connect(&second).await;
    let submitted = client
        .call(json!({"command": "submit", "args": {"url": "https://example.com/b", "depth": 2}}))
        .await;
    let after = submitted["result"]["docid"].as_u64().unwrap();
    assert!(after > before, "docid {} reissued after {}", after, before);

    drop(client);
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_backup_restores_lost_databases() {
    let dir = tempfile::tempdir().unwrap();

    let first = started(create_test_config(dir.path())).await;
    let frontier = first.frontier().unwrap();
    let docids = first.docids().unwrap();
    for path in ["a", "b", "c"] {
        frontier
            .submit(docids.as_ref(), "example", &format!("https://example.com/{}", path), 2)
            .unwrap();
    }
    let last = docids.current().unwrap();
    first.shutdown().await.unwrap();
    assert!(dir.path().join("backup.json").exists());

    // Lose every database, keep the backup
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.contains(".sqlite")) {
            std::fs::remove_file(path).unwrap();
        }
    }

    let second = started(create_test_config(dir.path())).await;
    assert!(matches!(
        second.recovery().unwrap(),
        RecoveryOutcome::Resumed { restored_backup: true, .. }
    ));
    assert_eq!(second.todo().unwrap().len().unwrap(), 4);
    assert!(second.docids().unwrap().current().unwrap() >= last);

    let fresh = second
        .frontier()
        .unwrap()
        .submit(second.docids().unwrap().as_ref(), "example", "https://example.com/d", 2)
        .unwrap();
    assert!(fresh.docid > last);

    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_closes_queues() {
    let dir = tempfile::tempdir().unwrap();
    let manager = started(create_test_config(dir.path())).await;

    manager.shutdown().await.unwrap();
    manager.shutdown().await.unwrap();

    assert_eq!(manager.state(), ManagerState::Stopped);
    assert!(manager.is_shutdown());
    assert!(manager.todo().unwrap().is_closed());
    assert!(manager.working().unwrap().is_closed());
    assert!(manager.failed().unwrap().is_closed());
}

#[tokio::test]
async fn test_concurrent_init_builds_once() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SiteManager::new(create_test_config(dir.path()));

    let (a, b) = tokio::join!(manager.init(), manager.init());
    a.unwrap();
    b.unwrap();

    assert!(manager.local_addr().is_some());
    assert_eq!(manager.todo().unwrap().len().unwrap(), 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_command_stops_manager() {
    let dir = tempfile::tempdir().unwrap();
    let manager = started(create_test_config(dir.path())).await;

    let port = manager.local_addr().unwrap().port();
    let mut stream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await
        .unwrap();
    stream
        .write_all(b"{\"command\": \"shutdown\"}\n")
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(10), manager.wait_stopped())
        .await
        .expect("manager did not stop");
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert!(manager.todo().unwrap().is_closed());
}

#[tokio::test]
async fn test_bind_failure_is_tolerated_unless_required() {
    let dir = tempfile::tempdir().unwrap();
    let occupied = std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut config = create_test_config(&dir.path().join("optional"));
    config.control.listen_port = port;
    let manager = SiteManager::new(config.clone());
    manager.init().await.unwrap();

    assert!(matches!(
        manager.control_status().unwrap(),
        ControlStatus::Unavailable { .. }
    ));
    assert!(manager
        .warnings()
        .iter()
        .any(|w| matches!(w, InitWarning::ControlUnavailable { .. })));
    assert!(manager.local_addr().is_none());
    assert_eq!(manager.todo().unwrap().len().unwrap(), 1);
    manager.shutdown().await.unwrap();

    config.site.work_dir = dir.path().join("required");
    config.control.required = true;
    let manager = SiteManager::new(config);
    let err = manager.init().await.unwrap_err();
    assert!(matches!(
        err,
        SiteError::Init {
            stage: InitStage::ControlServer,
            ..
        }
    ));
    assert_eq!(manager.state(), ManagerState::Stopped);
}

#[tokio::test]
async fn test_control_address_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let registry = dir.path().join("registry.toml");
    std::fs::write(&registry, "other-service = \"elsewhere:1\"\n").unwrap();

    let mut config = create_test_config(&dir.path().join("work"));
    config.control.advertise_host = Some("frontier.test".to_string());
    config.discovery.registry_path = Some(registry.clone());

    let manager = SiteManager::new(config);
    manager.init().await.unwrap();

    let port = manager.local_addr().unwrap().port();
    let expected = format!("frontier.test:{}", port);
    let ControlStatus::Listening { publication, .. } = manager.control_status().unwrap() else {
        panic!("control server should be listening");
    };
    assert!(matches!(publication, Publication::Published { .. }));
    assert_eq!(publication.addr(), expected);

    let table: toml::Table = std::fs::read_to_string(&registry).unwrap().parse().unwrap();
    assert_eq!(table[REGISTRY_KEY].as_str(), Some(expected.as_str()));
    assert_eq!(table["other-service"].as_str(), Some("elsewhere:1"));

    manager.shutdown().await.unwrap();
}
