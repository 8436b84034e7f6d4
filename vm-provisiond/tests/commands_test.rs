//! Operator commands against a file-backed database.

use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use tempfile::TempDir;
use vm_iac::mock::ScriptedExecutor;
use vm_orchestrator::test_utils::RecordingNotifier;
use vm_orchestrator::{JobQueue, ProvisionOutcome};
use vm_provisiond::cli::Args;
use vm_provisiond::{execute, open_database, Config, Services};

struct Harness {
    services: Services,
    temp: TempDir,
}

async fn harness() -> Harness {
    let temp = TempDir::new().unwrap();
    let config = Config {
        db_path: temp.path().join("state").join("provisiond.db"),
        work_root: temp.path().join("runs"),
        ..Config::default()
    };
    let pool = open_database(&config).await.expect("open database");
    let services = Services::new(
        pool,
        JobQueue::detached(),
        Arc::new(ScriptedExecutor::new().with_output("vm_id", "300")),
        Arc::new(RecordingNotifier::new()),
        config.pipeline_settings(),
    );
    Harness { services, temp }
}

async fn run(services: &Services, argv: &[&str]) -> anyhow::Result<Value> {
    let mut full = vec!["provisiond"];
    full.extend_from_slice(argv);
    let args = Args::try_parse_from(full)?;
    execute(services, args.command).await
}

#[tokio::test]
async fn test_request_lifecycle_commands() {
    let h = harness().await;

    let created = run(
        &h.services,
        &[
            "request",
            "create",
            "--requester",
            "alice",
            "--provider",
            "pve",
            "--environment",
            "dev",
            "--spec",
            r#"{"name":"db1","cpu":2}"#,
        ],
    )
    .await
    .unwrap();
    assert_eq!(created["status"], "pending");
    let id = created["id"].as_str().unwrap().to_string();

    let approved = run(&h.services, &["request", "approve", &id, "--approver", "bob"])
        .await
        .unwrap();
    assert_eq!(approved["status"], "approved");
    assert_eq!(approved["approver"], "bob");

    let again = run(&h.services, &["request", "approve", &id, "--approver", "bob"]).await;
    assert!(again.is_err());

    let listed = run(&h.services, &["request", "list", "--status", "approved"])
        .await
        .unwrap();
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let config = run(&h.services, &["request", "config", &id]).await.unwrap();
    assert_eq!(config["status"], "pending");
}

#[tokio::test]
async fn test_create_rejects_bad_spec_json() {
    let h = harness().await;

    let result = run(
        &h.services,
        &[
            "request",
            "create",
            "--requester",
            "alice",
            "--provider",
            "pve",
            "--environment",
            "dev",
            "--spec",
            "{not json",
        ],
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_ip_commands() {
    let h = harness().await;

    let pool = run(
        &h.services,
        &[
            "ip",
            "create-pool",
            "--name",
            "lab",
            "--cidr",
            "192.168.10.0/24",
            "--start",
            "192.168.10.100",
            "--end",
            "192.168.10.109",
        ],
    )
    .await
    .unwrap();
    let pool_id = pool["id"].as_str().unwrap().to_string();

    let first = run(&h.services, &["ip", "allocate", &pool_id, "--hostname", "web1"])
        .await
        .unwrap();
    assert_eq!(first["address"], "192.168.10.100");
    assert_eq!(first["status"], "reserved");

    run(&h.services, &["ip", "allocate-specific", &pool_id, "192.168.10.105"])
        .await
        .unwrap();

    let available = run(&h.services, &["ip", "available", &pool_id]).await.unwrap();
    assert_eq!(available["available"], 8);

    let outside = run(&h.services, &["ip", "allocate-specific", &pool_id, "192.168.10.200"]).await;
    assert!(outside.is_err());

    let released = run(
        &h.services,
        &["ip", "release", first["id"].as_str().unwrap()],
    )
    .await
    .unwrap();
    assert_eq!(released["status"], "available");

    let listed = run(&h.services, &["ip", "list", &pool_id]).await.unwrap();
    assert_eq!(listed.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_resource_destroy_runs_inline() {
    let h = harness().await;

    let created = run(
        &h.services,
        &[
            "request",
            "create",
            "--requester",
            "alice",
            "--provider",
            "pve",
            "--environment",
            "dev",
            "--spec",
            r#"{"name":"app1"}"#,
        ],
    )
    .await
    .unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    run(&h.services, &["request", "approve", &id, "--approver", "bob"])
        .await
        .unwrap();

    let ProvisionOutcome::Completed { resource_id } =
        h.services.pipeline.provision(&id).await.unwrap()
    else {
        panic!("expected completion");
    };

    let destroyed = run(&h.services, &["resource", "destroy", &resource_id])
        .await
        .unwrap();
    assert_eq!(destroyed["outcome"]["result"], "destroyed");
    assert_eq!(destroyed["resource"]["status"], "destroyed");

    assert!(h.temp.path().join("runs").is_dir());
}

#[tokio::test]
async fn test_reopening_backs_up_database() {
    let h = harness().await;
    let config = Config {
        db_path: h.temp.path().join("state").join("provisiond.db"),
        work_root: h.temp.path().join("runs"),
        ..Config::default()
    };

    open_database(&config).await.expect("reopen");

    let backups = std::fs::read_dir(h.temp.path().join("state"))
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().contains(".backup."))
        .count();
    assert!(backups >= 1);
}
