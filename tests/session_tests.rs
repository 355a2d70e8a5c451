//! Agents working side by side through sessions on one kernel.

mod fixtures;

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use fleet_kernel::events::AgentEvent;
use fleet_kernel::health::AgentStatus;
use fleet_kernel::locks::CommandDecision;
use fleet_kernel::store::keys::channels;
use fleet_kernel::{FleetKernelConfig, Kernel};

use fixtures::{manual_context, FakeSupervisor};

fn kernel() -> Kernel {
    let (ctx, _clock) = manual_context();
    let (_exit_tx, exit_rx) = mpsc::unbounded_channel();
    Kernel::with_supervisor(ctx, FleetKernelConfig::default(), FakeSupervisor::new(), exit_rx)
}

#[tokio::test]
async fn sessions_contend_for_files_and_commands() {
    let kernel = kernel();
    let a1 = kernel.session("a1", None);
    let a2 = kernel.session("a2", None);

    assert!(a1.claim("src/lib.rs", None).await.unwrap().success);
    let busy = a2.claim("src/lib.rs", None).await.unwrap();
    assert!(!busy.success);
    assert_eq!(busy.owner.as_deref(), Some("a1"));

    assert!(a1.request_command("npm  install").await.unwrap().may_run());
    match a2.request_command("npm install").await.unwrap() {
        CommandDecision::Busy { owner, .. } => assert_eq!(owner.as_deref(), Some("a1")),
        other => panic!("expected busy, got {other:?}"),
    }
    assert_eq!(
        a2.request_command("cargo test").await.unwrap(),
        CommandDecision::Monitored
    );

    assert!(a1.complete_command("npm install", true).await.unwrap());
    assert!(a2.request_command("npm install").await.unwrap().may_run());
}

#[tokio::test]
async fn session_shutdown_leaves_nothing_behind() {
    let kernel = kernel();
    let session = kernel.session("a1", Some("claude".into()));
    session.claim("docs/guide.md", None).await.unwrap();
    session.request_command("docker compose up").await.unwrap();

    let summary = session.shutdown().await.unwrap();
    assert_eq!(summary.file_locks_released, 1);
    assert_eq!(summary.command_locks_released, 1);
    assert!(kernel.locks().list_all().await.unwrap().is_empty());
    assert!(kernel.commands().locks().list_all().await.unwrap().is_empty());
    assert_eq!(kernel.commands().running_heartbeats(), 0);
}

#[tokio::test]
async fn session_events_reach_the_health_monitor() {
    let kernel = kernel();
    kernel.start().await.unwrap();
    // let the listener subscribe before anything is published
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut registry = kernel.context().store.subscribe(channels::AGENT_REGISTRY);

    let session = kernel.session("a1", Some("claude".into()));
    session.register(vec!["rust".into()]).await.unwrap();
    let raw = tokio::time::timeout(Duration::from_secs(5), registry.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(raw.contains("\"type\":\"agent_registered\""));

    session
        .heartbeat(AgentStatus::Working, HashMap::new())
        .await
        .unwrap();
    let mut status = AgentStatus::Active;
    for _ in 0..50 {
        if let Some(record) = kernel.health().get("a1").await.unwrap() {
            status = record.status;
            if status == AgentStatus::Working {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, AgentStatus::Working);

    kernel.shutdown().await;
}

#[tokio::test]
async fn kernel_shutdown_stops_supervised_agents() {
    let (ctx, _clock) = manual_context();
    let supervisor = FakeSupervisor::new();
    let (_exit_tx, exit_rx) = mpsc::unbounded_channel();
    let mut config = FleetKernelConfig::default();
    config.scaling.pools.push(fixtures::pool("claude"));
    let kernel = Kernel::with_supervisor(ctx, config, supervisor.clone(), exit_rx);

    let spawned = kernel
        .scaler()
        .scale_up("claude", 2, fleet_kernel::scaling::Urgency::Low)
        .await
        .unwrap();
    for id in &spawned {
        kernel.health().register(id, vec![], Some("claude".into())).await.unwrap();
        kernel.locks().claim(&format!("{id}.log"), id, None).await.unwrap();
    }

    kernel.shutdown().await;
    assert_eq!(supervisor.terminated_ids().len(), 2);
    assert!(kernel.locks().list_all().await.unwrap().is_empty());
    for id in &spawned {
        assert!(kernel.health().get(id).await.unwrap().is_none());
    }
}

#[test]
fn unknown_agent_events_deserialize() {
    let event: AgentEvent = serde_json::from_str(r#"{"type":"dance","agent_id":"a1"}"#).unwrap();
    assert_eq!(event, AgentEvent::Unknown);
}
