//! Queue-driven scaling against a recording process supervisor.

mod fixtures;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

use fleet_kernel::config::{CommandConfig, HealthConfig, LockConfig};
use fleet_kernel::events::ControlMessage;
use fleet_kernel::locks::{CommandCoordinator, LeaseLockManager};
use fleet_kernel::scaling::{
    make_scaling_decision, ExitNotice, PoolMetrics, ScalingAction, ScalingPolicy, Urgency,
};
use fleet_kernel::store::keys;
use fleet_kernel::{AgentHealthMonitor, AgentRetirement};

use fixtures::{pool, scaler_harness, scaling_config, seed_queue, ScalerHarness};

#[tokio::test]
async fn deep_queue_spawns_agents_up_to_target() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    seed_queue(h.ctx.store.as_ref(), "claude", 45).await;

    let decision = h.scaler.evaluate_pool("claude").await.unwrap();
    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.from_count, 0);
    assert_eq!(decision.to_count, 3);
    assert_eq!(h.scaler.supervised_count(), 3);

    let spawned = h.supervisor.spawned.lock().unwrap().clone();
    assert_eq!(spawned.len(), 3);
    for spec in &spawned {
        assert!(spec.agent_id.starts_with("claude-"));
        assert_eq!(spec.command, "agent-worker");
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "FLEET_POOL_ID" && v == "claude"));
        assert!(spec
            .env
            .iter()
            .any(|(k, v)| k == "FLEET_AGENT_ID" && v == &spec.agent_id));
    }

    let history = h.scaler.scaling_history().await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to_count, 3);
    assert_eq!(h.scaler.current_metrics()["claude"].queue_depth, 45);
}

#[tokio::test]
async fn cooldown_blocks_back_to_back_actions() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    seed_queue(h.ctx.store.as_ref(), "claude", 45).await;
    h.scaler.evaluate_pool("claude").await.unwrap();

    seed_queue(h.ctx.store.as_ref(), "claude", 100).await;
    let blocked = h.scaler.evaluate_pool("claude").await.unwrap();
    assert_eq!(blocked.action, ScalingAction::None);
    assert!(blocked.reason.contains("cooldown"));
    assert_eq!(h.scaler.supervised_count(), 3);

    h.clock.advance(Duration::from_secs(301));
    let next = h.scaler.evaluate_pool("claude").await.unwrap();
    assert_eq!(next.action, ScalingAction::ScaleUp);
    assert_eq!(next.to_count, 8);
}

#[tokio::test]
async fn scale_down_waits_for_in_flight_work_and_stops_newest_first() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    seed_queue(h.ctx.store.as_ref(), "claude", 45).await;
    h.scaler.evaluate_pool("claude").await.unwrap();
    let started = h.supervisor.spawned_ids();

    fixtures::drain_queue(h.ctx.store.as_ref(), "claude").await;
    h.ctx
        .store
        .push(&keys::processing("claude"), "job-7")
        .await
        .unwrap();
    h.clock.advance(Duration::from_secs(301));

    let held = h.scaler.evaluate_pool("claude").await.unwrap();
    assert_eq!(held.action, ScalingAction::None);
    assert_eq!(h.scaler.supervised_count(), 3);

    h.ctx.store.take(&keys::processing("claude")).await.unwrap();
    let shrink = h.scaler.evaluate_pool("claude").await.unwrap();
    assert_eq!(shrink.action, ScalingAction::ScaleDown);
    assert_eq!(shrink.to_count, 1);

    let mut terminated = h.supervisor.terminated_ids();
    terminated.sort();
    let mut newest = started[1..].to_vec();
    newest.sort();
    assert_eq!(terminated, newest);
    let remaining: Vec<_> = h
        .scaler
        .supervised("claude")
        .into_iter()
        .map(|a| a.agent_id)
        .collect();
    assert_eq!(remaining, vec![started[0].clone()]);
}

#[tokio::test]
async fn scaled_down_agents_are_retired_not_escalated() {
    let ScalerHarness {
        ctx, clock, scaler, ..
    } = scaler_harness(scaling_config(vec![pool("claude")]));
    let locks = LeaseLockManager::for_files(ctx.clone(), LockConfig::default());
    let commands = Arc::new(CommandCoordinator::new(
        ctx.clone(),
        CommandConfig::default(),
        LockConfig::default(),
    ));
    let health = Arc::new(AgentHealthMonitor::new(ctx.clone(), HealthConfig::default()));
    let scaler = scaler.with_retirement(AgentRetirement::new(
        locks.clone(),
        commands.clone(),
        health.clone(),
    ));

    let started = scaler.scale_up("claude", 3, Urgency::Medium).await.unwrap();
    for (i, agent_id) in started.iter().enumerate() {
        health
            .register(agent_id, vec![], Some("claude".into()))
            .await
            .unwrap();
        let file = format!("src/worker_{i}.rs");
        assert!(locks.claim(&file, agent_id, None).await.unwrap().success);
        let command = format!("npm install pkg-{i}");
        assert!(commands
            .request_command_execution(agent_id, &command)
            .await
            .unwrap()
            .may_run());
    }

    let stopped = scaler.scale_down("claude", 2).await;
    assert_eq!(stopped.len(), 2);
    for agent_id in &stopped {
        assert!(health.get(agent_id).await.unwrap().is_none());
        assert!(locks.list_for_agent(agent_id).await.unwrap().is_empty());
        assert!(commands
            .locks()
            .list_for_agent(agent_id)
            .await
            .unwrap()
            .is_empty());
    }
    assert_eq!(commands.running_heartbeats(), 1);
    assert_eq!(health.system_health().await.unwrap().total, 1);

    for _ in 0..4 {
        clock.advance(Duration::from_secs(91));
        health.sweep().await.unwrap();
    }
    let escalated: Vec<_> = health
        .escalations()
        .await
        .unwrap()
        .into_iter()
        .map(|escalation| escalation.agent_id)
        .collect();
    assert!(stopped.iter().all(|agent_id| !escalated.contains(agent_id)));
}

#[tokio::test]
async fn failed_spawns_are_not_counted() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    h.supervisor.fail_spawns(true);

    let spawned = h.scaler.scale_up("claude", 2, Urgency::Low).await.unwrap();
    assert!(spawned.is_empty());
    assert_eq!(h.scaler.supervised_count(), 0);
}

#[tokio::test]
async fn unknown_pools_are_rejected() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    assert!(h.scaler.scale_up("gpt", 1, Urgency::Low).await.is_err());
    assert!(h.scaler.evaluate_pool("gpt").await.is_err());
}

#[tokio::test]
async fn exited_agents_leave_the_table() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    let spawned = h.scaler.scale_up("claude", 2, Urgency::Medium).await.unwrap();

    h.supervisor.exit(&spawned[0]);
    h.exits
        .send(ExitNotice {
            agent_id: spawned[0].clone(),
            pool_id: "claude".into(),
            code: Some(1),
        })
        .unwrap();

    assert_eq!(h.scaler.drain_exits(), 1);
    assert_eq!(h.scaler.supervised_count(), 1);
    assert_eq!(h.scaler.supervised("claude")[0].agent_id, spawned[1]);
}

#[tokio::test]
async fn restart_requests_replace_supervised_agents() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    let spawned = h.scaler.scale_up("claude", 1, Urgency::Low).await.unwrap();
    let original = spawned[0].clone();

    let replacement = h
        .scaler
        .handle_control(ControlMessage::Restart {
            agent_id: original.clone(),
            pool: Some("claude".into()),
        })
        .await
        .unwrap();

    assert_ne!(replacement, original);
    assert_eq!(h.supervisor.terminated_ids(), vec![original]);
    let supervised = h.scaler.supervised("claude");
    assert_eq!(supervised.len(), 1);
    assert_eq!(supervised[0].agent_id, replacement);
    assert_eq!(supervised[0].urgency, "high");

    let ignored = h
        .scaler
        .handle_control(ControlMessage::Ping { agent_id: replacement })
        .await;
    assert!(ignored.is_none());
}

#[tokio::test]
async fn restart_of_an_unsupervised_agent_is_ignored() {
    let h = scaler_harness(scaling_config(vec![pool("claude")]));
    let outcome = h
        .scaler
        .handle_control(ControlMessage::Restart {
            agent_id: "someone-else".into(),
            pool: None,
        })
        .await;
    assert!(outcome.is_none());
    assert!(h.supervisor.spawned_ids().is_empty());
}

#[tokio::test]
async fn stop_all_terminates_every_pool() {
    let h = scaler_harness(scaling_config(vec![pool("claude"), pool("gpt")]));
    h.scaler.scale_up("claude", 2, Urgency::Low).await.unwrap();
    h.scaler.scale_up("gpt", 1, Urgency::Low).await.unwrap();

    let stopped = h.scaler.stop_all().await;
    assert_eq!(stopped.len(), 3);
    assert_eq!(h.scaler.supervised_count(), 0);
    assert_eq!(h.supervisor.terminated_ids().len(), 3);
}

#[tokio::test]
async fn evaluate_scaling_covers_every_pool() {
    let h = scaler_harness(scaling_config(vec![pool("claude"), pool("gpt")]));
    seed_queue(h.ctx.store.as_ref(), "gpt", 30).await;

    let decisions = h.scaler.evaluate_scaling().await;
    assert_eq!(decisions.len(), 2);
    let gpt = decisions.iter().find(|d| d.pool_id == "gpt").unwrap();
    assert_eq!(gpt.action, ScalingAction::ScaleUp);
    assert_eq!(gpt.to_count, 2);
    let claude = decisions.iter().find(|d| d.pool_id == "claude").unwrap();
    assert_eq!(claude.action, ScalingAction::None);
}

fn metrics(queue_depth: u64, processing: u64, current: u32, avg: f64, error_rate: f64) -> PoolMetrics {
    PoolMetrics {
        queue_depth,
        processing_count: processing,
        avg_processing_time: avg,
        error_rate,
        ..PoolMetrics::idle("claude", current, Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap())
    }
}

proptest! {
    #[test]
    fn executed_decisions_stay_within_pool_limits(
        queue_depth in 0u64..500,
        processing in 0u64..50,
        current in 1u32..=10,
        avg in 0.0f64..900.0,
        error_rate in 0.0f64..1.0,
    ) {
        let policy = ScalingPolicy::default();
        let m = metrics(queue_depth, processing, current, avg, error_rate);
        let decision = make_scaling_decision(&m, &policy, None, m.timestamp);

        if decision.is_action() {
            prop_assert!(decision.to_count >= policy.min_agents);
            prop_assert!(decision.to_count <= policy.max_agents);
            prop_assert_ne!(decision.to_count, decision.from_count);
        } else {
            prop_assert_eq!(decision.to_count, current);
        }
        if processing > 0 {
            prop_assert_ne!(decision.action, ScalingAction::ScaleDown);
        }
    }

    #[test]
    fn nothing_happens_inside_the_cooldown(
        queue_depth in 0u64..500,
        current in 1u32..=10,
        since_last in 0i64..300,
    ) {
        let policy = ScalingPolicy::default();
        let m = metrics(queue_depth, 0, current, 0.0, 0.0);
        let last = m.timestamp - chrono::Duration::seconds(since_last);
        let decision = make_scaling_decision(&m, &policy, Some(last), m.timestamp);
        prop_assert_eq!(decision.action, ScalingAction::None);
    }
}
