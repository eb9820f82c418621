#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{DateTime, TimeZone, Utc};
use claims::{assert_matches, assert_none, assert_some};
use futures_util::future::join_all;
use incident_engine::schema::{
    EscalationPolicy, EscalationStep, EscalationTarget, IncidentStatus, JobType, Urgency,
};
use incident_engine::{
    Engine, EngineConfig, EventError, EventPayload, EventResult, LogDispatcher, ManualClock,
    MemoryStore,
};
use insta::assert_compact_json_snapshot;
use serde_json::json;

const SERVICE: &str = "checkout";

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) type TestEngine = Engine<MemoryStore, LogDispatcher, ManualClock>;

    pub(super) fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    /// Create an engine with one service, optionally with an escalation policy
    pub(super) async fn create_engine(policy: Option<EscalationPolicy>) -> (TestEngine, ManualClock) {
        let store = MemoryStore::new();
        store.insert_service(SERVICE, None, policy).await;

        let clock = ManualClock::new(start_time());
        let engine = Engine::with_config(store, LogDispatcher, clock.clone(), EngineConfig::default());
        (engine, clock)
    }

    pub(super) fn event(action: &str, dedup_key: &str) -> EventPayload {
        EventPayload::from_json(json!({
            "event_action": action,
            "dedup_key": dedup_key,
            "payload": {
                "summary": "Disk full on db1",
                "source": "prometheus",
                "severity": "critical",
                "custom_details": { "mount": "/var" }
            }
        }))
        .unwrap()
    }

    pub(super) async fn timeline(engine: &TestEngine, id: uuid::Uuid) -> Vec<String> {
        let events = engine.incident_timeline(id).await.unwrap();
        events.into_iter().map(|event| event.message).collect()
    }
}

#[tokio::test]
async fn trigger_opens_an_incident() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine(None).await;

    let outcome = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;
    assert_eq!(outcome.action, EventResult::Triggered);
    let id = assert_some!(outcome.incident_id);

    let incident = engine.get_incident(id).await?;
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.title, "Disk full on db1");
    assert_eq!(incident.urgency, Urgency::High);
    assert_eq!(incident.created_at, test_utils::start_time());
    assert_none!(incident.escalation_status);
    assert_eq!(incident.description.as_deref(), Some("{\n  \"mount\": \"/var\"\n}"));

    let alerts = engine.incident_alerts(id).await?;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].integration_id, "prometheus");
    assert_eq!(alerts[0].payload["summary"], "Disk full on db1");

    assert_compact_json_snapshot!(test_utils::timeline(&engine, id).await, @r#"["Incident triggered via API from prometheus"]"#);

    Ok(())
}

#[tokio::test]
async fn duplicate_triggers_are_folded_into_the_open_incident() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine(None).await;

    let first = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;
    let second = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;

    assert_eq!(second.action, EventResult::Deduplicated);
    assert_eq!(second.incident_id, first.incident_id);

    let id = assert_some!(first.incident_id);
    assert_eq!(engine.incident_alerts(id).await?.len(), 2);
    assert_eq!(
        test_utils::timeline(&engine, id).await,
        vec![
            "Incident triggered via API from prometheus",
            "Re-triggered by event from prometheus. Summary: Disk full on db1",
        ]
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_triggers_open_exactly_one_incident() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine(None).await;

    let tasks = (0..10).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
                .await
        })
    });

    let mut outcomes = Vec::new();
    for result in join_all(tasks).await {
        outcomes.push(result??);
    }

    let triggered = outcomes
        .iter()
        .filter(|outcome| outcome.action == EventResult::Triggered)
        .count();
    let deduplicated = outcomes
        .iter()
        .filter(|outcome| outcome.action == EventResult::Deduplicated)
        .count();
    assert_eq!(triggered, 1);
    assert_eq!(deduplicated, 9);

    let incidents = engine.store().incidents().await;
    assert_eq!(incidents.len(), 1);
    assert!(outcomes.iter().all(|o| o.incident_id == Some(incidents[0].id)));
    assert_eq!(engine.incident_alerts(incidents[0].id).await?.len(), 10);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolves_resolve_once() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine(None).await;

    let outcome = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;
    let id = assert_some!(outcome.incident_id);

    let tasks = (0..10).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .process_event(test_utils::event("resolve", "disk-full"), SERVICE, "prometheus")
                .await
        })
    });

    let mut actions = Vec::new();
    for result in join_all(tasks).await {
        let outcome = result??;
        assert_eq!(outcome.incident_id, Some(id));
        actions.push(outcome.action);
    }

    assert_eq!(actions.iter().filter(|a| **a == EventResult::Resolved).count(), 1);
    assert_eq!(
        actions.iter().filter(|a| **a == EventResult::AlreadyResolved).count(),
        9
    );

    let incident = engine.get_incident(id).await?;
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_some!(incident.resolved_at);

    let resolutions = test_utils::timeline(&engine, id)
        .await
        .into_iter()
        .filter(|message| message.starts_with("Auto-resolved"))
        .count();
    assert_eq!(resolutions, 1);

    Ok(())
}

#[tokio::test]
async fn trigger_after_resolve_opens_a_new_incident() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine(None).await;

    let first = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;
    engine
        .process_event(test_utils::event("resolve", "disk-full"), SERVICE, "prometheus")
        .await?;

    clock.advance(chrono::Duration::minutes(1));
    let second = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;

    assert_eq!(second.action, EventResult::Triggered);
    assert_ne!(second.incident_id, first.incident_id);
    assert_eq!(engine.store().incidents().await.len(), 2);

    Ok(())
}

#[tokio::test]
async fn acknowledge_events() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine(None).await;

    let trigger = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;
    let id = assert_some!(trigger.incident_id);

    let first = engine
        .process_event(test_utils::event("acknowledge", "disk-full"), SERVICE, "prometheus")
        .await?;
    assert_eq!(first.action, EventResult::Acknowledged);
    assert_eq!(first.incident_id, Some(id));

    let second = engine
        .process_event(test_utils::event("acknowledge", "disk-full"), SERVICE, "prometheus")
        .await?;
    assert_eq!(second.action, EventResult::AlreadyAcknowledged);

    let incident = engine.get_incident(id).await?;
    assert_eq!(incident.status, IncidentStatus::Acknowledged);
    assert_eq!(incident.acknowledged_at, Some(test_utils::start_time()));

    engine
        .process_event(test_utils::event("resolve", "disk-full"), SERVICE, "prometheus")
        .await?;
    let after_resolve = engine
        .process_event(test_utils::event("acknowledge", "disk-full"), SERVICE, "prometheus")
        .await?;
    assert_compact_json_snapshot!(after_resolve, @r#"{"action": "ignored", "incident_id": null}"#);

    Ok(())
}

#[tokio::test]
async fn events_for_unknown_dedup_keys_are_ignored() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine(None).await;

    let resolve = engine
        .process_event(test_utils::event("resolve", "never-seen"), SERVICE, "prometheus")
        .await?;
    assert_compact_json_snapshot!(resolve, @r#"{"action": "ignored", "incident_id": null}"#);

    let acknowledge = engine
        .process_event(test_utils::event("acknowledge", "never-seen"), SERVICE, "prometheus")
        .await?;
    assert_compact_json_snapshot!(acknowledge, @r#"{"action": "ignored", "incident_id": null}"#);

    assert!(engine.store().incidents().await.is_empty());

    Ok(())
}

#[tokio::test]
async fn invalid_events_are_rejected() {
    let (engine, _clock) = test_utils::create_engine(None).await;

    let mut blank_summary = test_utils::event("trigger", "disk-full");
    blank_summary.payload.summary = "   ".to_string();
    let result = engine.process_event(blank_summary, SERVICE, "prometheus").await;
    assert_matches!(result, Err(EventError::Validation(_)));

    let mut long_key = test_utils::event("trigger", "disk-full");
    long_key.dedup_key = "k".repeat(256);
    let result = engine.process_event(long_key, SERVICE, "prometheus").await;
    assert_matches!(result, Err(EventError::Validation(_)));

    let result = engine
        .process_event(test_utils::event("trigger", "disk-full"), "unknown", "prometheus")
        .await;
    assert_matches!(result, Err(EventError::Validation(_)));

    assert!(engine.store().incidents().await.is_empty());
}

#[tokio::test]
async fn trigger_with_policy_schedules_the_first_step() -> anyhow::Result<()> {
    let policy = EscalationPolicy::new(
        "database",
        vec![EscalationStep {
            step_order: 1,
            delay_minutes: 5,
            target: EscalationTarget::User {
                user_id: "alice".to_string(),
            },
            channels: vec![],
        }],
    );
    let (engine, _clock) = test_utils::create_engine(Some(policy)).await;

    let outcome = engine
        .process_event(test_utils::event("trigger", "disk-full"), SERVICE, "prometheus")
        .await?;
    let id = assert_some!(outcome.incident_id);

    let incident = engine.get_incident(id).await?;
    let due_at = test_utils::start_time() + chrono::Duration::minutes(5);
    assert_eq!(incident.next_escalation_at, Some(due_at));
    assert_eq!(incident.escalation_claimed_step, -1);

    let jobs = engine.store().jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_type, JobType::EscalationStep);
    assert_eq!(jobs[0].scheduled_at, due_at);
    assert_eq!(jobs[0].payload, json!({ "incidentId": id, "stepIndex": 0 }));

    // Not due yet, and nobody was notified.
    assert!(engine.claim_pending_jobs(10).await?.is_empty());
    assert!(engine.incident_notifications(id).await?.is_empty());

    Ok(())
}
