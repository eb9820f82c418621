#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use claims::assert_some;
use incident_engine::schema::{JobStatus, JobType, SlaTargets};
use incident_engine::sla::BreachKind;
use incident_engine::{Engine, EngineConfig, EventPayload, LogDispatcher, ManualClock, MemoryStore};
use insta::assert_compact_json_snapshot;
use serde_json::json;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) type TestEngine = Engine<MemoryStore, LogDispatcher, ManualClock>;

    pub(super) fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    pub(super) async fn create_engine(store: MemoryStore) -> (TestEngine, ManualClock) {
        store.insert_service("checkout", None, None).await;

        let clock = ManualClock::new(start_time());
        let engine = Engine::with_config(store, LogDispatcher, clock.clone(), EngineConfig::default());
        (engine, clock)
    }

    pub(super) async fn trigger(engine: &TestEngine, service_id: &str, dedup_key: &str) -> Uuid {
        let event = EventPayload::from_json(json!({
            "event_action": "trigger",
            "dedup_key": dedup_key,
            "payload": { "summary": "Disk full", "source": "prometheus", "severity": "critical" }
        }))
        .unwrap();

        let outcome = engine.process_event(event, service_id, "prometheus").await.unwrap();
        outcome.incident_id.unwrap()
    }
}

#[tokio::test]
async fn warnings_are_raised_once_per_lead_time() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine(MemoryStore::new()).await;
    let id = test_utils::trigger(&engine, "checkout", "disk-full").await;

    clock.advance(Duration::minutes(5));
    let report = engine.check_sla_breaches().await?;
    assert_eq!(report.active_incident_count, 1);
    assert!(report.warnings.is_empty());

    clock.advance(Duration::minutes(6));
    let report = engine.check_sla_breaches().await?;
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].incident_id, id);
    assert_compact_json_snapshot!(report.warnings[0].kind, @r#""ack""#);
    assert_eq!(report.warnings[0].remaining_minutes, 4);
    assert_eq!(report.warnings[0].target_minutes, 15);

    // Already on the timeline.
    clock.advance(Duration::minutes(1));
    assert!(engine.check_sla_breaches().await?.warnings.is_empty());

    let timeline = engine.incident_timeline(id).await?;
    let last = assert_some!(timeline.last());
    assert_eq!(last.message, "SLA ACK Warning: 4 min remaining (target: 15 min)");
    assert_eq!(last.created_at, test_utils::start_time() + Duration::minutes(11));

    assert!(engine.acknowledge_incident(id).await?);
    clock.set(test_utils::start_time() + Duration::minutes(110));
    let report = engine.check_sla_breaches().await?;
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].kind, BreachKind::Resolve);
    assert_eq!(report.warnings[0].remaining_minutes, 10);

    assert!(engine.resolve_incident(id).await?);
    let report = engine.check_sla_breaches().await?;
    assert_eq!(report.active_incident_count, 0);
    assert!(report.warnings.is_empty());

    Ok(())
}

#[tokio::test]
async fn services_can_opt_out_of_warnings() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    store.insert_service("batch", None, None).await;
    store
        .set_sla_targets(
            "batch",
            SlaTargets {
                notify_on_breach: false,
                ..SlaTargets::default()
            },
        )
        .await;
    let (engine, clock) = test_utils::create_engine(store).await;

    let quiet = test_utils::trigger(&engine, "batch", "nightly-export").await;
    test_utils::trigger(&engine, "checkout", "disk-full").await;

    clock.advance(Duration::minutes(12));
    let report = engine.check_sla_breaches().await?;
    assert_eq!(report.active_incident_count, 2);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].service_id, "checkout");

    let timeline = engine.incident_timeline(quiet).await?;
    assert!(timeline.iter().all(|event| !event.message.starts_with("SLA")));

    Ok(())
}

#[tokio::test]
async fn tighter_targets_warn_earlier() -> anyhow::Result<()> {
    let store = MemoryStore::new();
    let (engine, clock) = test_utils::create_engine(store).await;
    engine
        .store()
        .set_sla_targets(
            "checkout",
            SlaTargets {
                ack_minutes: 5,
                resolve_minutes: 30,
                notify_on_breach: true,
            },
        )
        .await;
    test_utils::trigger(&engine, "checkout", "disk-full").await;

    clock.advance(Duration::minutes(2));
    let report = engine.check_sla_breaches().await?;
    let kinds = report.warnings.iter().map(|w| w.kind).collect::<Vec<_>>();
    assert_eq!(kinds, vec![BreachKind::Ack]);
    assert_eq!(report.warnings[0].remaining_minutes, 3);

    clock.advance(Duration::minutes(14));
    let report = engine.check_sla_breaches().await?;
    let kinds = report.warnings.iter().map(|w| w.kind).collect::<Vec<_>>();
    assert_eq!(kinds, vec![BreachKind::Resolve]);

    Ok(())
}

#[tokio::test]
async fn the_monitor_reschedules_itself() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine(MemoryStore::new()).await;
    let id = test_utils::trigger(&engine, "checkout", "disk-full").await;
    clock.advance(Duration::minutes(11));

    let first = engine.schedule_sla_monitor().await?;
    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(job.id, first);
    assert_eq!(job.job_type, JobType::SlaBreachCheck);
    assert_eq!(engine.process_job(job).await?, JobStatus::Completed);

    let timeline = engine.incident_timeline(id).await?;
    assert!(timeline.iter().any(|event| event.message.starts_with("SLA ACK Warning")));

    let next = engine
        .store()
        .jobs()
        .await
        .into_iter()
        .find(|job| job.job_type == JobType::SlaBreachCheck && job.status == JobStatus::Pending);
    let next = assert_some!(next);
    assert_eq!(next.scheduled_at, test_utils::start_time() + Duration::minutes(16));
    assert!(engine.claim_pending_jobs(10).await?.is_empty());

    clock.advance(Duration::minutes(5));
    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(job.id, next.id);
    assert_eq!(engine.process_job(job).await?, JobStatus::Completed);

    Ok(())
}
