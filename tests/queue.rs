#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use claims::{assert_matches, assert_ok, assert_some, assert_some_eq};
use futures_util::future::join_all;
use incident_engine::jobs::ScheduledTask;
use incident_engine::schema::{IncidentStatus, JobStatus, JobType};
use incident_engine::{
    BackgroundJob, Clock, Dispatcher, Engine, EngineConfig, EngineError, EventPayload, JobOutcome,
    LogDispatcher, ManualClock, MemoryStore, Store,
};
use insta::assert_compact_json_snapshot;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::LazyLock;
use tokio::sync::Barrier;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    pub(super) type TestEngine = Engine<MemoryStore, LogDispatcher, ManualClock>;

    pub(super) fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    pub(super) async fn create_engine() -> (TestEngine, ManualClock) {
        let store = MemoryStore::new();
        store.insert_service("checkout", None, None).await;

        let clock = ManualClock::new(start_time());
        let engine = Engine::with_config(store, LogDispatcher, clock.clone(), EngineConfig::default());
        (engine, clock)
    }

    pub(super) async fn schedule_task(engine: &TestEngine, name: &str) -> i64 {
        let task = ScheduledTask {
            task: name.to_string(),
            data: json!({}),
        };
        task.enqueue_at(engine, start_time()).await.unwrap()
    }

    pub(super) async fn trigger(engine: &TestEngine) -> Uuid {
        let event = EventPayload::from_json(json!({
            "event_action": "trigger",
            "dedup_key": "disk-full",
            "payload": { "summary": "Disk full", "source": "prometheus", "severity": "info" }
        }))
        .unwrap();

        let outcome = engine.process_event(event, "checkout", "prometheus").await.unwrap();
        outcome.incident_id.unwrap()
    }
}

#[tokio::test]
async fn completed_jobs_are_retired() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine().await;
    let id = test_utils::schedule_task(&engine, "rotate-logs").await;

    let job = engine.get_job(id).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);

    let mut claimed = engine.claim_pending_jobs(10).await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].status, JobStatus::Processing);
    assert_eq!(claimed[0].attempts, 1);

    let status = engine.process_job(claimed.remove(0)).await?;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(engine.get_job(id).await?.status, JobStatus::Completed);

    // Already retired.
    assert!(!engine.mark_job_completed(id, 1).await?);
    assert!(!engine.mark_job_cancelled(id, 1, "too late").await?);

    Ok(())
}

#[tokio::test]
async fn failing_jobs_back_off_exponentially() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine().await;
    let start = test_utils::start_time();

    let id = engine
        .schedule_job(JobType::EscalationStep, start, json!({ "bogus": true }), 3)
        .await?;

    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(engine.process_job(job).await?, JobStatus::Pending);
    let job = engine.get_job(id).await?;
    assert_eq!(job.attempts, 1);
    assert_eq!(job.scheduled_at, start + Duration::seconds(10));
    assert!(job.error.unwrap().contains("missing field"));

    // Not due before the backoff has elapsed.
    assert!(engine.claim_pending_jobs(10).await?.is_empty());

    clock.advance(Duration::seconds(10));
    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(engine.process_job(job).await?, JobStatus::Pending);
    let job = engine.get_job(id).await?;
    assert_eq!(job.attempts, 2);
    assert_eq!(job.scheduled_at, start + Duration::seconds(30));

    clock.advance(Duration::seconds(20));
    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(engine.process_job(job).await?, JobStatus::Failed);
    let job = engine.get_job(id).await?;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);

    clock.advance(Duration::days(1));
    assert!(engine.claim_pending_jobs(10).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn panicking_handlers_fail_the_job() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct PanickingTask {
        task: String,
    }

    impl BackgroundJob for PanickingTask {
        const JOB_TYPE: JobType = JobType::ScheduledTask;

        async fn run<S: Store, D: Dispatcher, C: Clock>(
            &self,
            _engine: &Engine<S, D, C>,
        ) -> anyhow::Result<JobOutcome> {
            panic!("{} exploded", self.task);
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(test_utils::start_time());
    let engine = Engine::new(store, LogDispatcher, clock).register_job_type::<PanickingTask>();

    let task = PanickingTask {
        task: "rotate-logs".to_string(),
    };
    let id = task.enqueue_at(&engine, test_utils::start_time()).await?;

    let job = engine.claim_pending_jobs(1).await?.remove(0);
    assert_eq!(engine.process_job(job).await?, JobStatus::Pending);

    let job = engine.get_job(id).await?;
    assert_some_eq!(job.error.as_deref(), "job panicked: rotate-logs exploded");

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_overlap() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine().await;
    for i in 0..5 {
        test_utils::schedule_task(&engine, &format!("task-{i}")).await;
    }

    let tasks = (0..3).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.claim_pending_jobs(10).await })
    });

    let mut claimed = Vec::new();
    for result in join_all(tasks).await {
        claimed.extend(result??.into_iter().map(|job| job.id));
    }

    let unique = claimed.iter().copied().collect::<HashSet<_>>();
    assert_eq!(claimed.len(), 5);
    assert_eq!(unique.len(), 5);

    let stats = engine.get_job_stats().await?;
    assert_eq!(stats.processing, 5);
    assert_eq!(stats.total(), 5);

    Ok(())
}

#[tokio::test]
async fn claims_respect_the_limit_and_due_time() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine().await;
    let later = test_utils::start_time() + Duration::hours(1);

    for i in 0..3 {
        test_utils::schedule_task(&engine, &format!("task-{i}")).await;
    }
    engine
        .schedule_job(JobType::ScheduledTask, later, json!({ "task": "later" }), 1)
        .await?;

    assert_eq!(engine.claim_pending_jobs(2).await?.len(), 2);
    assert_eq!(engine.claim_pending_jobs(2).await?.len(), 1);
    assert!(engine.claim_pending_jobs(2).await?.is_empty());
    assert!(engine.claim_pending_jobs(0).await?.is_empty());

    clock.set(later);
    let claimed = engine.claim_pending_jobs(2).await?;
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].payload["task"], "later");

    Ok(())
}

#[tokio::test]
async fn stale_jobs_are_requeued() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine().await;
    let retryable = test_utils::schedule_task(&engine, "retryable").await;
    let exhausted = engine
        .schedule_job(
            JobType::ScheduledTask,
            test_utils::start_time(),
            json!({ "task": "once" }),
            1,
        )
        .await?;

    assert_eq!(engine.claim_pending_jobs(10).await?.len(), 2);

    clock.advance(Duration::minutes(2));
    assert_eq!(engine.requeue_stale_jobs(std::time::Duration::from_secs(300)).await?, 0);

    clock.advance(Duration::minutes(4));
    assert_eq!(engine.requeue_stale_jobs(std::time::Duration::from_secs(300)).await?, 2);

    let job = engine.get_job(retryable).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error.as_deref(), Some("worker stopped responding"));
    assert_eq!(engine.get_job(exhausted).await?.status, JobStatus::Failed);

    let stats = engine.get_job_stats().await?;
    assert_compact_json_snapshot!(stats, @r#"{"pending": 1, "processing": 0, "completed": 0, "failed": 1, "cancelled": 0}"#);

    Ok(())
}

#[tokio::test]
async fn requeued_jobs_reject_the_previous_claim() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine().await;
    let id = test_utils::schedule_task(&engine, "rotate-logs").await;

    let first = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(first.attempts, 1);

    clock.advance(Duration::minutes(6));
    assert_eq!(engine.requeue_stale_jobs(std::time::Duration::from_secs(300)).await?, 1);
    let second = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(second.attempts, 2);

    // The first worker finishing late must not retire the second one's claim.
    assert!(!engine.mark_job_completed(id, first.attempts).await?);
    assert!(!engine.mark_job_cancelled(id, first.attempts, "late").await?);
    assert_eq!(engine.mark_job_failed(id, first.attempts, "late").await?, None);
    let job = engine.get_job(id).await?;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempts, 2);

    assert!(engine.mark_job_completed(id, second.attempts).await?);
    assert_eq!(engine.get_job(id).await?.status, JobStatus::Completed);

    Ok(())
}

#[tokio::test]
async fn outcomes_of_lost_claims_are_dropped() -> anyhow::Result<()> {
    /// Loses its own claim to a requeue while running.
    #[derive(Serialize, Deserialize)]
    struct RequeuedTask;

    impl BackgroundJob for RequeuedTask {
        const JOB_TYPE: JobType = JobType::ScheduledTask;

        async fn run<S: Store, D: Dispatcher, C: Clock>(
            &self,
            engine: &Engine<S, D, C>,
        ) -> anyhow::Result<JobOutcome> {
            let now = engine.clock().now();
            engine.store().requeue_stale_jobs(DateTime::<Utc>::MAX_UTC, now).await?;
            Ok(JobOutcome::Completed)
        }
    }

    let (engine, _clock) = test_utils::create_engine().await;
    let engine = engine.register_job_type::<RequeuedTask>();
    let id = RequeuedTask.enqueue_at(&engine, test_utils::start_time()).await?;

    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(engine.process_job(job).await?, JobStatus::Pending);

    let job = engine.get_job(id).await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.error.as_deref(), Some("worker stopped responding"));

    Ok(())
}

static HEARTBEAT_JOB_STARTED: LazyLock<Barrier> = LazyLock::new(|| Barrier::new(2));
static HEARTBEAT_CHECKED: LazyLock<Barrier> = LazyLock::new(|| Barrier::new(2));

#[tokio::test]
async fn running_jobs_renew_their_claim() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct SlowTask;

    impl BackgroundJob for SlowTask {
        const JOB_TYPE: JobType = JobType::ScheduledTask;

        async fn run<S: Store, D: Dispatcher, C: Clock>(
            &self,
            _engine: &Engine<S, D, C>,
        ) -> anyhow::Result<JobOutcome> {
            HEARTBEAT_JOB_STARTED.wait().await;
            HEARTBEAT_CHECKED.wait().await;
            Ok(JobOutcome::Completed)
        }
    }

    let store = MemoryStore::new();
    let clock = ManualClock::new(test_utils::start_time());
    let config = EngineConfig::default().job_heartbeat_interval(std::time::Duration::from_millis(10));
    let engine = Engine::with_config(store, LogDispatcher, clock.clone(), config)
        .register_job_type::<SlowTask>();
    let id = SlowTask.enqueue_at(&engine, test_utils::start_time()).await?;

    let job = engine.claim_pending_jobs(10).await?.remove(0);
    let worker = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.process_job(job).await })
    };
    HEARTBEAT_JOB_STARTED.wait().await;

    clock.advance(Duration::minutes(6));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let job = engine.get_job(id).await?;
    assert_eq!(job.updated_at, test_utils::start_time() + Duration::minutes(6));
    assert_eq!(engine.requeue_stale_jobs(std::time::Duration::from_secs(300)).await?, 0);

    HEARTBEAT_CHECKED.wait().await;
    assert_eq!(worker.await??, JobStatus::Completed);
    assert_eq!(engine.get_job(id).await?.attempts, 1);

    Ok(())
}

#[tokio::test]
async fn unknown_jobs_are_reported() {
    let (engine, _clock) = test_utils::create_engine().await;
    assert_matches!(engine.get_job(42).await, Err(EngineError::JobNotFound(42)));
}

#[tokio::test]
async fn snoozed_incidents_return_when_the_snooze_expires() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine().await;
    let id = test_utils::trigger(&engine).await;
    let until = test_utils::start_time() + Duration::hours(1);

    assert!(engine.snooze_incident(id, until).await?);
    let incident = engine.get_incident(id).await?;
    assert_eq!(incident.status, IncidentStatus::Snoozed);
    assert_eq!(incident.snoozed_until, Some(until));

    // Snoozing twice is refused.
    assert!(!engine.snooze_incident(id, until).await?);

    let job = engine
        .store()
        .jobs()
        .await
        .into_iter()
        .find(|job| job.job_type == JobType::AutoUnsnooze);
    let job = assert_some!(job);
    assert_eq!(job.scheduled_at, until);
    assert!(engine.claim_pending_jobs(10).await?.is_empty());

    clock.set(until);
    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(engine.process_job(job).await?, JobStatus::Completed);

    let incident = engine.get_incident(id).await?;
    assert_eq!(incident.status, IncidentStatus::Open);
    assert_eq!(incident.snoozed_until, None);

    let timeline = engine.incident_timeline(id).await?;
    let messages = timeline.iter().map(|e| e.message.as_str()).collect::<Vec<_>>();
    assert_eq!(
        messages,
        vec![
            "Incident triggered via API from prometheus",
            "Incident snoozed until 2025-03-01T13:00:00+00:00",
            "Incident auto-unsnoozed",
        ]
    );

    Ok(())
}

#[tokio::test]
async fn unsnooze_is_cancelled_when_the_incident_moved_on() -> anyhow::Result<()> {
    let (engine, clock) = test_utils::create_engine().await;
    let id = test_utils::trigger(&engine).await;
    let until = test_utils::start_time() + Duration::hours(1);

    assert!(engine.snooze_incident(id, until).await?);
    assert!(engine.resolve_incident(id).await?);

    clock.set(until);
    let job = engine.claim_pending_jobs(10).await?.remove(0);
    assert_eq!(engine.process_job(job).await?, JobStatus::Cancelled);
    assert_eq!(engine.get_incident(id).await?.status, IncidentStatus::Resolved);

    Ok(())
}

#[tokio::test]
async fn manual_transitions_are_guarded() -> anyhow::Result<()> {
    let (engine, _clock) = test_utils::create_engine().await;
    let id = test_utils::trigger(&engine).await;

    assert!(engine.suppress_incident(id).await?);
    assert!(!engine.suppress_incident(id).await?);
    assert!(engine.acknowledge_incident(id).await?);
    assert!(!engine.acknowledge_incident(id).await?);
    assert!(engine.resolve_incident(id).await?);
    assert!(!engine.resolve_incident(id).await?);
    assert!(!engine.acknowledge_incident(id).await?);

    let missing = Uuid::new_v4();
    assert_matches!(
        engine.resolve_incident(missing).await,
        Err(EngineError::IncidentNotFound(_))
    );
    assert_ok!(engine.incident_timeline(id).await);

    Ok(())
}
