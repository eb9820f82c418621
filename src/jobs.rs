//! Built-in job types.

use crate::background_job::{BackgroundJob, JobOutcome};
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::escalation::notification_request;
use crate::schema::{IncidentStatus, JobType, NotificationStatus};
use crate::storage::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

/// Runs one escalation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationStepJob {
    #[allow(missing_docs)]
    pub incident_id: Uuid,
    #[allow(missing_docs)]
    pub step_index: i32,
}

impl BackgroundJob for EscalationStepJob {
    const JOB_TYPE: JobType = JobType::EscalationStep;

    async fn run<S: Store, D: Dispatcher, C: Clock>(
        &self,
        engine: &Engine<S, D, C>,
    ) -> anyhow::Result<JobOutcome> {
        let outcome = match engine
            .execute_escalation(self.incident_id, self.step_index)
            .await
        {
            Ok(outcome) => outcome,
            Err(EngineError::IncidentNotFound(_)) => {
                return Ok(JobOutcome::cancelled("Incident not found"));
            }
            Err(error) => return Err(error.into()),
        };

        if outcome.escalated {
            return Ok(JobOutcome::Completed);
        }

        let reason = outcome.reason.unwrap_or_default();
        Ok(JobOutcome::Cancelled(reason))
    }
}

/// Returns a snoozed incident to `OPEN` once its snooze has expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUnsnoozeJob {
    #[allow(missing_docs)]
    pub incident_id: Uuid,
}

impl BackgroundJob for AutoUnsnoozeJob {
    const JOB_TYPE: JobType = JobType::AutoUnsnooze;

    async fn run<S: Store, D: Dispatcher, C: Clock>(
        &self,
        engine: &Engine<S, D, C>,
    ) -> anyhow::Result<JobOutcome> {
        if engine.auto_unsnooze(self.incident_id).await? {
            Ok(JobOutcome::Completed)
        } else {
            Ok(JobOutcome::cancelled("Incident is not snoozed or its snooze has not expired"))
        }
    }
}

/// Retries the dispatch of a failed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    #[allow(missing_docs)]
    pub notification_id: Uuid,
}

impl BackgroundJob for NotificationJob {
    const JOB_TYPE: JobType = JobType::Notification;

    async fn run<S: Store, D: Dispatcher, C: Clock>(
        &self,
        engine: &Engine<S, D, C>,
    ) -> anyhow::Result<JobOutcome> {
        let store = engine.store();

        let Some(notification) = store.get_notification(self.notification_id).await? else {
            return Ok(JobOutcome::cancelled("Notification not found"));
        };
        if notification.status == NotificationStatus::Sent {
            return Ok(JobOutcome::cancelled("Notification already sent"));
        }

        let Some(incident) = store.get_incident(notification.incident_id).await? else {
            return Ok(JobOutcome::cancelled("Incident not found"));
        };
        if incident.status != IncidentStatus::Open {
            return Ok(JobOutcome::cancelled("Incident is no longer open"));
        }

        let request = notification_request(
            &incident,
            notification.id,
            &notification.user_id,
            notification.channel,
            notification.escalation_step,
        );

        // A failure here fails the job, which retries with backoff.
        engine.deliver(&request, engine.now()).await?;
        Ok(JobOutcome::Completed)
    }
}

/// Raises warnings for incidents about to miss their SLA targets.
///
/// A recurring check schedules its successor one
/// [`EngineConfig::sla_check_interval`](crate::EngineConfig::sla_check_interval)
/// after it ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaBreachCheckJob {
    #[allow(missing_docs)]
    #[serde(default)]
    pub recurring: bool,
}

impl BackgroundJob for SlaBreachCheckJob {
    const JOB_TYPE: JobType = JobType::SlaBreachCheck;

    async fn run<S: Store, D: Dispatcher, C: Clock>(
        &self,
        engine: &Engine<S, D, C>,
    ) -> anyhow::Result<JobOutcome> {
        let report = engine.check_sla_breaches().await?;

        if self.recurring {
            let interval = chrono::Duration::from_std(engine.config().sla_check_interval)?;
            let next_id = self.enqueue_at(engine, report.checked_at + interval).await?;
            debug!(job.id = next_id, "Scheduled next SLA breach check");
        }
        Ok(JobOutcome::Completed)
    }
}

/// Generic application task.
///
/// Only logs its name and data; applications schedule it to leave a trace in
/// the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Task name
    pub task: String,
    /// Free-form task data
    #[serde(default)]
    pub data: Value,
}

impl BackgroundJob for ScheduledTask {
    const JOB_TYPE: JobType = JobType::ScheduledTask;

    async fn run<S: Store, D: Dispatcher, C: Clock>(
        &self,
        _engine: &Engine<S, D, C>,
    ) -> anyhow::Result<JobOutcome> {
        info!(task = %self.task, data = %self.data, "Running scheduled task");
        Ok(JobOutcome::Completed)
    }
}
