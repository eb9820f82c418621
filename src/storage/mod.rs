//! Persistence seam of the engine.
//!
//! Every [`Store`] method is one atomic unit: either all of its writes are
//! visible or none are. The engine builds exactly-once behaviour on top of
//! three primitives every implementation must honour:
//!
//! - [`Store::create_incident`] fails with [`StoreError::Conflict`] while a
//!   non-resolved incident exists for the same service and dedup key,
//! - guarded updates ([`Store::transition_incident`],
//!   [`Store::advance_escalation`]) report whether they applied,
//! - [`Store::claim_pending_jobs`] never hands the same job to two callers,
//!   and only the holder of the latest claim may retire the job.

mod memory;
mod postgres;

pub use self::memory::MemoryStore;
pub use self::postgres::{PgStore, setup_database};

use crate::errors::StoreError;
use crate::schema::{
    Alert, BackgroundJob, Channel, Incident, IncidentEvent, IncidentStatus, JobStats, JobStatus,
    Notification, NotificationStatus, OnCallSchedule, Service, Team, Urgency,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// A job to be inserted into the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    #[allow(missing_docs)]
    pub job_type: crate::schema::JobType,
    #[allow(missing_docs)]
    pub payload: Value,
    /// Claims allowed before the job is marked as failed
    pub max_attempts: i32,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
}

/// An incident about to be opened by event intake.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewIncident {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub dedup_key: String,
    pub urgency: Urgency,
    pub priority: Option<String>,
    pub service_id: String,
    pub team_id: Option<String>,
    /// Due time of step 0 when the service has an escalation policy
    pub first_escalation_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl NewIncident {
    pub(crate) fn into_incident(self) -> Incident {
        let escalation_status = self
            .first_escalation_at
            .map(|_| crate::schema::EscalationStatus::Escalating);

        Incident {
            id: self.id,
            title: self.title,
            description: self.description,
            dedup_key: self.dedup_key,
            status: IncidentStatus::Open,
            urgency: self.urgency,
            priority: self.priority,
            service_id: self.service_id,
            assignee_id: None,
            team_id: self.team_id,
            escalation_status,
            current_escalation_step: 0,
            escalation_claimed_step: -1,
            next_escalation_at: self.first_escalation_at,
            acknowledged_at: None,
            resolved_at: None,
            snoozed_until: None,
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

/// A raw alert to be attached to an incident.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewAlert {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub dedup_key: String,
    pub service_id: String,
    pub integration_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl NewAlert {
    pub(crate) fn into_alert(self) -> Alert {
        Alert {
            id: self.id,
            incident_id: self.incident_id,
            dedup_key: self.dedup_key,
            service_id: self.service_id,
            integration_id: self.integration_id,
            payload: self.payload,
            created_at: self.created_at,
        }
    }
}

/// A guarded status change of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Any non-acknowledged, non-resolved status to `ACKNOWLEDGED`.
    Acknowledge,
    /// Any non-resolved status to `RESOLVED`.
    Resolve,
    /// `OPEN` or `ACKNOWLEDGED` to `SNOOZED` until the given instant.
    Snooze {
        #[allow(missing_docs)]
        until: DateTime<Utc>,
    },
    /// `SNOOZED` back to `OPEN`, once the snooze deadline has passed.
    Unsnooze,
    /// Any non-resolved, non-suppressed status to `SUPPRESSED`.
    Suppress,
}

impl Transition {
    /// Whether the guard of this transition holds for `incident` at `now`.
    pub fn allows(&self, incident: &Incident, now: DateTime<Utc>) -> bool {
        use IncidentStatus::*;

        match self {
            Self::Acknowledge => !matches!(incident.status, Acknowledged | Resolved),
            Self::Resolve => incident.status != Resolved,
            Self::Snooze { .. } => matches!(incident.status, Open | Acknowledged),
            Self::Unsnooze => {
                incident.status == Snoozed && incident.snoozed_until.is_none_or(|until| until <= now)
            }
            Self::Suppress => !matches!(incident.status, Resolved | Suppressed),
        }
    }

    /// Apply the transition to an in-memory incident if its guard holds.
    pub(crate) fn apply(&self, incident: &mut Incident, now: DateTime<Utc>) -> bool {
        if !self.allows(incident, now) {
            return false;
        }

        match self {
            Self::Acknowledge => {
                incident.status = IncidentStatus::Acknowledged;
                incident.acknowledged_at = Some(now);
            }
            Self::Resolve => {
                incident.status = IncidentStatus::Resolved;
                incident.resolved_at = Some(now);
                incident.snoozed_until = None;
            }
            Self::Snooze { until } => {
                incident.status = IncidentStatus::Snoozed;
                incident.snoozed_until = Some(*until);
            }
            Self::Unsnooze => {
                incident.status = IncidentStatus::Open;
                incident.snoozed_until = None;
            }
            Self::Suppress => {
                incident.status = IncidentStatus::Suppressed;
            }
        }
        incident.updated_at = now;
        true
    }
}

/// How an executed escalation step moves the state machine forward.
#[derive(Debug, Clone)]
pub enum EscalationAdvance {
    /// Another step follows.
    Next {
        /// Index of the following step
        step: i32,
        /// When it is due
        due_at: DateTime<Utc>,
        /// The job that will run it
        job: NewJob,
    },
    /// The executed step was the last one.
    Completed,
}

/// Everything one execution of an escalation step commits at once.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// Step the executor was asked to run. The commit only applies while no
    /// execution of this or a later step has been committed.
    pub requested_step: i32,
    /// Step that actually notified, after skipping steps without recipients
    pub executed_step: i32,
    /// New assignee when the step had a single recipient
    pub assignee_id: Option<String>,
    #[allow(missing_docs)]
    pub advance: EscalationAdvance,
    /// Notification records, written as `PENDING`
    pub notifications: Vec<NewNotification>,
    /// Timeline messages, oldest first
    pub messages: Vec<String>,
}

/// A notification record about to be written, before dispatch.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct NewNotification {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub user_id: String,
    pub channel: Channel,
    pub escalation_step: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl NewNotification {
    pub(crate) fn into_notification(self) -> Notification {
        Notification {
            id: self.id,
            incident_id: self.incident_id,
            user_id: self.user_id,
            channel: self.channel,
            status: NotificationStatus::Pending,
            error: None,
            escalation_step: self.escalation_step,
            sent_at: None,
            created_at: self.created_at,
        }
    }
}

/// Durable state behind the engine.
///
/// Implemented by [`PgStore`] for production and [`MemoryStore`] for tests and
/// embedding. Configuration reads (`service`, `team`, `schedule`,
/// `user_channels`) return data written by the surrounding application.
pub trait Store: Send + Sync + 'static {
    /// Load a service with its escalation policy.
    fn service(
        &self,
        service_id: &str,
    ) -> impl Future<Output = Result<Option<Service>, StoreError>> + Send;

    /// Load a team with its members.
    fn team(&self, team_id: &str) -> impl Future<Output = Result<Option<Team>, StoreError>> + Send;

    /// Load an on-call schedule with its layers and overrides.
    fn schedule(
        &self,
        schedule_id: &str,
    ) -> impl Future<Output = Result<Option<OnCallSchedule>, StoreError>> + Send;

    /// Channels a user has enabled, in preference order.
    fn user_channels(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Channel>, StoreError>> + Send;

    #[allow(missing_docs)]
    fn get_incident(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Incident>, StoreError>> + Send;

    /// The non-resolved incident for a service and dedup key, if any.
    fn find_open_incident(
        &self,
        service_id: &str,
        dedup_key: &str,
    ) -> impl Future<Output = Result<Option<Incident>, StoreError>> + Send;

    /// The most recently created incident for a service and dedup key, in any status.
    fn find_latest_incident(
        &self,
        service_id: &str,
        dedup_key: &str,
    ) -> impl Future<Output = Result<Option<Incident>, StoreError>> + Send;

    /// Open an incident together with its first alert, a timeline event and
    /// any jobs.
    ///
    /// Fails with [`StoreError::Conflict`] if a non-resolved incident already
    /// exists for the same service and dedup key.
    fn create_incident(
        &self,
        incident: NewIncident,
        alert: NewAlert,
        message: &str,
        jobs: &[NewJob],
    ) -> impl Future<Output = Result<Incident, StoreError>> + Send;

    /// Attach a duplicate alert and a timeline event to an existing incident.
    ///
    /// Fails with [`StoreError::Conflict`] if the incident was resolved in the
    /// meantime.
    fn append_alert(
        &self,
        alert: NewAlert,
        message: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Apply a guarded transition, writing `message` to the timeline and
    /// inserting `job` only if the guard held.
    ///
    /// Returns the updated incident, or `None` if the guard failed.
    fn transition_incident(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
        message: &str,
        job: Option<&NewJob>,
    ) -> impl Future<Output = Result<Option<Incident>, StoreError>> + Send;

    /// Append a timeline event.
    fn record_event(
        &self,
        incident_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Timeline of an incident, oldest first.
    fn incident_events(
        &self,
        incident_id: Uuid,
    ) -> impl Future<Output = Result<Vec<IncidentEvent>, StoreError>> + Send;

    /// Alerts of an incident, oldest first.
    fn alerts_for_incident(
        &self,
        incident_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Alert>, StoreError>> + Send;

    /// Commit an executed escalation step: mark it as executed, record its
    /// notifications and timeline messages, and move the state machine
    /// forward, scheduling the next step's job if there is one.
    ///
    /// Applies only while the incident is `OPEN`, still escalating and no
    /// execution of `requested_step` or a later step has been committed.
    /// Returns `false` without writing anything otherwise.
    fn advance_escalation(
        &self,
        incident_id: Uuid,
        execution: StepExecution,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Incidents that are `OPEN` or `ACKNOWLEDGED`, oldest first.
    fn active_incidents(&self) -> impl Future<Output = Result<Vec<Incident>, StoreError>> + Send;

    #[allow(missing_docs)]
    fn get_notification(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Notification>, StoreError>> + Send;

    /// Notifications of an incident, oldest first.
    fn notifications_for_incident(
        &self,
        incident_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Notification>, StoreError>> + Send;

    /// Record the outcome of a dispatch attempt.
    fn update_notification(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Insert a `PENDING` job and return its id.
    fn insert_job(
        &self,
        job: &NewJob,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    #[allow(missing_docs)]
    fn get_job(
        &self,
        id: i64,
    ) -> impl Future<Output = Result<Option<BackgroundJob>, StoreError>> + Send;

    /// Move up to `limit` due `PENDING` jobs to `PROCESSING`, incrementing
    /// their attempt counters.
    fn claim_pending_jobs(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<BackgroundJob>, StoreError>> + Send;

    /// Renew the claim `attempt` on a `PROCESSING` job so it is not
    /// considered stale. Returns `false` if the claim is no longer held.
    fn touch_job(
        &self,
        id: i64,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Retire a job held under claim `attempt` as `COMPLETED`.
    ///
    /// Returns `false` if the job is not `PROCESSING` under that claim.
    fn complete_job(
        &self,
        id: i64,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Retire a job held under claim `attempt` as `CANCELLED`.
    ///
    /// Returns `false` if the job is not `PROCESSING` under that claim.
    fn cancel_job(
        &self,
        id: i64,
        attempt: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Record a failed attempt of a job held under claim `attempt`: `FAILED`
    /// once attempts are exhausted, otherwise back to `PENDING` at
    /// `now + backoff_base * 2^attempts`.
    ///
    /// Returns the resulting status, or `None` if the claim is no longer held.
    fn fail_job(
        &self,
        id: i64,
        attempt: i32,
        error: &str,
        now: DateTime<Utc>,
        backoff_base: Duration,
    ) -> impl Future<Output = Result<Option<JobStatus>, StoreError>> + Send;

    /// Return `PROCESSING` jobs not updated since `stale_before` to `PENDING`
    /// (or `FAILED` when exhausted). Returns the number of jobs touched.
    fn requeue_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Job counts per status.
    fn job_stats(&self) -> impl Future<Output = Result<JobStats, StoreError>> + Send;
}
