use super::{
    EscalationAdvance, NewAlert, NewIncident, NewJob, NewNotification, StepExecution, Store,
    Transition,
};
use crate::errors::StoreError;
use crate::queue::backoff_delay;
use crate::schema::{
    Alert, BackgroundJob, Channel, EscalationPolicy, EscalationStatus, Incident, IncidentEvent,
    IncidentStatus, JobStats, JobStatus, Notification, NotificationStatus, OnCallSchedule,
    Service, SlaTargets, Team,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    services: HashMap<String, Service>,
    teams: HashMap<String, Team>,
    schedules: HashMap<String, OnCallSchedule>,
    user_channels: HashMap<String, Vec<Channel>>,

    incidents: HashMap<Uuid, Incident>,
    alerts: Vec<Alert>,
    events: Vec<IncidentEvent>,
    notifications: Vec<Notification>,
    jobs: BTreeMap<i64, BackgroundJob>,
    next_event_id: i64,
    next_job_id: i64,
}

impl State {
    fn push_event(&mut self, incident_id: Uuid, message: &str, now: DateTime<Utc>) {
        self.next_event_id += 1;
        self.events.push(IncidentEvent {
            id: self.next_event_id,
            incident_id,
            message: message.to_string(),
            created_at: now,
        });
    }

    fn push_job(&mut self, job: &NewJob, now: DateTime<Utc>) -> i64 {
        self.next_job_id += 1;
        let id = self.next_job_id;
        self.jobs.insert(
            id,
            BackgroundJob {
                id,
                job_type: job.job_type,
                payload: job.payload.clone(),
                status: JobStatus::Pending,
                attempts: 0,
                max_attempts: job.max_attempts,
                scheduled_at: job.scheduled_at,
                error: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// A `PROCESSING` job, if claim `attempt` is the latest one.
    fn claimed_job(&mut self, id: i64, attempt: i32) -> Option<&mut BackgroundJob> {
        self.jobs
            .get_mut(&id)
            .filter(|job| job.status == JobStatus::Processing && job.attempts == attempt)
    }
}

/// A [`Store`] kept in process memory.
///
/// Each method holds a single lock for its whole duration, which gives every
/// operation the atomicity the engine relies on. The seeding methods stand in
/// for the configuration CRUD of the surrounding application.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, optionally with an escalation policy.
    pub async fn insert_service(
        &self,
        service_id: impl Into<String>,
        team_id: Option<String>,
        escalation_policy: Option<EscalationPolicy>,
    ) {
        let id = service_id.into();
        let service = Service {
            id: id.clone(),
            team_id,
            escalation_policy,
            sla: SlaTargets::default(),
        };
        self.state.lock().await.services.insert(id, service);
    }

    /// Replace the SLA targets of a registered service.
    pub async fn set_sla_targets(&self, service_id: &str, sla: SlaTargets) {
        if let Some(service) = self.state.lock().await.services.get_mut(service_id) {
            service.sla = sla;
        }
    }

    /// Register a team.
    pub async fn insert_team(&self, team: Team) {
        self.state.lock().await.teams.insert(team.id.clone(), team);
    }

    /// Register an on-call schedule.
    pub async fn insert_schedule(&self, schedule: OnCallSchedule) {
        let mut state = self.state.lock().await;
        state.schedules.insert(schedule.id.clone(), schedule);
    }

    /// Set the channels a user receives notifications on.
    pub async fn set_user_channels(&self, user_id: impl Into<String>, channels: Vec<Channel>) {
        let mut state = self.state.lock().await;
        state.user_channels.insert(user_id.into(), channels);
    }

    /// All incidents, oldest first.
    pub async fn incidents(&self) -> Vec<Incident> {
        let state = self.state.lock().await;
        let mut incidents = state.incidents.values().cloned().collect::<Vec<_>>();
        incidents.sort_by_key(|incident| incident.created_at);
        incidents
    }

    /// All jobs, by id.
    pub async fn jobs(&self) -> Vec<BackgroundJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    /// Overwrite the due time of a job.
    pub async fn reschedule_job(&self, id: i64, scheduled_at: DateTime<Utc>) {
        if let Some(job) = self.state.lock().await.jobs.get_mut(&id) {
            job.scheduled_at = scheduled_at;
        }
    }
}

impl Store for MemoryStore {
    async fn service(&self, service_id: &str) -> Result<Option<Service>, StoreError> {
        Ok(self.state.lock().await.services.get(service_id).cloned())
    }

    async fn team(&self, team_id: &str) -> Result<Option<Team>, StoreError> {
        Ok(self.state.lock().await.teams.get(team_id).cloned())
    }

    async fn schedule(&self, schedule_id: &str) -> Result<Option<OnCallSchedule>, StoreError> {
        Ok(self.state.lock().await.schedules.get(schedule_id).cloned())
    }

    async fn user_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.user_channels.get(user_id).cloned().unwrap_or_default())
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        Ok(self.state.lock().await.incidents.get(&id).cloned())
    }

    async fn find_open_incident(
        &self,
        service_id: &str,
        dedup_key: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let state = self.state.lock().await;
        let incident = state.incidents.values().find(|incident| {
            incident.service_id == service_id
                && incident.dedup_key == dedup_key
                && !incident.status.is_terminal()
        });
        Ok(incident.cloned())
    }

    async fn find_latest_incident(
        &self,
        service_id: &str,
        dedup_key: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let state = self.state.lock().await;
        let incident = state
            .incidents
            .values()
            .filter(|incident| incident.service_id == service_id && incident.dedup_key == dedup_key)
            .max_by_key(|incident| (incident.created_at, !incident.status.is_terminal()));
        Ok(incident.cloned())
    }

    async fn create_incident(
        &self,
        incident: NewIncident,
        alert: NewAlert,
        message: &str,
        jobs: &[NewJob],
    ) -> Result<Incident, StoreError> {
        let mut state = self.state.lock().await;

        let duplicate = state.incidents.values().any(|existing| {
            existing.service_id == incident.service_id
                && existing.dedup_key == incident.dedup_key
                && !existing.status.is_terminal()
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "open incident already exists for dedup key {:?}",
                incident.dedup_key
            )));
        }

        let now = incident.created_at;
        let incident = incident.into_incident();
        state.incidents.insert(incident.id, incident.clone());
        state.alerts.push(alert.into_alert());
        state.push_event(incident.id, message, now);
        for job in jobs {
            state.push_job(job, now);
        }

        Ok(incident)
    }

    async fn append_alert(&self, alert: NewAlert, message: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;

        let open = state
            .incidents
            .get(&alert.incident_id)
            .is_some_and(|incident| !incident.status.is_terminal());
        if !open {
            return Err(StoreError::Conflict(format!(
                "incident {} is no longer open",
                alert.incident_id
            )));
        }

        let (incident_id, now) = (alert.incident_id, alert.created_at);
        state.alerts.push(alert.into_alert());
        state.push_event(incident_id, message, now);
        Ok(())
    }

    async fn transition_incident(
        &self,
        id: Uuid,
        transition: Transition,
        now: DateTime<Utc>,
        message: &str,
        job: Option<&NewJob>,
    ) -> Result<Option<Incident>, StoreError> {
        let mut state = self.state.lock().await;

        let Some(incident) = state.incidents.get_mut(&id) else {
            return Ok(None);
        };
        if !transition.apply(incident, now) {
            return Ok(None);
        }
        let incident = incident.clone();

        state.push_event(id, message, now);
        if let Some(job) = job {
            state.push_job(job, now);
        }
        Ok(Some(incident))
    }

    async fn record_event(
        &self,
        incident_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.state.lock().await.push_event(incident_id, message, now);
        Ok(())
    }

    async fn incident_events(&self, incident_id: Uuid) -> Result<Vec<IncidentEvent>, StoreError> {
        let state = self.state.lock().await;
        let events = state.events.iter().filter(|event| event.incident_id == incident_id);
        Ok(events.cloned().collect())
    }

    async fn alerts_for_incident(&self, incident_id: Uuid) -> Result<Vec<Alert>, StoreError> {
        let state = self.state.lock().await;
        let alerts = state.alerts.iter().filter(|alert| alert.incident_id == incident_id);
        Ok(alerts.cloned().collect())
    }

    async fn advance_escalation(
        &self,
        incident_id: Uuid,
        execution: StepExecution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;

        let Some(incident) = state.incidents.get_mut(&incident_id) else {
            return Ok(false);
        };
        if !incident.is_escalation_eligible()
            || incident.escalation_claimed_step >= execution.requested_step
        {
            return Ok(false);
        }

        incident.escalation_claimed_step = execution.executed_step;
        if let Some(assignee_id) = execution.assignee_id {
            incident.assignee_id = Some(assignee_id);
        }
        incident.updated_at = now;
        let next_job = match execution.advance {
            EscalationAdvance::Next { step, due_at, job } => {
                incident.current_escalation_step = step;
                incident.next_escalation_at = Some(due_at);
                Some(job)
            }
            EscalationAdvance::Completed => {
                incident.escalation_status = Some(EscalationStatus::Completed);
                incident.next_escalation_at = None;
                None
            }
        };

        state.notifications.extend(
            execution
                .notifications
                .into_iter()
                .map(NewNotification::into_notification),
        );
        for message in &execution.messages {
            state.push_event(incident_id, message, now);
        }
        if let Some(job) = next_job {
            state.push_job(&job, now);
        }
        Ok(true)
    }

    async fn active_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        let state = self.state.lock().await;
        let mut incidents = state
            .incidents
            .values()
            .filter(|incident| {
                matches!(incident.status, IncidentStatus::Open | IncidentStatus::Acknowledged)
            })
            .cloned()
            .collect::<Vec<_>>();
        incidents.sort_by_key(|incident| (incident.created_at, incident.id));
        Ok(incidents)
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.notifications.iter().find(|n| n.id == id).cloned())
    }

    async fn notifications_for_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock().await;
        let notifications = state.notifications.iter().filter(|n| n.incident_id == incident_id);
        Ok(notifications.cloned().collect())
    }

    async fn update_notification(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(notification) = state.notifications.iter_mut().find(|n| n.id == id) {
            notification.status = status;
            notification.error = error.map(str::to_string);
            notification.sent_at = sent_at;
        }
        Ok(())
    }

    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.push_job(job, now))
    }

    async fn get_job(&self, id: i64) -> Result<Option<BackgroundJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn claim_pending_jobs(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BackgroundJob>, StoreError> {
        let mut state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);

        let mut due = state
            .jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Pending && job.scheduled_at <= now)
            .collect::<Vec<_>>();
        due.sort_by_key(|job| (job.scheduled_at, job.id));

        let claimed = due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Processing;
                job.attempts += 1;
                job.updated_at = now;
                job.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn touch_job(&self, id: i64, attempt: i32, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.claimed_job(id, attempt) else {
            return Ok(false);
        };
        job.updated_at = now;
        Ok(true)
    }

    async fn complete_job(
        &self,
        id: i64,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.claimed_job(id, attempt) else {
            return Ok(false);
        };
        job.status = JobStatus::Completed;
        job.updated_at = now;
        Ok(true)
    }

    async fn cancel_job(
        &self,
        id: i64,
        attempt: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.claimed_job(id, attempt) else {
            return Ok(false);
        };
        job.status = JobStatus::Cancelled;
        job.error = Some(reason.to_string());
        job.updated_at = now;
        Ok(true)
    }

    async fn fail_job(
        &self,
        id: i64,
        attempt: i32,
        error: &str,
        now: DateTime<Utc>,
        backoff_base: Duration,
    ) -> Result<Option<JobStatus>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.claimed_job(id, attempt) else {
            return Ok(None);
        };

        if job.attempts >= job.max_attempts {
            job.status = JobStatus::Failed;
        } else {
            job.status = JobStatus::Pending;
            job.scheduled_at = now + backoff_delay(backoff_base, job.attempts);
        }
        job.error = Some(error.to_string());
        job.updated_at = now;
        Ok(Some(job.status))
    }

    async fn requeue_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut touched = 0;

        let stale = state
            .jobs
            .values_mut()
            .filter(|job| job.status == JobStatus::Processing && job.updated_at < stale_before);
        for job in stale {
            job.status = if job.attempts >= job.max_attempts {
                JobStatus::Failed
            } else {
                JobStatus::Pending
            };
            job.error = Some("worker stopped responding".to_string());
            job.updated_at = now;
            touched += 1;
        }
        Ok(touched)
    }

    async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = JobStats::default();
        for job in state.jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}
