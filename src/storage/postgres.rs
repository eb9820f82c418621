use super::{
    EscalationAdvance, NewAlert, NewIncident, NewJob, NewNotification, StepExecution, Store,
    Transition,
};
use crate::errors::StoreError;
use crate::schema::{
    Alert, BackgroundJob, Channel, EscalationPolicy, EscalationStatus, EscalationStepRow,
    Incident, IncidentEvent, JobStats, JobStatus, Notification, NotificationStatus,
    OnCallSchedule, ScheduleLayer, ScheduleOverride, Service, SlaTargets, Team,
};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Apply the crate's migrations to `pool`.
pub async fn setup_database(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// A [`Store`] backed by PostgreSQL.
///
/// Incident creation runs at `SERIALIZABLE` isolation and relies on the
/// partial unique index over open `(service_id, dedup_key)` pairs; job claims
/// use `FOR UPDATE SKIP LOCKED`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap a connection pool. Run [`setup_database`] first.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_event<'e>(
    executor: impl PgExecutor<'e>,
    incident_id: Uuid,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO incident_events (incident_id, message, created_at) VALUES ($1, $2, $3)")
        .bind(incident_id)
        .bind(message)
        .bind(now)
        .execute(executor)
        .await?;
    Ok(())
}

async fn insert_alert<'e>(executor: impl PgExecutor<'e>, alert: &NewAlert) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO alerts (id, incident_id, dedup_key, service_id, integration_id, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ",
    )
    .bind(alert.id)
    .bind(alert.incident_id)
    .bind(&alert.dedup_key)
    .bind(&alert.service_id)
    .bind(&alert.integration_id)
    .bind(&alert.payload)
    .bind(alert.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_job<'e>(
    executor: impl PgExecutor<'e>,
    job: &NewJob,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO background_jobs (job_type, payload, max_attempts, scheduled_at, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $5)
        RETURNING id
        ",
    )
    .bind(job.job_type)
    .bind(&job.payload)
    .bind(job.max_attempts)
    .bind(job.scheduled_at)
    .bind(now)
    .fetch_one(executor)
    .await
}

async fn insert_notification<'e>(
    executor: impl PgExecutor<'e>,
    notification: &NewNotification,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO notifications (id, incident_id, user_id, channel, escalation_step, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ",
    )
    .bind(notification.id)
    .bind(notification.incident_id)
    .bind(&notification.user_id)
    .bind(notification.channel)
    .bind(notification.escalation_step)
    .bind(notification.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: String,
    team_id: Option<String>,
    escalation_policy_id: Option<String>,
    target_ack_minutes: Option<i32>,
    target_resolve_minutes: Option<i32>,
    notify_on_sla_breach: bool,
}

impl ServiceRow {
    fn sla_targets(&self) -> SlaTargets {
        SlaTargets {
            ack_minutes: self
                .target_ack_minutes
                .unwrap_or(SlaTargets::DEFAULT_ACK_MINUTES),
            resolve_minutes: self
                .target_resolve_minutes
                .unwrap_or(SlaTargets::DEFAULT_RESOLVE_MINUTES),
            notify_on_breach: self.notify_on_sla_breach,
        }
    }
}

impl Store for PgStore {
    async fn service(&self, service_id: &str) -> Result<Option<Service>, StoreError> {
        let row = sqlx::query_as::<_, ServiceRow>(
            r"
            SELECT id, team_id, escalation_policy_id, target_ack_minutes, target_resolve_minutes,
                   notify_on_sla_breach
            FROM services
            WHERE id = $1
            ",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let sla = row.sla_targets();
        let ServiceRow {
            id,
            team_id,
            escalation_policy_id: policy_id,
            ..
        } = row;

        let escalation_policy = match policy_id {
            Some(policy_id) => {
                let steps = sqlx::query_as::<_, EscalationStepRow>(
                    r"
                    SELECT step_order, delay_minutes, target_type, target_id, notify_only_team_lead, channels
                    FROM escalation_steps
                    WHERE policy_id = $1
                    ORDER BY step_order ASC
                    ",
                )
                .bind(&policy_id)
                .fetch_all(&self.pool)
                .await?;

                let steps = steps.into_iter().map(Into::into).collect();
                Some(EscalationPolicy::new(policy_id, steps))
            }
            None => None,
        };

        Ok(Some(Service {
            id,
            team_id,
            escalation_policy,
            sla,
        }))
    }

    async fn team(&self, team_id: &str) -> Result<Option<Team>, StoreError> {
        let row = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT id, lead_id FROM teams WHERE id = $1",
        )
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, lead_id)) = row else {
            return Ok(None);
        };

        let member_ids = sqlx::query_scalar::<_, String>(
            "SELECT user_id FROM team_members WHERE team_id = $1 ORDER BY position ASC, user_id ASC",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Team {
            id,
            lead_id,
            member_ids,
        }))
    }

    async fn schedule(&self, schedule_id: &str) -> Result<Option<OnCallSchedule>, StoreError> {
        let id = sqlx::query_scalar::<_, String>("SELECT id FROM on_call_schedules WHERE id = $1")
            .bind(schedule_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(id) = id else {
            return Ok(None);
        };

        let layers = sqlx::query_as::<_, ScheduleLayer>(
            r"
            SELECT id, name, start_at, end_at, rotation_length_hours, user_ids
            FROM schedule_layers
            WHERE schedule_id = $1
            ORDER BY position ASC, id ASC
            ",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let overrides = sqlx::query_as::<_, ScheduleOverride>(
            r"
            SELECT id, user_id, replaces_user_id, start_at, end_at
            FROM schedule_overrides
            WHERE schedule_id = $1
            ORDER BY start_at ASC, id ASC
            ",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(OnCallSchedule {
            id,
            layers,
            overrides,
        }))
    }

    async fn user_channels(&self, user_id: &str) -> Result<Vec<Channel>, StoreError> {
        let channels = sqlx::query_scalar::<_, Vec<Channel>>(
            "SELECT notification_channels FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(channels.unwrap_or_default())
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        let incident = sqlx::query_as::<_, Incident>("SELECT * FROM incidents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(incident)
    }

    async fn find_open_incident(
        &self,
        service_id: &str,
        dedup_key: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let incident = sqlx::query_as::<_, Incident>(
            r"
            SELECT * FROM incidents
            WHERE service_id = $1 AND dedup_key = $2 AND status <> 'RESOLVED'
            ",
        )
        .bind(service_id)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(incident)
    }

    async fn find_latest_incident(
        &self,
        service_id: &str,
        dedup_key: &str,
    ) -> Result<Option<Incident>, StoreError> {
        let incident = sqlx::query_as::<_, Incident>(
            r"
            SELECT * FROM incidents
            WHERE service_id = $1 AND dedup_key = $2
            ORDER BY created_at DESC, (status <> 'RESOLVED') DESC
            LIMIT 1
            ",
        )
        .bind(service_id)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(incident)
    }

    async fn create_incident(
        &self,
        incident: NewIncident,
        alert: NewAlert,
        message: &str,
        jobs: &[NewJob],
    ) -> Result<Incident, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let escalation_status = incident
            .first_escalation_at
            .map(|_| EscalationStatus::Escalating);

        // The partial unique index turns a concurrent duplicate into a
        // unique violation, surfaced as `StoreError::Conflict`.
        let created = sqlx::query_as::<_, Incident>(
            r"
            INSERT INTO incidents (
                id, title, description, dedup_key, status, urgency, priority, service_id, team_id,
                escalation_status, next_escalation_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'OPEN', $5, $6, $7, $8, $9, $10, $11, $11)
            RETURNING *
            ",
        )
        .bind(incident.id)
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(&incident.dedup_key)
        .bind(incident.urgency)
        .bind(&incident.priority)
        .bind(&incident.service_id)
        .bind(&incident.team_id)
        .bind(escalation_status)
        .bind(incident.first_escalation_at)
        .bind(incident.created_at)
        .fetch_one(&mut *tx)
        .await?;

        insert_alert(&mut *tx, &alert).await?;
        insert_event(&mut *tx, created.id, message, incident.created_at).await?;
        for job in jobs {
            insert_job(&mut *tx, job, incident.created_at).await?;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn append_alert(&self, alert: NewAlert, message: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Holding a share lock keeps a concurrent resolve from slipping in
        // between the check and the insert.
        let open = sqlx::query_scalar::<_, bool>(
            "SELECT status <> 'RESOLVED' FROM incidents WHERE id = $1 FOR SHARE",
        )
        .bind(alert.incident_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(false);

        if !open {
            tx.rollback().await?;
            return Err(StoreError::Conflict(format!(
                "incident {} is no longer open",
                alert.incident_id
            )));
        }

        insert_alert(&mut *tx, &alert).await?;
        insert_event(&mut *tx, alert.incident_id, message, alert.created_at).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let query = match transition {
            Transition::Acknowledge => sqlx::query_as::<_, Incident>(
                r"
                UPDATE incidents
                SET status = 'ACKNOWLEDGED', acknowledged_at = $2, updated_at = $2
                WHERE id = $1 AND status NOT IN ('ACKNOWLEDGED', 'RESOLVED')
                RETURNING *
                ",
            ),
            Transition::Resolve => sqlx::query_as::<_, Incident>(
                r"
                UPDATE incidents
                SET status = 'RESOLVED', resolved_at = $2, snoozed_until = NULL, updated_at = $2
                WHERE id = $1 AND status <> 'RESOLVED'
                RETURNING *
                ",
            ),
            Transition::Snooze { .. } => sqlx::query_as::<_, Incident>(
                r"
                UPDATE incidents
                SET status = 'SNOOZED', snoozed_until = $3, updated_at = $2
                WHERE id = $1 AND status IN ('OPEN', 'ACKNOWLEDGED')
                RETURNING *
                ",
            ),
            Transition::Unsnooze => sqlx::query_as::<_, Incident>(
                r"
                UPDATE incidents
                SET status = 'OPEN', snoozed_until = NULL, updated_at = $2
                WHERE id = $1
                  AND status = 'SNOOZED'
                  AND (snoozed_until IS NULL OR snoozed_until <= $2)
                RETURNING *
                ",
            ),
            Transition::Suppress => sqlx::query_as::<_, Incident>(
                r"
                UPDATE incidents
                SET status = 'SUPPRESSED', updated_at = $2
                WHERE id = $1 AND status NOT IN ('RESOLVED', 'SUPPRESSED')
                RETURNING *
                ",
            ),
        };

        let mut query = query.bind(id).bind(now);
        if let Transition::Snooze { until } = transition {
            query = query.bind(until);
        }

        let Some(incident) = query.fetch_optional(&mut *tx).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        insert_event(&mut *tx, id, message, now).await?;
        if let Some(job) = job {
            insert_job(&mut *tx, job, now).await?;
        }

        tx.commit().await?;
        Ok(Some(incident))
    }

    async fn record_event(
        &self,
        incident_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        insert_event(&self.pool, incident_id, message, now).await?;
        Ok(())
    }

    async fn incident_events(&self, incident_id: Uuid) -> Result<Vec<IncidentEvent>, StoreError> {
        let events = sqlx::query_as::<_, IncidentEvent>(
            "SELECT * FROM incident_events WHERE incident_id = $1 ORDER BY id ASC",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn alerts_for_incident(&self, incident_id: Uuid) -> Result<Vec<Alert>, StoreError> {
        let alerts = sqlx::query_as::<_, Alert>(
            "SELECT * FROM alerts WHERE incident_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }

    async fn advance_escalation(
        &self,
        incident_id: Uuid,
        execution: StepExecution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let (next_step, next_at, status, job) = match &execution.advance {
            EscalationAdvance::Next { step, due_at, job } => {
                (Some(*step), Some(*due_at), EscalationStatus::Escalating, Some(job))
            }
            EscalationAdvance::Completed => (None, None, EscalationStatus::Completed, None),
        };

        let mut tx = self.pool.begin().await?;

        // A concurrent commit of the same step holds the row lock; once it
        // commits, the re-evaluated guard no longer matches.
        let result = sqlx::query(
            r"
            UPDATE incidents
            SET escalation_claimed_step = $3,
                assignee_id = COALESCE($4, assignee_id),
                current_escalation_step = COALESCE($5, current_escalation_step),
                next_escalation_at = $6,
                escalation_status = $7,
                updated_at = $8
            WHERE id = $1
              AND escalation_claimed_step < $2
              AND status = 'OPEN'
              AND escalation_status = 'ESCALATING'
            ",
        )
        .bind(incident_id)
        .bind(execution.requested_step)
        .bind(execution.executed_step)
        .bind(execution.assignee_id.as_deref())
        .bind(next_step)
        .bind(next_at)
        .bind(status)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            debug!(incident.id = %incident_id, "Step already executed or incident stopped escalating");
            tx.rollback().await?;
            return Ok(false);
        }

        for notification in &execution.notifications {
            insert_notification(&mut *tx, notification).await?;
        }
        for message in &execution.messages {
            insert_event(&mut *tx, incident_id, message, now).await?;
        }
        if let Some(job) = job {
            insert_job(&mut *tx, job, now).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn active_incidents(&self) -> Result<Vec<Incident>, StoreError> {
        let incidents = sqlx::query_as::<_, Incident>(
            r"
            SELECT * FROM incidents
            WHERE status IN ('OPEN', 'ACKNOWLEDGED')
            ORDER BY created_at ASC, id ASC
            ",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(incidents)
    }

    async fn get_notification(&self, id: Uuid) -> Result<Option<Notification>, StoreError> {
        let notification =
            sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(notification)
    }

    async fn notifications_for_incident(
        &self,
        incident_id: Uuid,
    ) -> Result<Vec<Notification>, StoreError> {
        let notifications = sqlx::query_as::<_, Notification>(
            "SELECT * FROM notifications WHERE incident_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(notifications)
    }

    async fn update_notification(
        &self,
        id: Uuid,
        status: NotificationStatus,
        error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE notifications SET status = $2, error = $3, sent_at = $4 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(error)
            .bind(sent_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(insert_job(&self.pool, job, now).await?)
    }

    async fn get_job(&self, id: i64) -> Result<Option<BackgroundJob>, StoreError> {
        let job = sqlx::query_as::<_, BackgroundJob>("SELECT * FROM background_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim_pending_jobs(
        &self,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BackgroundJob>, StoreError> {
        let mut jobs = sqlx::query_as::<_, BackgroundJob>(
            r"
            UPDATE background_jobs
            SET status = 'PROCESSING', attempts = attempts + 1, updated_at = $2
            WHERE id IN (
                SELECT id
                FROM background_jobs
                WHERE status = 'PENDING' AND scheduled_at <= $2
                ORDER BY scheduled_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            RETURNING *
            ",
        )
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        jobs.sort_by_key(|job| (job.scheduled_at, job.id));
        Ok(jobs)
    }

    async fn touch_job(&self, id: i64, attempt: i32, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE background_jobs
            SET updated_at = $3
            WHERE id = $1 AND attempts = $2 AND status = 'PROCESSING'
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_job(
        &self,
        id: i64,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE background_jobs
            SET status = 'COMPLETED', updated_at = $3
            WHERE id = $1 AND attempts = $2 AND status = 'PROCESSING'
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_job(
        &self,
        id: i64,
        attempt: i32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE background_jobs
            SET status = 'CANCELLED', error = $3, updated_at = $4
            WHERE id = $1 AND attempts = $2 AND status = 'PROCESSING'
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn fail_job(
        &self,
        id: i64,
        attempt: i32,
        error: &str,
        now: DateTime<Utc>,
        backoff_base: Duration,
    ) -> Result<Option<JobStatus>, StoreError> {
        let status = sqlx::query_scalar::<_, JobStatus>(
            r"
            UPDATE background_jobs
            SET status = CASE
                    WHEN attempts >= max_attempts THEN 'FAILED'::job_status
                    ELSE 'PENDING'::job_status
                END,
                scheduled_at = CASE
                    WHEN attempts >= max_attempts THEN scheduled_at
                    ELSE $4 + ($5 * POWER(2, attempts)) * INTERVAL '1 millisecond'
                END,
                error = $3,
                updated_at = $4
            WHERE id = $1 AND attempts = $2 AND status = 'PROCESSING'
            RETURNING status
            ",
        )
        .bind(id)
        .bind(attempt)
        .bind(error)
        .bind(now)
        .bind(backoff_base.as_secs_f64() * 1000.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(status)
    }

    async fn requeue_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE background_jobs
            SET status = CASE
                    WHEN attempts >= max_attempts THEN 'FAILED'::job_status
                    ELSE 'PENDING'::job_status
                END,
                error = 'worker stopped responding',
                updated_at = $2
            WHERE status = 'PROCESSING' AND updated_at < $1
            ",
        )
        .bind(stale_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn job_stats(&self) -> Result<JobStats, StoreError> {
        let counts = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM background_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (status, count) in counts {
            stats.add(status, count);
        }
        Ok(stats)
    }
}
