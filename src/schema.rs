//! Database schema definitions for SQLx.
//!
//! Row types for the incident lifecycle tables, the background job table and
//! the read-only configuration (policies, teams, schedules) the engine consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "incident_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    /// Triggered and waiting for a responder.
    Open,
    /// A responder has taken ownership.
    Acknowledged,
    /// Terminal.
    Resolved,
    /// Silenced until `snoozed_until`.
    Snoozed,
    /// Silenced indefinitely.
    Suppressed,
}

impl IncidentStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self == Self::Resolved
    }
}

/// Urgency derived from the triggering event's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "incident_urgency", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum Urgency {
    High,
    Low,
}

/// Progress of the escalation state machine of a single incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "escalation_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationStatus {
    /// Steps remain to be executed.
    Escalating,
    /// The last step has been executed.
    Completed,
}

/// An incident: the deduplicated unit of work responders are paged for.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Incident {
    /// Unique identifier for the incident
    pub id: Uuid,
    /// Summary taken from the first triggering event
    pub title: String,
    /// Pretty-printed custom details of the first triggering event
    pub description: Option<String>,
    /// Caller-supplied key folding repeated alerts into this incident
    pub dedup_key: String,
    /// Current lifecycle status
    pub status: IncidentStatus,
    /// Urgency derived from the event severity
    pub urgency: Urgency,
    /// Optional caller-supplied priority label
    pub priority: Option<String>,
    /// Owning service
    pub service_id: String,
    /// Primary responder, set by escalation
    pub assignee_id: Option<String>,
    /// Team owning the service, if any
    pub team_id: Option<String>,
    /// `None` when the service has no escalation policy
    pub escalation_status: Option<EscalationStatus>,
    /// Index of the next step to execute while escalating
    pub current_escalation_step: i32,
    /// Highest step index whose execution has been committed, `-1` before the first
    pub escalation_claimed_step: i32,
    /// When the next escalation step is due
    pub next_escalation_at: Option<DateTime<Utc>>,
    #[allow(missing_docs)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[allow(missing_docs)]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Snooze deadline, cleared by the auto-unsnooze job
    pub snoozed_until: Option<DateTime<Utc>>,
    #[allow(missing_docs)]
    pub created_at: DateTime<Utc>,
    #[allow(missing_docs)]
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    /// Whether a pending escalation step may still notify anyone.
    pub fn is_escalation_eligible(&self) -> bool {
        self.status == IncidentStatus::Open
            && self.escalation_status == Some(EscalationStatus::Escalating)
    }
}

/// Raw inbound alert. One row is written for every trigger event, duplicates included.
#[derive(Debug, Clone, FromRow, Serialize)]
#[allow(missing_docs)]
pub struct Alert {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub dedup_key: String,
    pub service_id: String,
    pub integration_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Timeline entry of an incident.
#[derive(Debug, Clone, FromRow, Serialize)]
#[allow(missing_docs)]
pub struct IncidentEvent {
    pub id: i64,
    pub incident_id: Uuid,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_channel", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum Channel {
    Email,
    Sms,
    Push,
    Slack,
    Whatsapp,
}

/// Delivery state of a notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "notification_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

/// Audit record of one attempted dispatch to one user over one channel.
#[derive(Debug, Clone, FromRow, Serialize)]
#[allow(missing_docs)]
pub struct Notification {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub user_id: String,
    pub channel: Channel,
    pub status: NotificationStatus,
    pub error: Option<String>,
    /// Escalation step that produced this notification, if any
    pub escalation_step: Option<i32>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Kind of a background job, used for handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Re-invokes the escalation orchestrator for one step.
    EscalationStep,
    /// Returns a snoozed incident to `OPEN`.
    AutoUnsnooze,
    /// Retries a failed notification dispatch.
    Notification,
    /// Generic application task.
    ScheduledTask,
    /// Checks active incidents against their service's SLA targets.
    SlaBreachCheck,
}

impl JobType {
    /// Name used in logs and Sentry transactions.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EscalationStep => "ESCALATION_STEP",
            Self::AutoUnsnooze => "AUTO_UNSNOOZE",
            Self::Notification => "NOTIFICATION",
            Self::ScheduledTask => "SCHEDULED_TASK",
            Self::SlaBreachCheck => "SLA_BREACH_CHECK",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// Represents a background job record in the database
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BackgroundJob {
    /// Unique identifier for the job
    pub id: i64,
    /// Type identifier for the job (used for dispatch)
    pub job_type: JobType,
    /// JSON data containing the job payload
    pub payload: Value,
    /// Current lifecycle status
    pub status: JobStatus,
    /// Number of times the job has been claimed
    pub attempts: i32,
    /// Claims allowed before the job is marked as failed
    pub max_attempts: i32,
    /// Earliest time the job may be claimed
    pub scheduled_at: DateTime<Utc>,
    /// Error of the most recent failed attempt
    pub error: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last status change
    pub updated_at: DateTime<Utc>,
}

/// Aggregate job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct JobStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl JobStats {
    pub(crate) fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    /// Total number of jobs across all statuses.
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.cancelled
    }
}

/// Target kind column of `escalation_steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "escalation_target_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum TargetType {
    User,
    Team,
    Schedule,
}

/// Who an escalation step notifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscalationTarget {
    /// A single user.
    User {
        /// Target user
        user_id: String,
    },
    /// All members of a team, or only its lead.
    Team {
        /// Target team
        team_id: String,
        /// Notify the lead instead of every member
        notify_only_team_lead: bool,
    },
    /// Whoever is on call for a schedule at execution time.
    Schedule {
        /// Target schedule
        schedule_id: String,
    },
}

impl std::fmt::Display for EscalationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User { user_id } => write!(f, "user {user_id}"),
            Self::Team {
                team_id,
                notify_only_team_lead: true,
            } => write!(f, "lead of team {team_id}"),
            Self::Team { team_id, .. } => write!(f, "team {team_id}"),
            Self::Schedule { schedule_id } => write!(f, "schedule {schedule_id}"),
        }
    }
}

/// One step of an escalation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Position in the policy, ascending
    pub step_order: i32,
    /// Delay after the previous step before this one runs
    pub delay_minutes: i32,
    /// Who to notify
    pub target: EscalationTarget,
    /// Channels overriding each recipient's preferences, empty for none
    pub channels: Vec<Channel>,
}

impl EscalationStep {
    /// Delay before the step runs.
    pub fn delay(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.delay_minutes.max(0)))
    }
}

/// Row of `escalation_steps`.
#[derive(Debug, FromRow)]
pub(crate) struct EscalationStepRow {
    pub(crate) step_order: i32,
    pub(crate) delay_minutes: i32,
    pub(crate) target_type: TargetType,
    pub(crate) target_id: String,
    pub(crate) notify_only_team_lead: bool,
    pub(crate) channels: Vec<Channel>,
}

impl From<EscalationStepRow> for EscalationStep {
    fn from(row: EscalationStepRow) -> Self {
        let target = match row.target_type {
            TargetType::User => EscalationTarget::User {
                user_id: row.target_id,
            },
            TargetType::Team => EscalationTarget::Team {
                team_id: row.target_id,
                notify_only_team_lead: row.notify_only_team_lead,
            },
            TargetType::Schedule => EscalationTarget::Schedule {
                schedule_id: row.target_id,
            },
        };
        Self {
            step_order: row.step_order,
            delay_minutes: row.delay_minutes,
            target,
            channels: row.channels,
        }
    }
}

/// Ordered escalation steps of a service's policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    #[allow(missing_docs)]
    pub id: String,
    /// Steps sorted by `step_order`
    pub steps: Vec<EscalationStep>,
}

impl EscalationPolicy {
    /// Build a policy, sorting the steps by their order.
    pub fn new(id: impl Into<String>, mut steps: Vec<EscalationStep>) -> Self {
        steps.sort_by_key(|step| step.step_order);
        Self {
            id: id.into(),
            steps,
        }
    }
}

/// A team as seen by target resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Team {
    pub id: String,
    pub lead_id: Option<String>,
    /// Members in display order
    pub member_ids: Vec<String>,
}

/// A rotation within an on-call schedule.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ScheduleLayer {
    #[allow(missing_docs)]
    pub id: String,
    #[allow(missing_docs)]
    pub name: String,
    /// Rotation origin
    #[sqlx(rename = "start_at")]
    pub start: DateTime<Utc>,
    /// Layer stops contributing at this instant, if set
    #[sqlx(rename = "end_at")]
    pub end: Option<DateTime<Utc>>,
    /// Length of one shift
    pub rotation_length_hours: i32,
    /// Users in rotation order
    pub user_ids: Vec<String>,
}

/// A time-bounded substitution of the on-call user.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct ScheduleOverride {
    #[allow(missing_docs)]
    pub id: String,
    /// User on call during the override
    pub user_id: String,
    /// Only replace this user, or every layer when `None`
    pub replaces_user_id: Option<String>,
    #[sqlx(rename = "start_at")]
    #[allow(missing_docs)]
    pub start: DateTime<Utc>,
    #[sqlx(rename = "end_at")]
    #[allow(missing_docs)]
    pub end: DateTime<Utc>,
}

/// Rotation layers plus overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct OnCallSchedule {
    pub id: String,
    /// Layers in priority order
    pub layers: Vec<ScheduleLayer>,
    pub overrides: Vec<ScheduleOverride>,
}

/// Acknowledgement and resolution targets of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaTargets {
    /// Minutes from creation until the incident should be acknowledged
    pub ack_minutes: i32,
    /// Minutes from creation until the incident should be resolved
    pub resolve_minutes: i32,
    /// Whether breach warnings are raised for the service's incidents
    pub notify_on_breach: bool,
}

impl SlaTargets {
    /// Targets used when a service sets none.
    pub const DEFAULT_ACK_MINUTES: i32 = 15;
    #[allow(missing_docs)]
    pub const DEFAULT_RESOLVE_MINUTES: i32 = 120;

    #[allow(missing_docs)]
    pub fn ack_target(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.ack_minutes))
    }

    #[allow(missing_docs)]
    pub fn resolve_target(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.resolve_minutes))
    }
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            ack_minutes: Self::DEFAULT_ACK_MINUTES,
            resolve_minutes: Self::DEFAULT_RESOLVE_MINUTES,
            notify_on_breach: true,
        }
    }
}

/// The parts of a service the engine reads when opening incidents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    #[allow(missing_docs)]
    pub id: String,
    /// Team that owns incidents of this service
    pub team_id: Option<String>,
    /// Policy applied to new incidents, if any
    pub escalation_policy: Option<EscalationPolicy>,
    /// Targets checked by the SLA breach monitor
    pub sla: SlaTargets,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::TypeInfo;
    use sqlx::postgres::PgHasArrayType;

    #[test]
    fn channel_arrays_use_the_derived_array_type() {
        let info = <Channel as PgHasArrayType>::array_type_info();
        assert_eq!(info.name(), "notification_channel[]");
    }

    #[test]
    fn sla_targets_default_to_fifteen_minutes_and_two_hours() {
        let targets = SlaTargets::default();
        assert_eq!(targets.ack_target(), chrono::Duration::minutes(15));
        assert_eq!(targets.resolve_target(), chrono::Duration::hours(2));
        assert!(targets.notify_on_breach);
    }
}
