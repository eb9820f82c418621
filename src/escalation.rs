//! Escalation state machine.
//!
//! Executors resolve the step's target to recipients and then commit, in one
//! store operation, the notification records, the timeline and the advance of
//! the state machine. The commit is guarded on no execution of the step having
//! been committed before, so concurrent executors notify once and an executor
//! that fails before committing leaves the step to the job's retry. Dispatch
//! only happens after the commit. Steps whose target resolves to nobody are
//! skipped forward within the same execution.

use crate::background_job::{BackgroundJob, new_job};
use crate::clock::Clock;
use crate::dispatch::{Dispatcher, NotificationRequest, TemplateData};
use crate::engine::Engine;
use crate::errors::{DispatchError, EngineError};
use crate::jobs::{EscalationStepJob, NotificationJob};
use crate::schema::{
    Channel, EscalationPolicy, EscalationTarget, Incident, NotificationStatus,
};
use crate::storage::{EscalationAdvance, NewNotification, StepExecution, Store};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Reason reported when the incident's service has no (or an empty) policy.
pub(crate) const REASON_NO_POLICY: &str = "No escalation policy configured";
/// Reason reported when the step index is past the end of the policy.
pub(crate) const REASON_EXHAUSTED: &str = "All escalation steps exhausted";
/// Reason reported when the incident is not `OPEN` and escalating.
pub(crate) const REASON_NOT_ELIGIBLE: &str = "Incident is no longer eligible for escalation";
/// Reason reported when another executor already committed the step.
pub(crate) const REASON_IN_PROGRESS: &str = "Escalation already in progress";
/// Reason reported when the last step resolved to nobody.
pub(crate) const REASON_NO_RECIPIENTS: &str = "No recipients for the final escalation step";

/// Channel used for recipients without any notification preference.
const FALLBACK_CHANNEL: Channel = Channel::Email;

/// Result of [`Engine::execute_escalation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationOutcome {
    /// Whether notifications were recorded for a step
    pub escalated: bool,
    /// The step that was executed, after any skip-forward
    pub step_index: i32,
    /// Number of recipients notified
    pub target_count: usize,
    /// Whether a job for the following step was scheduled
    pub next_step_scheduled: bool,
    /// Why nothing was escalated
    pub reason: Option<String>,
}

impl EscalationOutcome {
    fn not_escalated(step_index: i32, reason: &str) -> Self {
        Self {
            escalated: false,
            step_index,
            target_count: 0,
            next_step_scheduled: false,
            reason: Some(reason.to_string()),
        }
    }
}

fn step_count(policy: &EscalationPolicy) -> i32 {
    i32::try_from(policy.steps.len()).unwrap_or(i32::MAX)
}

pub(crate) fn notification_request(
    incident: &Incident,
    notification_id: Uuid,
    user_id: &str,
    channel: Channel,
    escalation_step: Option<i32>,
) -> NotificationRequest {
    NotificationRequest {
        notification_id,
        user_id: user_id.to_string(),
        channel,
        incident_id: incident.id,
        template: TemplateData {
            title: incident.title.clone(),
            urgency: incident.urgency,
            escalation_step,
        },
    }
}

impl<S: Store, D: Dispatcher, C: Clock> Engine<S, D, C> {
    /// Execute escalation step `step_index` of an incident.
    ///
    /// Safe to call concurrently and repeatedly: only the caller whose
    /// execution commits first notifies anyone, everybody else gets
    /// `escalated: false` with a reason.
    #[instrument(
        name = "escalation.execute",
        skip_all,
        fields(incident.id = %incident_id, step = step_index)
    )]
    pub async fn execute_escalation(
        &self,
        incident_id: Uuid,
        step_index: i32,
    ) -> Result<EscalationOutcome, EngineError> {
        let now = self.now();
        let store = self.store();

        let incident = store
            .get_incident(incident_id)
            .await?
            .ok_or(EngineError::IncidentNotFound(incident_id))?;

        let policy = store
            .service(&incident.service_id)
            .await?
            .and_then(|service| service.escalation_policy)
            .filter(|policy| !policy.steps.is_empty());

        let Some(policy) = policy else {
            return Ok(EscalationOutcome::not_escalated(step_index, REASON_NO_POLICY));
        };

        if step_index < 0 || step_index >= step_count(&policy) {
            return Ok(EscalationOutcome::not_escalated(step_index, REASON_EXHAUSTED));
        }

        if !incident.is_escalation_eligible() {
            return Ok(EscalationOutcome::not_escalated(step_index, REASON_NOT_ELIGIBLE));
        }

        if incident.escalation_claimed_step >= step_index {
            debug!("Step already executed");
            return Ok(EscalationOutcome::not_escalated(step_index, REASON_IN_PROGRESS));
        }

        self.run_steps(&incident, &policy, step_index, now).await
    }

    /// Execute `step_index`, skipping forward over steps without recipients,
    /// and commit the result.
    async fn run_steps(
        &self,
        incident: &Incident,
        policy: &EscalationPolicy,
        step_index: i32,
        now: DateTime<Utc>,
    ) -> Result<EscalationOutcome, EngineError> {
        let store = self.store();
        let total = step_count(policy);
        let mut index = step_index;
        let mut messages = Vec::new();

        loop {
            let Some(step) = usize::try_from(index).ok().and_then(|i| policy.steps.get(i)) else {
                return Ok(EscalationOutcome::not_escalated(index, REASON_EXHAUSTED));
            };
            let next_index = index + 1;
            let has_next = next_index < total;

            let recipients = self.resolve_target(&step.target, now).await?;

            if recipients.is_empty() {
                let message = format!(
                    "Escalation level {} skipped: {} resolved to no recipients",
                    index + 1,
                    step.target
                );
                info!(step = index, target = %step.target, "Escalation target resolved to no recipients");

                if has_next {
                    messages.push(message);
                    index = next_index;
                    continue;
                }

                messages.push(format!("{message}. Escalation completed."));
                let execution = StepExecution {
                    requested_step: step_index,
                    executed_step: index,
                    assignee_id: None,
                    advance: EscalationAdvance::Completed,
                    notifications: Vec::new(),
                    messages,
                };
                if !store.advance_escalation(incident.id, execution, now).await? {
                    return self.lost_commit(incident.id, index).await;
                }
                return Ok(EscalationOutcome::not_escalated(index, REASON_NO_RECIPIENTS));
            }

            let mut notifications = Vec::new();
            for user_id in &recipients {
                let channels = if step.channels.is_empty() {
                    store.user_channels(user_id).await?
                } else {
                    step.channels.clone()
                };
                let channels = if channels.is_empty() {
                    vec![FALLBACK_CHANNEL]
                } else {
                    channels
                };

                for channel in channels {
                    notifications.push(NewNotification {
                        id: Uuid::new_v4(),
                        incident_id: incident.id,
                        user_id: user_id.clone(),
                        channel,
                        escalation_step: Some(index),
                        created_at: now,
                    });
                }
            }

            let assignee_id = match recipients.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            };

            let mut message = format!("Escalated to {} (Level {}", recipients.join(", "), index + 1);
            if step.delay_minutes > 0 {
                message.push_str(&format!(", after {} minute delay", step.delay_minutes));
            }
            message.push(')');

            let advance = match usize::try_from(next_index).ok().and_then(|i| policy.steps.get(i)) {
                Some(next_step) => {
                    let due_at = now + next_step.delay();
                    let job = EscalationStepJob {
                        incident_id: incident.id,
                        step_index: next_index,
                    };
                    let job = new_job(&job, due_at, self.config().default_max_attempts)?;
                    message.push_str(&format!(
                        ". Next escalation step scheduled for {}",
                        due_at.to_rfc3339()
                    ));
                    EscalationAdvance::Next {
                        step: next_index,
                        due_at,
                        job,
                    }
                }
                None => EscalationAdvance::Completed,
            };
            messages.push(message);

            let requests: Vec<_> = notifications
                .iter()
                .map(|n| notification_request(incident, n.id, &n.user_id, n.channel, Some(index)))
                .collect();

            let execution = StepExecution {
                requested_step: step_index,
                executed_step: index,
                assignee_id,
                advance,
                notifications,
                messages,
            };
            if !store.advance_escalation(incident.id, execution, now).await? {
                return self.lost_commit(incident.id, index).await;
            }

            info!(step = index, recipients = recipients.len(), "Escalated incident");

            for request in &requests {
                if let Err(error) = self.deliver(request, now).await {
                    warn!(notification.id = %request.notification_id, "Failed to dispatch notification: {error}");
                    if self.config().retry_failed_notifications {
                        self.schedule_notification_retry(request.notification_id, now)
                            .await;
                    }
                }
            }

            return Ok(EscalationOutcome {
                escalated: true,
                step_index: index,
                target_count: recipients.len(),
                next_step_scheduled: has_next,
                reason: None,
            });
        }
    }

    /// Outcome for an execution whose commit was refused: either another
    /// executor committed first or the incident stopped escalating.
    async fn lost_commit(
        &self,
        incident_id: Uuid,
        step_index: i32,
    ) -> Result<EscalationOutcome, EngineError> {
        let still_eligible = self
            .store()
            .get_incident(incident_id)
            .await?
            .is_some_and(|incident| incident.is_escalation_eligible());

        let reason = if still_eligible {
            REASON_IN_PROGRESS
        } else {
            REASON_NOT_ELIGIBLE
        };
        debug!(reason, "Escalation commit refused");
        Ok(EscalationOutcome::not_escalated(step_index, reason))
    }

    /// Recipients of a step target at `now`. Unknown teams and schedules resolve to nobody.
    async fn resolve_target(
        &self,
        target: &EscalationTarget,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, EngineError> {
        let recipients = match target {
            EscalationTarget::User { user_id } => vec![user_id.clone()],
            EscalationTarget::Team {
                team_id,
                notify_only_team_lead,
            } => match self.store().team(team_id).await? {
                Some(team) if *notify_only_team_lead => team.lead_id.into_iter().collect(),
                Some(team) => team.member_ids,
                None => Vec::new(),
            },
            EscalationTarget::Schedule { schedule_id } => {
                self.resolve_on_call(schedule_id, now).await?
            }
        };
        Ok(recipients)
    }

    /// Send one notification with a bounded timeout and record the result on
    /// its row.
    ///
    /// Returns the dispatch error, if any; store errors while recording the
    /// result are logged, never returned, since the notification already left.
    pub(crate) async fn deliver(
        &self,
        request: &NotificationRequest,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let timeout: Duration = self.config().dispatch_timeout;
        let result = match tokio::time::timeout(timeout, self.dispatcher().send(request)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::new(format!(
                "dispatch timed out after {timeout:?}"
            ))),
        };

        let (status, error, sent_at) = match &result {
            Ok(()) => (NotificationStatus::Sent, None, Some(now)),
            Err(error) => (NotificationStatus::Failed, Some(error.to_string()), None),
        };

        if let Err(error) = self
            .store()
            .update_notification(request.notification_id, status, error.as_deref(), sent_at)
            .await
        {
            warn!(notification.id = %request.notification_id, "Failed to record dispatch result: {error}");
        }

        result
    }

    async fn schedule_notification_retry(&self, notification_id: Uuid, now: DateTime<Utc>) {
        let job = NotificationJob { notification_id };
        let scheduled_at = now + crate::queue::backoff_delay(self.config().job_backoff_base, 0);
        if let Err(error) = job.enqueue_at(self, scheduled_at).await {
            warn!(notification.id = %notification_id, "Failed to schedule notification retry: {error}");
        }
    }
}
