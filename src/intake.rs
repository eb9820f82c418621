//! Event intake: folds inbound alert events into incidents.
//!
//! Deduplication rests on the store refusing a second non-resolved incident
//! for the same service and dedup key. A trigger that loses that race, or
//! whose incident gets resolved under it, simply runs again and then finds the
//! winner's incident.

use crate::background_job::new_job;
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::errors::{EventError, StoreError};
use crate::jobs::EscalationStepJob;
use crate::schema::{IncidentStatus, Service, Urgency};
use crate::storage::{NewAlert, NewIncident, Store, Transition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const MAX_DEDUP_KEY_LEN: usize = 255;
const MAX_SUMMARY_LEN: usize = 1024;

/// What an inbound event asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum EventAction {
    Trigger,
    Resolve,
    Acknowledge,
}

/// Severity reported by the monitoring source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    /// Only critical events page with high urgency.
    pub fn urgency(self) -> Urgency {
        match self {
            Self::Critical => Urgency::High,
            Self::Error | Self::Warning | Self::Info => Urgency::Low,
        }
    }
}

/// Details of an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDetails {
    /// Becomes the incident title
    pub summary: String,
    /// Name of the emitting monitor
    pub source: String,
    #[allow(missing_docs)]
    pub severity: Severity,
    #[allow(missing_docs)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// Arbitrary JSON, rendered into the incident description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_details: Option<Value>,
}

/// An inbound alert event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[allow(missing_docs)]
    pub event_action: EventAction,
    /// Key folding repeated events into one incident
    pub dedup_key: String,
    #[allow(missing_docs)]
    pub payload: EventDetails,
}

impl EventPayload {
    /// Parse and validate a raw JSON event.
    pub fn from_json(value: Value) -> Result<Self, EventError> {
        let payload: Self =
            serde_json::from_value(value).map_err(|e| EventError::Validation(e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check the fields serde cannot.
    pub fn validate(&self) -> Result<(), EventError> {
        let invalid = |message: &str| Err(EventError::Validation(message.to_string()));

        if self.dedup_key.trim().is_empty() {
            return invalid("dedup_key must not be empty");
        }
        if self.dedup_key.len() > MAX_DEDUP_KEY_LEN {
            return invalid("dedup_key is too long");
        }
        if self.payload.summary.trim().is_empty() {
            return invalid("summary must not be empty");
        }
        if self.payload.summary.len() > MAX_SUMMARY_LEN {
            return invalid("summary is too long");
        }
        if self.payload.source.trim().is_empty() {
            return invalid("source must not be empty");
        }
        Ok(())
    }
}

/// What event intake did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[allow(missing_docs)]
pub enum EventResult {
    Triggered,
    Deduplicated,
    Resolved,
    /// The pair's latest incident is already resolved; its id is reported.
    AlreadyResolved,
    Acknowledged,
    AlreadyAcknowledged,
    /// The event had no incident to apply to. Always reported without an
    /// incident id, even when the pair has a resolved incident.
    Ignored,
}

/// Result of [`Engine::process_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOutcome {
    #[allow(missing_docs)]
    pub action: EventResult,
    /// Incident the event was applied to, if any
    pub incident_id: Option<Uuid>,
}

impl EventOutcome {
    fn new(action: EventResult, incident_id: Option<Uuid>) -> Self {
        Self {
            action,
            incident_id,
        }
    }
}

/// Work left to do once the intake transaction committed.
enum FollowUp {
    None,
    FirstStep(Uuid),
}

impl<S: Store, D: Dispatcher, C: Clock> Engine<S, D, C> {
    /// Apply an inbound event for `service_id`.
    ///
    /// Duplicate and concurrent events are folded exactly once; write
    /// conflicts are retried internally up to the configured limit.
    #[instrument(
        name = "incidents.process_event",
        skip_all,
        fields(service.id = %service_id, dedup_key = %payload.dedup_key, action = ?payload.event_action)
    )]
    pub async fn process_event(
        &self,
        payload: EventPayload,
        service_id: &str,
        integration_id: &str,
    ) -> Result<EventOutcome, EventError> {
        payload.validate()?;

        let now = self.now();
        let service = self
            .store()
            .service(service_id)
            .await?
            .ok_or_else(|| EventError::Validation(format!("unknown service {service_id}")))?;

        let max_attempts = self.config().conflict_retries.saturating_add(1);
        let mut attempt = 0;
        let (outcome, follow_up) = loop {
            attempt += 1;
            match self.apply_event(&payload, &service, integration_id, now).await {
                Ok(result) => break result,
                Err(StoreError::Conflict(error)) if attempt < max_attempts => {
                    debug!(attempt, "Write conflict, retrying: {error}");
                }
                Err(StoreError::Conflict(error)) => {
                    warn!(attempt, "Giving up after repeated write conflicts: {error}");
                    return Err(EventError::Conflict { attempts: attempt });
                }
                Err(error) => return Err(error.into()),
            }
        };

        if let FollowUp::FirstStep(incident_id) = follow_up {
            match self.execute_escalation(incident_id, 0).await {
                Ok(result) => debug!(escalated = result.escalated, "Ran first escalation step"),
                Err(error) => warn!(incident.id = %incident_id, "First escalation step failed: {error}"),
            }
        }

        Ok(outcome)
    }

    async fn apply_event(
        &self,
        event: &EventPayload,
        service: &Service,
        integration_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(EventOutcome, FollowUp), StoreError> {
        let store = self.store();
        let details = &event.payload;
        let open = store.find_open_incident(&service.id, &event.dedup_key).await?;

        match event.event_action {
            EventAction::Trigger => {
                let alert = |incident_id| -> Result<NewAlert, StoreError> {
                    Ok(NewAlert {
                        id: Uuid::new_v4(),
                        incident_id,
                        dedup_key: event.dedup_key.clone(),
                        service_id: service.id.clone(),
                        integration_id: integration_id.to_string(),
                        payload: serde_json::to_value(details)?,
                        created_at: now,
                    })
                };

                if let Some(incident) = open {
                    let message = format!(
                        "Re-triggered by event from {}. Summary: {}",
                        details.source, details.summary
                    );
                    store.append_alert(alert(incident.id)?, &message).await?;
                    debug!(incident.id = %incident.id, "Deduplicated event");
                    let outcome = EventOutcome::new(EventResult::Deduplicated, Some(incident.id));
                    return Ok((outcome, FollowUp::None));
                }

                let incident_id = Uuid::new_v4();
                let first_step = service
                    .escalation_policy
                    .as_ref()
                    .and_then(|policy| policy.steps.first());

                let mut jobs = Vec::new();
                let mut first_escalation_at = None;
                if let Some(step) = first_step {
                    let due_at = now + step.delay();
                    let job = EscalationStepJob {
                        incident_id,
                        step_index: 0,
                    };
                    jobs.push(new_job(&job, due_at, self.config().default_max_attempts)?);
                    first_escalation_at = Some(due_at);
                }

                let description = details
                    .custom_details
                    .as_ref()
                    .map(serde_json::to_string_pretty)
                    .transpose()?;

                let incident = NewIncident {
                    id: incident_id,
                    title: details.summary.clone(),
                    description,
                    dedup_key: event.dedup_key.clone(),
                    urgency: details.severity.urgency(),
                    priority: details.priority.clone(),
                    service_id: service.id.clone(),
                    team_id: service.team_id.clone(),
                    first_escalation_at,
                    created_at: now,
                };

                let message = format!("Incident triggered via API from {}", details.source);
                let incident = store
                    .create_incident(incident, alert(incident_id)?, &message, &jobs)
                    .await?;
                info!(incident.id = %incident.id, "Incident triggered");

                let run_now = self.config().immediate_first_step
                    && first_step.is_some_and(|step| step.delay_minutes <= 0);
                let follow_up = if run_now {
                    FollowUp::FirstStep(incident.id)
                } else {
                    FollowUp::None
                };

                Ok((EventOutcome::new(EventResult::Triggered, Some(incident.id)), follow_up))
            }
            EventAction::Resolve => {
                let Some(incident) = open else {
                    return self.closed_outcome(service, event).await;
                };

                let message = format!("Auto-resolved by event from {}.", details.source);
                let action = match store
                    .transition_incident(incident.id, Transition::Resolve, now, &message, None)
                    .await?
                {
                    Some(_) => EventResult::Resolved,
                    None => EventResult::AlreadyResolved,
                };
                Ok((EventOutcome::new(action, Some(incident.id)), FollowUp::None))
            }
            EventAction::Acknowledge => {
                let Some(incident) = open else {
                    return Ok((EventOutcome::new(EventResult::Ignored, None), FollowUp::None));
                };

                let message = format!("Acknowledged via API event from {}.", details.source);
                let action = match store
                    .transition_incident(incident.id, Transition::Acknowledge, now, &message, None)
                    .await?
                {
                    Some(_) => EventResult::Acknowledged,
                    None => EventResult::AlreadyAcknowledged,
                };
                Ok((EventOutcome::new(action, Some(incident.id)), FollowUp::None))
            }
        }
    }

    /// Outcome of a resolve when no incident is open: `already-resolved` if
    /// the pair has a resolved incident, `ignored` if it never had one.
    async fn closed_outcome(
        &self,
        service: &Service,
        event: &EventPayload,
    ) -> Result<(EventOutcome, FollowUp), StoreError> {
        let latest = self
            .store()
            .find_latest_incident(&service.id, &event.dedup_key)
            .await?;

        let outcome = match latest {
            Some(incident) if incident.status == IncidentStatus::Resolved => {
                EventOutcome::new(EventResult::AlreadyResolved, Some(incident.id))
            }
            _ => EventOutcome::new(EventResult::Ignored, None),
        };
        Ok((outcome, FollowUp::None))
    }
}
