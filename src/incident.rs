//! Guarded incident transitions driven by responders.
//!
//! None of these cancel pending jobs: the job handlers re-check the incident
//! when they run and cancel themselves.

use crate::background_job::new_job;
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::jobs::AutoUnsnoozeJob;
use crate::schema::{Alert, Incident, IncidentEvent, Notification};
use crate::storage::{NewJob, Store, Transition};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

impl<S: Store, D: Dispatcher, C: Clock> Engine<S, D, C> {
    #[allow(missing_docs)]
    pub async fn get_incident(&self, id: Uuid) -> Result<Incident, EngineError> {
        self.store()
            .get_incident(id)
            .await?
            .ok_or(EngineError::IncidentNotFound(id))
    }

    /// Timeline of an incident, oldest first.
    pub async fn incident_timeline(&self, id: Uuid) -> Result<Vec<IncidentEvent>, EngineError> {
        Ok(self.store().incident_events(id).await?)
    }

    /// Alerts folded into an incident, oldest first.
    pub async fn incident_alerts(&self, id: Uuid) -> Result<Vec<Alert>, EngineError> {
        Ok(self.store().alerts_for_incident(id).await?)
    }

    /// Notifications recorded for an incident, oldest first.
    pub async fn incident_notifications(
        &self,
        id: Uuid,
    ) -> Result<Vec<Notification>, EngineError> {
        Ok(self.store().notifications_for_incident(id).await?)
    }

    /// Acknowledge an incident. Returns `false` if it was already acknowledged or resolved.
    #[instrument(name = "incidents.acknowledge", skip(self))]
    pub async fn acknowledge_incident(&self, id: Uuid) -> Result<bool, EngineError> {
        self.transition(id, Transition::Acknowledge, "Incident acknowledged", None)
            .await
    }

    /// Resolve an incident. Returns `false` if it was already resolved.
    #[instrument(name = "incidents.resolve", skip(self))]
    pub async fn resolve_incident(&self, id: Uuid) -> Result<bool, EngineError> {
        self.transition(id, Transition::Resolve, "Incident resolved", None)
            .await
    }

    /// Snooze an incident until `until`, scheduling its automatic return to
    /// `OPEN` in the same transaction.
    ///
    /// Returns `false` unless the incident was `OPEN` or `ACKNOWLEDGED`.
    #[instrument(name = "incidents.snooze", skip(self))]
    pub async fn snooze_incident(&self, id: Uuid, until: DateTime<Utc>) -> Result<bool, EngineError> {
        let job = AutoUnsnoozeJob { incident_id: id };
        let job = new_job(&job, until, self.config().default_max_attempts)?;
        let message = format!("Incident snoozed until {}", until.to_rfc3339());

        self.transition(id, Transition::Snooze { until }, &message, Some(&job))
            .await
    }

    /// Suppress an incident. Returns `false` if it was resolved or already suppressed.
    #[instrument(name = "incidents.suppress", skip(self))]
    pub async fn suppress_incident(&self, id: Uuid) -> Result<bool, EngineError> {
        self.transition(id, Transition::Suppress, "Incident suppressed", None)
            .await
    }

    /// Return a snoozed incident to `OPEN` if its snooze has expired.
    pub(crate) async fn auto_unsnooze(&self, id: Uuid) -> Result<bool, EngineError> {
        let now = self.now();
        let incident = self
            .store()
            .transition_incident(id, Transition::Unsnooze, now, "Incident auto-unsnoozed", None)
            .await?;
        Ok(incident.is_some())
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: Transition,
        message: &str,
        job: Option<&NewJob>,
    ) -> Result<bool, EngineError> {
        let now = self.now();
        let updated = self
            .store()
            .transition_incident(id, transition, now, message, job)
            .await?;

        match updated {
            Some(incident) => {
                info!(incident.id = %id, status = ?incident.status, "Incident transitioned");
                Ok(true)
            }
            None => {
                // Tell a failed guard apart from an unknown id.
                self.get_incident(id).await?;
                Ok(false)
            }
        }
    }
}
