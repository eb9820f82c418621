//! Service level targets.
//!
//! The checks are pure functions of an incident, its service's targets and a
//! caller-supplied `now`. [`Engine::check_sla_breaches`] reads the clock once
//! and warns about active incidents that are about to miss a target.

use crate::background_job::BackgroundJob;
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::jobs::SlaBreachCheckJob;
use crate::schema::{Incident, Service, SlaTargets};
use crate::storage::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Time from creation to acknowledgement, if acknowledged.
pub fn time_to_acknowledge(incident: &Incident) -> Option<Duration> {
    incident.acknowledged_at.map(|at| at - incident.created_at)
}

/// Time from creation to resolution, if resolved.
pub fn time_to_resolve(incident: &Incident) -> Option<Duration> {
    incident.resolved_at.map(|at| at - incident.created_at)
}

/// Whether the incident was acknowledged within its target.
///
/// Unacknowledged incidents have not met it.
pub fn ack_sla_met(incident: &Incident, targets: &SlaTargets) -> bool {
    time_to_acknowledge(incident).is_some_and(|elapsed| elapsed <= targets.ack_target())
}

/// Whether the incident was resolved within its target.
///
/// Unresolved incidents have not met it.
pub fn resolve_sla_met(incident: &Incident, targets: &SlaTargets) -> bool {
    time_to_resolve(incident).is_some_and(|elapsed| elapsed <= targets.resolve_target())
}

/// Mean of a set of durations, e.g. [`time_to_acknowledge`] over many
/// incidents for MTTA. `None` when empty.
pub fn mean_duration(durations: impl IntoIterator<Item = Duration>) -> Option<Duration> {
    let (total, count) = durations
        .into_iter()
        .fold((Duration::zero(), 0i32), |(total, count), d| (total + d, count + 1));

    (count > 0).then(|| total / count)
}

/// Which target is about to be missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreachKind {
    #[allow(missing_docs)]
    Ack,
    #[allow(missing_docs)]
    Resolve,
}

impl BreachKind {
    fn timeline_prefix(self) -> &'static str {
        match self {
            Self::Ack => "SLA ACK Warning",
            Self::Resolve => "SLA RESOLVE Warning",
        }
    }
}

/// An active incident close to missing one of its service's targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreachWarning {
    #[allow(missing_docs)]
    pub incident_id: Uuid,
    #[allow(missing_docs)]
    pub title: String,
    #[allow(missing_docs)]
    pub service_id: String,
    #[allow(missing_docs)]
    pub kind: BreachKind,
    /// Minutes left until the breach, rounded
    pub remaining_minutes: i64,
    #[allow(missing_docs)]
    pub target_minutes: i32,
}

impl BreachWarning {
    /// Timeline message recorded for the warning.
    pub fn message(&self) -> String {
        format!(
            "{}: {} min remaining (target: {} min)",
            self.kind.timeline_prefix(),
            self.remaining_minutes,
            self.target_minutes
        )
    }
}

/// Warnings for targets that `incident` will miss within the lead times.
///
/// An acknowledgement warning is only raised while the incident is
/// unacknowledged; targets already missed raise nothing.
pub fn breach_warnings(
    incident: &Incident,
    targets: &SlaTargets,
    now: DateTime<Utc>,
    ack_lead: Duration,
    resolve_lead: Duration,
) -> Vec<BreachWarning> {
    let elapsed = now - incident.created_at;
    let mut warnings = Vec::new();

    let mut check = |kind, target: Duration, target_minutes, lead| {
        let remaining = target - elapsed;
        if remaining > Duration::zero() && remaining < lead {
            warnings.push(BreachWarning {
                incident_id: incident.id,
                title: incident.title.clone(),
                service_id: incident.service_id.clone(),
                kind,
                remaining_minutes: (remaining.num_seconds() + 30) / 60,
                target_minutes,
            });
        }
    };

    if incident.acknowledged_at.is_none() {
        check(BreachKind::Ack, targets.ack_target(), targets.ack_minutes, ack_lead);
    }
    if incident.resolved_at.is_none() {
        check(
            BreachKind::Resolve,
            targets.resolve_target(),
            targets.resolve_minutes,
            resolve_lead,
        );
    }
    warnings
}

/// Result of [`Engine::check_sla_breaches`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlaCheckReport {
    #[allow(missing_docs)]
    pub checked_at: DateTime<Utc>,
    /// `OPEN` and `ACKNOWLEDGED` incidents looked at
    pub active_incident_count: usize,
    /// Warnings raised by this check, not repeating earlier ones
    pub warnings: Vec<BreachWarning>,
}

fn lead_time(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}

impl<S: Store, D: Dispatcher, C: Clock> Engine<S, D, C> {
    /// Warn about active incidents close to missing their service's targets.
    ///
    /// Each warning is logged and written to the incident's timeline. A
    /// warning already on the timeline within its lead time is not repeated.
    /// Services with `notify_on_breach` disabled are skipped.
    #[instrument(name = "sla.check_breaches", skip(self))]
    pub async fn check_sla_breaches(&self) -> Result<SlaCheckReport, EngineError> {
        let now = self.now();
        let store = self.store();
        let config = self.config();
        let ack_lead = lead_time(config.sla_ack_warning);
        let resolve_lead = lead_time(config.sla_resolve_warning);

        let incidents = store.active_incidents().await?;
        let mut services: HashMap<String, Option<Service>> = HashMap::new();
        let mut warnings = Vec::new();

        for incident in &incidents {
            if !services.contains_key(&incident.service_id) {
                let service = store.service(&incident.service_id).await?;
                services.insert(incident.service_id.clone(), service);
            }
            let targets = services
                .get(&incident.service_id)
                .and_then(Option::as_ref)
                .map_or_else(SlaTargets::default, |service| service.sla);
            if !targets.notify_on_breach {
                continue;
            }

            let candidates = breach_warnings(incident, &targets, now, ack_lead, resolve_lead);
            if candidates.is_empty() {
                continue;
            }

            let timeline = store.incident_events(incident.id).await?;
            for warning in candidates {
                let lead = match warning.kind {
                    BreachKind::Ack => ack_lead,
                    BreachKind::Resolve => resolve_lead,
                };
                let already_warned = timeline.iter().any(|event| {
                    event.message.starts_with(warning.kind.timeline_prefix())
                        && now - event.created_at <= lead
                });
                if already_warned {
                    continue;
                }

                warn!(
                    incident.id = %warning.incident_id,
                    kind = ?warning.kind,
                    remaining_minutes = warning.remaining_minutes,
                    target_minutes = warning.target_minutes,
                    "SLA breach approaching"
                );
                store.record_event(incident.id, &warning.message(), now).await?;
                warnings.push(warning);
            }
        }

        debug!(active = incidents.len(), warnings = warnings.len(), "Checked SLA targets");
        Ok(SlaCheckReport {
            checked_at: now,
            active_incident_count: incidents.len(),
            warnings,
        })
    }

    /// Schedule the recurring SLA breach check to run now and then every
    /// [`EngineConfig::sla_check_interval`](crate::EngineConfig::sla_check_interval).
    ///
    /// Call once per deployment; every call starts another chain of checks.
    pub async fn schedule_sla_monitor(&self) -> Result<i64, EngineError> {
        SlaBreachCheckJob { recurring: true }
            .enqueue_at(self, self.now())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IncidentStatus, Urgency};
    use chrono::TimeZone;

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn incident() -> Incident {
        Incident {
            id: Uuid::nil(),
            title: "Disk full".to_string(),
            description: None,
            dedup_key: "disk-full".to_string(),
            status: IncidentStatus::Open,
            urgency: Urgency::High,
            priority: None,
            service_id: "checkout".to_string(),
            assignee_id: None,
            team_id: None,
            escalation_status: None,
            current_escalation_step: 0,
            escalation_claimed_step: -1,
            next_escalation_at: None,
            acknowledged_at: None,
            resolved_at: None,
            snoozed_until: None,
            created_at: created_at(),
            updated_at: created_at(),
        }
    }

    #[test]
    fn acknowledgement_within_target_meets_the_sla() {
        let targets = SlaTargets::default();
        let mut incident = incident();
        assert!(!ack_sla_met(&incident, &targets));

        incident.acknowledged_at = Some(created_at() + Duration::minutes(15));
        assert!(ack_sla_met(&incident, &targets));
        assert_eq!(time_to_acknowledge(&incident), Some(Duration::minutes(15)));

        incident.acknowledged_at = Some(created_at() + Duration::minutes(16));
        assert!(!ack_sla_met(&incident, &targets));
    }

    #[test]
    fn resolution_uses_the_service_target() {
        let targets = SlaTargets {
            resolve_minutes: 30,
            ..SlaTargets::default()
        };
        let mut incident = incident();
        incident.resolved_at = Some(created_at() + Duration::minutes(45));

        assert!(!resolve_sla_met(&incident, &targets));
        assert!(resolve_sla_met(&incident, &SlaTargets::default()));
        assert_eq!(time_to_resolve(&incident), Some(Duration::minutes(45)));
    }

    #[test]
    fn mean_of_durations() {
        assert_eq!(mean_duration(Vec::new()), None);
        let durations = [Duration::minutes(10), Duration::minutes(20), Duration::minutes(30)];
        assert_eq!(mean_duration(durations), Some(Duration::minutes(20)));
    }

    #[test]
    fn warnings_only_inside_the_lead_time() {
        let targets = SlaTargets::default();
        let (ack_lead, resolve_lead) = (Duration::minutes(5), Duration::minutes(15));
        let incident = incident();

        let early = created_at() + Duration::minutes(9);
        assert!(breach_warnings(&incident, &targets, early, ack_lead, resolve_lead).is_empty());

        let close = created_at() + Duration::minutes(12);
        let warnings = breach_warnings(&incident, &targets, close, ack_lead, resolve_lead);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, BreachKind::Ack);
        assert_eq!(warnings[0].remaining_minutes, 3);
        assert_eq!(warnings[0].message(), "SLA ACK Warning: 3 min remaining (target: 15 min)");

        // Already breached.
        let late = created_at() + Duration::minutes(20);
        assert!(breach_warnings(&incident, &targets, late, ack_lead, resolve_lead).is_empty());

        let near_resolve = created_at() + Duration::minutes(110);
        let warnings = breach_warnings(&incident, &targets, near_resolve, ack_lead, resolve_lead);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, BreachKind::Resolve);
        assert_eq!(warnings[0].remaining_minutes, 10);
    }

    #[test]
    fn acknowledged_incidents_only_warn_about_resolution() {
        let targets = SlaTargets {
            ack_minutes: 15,
            resolve_minutes: 20,
            notify_on_breach: true,
        };
        let mut incident = incident();
        incident.acknowledged_at = Some(created_at() + Duration::minutes(1));

        let now = created_at() + Duration::minutes(12);
        let warnings =
            breach_warnings(&incident, &targets, now, Duration::minutes(5), Duration::minutes(15));
        let kinds = warnings.iter().map(|w| w.kind).collect::<Vec<_>>();
        assert_eq!(kinds, vec![BreachKind::Resolve]);
    }
}
