//! Notification delivery contract.

use crate::errors::DispatchError;
use crate::schema::{Channel, Urgency};
use serde::Serialize;
use std::future::Future;
use tracing::info;
use uuid::Uuid;

/// Content rendered into a notification by the delivery integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateData {
    /// Incident title
    pub title: String,
    #[allow(missing_docs)]
    pub urgency: Urgency,
    /// Escalation step that produced the notification, if any
    pub escalation_step: Option<i32>,
}

impl TemplateData {
    /// One-line subject for the notification.
    pub fn subject(&self) -> String {
        match self.escalation_step {
            Some(step) if step > 0 => {
                format!("Incident: {} (Escalation Level {})", self.title, step + 1)
            }
            _ => format!("Incident: {}", self.title),
        }
    }
}

/// A single notification to deliver to one user over one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct NotificationRequest {
    /// Id of the `notifications` row tracking this delivery
    pub notification_id: Uuid,
    pub user_id: String,
    pub channel: Channel,
    pub incident_id: Uuid,
    pub template: TemplateData,
}

/// Delivers notifications over email, SMS, push, Slack or WhatsApp.
///
/// Implementations should return promptly; the engine bounds every call with
/// a timeout and treats a timeout like any other failure.
pub trait Dispatcher: Send + Sync + 'static {
    /// Deliver one notification.
    fn send(
        &self,
        request: &NotificationRequest,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send;
}

/// A [`Dispatcher`] that only logs what it would deliver.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogDispatcher;

impl Dispatcher for LogDispatcher {
    async fn send(&self, request: &NotificationRequest) -> Result<(), DispatchError> {
        info!(
            incident.id = %request.incident_id,
            user.id = %request.user_id,
            channel = ?request.channel,
            subject = %request.template.subject(),
            "Dispatching notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_mentions_escalation_level() {
        let mut template = TemplateData {
            title: "Disk full".into(),
            urgency: Urgency::High,
            escalation_step: Some(0),
        };
        assert_eq!(template.subject(), "Incident: Disk full");

        template.escalation_step = Some(2);
        assert_eq!(template.subject(), "Incident: Disk full (Escalation Level 3)");
    }
}
