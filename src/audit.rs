use chrono::{DateTime, Utc};

/// Events the core hands to the audit sink. The durable writer lives
/// outside this service; this sink puts the events on the structured log
/// under the `audit` target where that collaborator picks them up.
#[derive(Debug)]
pub struct AuditEvent<'a> {
    pub user: &'a str,
    pub action: &'a str,
    pub resource: &'a str,
    pub reason: &'a str,
    pub at: DateTime<Utc>,
}

impl<'a> AuditEvent<'a> {
    pub fn denied(user: &'a str, action: &'a str, resource: &'a str, reason: &'a str) -> Self {
        AuditEvent {
            user,
            action,
            resource,
            reason,
            at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AuditSink;

impl AuditSink {
    pub fn record(&self, event: &AuditEvent<'_>) {
        tracing::warn!(
            target: "audit",
            user = event.user,
            action = event.action,
            resource = event.resource,
            reason = event.reason,
            at = %event.at.to_rfc3339(),
            "audit"
        );
    }
}
