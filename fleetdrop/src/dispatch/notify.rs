//! Job notifications.
//!
//! Every job transition produces a [`JobUpdate`]; where it goes is up to the
//! host through a [`JobNotifier`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::endpoint::EndpointId;
use super::job::{ActionKind, Job, JobId, JobStatus};

/// Display severity of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// A structured, human-readable status update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requester: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    pub text: String,
    pub level: Severity,
    pub timestamp: DateTime<Utc>,
}

impl JobUpdate {
    /// Update describing a job transition.
    pub fn for_job(job: &Job, status: JobStatus, level: Severity, text: impl Into<String>) -> Self {
        Self {
            job_id: Some(job.id()),
            endpoint: Some(job.endpoint().clone()),
            node_name: job.node_name().map(str::to_string),
            requester: job.requester().map(str::to_string),
            action: Some(job.action()),
            status: Some(status),
            text: text.into(),
            level,
            timestamp: Utc::now(),
        }
    }

    /// Update not tied to a job (validation errors, status checks).
    pub fn message(level: Severity, text: impl Into<String>) -> Self {
        Self {
            job_id: None,
            endpoint: None,
            node_name: None,
            requester: None,
            action: None,
            status: None,
            text: text.into(),
            level,
            timestamp: Utc::now(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: EndpointId) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_node_name(mut self, name: Option<String>) -> Self {
        self.node_name = name;
        self
    }

    pub fn with_requester(mut self, requester: Option<String>) -> Self {
        self.requester = requester;
        self
    }

    pub fn with_action(mut self, action: ActionKind) -> Self {
        self.action = Some(action);
        self
    }
}

/// Sink for job updates.
pub trait JobNotifier: Send + Sync {
    fn notify(&self, update: JobUpdate);
}

/// Writes updates to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl JobNotifier for TracingNotifier {
    fn notify(&self, update: JobUpdate) {
        let endpoint = update
            .endpoint
            .as_ref()
            .map(|e| e.as_str())
            .unwrap_or("-");
        let action = update.action.map(|a| a.as_str()).unwrap_or("-");
        match update.level {
            Severity::Info => info!(endpoint, action, "{}", update.text),
            Severity::Warn => warn!(endpoint, action, "{}", update.text),
            Severity::Error => error!(endpoint, action, "{}", update.text),
        }
    }
}

/// Forwards updates over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<JobUpdate>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobNotifier for ChannelNotifier {
    fn notify(&self, update: JobUpdate) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_update_serialization() {
        let endpoint = EndpointId::parse("node/site/abc").unwrap();
        let job = Job::new(endpoint, ActionKind::Deploy, "echo hi").with_requester("admin");
        let update =
            JobUpdate::for_job(&job, JobStatus::InFlight, Severity::Info, "Command dispatched");

        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["endpoint"], "node/site/abc");
        assert_eq!(json["action"], "deploy");
        assert_eq!(json["status"], "inFlight");
        assert_eq!(json["level"], "info");
        assert_eq!(json["requester"], "admin");
        assert!(json.get("nodeName").is_none());
    }

    #[test]
    fn test_channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(JobUpdate::message(Severity::Error, "No target devices provided."));
        let update = rx.try_recv().unwrap();
        assert_eq!(update.level, Severity::Error);
        assert!(update.job_id.is_none());

        drop(rx);
        notifier.notify(JobUpdate::message(Severity::Info, "ignored"));
    }
}
