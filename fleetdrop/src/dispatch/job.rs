//! Jobs: one command invocation against one endpoint.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Serialize, Serializer};

use super::endpoint::EndpointId;
use super::error::DispatchError;

/// What a job (or a caller request) asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Install the published artifact.
    Deploy,
    /// Remove a previous install.
    Undeploy,
    /// Report connectivity; never dispatched.
    Status,
    /// Report artifact metadata; never dispatched.
    Info,
    /// Run a caller-supplied script verbatim.
    Custom,
}

impl ActionKind {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Undeploy => "undeploy",
            Self::Status => "status",
            Self::Info => "info",
            Self::Custom => "custom",
        }
    }

    /// True for actions that send a command to the endpoint.
    pub fn dispatches(&self) -> bool {
        matches!(self, Self::Deploy | Self::Undeploy | Self::Custom)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deploy" => Ok(Self::Deploy),
            "undeploy" => Ok(Self::Undeploy),
            "status" => Ok(Self::Status),
            "info" => Ok(Self::Info),
            "custom" => Ok(Self::Custom),
            _ => Err(DispatchError::UnsupportedAction(s.to_string())),
        }
    }
}

impl Serialize for ActionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Queue-assigned job identity, stable across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Per-attempt token matching a reply to the dispatch that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Mint a fresh id: `<prefix>:<16 hex chars>`.
    pub fn generate(prefix: &str) -> Self {
        let bytes: [u8; 8] = rand::random();
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self(format!("{}:{}", prefix, hex))
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    /// Waiting behind another job for the same endpoint.
    Queued,
    /// Sent; awaiting a reply or the timeout.
    InFlight,
    /// Endpoint was busy; waiting to be re-sent.
    Retrying,
    /// Reply received without an error.
    Succeeded,
    /// Offline, rejected, errored, or out of retries.
    Failed,
    /// No reply before the timeout.
    TimedOut,
}

impl JobStatus {
    /// True for states that release the endpoint's queue slot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

/// One command for one endpoint.
#[derive(Debug, Clone)]
pub struct Job {
    pub(crate) id: JobId,
    pub(crate) endpoint: EndpointId,
    pub(crate) requester: Option<String>,
    pub(crate) action: ActionKind,
    pub(crate) script: String,
    pub(crate) run_as_privileged: bool,
    pub(crate) retries: u32,
    pub(crate) started_at: Option<Instant>,
    pub(crate) correlation_id: Option<CorrelationId>,
    pub(crate) node_name: Option<String>,
}

impl Job {
    /// Create a job; the id is assigned when it is enqueued.
    pub fn new(endpoint: EndpointId, action: ActionKind, script: impl Into<String>) -> Self {
        Self {
            id: JobId(0),
            endpoint,
            requester: None,
            action,
            script: script.into(),
            run_as_privileged: true,
            retries: 0,
            started_at: None,
            correlation_id: None,
            node_name: None,
        }
    }

    /// Attribute the job to a requester; notifications are addressed to it.
    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    /// Run the script as the agent's privileged account (default) or not.
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.run_as_privileged = privileged;
        self
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn requester(&self) -> Option<&str> {
        self.requester.as_deref()
    }

    pub fn action(&self) -> ActionKind {
        self.action
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn run_as_privileged(&self) -> bool {
        self.run_as_privileged
    }

    /// Busy retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// When the first dispatch attempt happened.
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Correlation id of the current attempt, if in flight.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Human-readable endpoint name reported by the transport.
    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }
}
