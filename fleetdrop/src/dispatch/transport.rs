//! Endpoint transport seam.
//!
//! The host owns the actual agent connections. The dispatch queue only needs
//! to ask whether an endpoint is connected and to hand it an encoded
//! command; [`EndpointTransport`] is that contract. [`AgentRegistry`] is an
//! in-process implementation where each connected agent is an mpsc channel
//! of encoded messages.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use super::endpoint::EndpointId;
use super::envelope::CommandEnvelope;
use super::error::TransportError;

/// Host-side access to endpoint connections.
pub trait EndpointTransport: Send + Sync {
    /// True if the endpoint currently has a live connection.
    fn is_connected(&self, endpoint: &EndpointId) -> bool;

    /// Human-readable name for the endpoint, if the host knows one.
    fn display_name(&self, _endpoint: &EndpointId) -> Option<String> {
        None
    }

    /// Deliver a command. An `Err` means the command was not sent.
    fn send(&self, endpoint: &EndpointId, envelope: &CommandEnvelope) -> Result<(), TransportError>;
}

struct AgentConnection {
    name: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

/// Connected agents keyed by endpoint; each receives JSON-encoded commands.
#[derive(Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<EndpointId, AgentConnection>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected agent; commands arrive on the returned receiver.
    ///
    /// Replaces any previous connection for the same endpoint.
    pub fn connect(
        &self,
        endpoint: EndpointId,
        name: Option<String>,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(endpoint = %endpoint, "Agent connected");
        self.agents.write().insert(endpoint, AgentConnection { name, tx });
        rx
    }

    /// Forget an agent connection.
    pub fn disconnect(&self, endpoint: &EndpointId) -> bool {
        let removed = self.agents.write().remove(endpoint).is_some();
        if removed {
            debug!(endpoint = %endpoint, "Agent disconnected");
        }
        removed
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

impl EndpointTransport for AgentRegistry {
    fn is_connected(&self, endpoint: &EndpointId) -> bool {
        self.agents
            .read()
            .get(endpoint)
            .is_some_and(|agent| !agent.tx.is_closed())
    }

    fn display_name(&self, endpoint: &EndpointId) -> Option<String> {
        self.agents.read().get(endpoint).and_then(|a| a.name.clone())
    }

    fn send(
        &self,
        endpoint: &EndpointId,
        envelope: &CommandEnvelope,
    ) -> Result<(), TransportError> {
        let encoded = envelope.to_json()?;
        let agents = self.agents.read();
        let agent = agents
            .get(endpoint)
            .ok_or_else(|| TransportError::NotConnected(endpoint.to_string()))?;
        agent
            .tx
            .send(encoded)
            .map_err(|_| TransportError::SendFailed("agent connection closed".to_string()))
    }
}
