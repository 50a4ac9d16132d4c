//! Wire types exchanged with endpoint agents.
//!
//! Outbound commands are JSON objects:
//!
//! ```text
//! {"action":"runcommands","type":2,"cmds":"<script>","runAsUser":0,
//!  "responseid":"<correlation id>","reply":true}
//! ```
//!
//! Replies come back as `{"action":"msg","type":"runcommands",
//! "responseid":"...","result":"...","error":"..."}`.

use serde::Serialize;
use serde_json::Value;

use super::error::TransportError;
use super::job::CorrelationId;

/// Command kind understood by the agent.
pub const RUN_COMMANDS_ACTION: &str = "runcommands";

/// Script interpreter selector for run-command requests.
pub const RUN_COMMANDS_TYPE: u8 = 2;

/// `runAsUser` value for the agent's privileged account.
pub const RUN_AS_AGENT: u8 = 0;

/// `runAsUser` value for the logged-in user, falling back to the agent.
pub const RUN_AS_USER: u8 = 1;

/// Reply text used when the agent returns neither output nor error.
pub const EMPTY_REPLY_TEXT: &str = "Command completed.";

/// Outbound run-command request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEnvelope {
    action: &'static str,
    #[serde(rename = "type")]
    kind: u8,
    cmds: String,
    #[serde(rename = "runAsUser")]
    run_as_user: u8,
    #[serde(rename = "responseid")]
    correlation_id: String,
    reply: bool,
}

impl CommandEnvelope {
    /// Build a run-command request that expects a reply.
    pub fn run_command(
        script: &str,
        run_as_privileged: bool,
        correlation_id: &CorrelationId,
    ) -> Self {
        Self {
            action: RUN_COMMANDS_ACTION,
            kind: RUN_COMMANDS_TYPE,
            cmds: script.to_string(),
            run_as_user: if run_as_privileged {
                RUN_AS_AGENT
            } else {
                RUN_AS_USER
            },
            correlation_id: correlation_id.as_str().to_string(),
            reply: true,
        }
    }

    pub fn script(&self) -> &str {
        &self.cmds
    }

    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId::from(self.correlation_id.as_str())
    }

    pub fn run_as_privileged(&self) -> bool {
        self.run_as_user == RUN_AS_AGENT
    }

    pub fn expects_reply(&self) -> bool {
        self.reply
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }
}

/// A run-command result delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub correlation_id: CorrelationId,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl CommandReply {
    /// Reply carrying command output.
    pub fn ok(correlation_id: impl Into<CorrelationId>, result: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    /// Reply carrying an agent-side error.
    pub fn err(correlation_id: impl Into<CorrelationId>, error: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Extract a reply from a raw agent message.
    ///
    /// Returns `None` for anything that is not a run-command reply with a
    /// string correlation id.
    pub fn from_agent_message(message: &Value) -> Option<Self> {
        let correlation_id = message.get("responseid")?.as_str()?;
        if message.get("action")?.as_str()? != "msg" {
            return None;
        }
        if message.get("type")?.as_str()? != RUN_COMMANDS_ACTION {
            return None;
        }

        let error = match message.get("error") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };

        Some(Self {
            correlation_id: CorrelationId::from(correlation_id),
            result: message
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string),
            error,
        })
    }

    /// Display text: trimmed output, else `Error: <error>`, else a fixed
    /// completion message.
    pub fn text(&self) -> String {
        if let Some(result) = self.result.as_deref().map(str::trim) {
            if !result.is_empty() {
                return result.to_string();
            }
        }
        match &self.error {
            Some(error) => format!("Error: {}", error),
            None => EMPTY_REPLY_TEXT.to_string(),
        }
    }

    /// True when the agent reported an error.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}
