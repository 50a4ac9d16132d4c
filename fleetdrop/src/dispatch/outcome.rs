//! Classification of agent replies.
//!
//! The agent signals "already running something" only through free text, so
//! that match happens here once and everything downstream works with
//! [`ReplyOutcome`].

use std::sync::LazyLock;

use regex::Regex;

use super::envelope::CommandReply;

static BUSY_SIGNAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)already busy").expect("valid busy regex"));

/// What a reply means for its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The agent was occupied and did not run the command.
    Busy(String),
    /// The command ran and the agent reported no error.
    Completed(String),
    /// The agent reported an error.
    Failed(String),
}

impl ReplyOutcome {
    /// Classify a reply. The busy signal takes precedence over the error flag.
    pub fn classify(reply: &CommandReply) -> Self {
        let text = reply.text();
        if BUSY_SIGNAL.is_match(&text) {
            Self::Busy(text)
        } else if reply.has_error() {
            Self::Failed(text)
        } else {
            Self::Completed(text)
        }
    }

    /// Human-readable reply text.
    pub fn text(&self) -> &str {
        match self {
            Self::Busy(text) | Self::Completed(text) | Self::Failed(text) => text,
        }
    }
}
