//! Per-endpoint command dispatch.
//!
//! Guarantees at most one outstanding command per endpoint, keeps commands
//! for the same endpoint in submission order, and resolves every dispatched
//! command exactly once: by reply, by timeout, or by immediate failure.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       DispatchDaemon                          │
//! │                                                               │
//! │  DispatchHandle ──► DispatchQueue                             │
//! │                      ├─ node/a: [in flight] [queued] ...      │
//! │                      ├─ node/b: [retrying]                    │
//! │                      └─ timers: timeout / busy backoff        │
//! │                            │                                  │
//! │                            ├──► EndpointTransport::send       │
//! │                            └──► JobNotifier::notify           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies are classified once into a [`ReplyOutcome`]; a busy agent gets
//! linear backoff per [`BusyRetryPolicy`] before the job is failed.

mod daemon;
mod endpoint;
mod envelope;
mod error;
mod job;
mod notify;
mod outcome;
mod policy;
mod queue;
mod transport;

pub use daemon::{DispatchCommand, DispatchDaemon, DispatchHandle};
pub use endpoint::{EndpointId, NODE_PREFIX};
pub use envelope::{
    CommandEnvelope, CommandReply, EMPTY_REPLY_TEXT, RUN_AS_AGENT, RUN_AS_USER,
    RUN_COMMANDS_ACTION, RUN_COMMANDS_TYPE,
};
pub use error::{DispatchError, DispatchResult, TransportError};
pub use job::{ActionKind, CorrelationId, Job, JobId, JobStatus};
pub use notify::{ChannelNotifier, JobNotifier, JobUpdate, Severity, TracingNotifier};
pub use outcome::ReplyOutcome;
pub use policy::{
    BusyRetryPolicy, DispatchConfig, DEFAULT_BUSY_RETRY_DELAY_SECS, DEFAULT_CORRELATION_PREFIX,
    DEFAULT_JOB_TIMEOUT_SECS, DEFAULT_MAX_BUSY_RETRIES,
};
pub use queue::{DispatchQueue, DispatchStats, Timer};
pub use transport::{AgentRegistry, EndpointTransport};
