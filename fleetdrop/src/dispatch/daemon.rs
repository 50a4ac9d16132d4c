//! Dispatch daemon: the single task that owns a [`DispatchQueue`].
//!
//! ```text
//! DispatchHandle ──(mpsc)──► DispatchDaemon ──► DispatchQueue ──► EndpointTransport
//!   enqueue                      │  ▲
//!   deliver_reply                │  └── DelayQueue timers (timeouts, busy backoff)
//!   stats                        ▼
//!                           JobNotifier
//! ```
//!
//! Callers never touch the queue directly; they send commands through a
//! cloneable [`DispatchHandle`]. Replies, timeouts and retries are all
//! handled on the daemon task, one at a time.
//!
//! # Example
//!
//! ```ignore
//! let (daemon, handle) = DispatchDaemon::new(config, transport, notifier);
//! let shutdown = CancellationToken::new();
//! tokio::spawn(daemon.run(shutdown.clone()));
//!
//! handle.enqueue(Job::new(endpoint, ActionKind::Custom, "hostname"))?;
//! // later, from the host's message handler:
//! handle.deliver_agent_message(&message)?;
//! ```

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::envelope::CommandReply;
use super::error::{DispatchError, DispatchResult};
use super::job::Job;
use super::notify::JobNotifier;
use super::policy::DispatchConfig;
use super::queue::{DispatchQueue, DispatchStats};
use super::transport::EndpointTransport;

/// Messages accepted by the daemon.
#[derive(Debug)]
pub enum DispatchCommand {
    Enqueue(Job),
    Reply(CommandReply),
    Stats(oneshot::Sender<DispatchStats>),
}

/// Owns the dispatch queue and processes its events.
pub struct DispatchDaemon {
    queue: DispatchQueue,
    command_rx: mpsc::UnboundedReceiver<DispatchCommand>,
}

impl DispatchDaemon {
    /// Create a daemon and the handle used to talk to it.
    pub fn new(
        config: DispatchConfig,
        transport: Arc<dyn EndpointTransport>,
        notifier: Arc<dyn JobNotifier>,
    ) -> (Self, DispatchHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let daemon = Self {
            queue: DispatchQueue::new(config, transport, notifier),
            command_rx,
        };
        (daemon, DispatchHandle { command_tx })
    }

    /// Run until `shutdown` is cancelled or every handle is dropped.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            job_timeout_secs = self.queue.config().job_timeout.as_secs(),
            max_busy_retries = self.queue.config().busy_retry.max_retries,
            "Dispatch daemon starting"
        );

        let Self {
            mut queue,
            mut command_rx,
        } = self;

        loop {
            let has_timers = queue.has_timers();
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Dispatch daemon shutting down");
                    break;
                }

                command = command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All dispatch handles dropped");
                        break;
                    };
                    match command {
                        DispatchCommand::Enqueue(job) => {
                            queue.enqueue(job);
                        }
                        DispatchCommand::Reply(reply) => {
                            queue.on_reply(reply);
                        }
                        DispatchCommand::Stats(tx) => {
                            let _ = tx.send(queue.stats());
                        }
                    }
                }

                Some(timer) = queue.next_expired(), if has_timers => {
                    queue.on_timer(timer);
                }
            }
        }

        let stats = queue.stats();
        if stats.in_flight > 0 || !stats.queued.is_empty() {
            info!(
                in_flight = stats.in_flight,
                endpoints = stats.queued.len(),
                "Dispatch daemon stopped with pending jobs"
            );
        }
    }
}

/// Cloneable sender side of a [`DispatchDaemon`].
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    command_tx: mpsc::UnboundedSender<DispatchCommand>,
}

impl DispatchHandle {
    /// Queue a job for its endpoint.
    pub fn enqueue(&self, job: Job) -> DispatchResult<()> {
        self.send(DispatchCommand::Enqueue(job))
    }

    /// Hand a parsed reply to the correlator.
    pub fn deliver_reply(&self, reply: CommandReply) -> DispatchResult<()> {
        self.send(DispatchCommand::Reply(reply))
    }

    /// Inspect a raw agent message and forward it if it is a command reply.
    ///
    /// Returns `Ok(false)` for messages that are not replies.
    pub fn deliver_agent_message(&self, message: &Value) -> DispatchResult<bool> {
        match CommandReply::from_agent_message(message) {
            Some(reply) => self.deliver_reply(reply).map(|()| true),
            None => Ok(false),
        }
    }

    /// Current queue occupancy.
    pub async fn stats(&self) -> DispatchResult<DispatchStats> {
        let (tx, rx) = oneshot::channel();
        self.send(DispatchCommand::Stats(tx))?;
        rx.await.map_err(|_| DispatchError::DaemonStopped)
    }

    fn send(&self, command: DispatchCommand) -> DispatchResult<()> {
        self.command_tx
            .send(command)
            .map_err(|_| DispatchError::DaemonStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::endpoint::EndpointId;
    use crate::dispatch::job::{ActionKind, JobStatus};
    use crate::dispatch::notify::{ChannelNotifier, JobUpdate};
    use crate::dispatch::queue::tests::MockTransport;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        handle: DispatchHandle,
        transport: Arc<MockTransport>,
        updates: mpsc::UnboundedReceiver<JobUpdate>,
        shutdown: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn(connected: &[&EndpointId], config: DispatchConfig) -> Harness {
        let transport = MockTransport::with_connected(connected);
        let (notifier, updates) = ChannelNotifier::new();
        let (daemon, handle) = DispatchDaemon::new(config, transport.clone(), Arc::new(notifier));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(daemon.run(shutdown.clone()));
        Harness {
            handle,
            transport,
            updates,
            shutdown,
            task,
        }
    }

    fn node(id: &str) -> EndpointId {
        EndpointId::parse(&format!("node/site/{}", id)).unwrap()
    }

    async fn next_status(updates: &mut mpsc::UnboundedReceiver<JobUpdate>) -> (JobStatus, String) {
        let update = updates.recv().await.unwrap();
        (update.status.unwrap(), update.text)
    }

    #[tokio::test]
    async fn test_scenario_offline_endpoint() {
        let a = node("a");
        let mut h = spawn(&[], DispatchConfig::default());

        h.handle
            .enqueue(Job::new(a.clone(), ActionKind::Deploy, "install"))
            .unwrap();
        let stats = h.handle.stats().await.unwrap();

        assert_eq!(
            next_status(&mut h.updates).await,
            (JobStatus::Failed, "Agent offline".to_string())
        );
        assert_eq!(stats.depth(&a), 0);
        assert_eq!(h.transport.sent_count(), 0);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_scenario_second_job_waits_for_reply() {
        let a = node("a");
        let mut h = spawn(&[&a], DispatchConfig::default());

        h.handle.enqueue(Job::new(a.clone(), ActionKind::Custom, "a")).unwrap();
        h.handle.enqueue(Job::new(a.clone(), ActionKind::Custom, "b")).unwrap();
        let stats = h.handle.stats().await.unwrap();
        assert_eq!(stats.depth(&a), 2);
        assert_eq!(h.transport.sent_count(), 1);

        let reply = json!({
            "action": "msg",
            "type": "runcommands",
            "responseid": h.transport.last_correlation_id().as_str(),
            "result": "ok",
        });
        assert!(h.handle.deliver_agent_message(&reply).unwrap());
        h.handle.stats().await.unwrap();
        assert_eq!(h.transport.sent_count(), 2);

        let statuses = [
            next_status(&mut h.updates).await.0,
            next_status(&mut h.updates).await.0,
            next_status(&mut h.updates).await.0,
            next_status(&mut h.updates).await.0,
        ];
        assert_eq!(
            statuses,
            [
                JobStatus::InFlight,
                JobStatus::Queued,
                JobStatus::Succeeded,
                JobStatus::InFlight
            ]
        );

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_reply_messages_are_not_forwarded() {
        let h = spawn(&[], DispatchConfig::default());
        let message = json!({"action": "msg", "type": "console", "value": "hi"});
        assert!(!h.handle.deliver_agent_message(&message).unwrap());
        h.shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_busy_retries_with_linear_backoff() {
        let a = node("a");
        let mut h = spawn(&[&a], DispatchConfig::default());
        h.handle.enqueue(Job::new(a.clone(), ActionKind::Deploy, "x")).unwrap();
        assert_eq!(next_status(&mut h.updates).await.0, JobStatus::InFlight);

        for retry in 1..=3u64 {
            let cid = h.transport.last_correlation_id();
            h.handle
                .deliver_reply(CommandReply::ok(cid, "Agent already busy"))
                .unwrap();
            assert_eq!(
                next_status(&mut h.updates).await,
                (
                    JobStatus::Retrying,
                    format!("Agent busy, retrying in {} seconds.", 4 * retry)
                )
            );
            // Re-dispatch happens once the backoff elapses.
            assert_eq!(next_status(&mut h.updates).await.0, JobStatus::InFlight);
            assert_eq!(h.transport.sent_count() as u64, retry + 1);
        }

        let cid = h.transport.last_correlation_id();
        h.handle
            .deliver_reply(CommandReply::ok(cid, "Agent already busy"))
            .unwrap();
        let (status, text) = next_status(&mut h.updates).await;
        assert_eq!(status, JobStatus::Failed);
        assert!(text.contains("exceeded retry budget"));

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_timeout_dispatches_next() {
        let a = node("a");
        let config = DispatchConfig::default().with_job_timeout(Duration::from_secs(60));
        let mut h = spawn(&[&a], config);

        h.handle.enqueue(Job::new(a.clone(), ActionKind::Custom, "a")).unwrap();
        h.handle.enqueue(Job::new(a.clone(), ActionKind::Custom, "b")).unwrap();
        assert_eq!(next_status(&mut h.updates).await.0, JobStatus::InFlight);
        assert_eq!(next_status(&mut h.updates).await.0, JobStatus::Queued);

        assert_eq!(
            next_status(&mut h.updates).await,
            (
                JobStatus::TimedOut,
                "Command timed out after 60 seconds.".to_string()
            )
        );
        assert_eq!(next_status(&mut h.updates).await.0, JobStatus::InFlight);
        assert_eq!(h.transport.sent_count(), 2);

        h.shutdown.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let h = spawn(&[], DispatchConfig::default());
        h.shutdown.cancel();
        h.task.await.unwrap();

        assert_eq!(
            h.handle.stats().await.unwrap_err(),
            DispatchError::DaemonStopped
        );
    }
}
