//! Per-endpoint FIFO dispatch with reply correlation.
//!
//! Each endpoint has its own queue; the job at the front is the active one.
//! It is either in flight (waiting for a reply or its timeout) or waiting
//! out a busy backoff. Everything behind it waits. Every way a job can end
//! (offline, send failure, reply, timeout, spent retries) goes through
//! [`DispatchQueue::finish`], which pops the job and dispatches the next.
//!
//! ```text
//! enqueue ──► [front | job | job]      endpoint A
//!               │
//!               ├─ offline / send error ─► Failed ──► next
//!               └─ sent ─► InFlight ─┬─ reply ok/err ─► Succeeded/Failed ──► next
//!                                    ├─ reply busy ──► Retrying ─(delay)─► InFlight
//!                                    └─ timeout ─────► TimedOut ──► next
//! ```
//!
//! The queue is plain owned state. It is driven by exactly one task (see
//! [`DispatchDaemon`](super::DispatchDaemon)), so a reply and a timeout for
//! the same job can never be handled at the same time: whichever is handled
//! first removes the in-flight record and the other becomes a no-op.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, warn};

use super::endpoint::EndpointId;
use super::envelope::{CommandEnvelope, CommandReply};
use super::job::{CorrelationId, Job, JobId, JobStatus};
use super::notify::{JobNotifier, JobUpdate, Severity};
use super::outcome::ReplyOutcome;
use super::policy::DispatchConfig;
use super::transport::EndpointTransport;

/// A scheduled wake-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timer {
    /// The in-flight attempt with this correlation id ran out of time.
    Timeout(CorrelationId),
    /// The busy backoff for this endpoint's front job has elapsed.
    Retry(EndpointId),
}

#[derive(Debug)]
struct InFlight {
    endpoint: EndpointId,
    timeout_key: Key,
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    /// Jobs per endpoint, including the active one.
    pub queued: BTreeMap<String, usize>,
    /// Attempts awaiting a reply or timeout.
    pub in_flight: usize,
}

impl DispatchStats {
    /// Depth of one endpoint's queue (zero if it has none).
    pub fn depth(&self, endpoint: &EndpointId) -> usize {
        self.queued.get(endpoint.as_str()).copied().unwrap_or(0)
    }
}

/// Dispatch state for one domain.
pub struct DispatchQueue {
    config: DispatchConfig,
    transport: Arc<dyn EndpointTransport>,
    notifier: Arc<dyn JobNotifier>,
    queues: HashMap<EndpointId, VecDeque<Job>>,
    in_flight: HashMap<CorrelationId, InFlight>,
    timers: DelayQueue<Timer>,
    next_job_id: u64,
}

impl DispatchQueue {
    pub fn new(
        config: DispatchConfig,
        transport: Arc<dyn EndpointTransport>,
        notifier: Arc<dyn JobNotifier>,
    ) -> Self {
        Self {
            config,
            transport,
            notifier,
            queues: HashMap::new(),
            in_flight: HashMap::new(),
            timers: DelayQueue::new(),
            next_job_id: 1,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Append a job to its endpoint's queue, dispatching it if the queue was
    /// empty.
    pub fn enqueue(&mut self, mut job: Job) -> JobId {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        job.id = id;

        let endpoint = job.endpoint.clone();
        let queue = self.queues.entry(endpoint.clone()).or_default();
        queue.push_back(job);

        if queue.len() == 1 {
            self.dispatch_front(&endpoint);
        } else if let Some(job) = queue.back() {
            let text = format!("Queued {} (waiting for previous job)", job.action);
            self.notifier
                .notify(JobUpdate::for_job(job, JobStatus::Queued, Severity::Info, text));
        }
        id
    }

    /// Resolve an in-flight attempt. Returns false for unknown correlation
    /// ids, which covers replies that arrive after their timeout.
    pub fn on_reply(&mut self, reply: CommandReply) -> bool {
        let Some(entry) = self.in_flight.remove(&reply.correlation_id) else {
            debug!(
                correlation_id = %reply.correlation_id,
                "Ignoring reply with unknown correlation id"
            );
            return false;
        };
        self.timers.remove(&entry.timeout_key);

        let endpoint = entry.endpoint;
        let policy = self.config.busy_retry;
        let Some(job) = self.queues.get_mut(&endpoint).and_then(VecDeque::front_mut) else {
            warn!(endpoint = %endpoint, "Reply for endpoint without an active job");
            return true;
        };
        job.correlation_id = None;

        let (status, level, text) = match ReplyOutcome::classify(&reply) {
            ReplyOutcome::Busy(text) => match policy.delay_for_retry(job.retries + 1) {
                Some(delay) => {
                    job.retries += 1;
                    debug!(
                        endpoint = %endpoint,
                        retries = job.retries,
                        reply = %text,
                        "Endpoint busy"
                    );
                    let text = format!("Agent busy, retrying in {} seconds.", delay.as_secs());
                    self.notifier.notify(JobUpdate::for_job(
                        job,
                        JobStatus::Retrying,
                        Severity::Warn,
                        text,
                    ));
                    self.timers.insert(Timer::Retry(endpoint), delay);
                    return true;
                }
                None => (
                    JobStatus::Failed,
                    Severity::Error,
                    format!(
                        "Agent busy - exceeded retry budget after {} attempts.",
                        job.retries
                    ),
                ),
            },
            ReplyOutcome::Completed(text) => (JobStatus::Succeeded, Severity::Info, text),
            ReplyOutcome::Failed(text) => (JobStatus::Failed, Severity::Error, text),
        };

        self.notifier.notify(JobUpdate::for_job(job, status, level, text));
        self.finish(&endpoint);
        true
    }

    /// Handle an expired timer.
    pub fn on_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Timeout(correlation_id) => {
                let Some(entry) = self.in_flight.remove(&correlation_id) else {
                    return;
                };
                let endpoint = entry.endpoint;
                if let Some(job) = self.queues.get_mut(&endpoint).and_then(VecDeque::front_mut) {
                    job.correlation_id = None;
                    let text = format!(
                        "Command timed out after {} seconds.",
                        self.config.job_timeout.as_secs()
                    );
                    self.notifier.notify(JobUpdate::for_job(
                        job,
                        JobStatus::TimedOut,
                        Severity::Error,
                        text,
                    ));
                }
                self.finish(&endpoint);
            }
            Timer::Retry(endpoint) => self.dispatch_front(&endpoint),
        }
    }

    /// Wait for the next timer to expire. Resolves to `None` when no timers
    /// are pending.
    pub async fn next_expired(&mut self) -> Option<Timer> {
        std::future::poll_fn(|cx| self.timers.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }

    /// True while any timeout or retry timer is pending.
    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// True when no endpoint has queued work.
    pub fn is_idle(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            queued: self
                .queues
                .iter()
                .map(|(endpoint, queue)| (endpoint.to_string(), queue.len()))
                .collect(),
            in_flight: self.in_flight.len(),
        }
    }

    fn finish(&mut self, endpoint: &EndpointId) {
        if let Some(queue) = self.queues.get_mut(endpoint) {
            queue.pop_front();
        }
        self.dispatch_front(endpoint);
    }

    /// Send the front job for `endpoint`. Jobs that fail immediately are
    /// finalized and the next one is tried, until one is in flight or the
    /// queue is empty.
    fn dispatch_front(&mut self, endpoint: &EndpointId) {
        loop {
            let Some(job) = self.queues.get_mut(endpoint).and_then(VecDeque::front_mut) else {
                self.queues.remove(endpoint);
                return;
            };

            if job.node_name.is_none() {
                job.node_name = self.transport.display_name(endpoint);
            }

            if !self.transport.is_connected(endpoint) {
                self.notifier.notify(JobUpdate::for_job(
                    job,
                    JobStatus::Failed,
                    Severity::Error,
                    "Agent offline",
                ));
                if let Some(queue) = self.queues.get_mut(endpoint) {
                    queue.pop_front();
                }
                continue;
            }

            let correlation_id = loop {
                let candidate = CorrelationId::generate(&self.config.correlation_prefix);
                if !self.in_flight.contains_key(&candidate) {
                    break candidate;
                }
            };
            let envelope =
                CommandEnvelope::run_command(&job.script, job.run_as_privileged, &correlation_id);

            match self.transport.send(endpoint, &envelope) {
                Ok(()) => {
                    let timeout_key = self
                        .timers
                        .insert(Timer::Timeout(correlation_id.clone()), self.config.job_timeout);
                    job.started_at.get_or_insert_with(Instant::now);
                    job.correlation_id = Some(correlation_id.clone());
                    debug!(
                        endpoint = %endpoint,
                        job = %job.id,
                        correlation_id = %correlation_id,
                        retries = job.retries,
                        "Command dispatched"
                    );
                    self.notifier.notify(JobUpdate::for_job(
                        job,
                        JobStatus::InFlight,
                        Severity::Info,
                        "Command dispatched",
                    ));
                    self.in_flight.insert(
                        correlation_id,
                        InFlight {
                            endpoint: endpoint.clone(),
                            timeout_key,
                        },
                    );
                    return;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Command send failed");
                    self.notifier.notify(JobUpdate::for_job(
                        job,
                        JobStatus::Failed,
                        Severity::Error,
                        format!("Failed to dispatch command: {}", e),
                    ));
                    if let Some(queue) = self.queues.get_mut(endpoint) {
                        queue.pop_front();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatch::error::TransportError;
    use crate::dispatch::job::ActionKind;
    use crate::dispatch::notify::ChannelNotifier;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Transport double recording every envelope it is asked to send.
    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub connected: Mutex<HashSet<EndpointId>>,
        pub rejecting: Mutex<HashSet<EndpointId>>,
        pub sent: Mutex<Vec<(EndpointId, CommandEnvelope)>>,
    }

    impl MockTransport {
        pub fn with_connected(endpoints: &[&EndpointId]) -> Arc<Self> {
            let transport = Self::default();
            transport
                .connected
                .lock()
                .extend(endpoints.iter().map(|e| (*e).clone()));
            Arc::new(transport)
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }

        pub fn last_correlation_id(&self) -> CorrelationId {
            self.sent.lock().last().unwrap().1.correlation_id()
        }
    }

    impl EndpointTransport for MockTransport {
        fn is_connected(&self, endpoint: &EndpointId) -> bool {
            self.connected.lock().contains(endpoint)
        }

        fn display_name(&self, endpoint: &EndpointId) -> Option<String> {
            Some(format!("host-{}", endpoint.as_str().rsplit('/').next().unwrap_or("")))
        }

        fn send(
            &self,
            endpoint: &EndpointId,
            envelope: &CommandEnvelope,
        ) -> Result<(), TransportError> {
            if self.rejecting.lock().contains(endpoint) {
                return Err(TransportError::SendFailed("socket closed".to_string()));
            }
            self.sent.lock().push((endpoint.clone(), envelope.clone()));
            Ok(())
        }
    }

    fn node(id: &str) -> EndpointId {
        EndpointId::parse(&format!("node/site/{}", id)).unwrap()
    }

    fn queue_with(
        transport: Arc<MockTransport>,
        config: DispatchConfig,
    ) -> (DispatchQueue, mpsc::UnboundedReceiver<JobUpdate>) {
        let (notifier, rx) = ChannelNotifier::new();
        (DispatchQueue::new(config, transport, Arc::new(notifier)), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<JobUpdate>) -> Vec<JobUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn test_offline_endpoint_fails_immediately() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[]);
        let (mut queue, mut rx) = queue_with(transport.clone(), DispatchConfig::default());

        queue.enqueue(Job::new(a.clone(), ActionKind::Deploy, "install"));

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, Some(JobStatus::Failed));
        assert_eq!(updates[0].text, "Agent offline");
        assert_eq!(updates[0].node_name.as_deref(), Some("host-a"));
        assert_eq!(transport.sent_count(), 0);
        assert!(queue.is_idle());
        assert!(!queue.has_timers());
    }

    #[tokio::test]
    async fn test_offline_front_advances_to_next() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[]);
        let (mut queue, mut rx) = queue_with(transport.clone(), DispatchConfig::default());

        // Hold the queue open with an in-flight job, then drop the connection.
        transport.connected.lock().insert(a.clone());
        queue.enqueue(Job::new(a.clone(), ActionKind::Deploy, "first"));
        queue.enqueue(Job::new(a.clone(), ActionKind::Deploy, "second"));
        queue.enqueue(Job::new(a.clone(), ActionKind::Undeploy, "third"));
        transport.connected.lock().clear();

        let cid = transport.last_correlation_id();
        assert!(queue.on_reply(CommandReply::ok(cid, "done")));

        let statuses: Vec<_> = drain(&mut rx).into_iter().filter_map(|u| u.status).collect();
        assert_eq!(
            statuses,
            vec![
                JobStatus::InFlight,
                JobStatus::Queued,
                JobStatus::Queued,
                JobStatus::Succeeded,
                JobStatus::Failed,
                JobStatus::Failed,
            ]
        );
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_fifo_one_in_flight_per_endpoint() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[&a]);
        let (mut queue, mut rx) = queue_with(transport.clone(), DispatchConfig::default());

        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "job-a"));
        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "job-b"));
        assert_eq!(transport.sent_count(), 1);
        assert_eq!(queue.stats().depth(&a), 2);
        assert_eq!(queue.stats().in_flight, 1);

        let queued = drain(&mut rx);
        assert_eq!(queued[1].status, Some(JobStatus::Queued));
        assert_eq!(queued[1].text, "Queued custom (waiting for previous job)");

        let first = transport.last_correlation_id();
        assert!(queue.on_reply(CommandReply::ok(first.clone(), "ok")));
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(transport.sent.lock()[1].1.script(), "job-b");
        assert_ne!(transport.last_correlation_id(), first);

        let updates = drain(&mut rx);
        assert_eq!(updates[0].status, Some(JobStatus::Succeeded));
        assert_eq!(updates[0].text, "ok");
        assert_eq!(updates[1].status, Some(JobStatus::InFlight));
    }

    #[tokio::test]
    async fn test_endpoints_are_independent() {
        let a = node("a");
        let b = node("b");
        let transport = MockTransport::with_connected(&[&a, &b]);
        let (mut queue, _rx) = queue_with(transport.clone(), DispatchConfig::default());

        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "a1"));
        queue.enqueue(Job::new(b.clone(), ActionKind::Custom, "b1"));
        assert_eq!(transport.sent_count(), 2);
        assert_eq!(queue.stats().in_flight, 2);
    }

    #[tokio::test]
    async fn test_send_failure_finalizes_and_advances() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[&a]);
        transport.rejecting.lock().insert(a.clone());
        let (mut queue, mut rx) = queue_with(transport.clone(), DispatchConfig::default());

        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "x"));

        let updates = drain(&mut rx);
        assert_eq!(updates[0].status, Some(JobStatus::Failed));
        assert_eq!(updates[0].text, "Failed to dispatch command: socket closed");
        assert!(queue.is_idle());
        assert!(!queue.has_timers());
    }

    #[tokio::test]
    async fn test_unknown_reply_is_ignored() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[&a]);
        let (mut queue, _rx) = queue_with(transport.clone(), DispatchConfig::default());
        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "x"));

        assert!(!queue.on_reply(CommandReply::ok("nope", "ok")));
        assert_eq!(queue.stats().in_flight, 1);
    }

    #[tokio::test]
    async fn test_agent_error_fails_job() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[&a]);
        let (mut queue, mut rx) = queue_with(transport.clone(), DispatchConfig::default());
        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "x"));
        drain(&mut rx);

        queue.on_reply(CommandReply::err(transport.last_correlation_id(), "access denied"));
        let updates = drain(&mut rx);
        assert_eq!(updates[0].status, Some(JobStatus::Failed));
        assert_eq!(updates[0].level, Severity::Error);
        assert_eq!(updates[0].text, "Error: access denied");
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_retries_then_exhausts_budget() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[&a]);
        let (mut queue, mut rx) = queue_with(transport.clone(), DispatchConfig::default());
        let job_id = queue.enqueue(Job::new(a.clone(), ActionKind::Deploy, "install"));
        drain(&mut rx);

        let mut seen = HashSet::new();
        for retry in 1..=3u64 {
            let cid = transport.last_correlation_id();
            assert!(seen.insert(cid.clone()));
            let before = tokio::time::Instant::now();

            queue.on_reply(CommandReply::ok(cid, "Agent already busy"));
            let update = drain(&mut rx).remove(0);
            assert_eq!(update.status, Some(JobStatus::Retrying));
            assert_eq!(update.job_id, Some(job_id));
            assert_eq!(
                update.text,
                format!("Agent busy, retrying in {} seconds.", 4 * retry)
            );
            assert_eq!(queue.stats().in_flight, 0);

            let timer = queue.next_expired().await.unwrap();
            assert_eq!(timer, Timer::Retry(a.clone()));
            assert!(before.elapsed() >= Duration::from_secs(4 * retry));
            queue.on_timer(timer);
            assert_eq!(transport.sent_count() as u64, retry + 1);
            drain(&mut rx);
        }

        queue.on_reply(CommandReply::ok(transport.last_correlation_id(), "already busy"));
        let update = drain(&mut rx).remove(0);
        assert_eq!(update.status, Some(JobStatus::Failed));
        assert_eq!(
            update.text,
            "Agent busy - exceeded retry budget after 3 attempts."
        );
        assert!(queue.is_idle());
        assert!(!queue.has_timers());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_advances_queue_and_late_reply_is_ignored() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[&a]);
        let config = DispatchConfig::default().with_job_timeout(Duration::from_secs(30));
        let (mut queue, mut rx) = queue_with(transport.clone(), config);

        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "slow"));
        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "next"));
        let first = transport.last_correlation_id();
        drain(&mut rx);

        let timer = queue.next_expired().await.unwrap();
        assert_eq!(timer, Timer::Timeout(first.clone()));
        queue.on_timer(timer);

        let updates = drain(&mut rx);
        assert_eq!(updates[0].status, Some(JobStatus::TimedOut));
        assert_eq!(updates[0].text, "Command timed out after 30 seconds.");
        assert_eq!(updates[1].status, Some(JobStatus::InFlight));
        assert_eq!(transport.sent_count(), 2);

        assert!(!queue.on_reply(CommandReply::ok(first, "too late")));
        assert_eq!(queue.stats().depth(&a), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_cancels_timeout() {
        let a = node("a");
        let transport = MockTransport::with_connected(&[&a]);
        let (mut queue, _rx) = queue_with(transport.clone(), DispatchConfig::default());
        queue.enqueue(Job::new(a.clone(), ActionKind::Custom, "x"));
        assert!(queue.has_timers());

        queue.on_reply(CommandReply::ok(transport.last_correlation_id(), "ok"));
        assert!(!queue.has_timers());
        assert_eq!(queue.next_expired().await, None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Enqueue(usize),
            Reply(usize, bool),
            Connect(usize, bool),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..3).prop_map(Op::Enqueue),
                (0usize..8, any::<bool>()).prop_map(|(i, busy)| Op::Reply(i, busy)),
                (0usize..3, any::<bool>()).prop_map(|(i, up)| Op::Connect(i, up)),
            ]
        }

        proptest! {
            #[test]
            fn prop_at_most_one_in_flight_per_endpoint(ops in prop::collection::vec(op(), 1..60)) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .start_paused(true)
                    .build()
                    .unwrap();
                let _guard = rt.enter();

                let endpoints: Vec<_> = ["a", "b", "c"].iter().map(|id| node(id)).collect();
                let transport =
                    MockTransport::with_connected(&endpoints.iter().collect::<Vec<_>>());
                let (mut queue, _rx) = queue_with(transport.clone(), DispatchConfig::default());

                for op in ops {
                    match op {
                        Op::Enqueue(i) => {
                            queue.enqueue(Job::new(endpoints[i].clone(), ActionKind::Custom, "x"));
                        }
                        Op::Reply(i, busy) => {
                            let sent = transport.sent.lock().clone();
                            if let Some((_, envelope)) = sent.get(i % sent.len().max(1)) {
                                let text = if busy { "already busy" } else { "ok" };
                                queue.on_reply(CommandReply::ok(envelope.correlation_id(), text));
                            }
                        }
                        Op::Connect(i, up) => {
                            if up {
                                transport.connected.lock().insert(endpoints[i].clone());
                            } else {
                                transport.connected.lock().remove(&endpoints[i]);
                            }
                        }
                    }

                    let mut per_endpoint: HashMap<EndpointId, usize> = HashMap::new();
                    for entry in queue.in_flight.values() {
                        *per_endpoint.entry(entry.endpoint.clone()).or_default() += 1;
                    }
                    prop_assert!(per_endpoint.values().all(|n| *n <= 1));
                    for endpoint in per_endpoint.keys() {
                        prop_assert!(queue.queues.get(endpoint).is_some_and(|q| !q.is_empty()));
                    }
                    prop_assert!(queue.queues.values().all(|q| !q.is_empty()));
                }
            }
        }
    }
}
