//! In-process broker implementing the consumer-group traits.
//!
//! Topics are vectors of partitions, partitions are append-only vectors of
//! messages, and committed offsets are tracked per (group, topic, partition).
//! A session hands out one claim per partition of the subscribed topics;
//! claims replay from the committed offset and then wait for new messages
//! until the session ends. Auto-commit applies marks immediately, so a
//! manual-commit group is the only one that can observe redelivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use microbatch_core::InitialOffset;

use crate::consumer::{
    BrokerMessage, ConsumerGroup, ConsumerGroupHandler, GroupConnector, GroupSession,
    GroupSettings, PartitionClaim, RecordHeader,
};
use crate::error::QueueError;

type OffsetKey = (String, String, i32);

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<BrokerMessage>>>,
    committed: HashMap<OffsetKey, i64>,
    live_sessions: Vec<CancellationToken>,
    generation: i32,
    failing_commits: usize,
    commits: usize,
}

struct Inner {
    state: Mutex<State>,
    appended: Notify,
}

/// Shared handle to an in-memory broker. Clones see the same data.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `topic` with `partitions` partitions. Existing topics are kept.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        self.state()
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    /// Append a message and return its offset.
    pub fn produce(
        &self,
        topic: &str,
        partition: i32,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        headers: Vec<RecordHeader>,
    ) -> Result<i64, QueueError> {
        let offset = {
            let mut state = self.state();
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|parts| usize::try_from(partition).ok().and_then(|p| parts.get_mut(p)))
                .ok_or_else(|| QueueError::Consume(format!("unknown partition {topic}/{partition}")))?;
            let offset = log.len() as i64;
            log.push(BrokerMessage {
                topic: topic.to_string(),
                partition,
                offset,
                key: key.into(),
                value: value.into(),
                headers,
                timestamp: Utc::now(),
            });
            offset
        };
        self.inner.appended.notify_waiters();
        Ok(offset)
    }

    pub fn partitions(&self, topic: &str) -> usize {
        self.state().topics.get(topic).map_or(0, Vec::len)
    }

    /// Offset the next produced message on the partition will get.
    pub fn high_water_mark(&self, topic: &str, partition: i32) -> i64 {
        self.state()
            .topics
            .get(topic)
            .and_then(|parts| usize::try_from(partition).ok().and_then(|p| parts.get(p)))
            .map_or(0, |log| log.len() as i64)
    }

    /// Next offset `group` will read from after a restart, if ever committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Number of successful explicit commits across all groups.
    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    /// Make the next `n` explicit commits fail.
    pub fn fail_next_commits(&self, n: usize) {
        self.state().failing_commits = n;
    }

    /// End every live session, as a membership change would.
    pub fn rebalance(&self) {
        let sessions = std::mem::take(&mut self.state().live_sessions);
        info!(sessions = sessions.len(), "memory broker rebalancing");
        for token in sessions {
            token.cancel();
        }
    }

    fn message_at(&self, topic: &str, partition: i32, offset: i64) -> Option<BrokerMessage> {
        let state = self.state();
        let log = state.topics.get(topic)?.get(usize::try_from(partition).ok()?)?;
        log.get(usize::try_from(offset).ok()?).cloned()
    }

    fn store_offsets(&self, group: &str, marks: &HashMap<(String, i32), i64>) {
        let mut state = self.state();
        for ((topic, partition), offset) in marks {
            let slot = state
                .committed
                .entry((group.to_string(), topic.clone(), *partition))
                .or_insert(*offset);
            *slot = (*slot).max(*offset);
        }
    }
}

#[async_trait]
impl GroupConnector for MemoryBroker {
    async fn connect(
        &self,
        group: &str,
        settings: &GroupSettings,
    ) -> Result<Arc<dyn ConsumerGroup>, QueueError> {
        if group.is_empty() {
            return Err(QueueError::Connection("empty consumer group name".into()));
        }
        debug!(group, client_id = %settings.client_id, auto_commit = settings.auto_commit, "memory group joined");
        Ok(Arc::new(MemoryGroup {
            broker: self.clone(),
            group: group.to_string(),
            settings: settings.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryGroup {
    broker: MemoryBroker,
    group: String,
    settings: GroupSettings,
    closed: AtomicBool,
}

#[async_trait]
impl ConsumerGroup for MemoryGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Consume("consumer group closed".into()));
        }

        let token = cancel.child_token();
        let generation = {
            let mut state = self.broker.state();
            state.generation += 1;
            state.live_sessions.push(token.clone());
            state.generation
        };

        let session = Arc::new(MemorySession {
            broker: self.broker.clone(),
            group: self.group.clone(),
            member_id: Uuid::new_v4().to_string(),
            generation,
            auto_commit: self.settings.auto_commit,
            marks: Mutex::new(HashMap::new()),
            token: token.clone(),
            closed: AtomicBool::new(false),
        });
        let session_dyn: Arc<dyn GroupSession> = session.clone();

        let result = self.run_session(&session_dyn, &token, topics, &handler).await;

        token.cancel();
        session.closed.store(true, Ordering::SeqCst);
        self.broker.state().live_sessions.retain(|t| !t.is_cancelled());
        if self.settings.auto_commit {
            session.flush_marks();
        }
        result
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl MemoryGroup {
    async fn run_session(
        &self,
        session: &Arc<dyn GroupSession>,
        token: &CancellationToken,
        topics: &[String],
        handler: &Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), QueueError> {
        let mut assigned = Vec::new();
        for topic in topics {
            let partitions = self.broker.partitions(topic);
            if partitions == 0 {
                warn!(topic = %topic, "subscribed topic does not exist");
            }
            assigned.extend((0..partitions as i32).map(|partition| (topic, partition)));
        }
        if assigned.is_empty() {
            return Err(QueueError::Consume(format!(
                "no partitions assigned for topics {topics:?}"
            )));
        }

        handler.setup(session).await?;

        let mut claims = JoinSet::new();
        for (topic, partition) in assigned {
            let start = match self.broker.committed_offset(&self.group, topic, partition) {
                Some(offset) => offset,
                None => match self.settings.initial_offset {
                    InitialOffset::Oldest => 0,
                    InitialOffset::Newest => self.broker.high_water_mark(topic, partition),
                },
            };
            let claim = MemoryClaim {
                broker: self.broker.clone(),
                topic: topic.clone(),
                partition,
                initial_offset: start,
                next_offset: start,
                token: token.clone(),
            };
            let handler = handler.clone();
            let session = session.clone();
            claims.spawn(async move { handler.consume_claim(session, Box::new(claim)).await });
        }

        let mut result = Ok(());
        while let Some(joined) = claims.join_next().await {
            let outcome = joined.map_err(|e| QueueError::Consume(format!("claim task failed: {e}")));
            if let Err(e) = outcome.and_then(|r| r) {
                warn!(group = %self.group, error = %e, "claim ended with error");
                if result.is_ok() {
                    // First failure ends the session for every other claim.
                    token.cancel();
                    result = Err(e);
                }
            }
        }

        handler.cleanup(session).await?;
        result
    }
}

struct MemorySession {
    broker: MemoryBroker,
    group: String,
    member_id: String,
    generation: i32,
    auto_commit: bool,
    marks: Mutex<HashMap<(String, i32), i64>>,
    token: CancellationToken,
    // Set once cleanup has run; later commits belong to a dead generation.
    closed: AtomicBool,
}

impl MemorySession {
    fn marks(&self) -> MutexGuard<'_, HashMap<(String, i32), i64>> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_marks(&self) {
        let marks = self.marks().clone();
        self.broker.store_offsets(&self.group, &marks);
    }
}

#[async_trait]
impl GroupSession for MemorySession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation_id(&self) -> i32 {
        self.generation
    }

    fn mark_message(&self, message: &BrokerMessage, _metadata: &str) {
        let next = message.offset + 1;
        {
            let mut marks = self.marks();
            let slot = marks
                .entry((message.topic.clone(), message.partition))
                .or_insert(next);
            *slot = (*slot).max(next);
        }
        if self.auto_commit {
            self.flush_marks();
        }
    }

    async fn commit(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Commit(format!(
                "session generation {} has ended",
                self.generation
            )));
        }
        {
            let mut state = self.broker.state();
            if state.failing_commits > 0 {
                state.failing_commits -= 1;
                return Err(QueueError::Commit("broker rejected offset commit".into()));
            }
            state.commits += 1;
        }
        self.flush_marks();
        Ok(())
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.token
    }
}

struct MemoryClaim {
    broker: MemoryBroker,
    topic: String,
    partition: i32,
    initial_offset: i64,
    next_offset: i64,
    token: CancellationToken,
}

#[async_trait]
impl PartitionClaim for MemoryClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    fn high_water_mark_offset(&self) -> i64 {
        self.broker.high_water_mark(&self.topic, self.partition)
    }

    async fn next_message(&mut self) -> Option<BrokerMessage> {
        loop {
            let appended = self.broker.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(message) = self.broker.message_at(&self.topic, self.partition, self.next_offset) {
                self.next_offset += 1;
                return Some(message);
            }

            tokio::select! {
                () = self.token.cancelled() => return None,
                () = &mut appended => {}
            }
        }
    }
}
