//! Consumer-group binding that feeds claimed messages through an
//! [`Aggregator`] and hands them to a user callback in batches.
//!
//! Two delivery modes exist:
//!
//! - **Best effort**: messages are marked as soon as they are queued and the
//!   broker client auto-commits. A failing callback loses its batch.
//! - **Consistency**: a single worker processes batches in order and commits
//!   the session only after the callback succeeded. Failed batches are
//!   redelivered after the next rebalance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use microbatch_core::{BatchConsumerConfig, Environment, KafkaConfig, LogConfig};

use crate::aggregator::{Aggregator, BatchProcessor};
use crate::consumer::{
    BrokerMessage, ConsumerGroup, ConsumerGroupHandler, GroupConnector, GroupSession,
    GroupSettings, PartitionClaim,
};
use crate::context::{log_value, BatchContext};
use crate::error::{EnqueueError, QueueError};

const CONSUME_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// User batch callback, boxed.
pub type BatchCallback =
    Arc<dyn Fn(BatchContext, Vec<BrokerMessage>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn boxed_callback<F, Fut>(callback: F) -> BatchCallback
where
    F: Fn(BatchContext, Vec<BrokerMessage>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, messages| Box::pin(callback(ctx, messages)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    BestEffort,
    Consistency,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::BestEffort => "best_effort",
            DeliveryMode::Consistency => "consistency",
        }
    }

    fn auto_commit(self) -> bool {
        self == DeliveryMode::BestEffort
    }
}

/// A broker message together with the session that claimed it.
#[derive(Clone)]
pub struct ClaimedMessage {
    pub cancel: CancellationToken,
    pub session: Arc<dyn GroupSession>,
    pub message: BrokerMessage,
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct BatchConsumerBuilder {
    connector: Arc<dyn GroupConnector>,
    config: BatchConsumerConfig,
    kafka: KafkaConfig,
    log: LogConfig,
    environment: Environment,
}

impl BatchConsumerBuilder {
    pub fn kafka(mut self, kafka: KafkaConfig) -> Self {
        self.kafka = kafka;
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Mark-on-enqueue delivery with `pool_size` workers.
    pub fn best_effort<F, Fut>(self, callback: F) -> BatchConsumer
    where
        F: Fn(BatchContext, Vec<BrokerMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finish(DeliveryMode::BestEffort, boxed_callback(callback))
    }

    /// Commit-after-success delivery with a single worker.
    pub fn consistency<F, Fut>(self, callback: F) -> BatchConsumer
    where
        F: Fn(BatchContext, Vec<BrokerMessage>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.finish(DeliveryMode::Consistency, boxed_callback(callback))
    }

    fn finish(self, mode: DeliveryMode, callback: BatchCallback) -> BatchConsumer {
        BatchConsumer {
            connector: self.connector,
            config: self.config,
            kafka: self.kafka,
            log: self.log,
            environment: self.environment,
            mode,
            callback,
        }
    }
}

// ── Consumer ─────────────────────────────────────────────────────────

pub struct BatchConsumer {
    connector: Arc<dyn GroupConnector>,
    config: BatchConsumerConfig,
    kafka: KafkaConfig,
    log: LogConfig,
    environment: Environment,
    mode: DeliveryMode,
    callback: BatchCallback,
}

impl BatchConsumer {
    pub fn builder(connector: Arc<dyn GroupConnector>, config: BatchConsumerConfig) -> BatchConsumerBuilder {
        BatchConsumerBuilder {
            connector,
            config,
            kafka: KafkaConfig::default(),
            log: LogConfig::default(),
            environment: Environment::default(),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Group name actually joined, after the environment suffix.
    pub fn group(&self) -> String {
        self.config.effective_group(self.environment)
    }

    /// Aggregator worker count. Consistency mode always runs one worker so
    /// commits follow partition order.
    pub fn workers(&self) -> usize {
        match self.mode {
            DeliveryMode::BestEffort => self.config.pool_size.max(1),
            DeliveryMode::Consistency => 1,
        }
    }

    /// Consume until `cancel` fires, then drain buffered batches and close
    /// the group.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), QueueError> {
        self.config.validate()?;
        let group = self.group();
        let category = self.log.category.as_str();

        let processor = ClaimedBatchProcessor {
            mode: self.mode,
            callback: self.callback.clone(),
            kafka: self.kafka.clone(),
            log: self.log.clone(),
            group: group.clone(),
        };
        let aggregator = Aggregator::builder(processor)
            .context(cancel.clone())
            .batch_size(self.config.batch_size)
            .workers(self.workers())
            .channel_buffer_size(self.config.channel_buffer_size)
            .linger(self.config.linger())
            .build()?;

        let settings = GroupSettings {
            client_id: self.kafka.client_id.clone(),
            brokers: self.kafka.consumer_hosts.clone(),
            auto_commit: self.mode.auto_commit(),
            initial_offset: self.config.initial_offset.unwrap_or(self.kafka.initial_offset),
        };
        let client = match self.connector.connect(&group, &settings).await {
            Ok(client) => client,
            Err(e) => {
                error!(
                    category,
                    group = %group,
                    topics = ?self.config.topics,
                    address = ?self.kafka.consumer_hosts,
                    error = %e,
                    "consumer group connection failed"
                );
                return Err(match e {
                    QueueError::Connection(_) => e,
                    other => QueueError::Connection(other.to_string()),
                });
            }
        };

        aggregator.start();
        info!(
            category,
            group = %group,
            topics = ?self.config.topics,
            mode = self.mode.as_str(),
            workers = aggregator.workers(),
            batch_size = aggregator.batch_size(),
            "batch consumer started"
        );

        let handler: Arc<dyn ConsumerGroupHandler> = Arc::new(ClaimHandler {
            mode: self.mode,
            cancel: cancel.clone(),
            aggregator: aggregator.clone(),
        });
        self.consume_loop(&cancel, client.as_ref(), handler, &group).await;

        aggregator.safe_stop().await;
        if let Err(e) = client.close().await {
            warn!(category, group = %group, error = %e, "failed to close consumer group");
        }
        info!(category, group = %group, "batch consumer stopped");
        Ok(())
    }

    async fn consume_loop(
        &self,
        cancel: &CancellationToken,
        client: &dyn ConsumerGroup,
        handler: Arc<dyn ConsumerGroupHandler>,
        group: &str,
    ) {
        let category = self.log.category.as_str();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match client.consume(cancel, &self.config.topics, handler.clone()).await {
                Ok(()) => debug!(category, group, "consumer session ended"),
                Err(e) => {
                    error!(
                        category,
                        group,
                        topics = ?self.config.topics,
                        error = %e,
                        "consume failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(CONSUME_RETRY_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

// ── Claim handler ────────────────────────────────────────────────────

struct ClaimHandler {
    mode: DeliveryMode,
    cancel: CancellationToken,
    aggregator: Aggregator<ClaimedMessage>,
}

#[async_trait]
impl ConsumerGroupHandler for ClaimHandler {
    async fn setup(&self, session: &Arc<dyn GroupSession>) -> Result<(), QueueError> {
        debug!(
            member_id = session.member_id(),
            generation = session.generation_id(),
            "consumer session started"
        );
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: Box<dyn PartitionClaim>,
    ) -> Result<(), QueueError> {
        let session_done = session.cancellation().clone();
        debug!(
            topic = claim.topic(),
            partition = claim.partition(),
            initial_offset = claim.initial_offset(),
            "claim started"
        );

        loop {
            let message = tokio::select! {
                biased;
                () = session_done.cancelled() => break,
                next = claim.next_message() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            let item = ClaimedMessage {
                cancel: self.cancel.clone(),
                session: session.clone(),
                message: message.clone(),
            };
            let queued = match self.mode {
                DeliveryMode::BestEffort => self.push_spinning(item, &session_done).await?,
                DeliveryMode::Consistency => tokio::select! {
                    res = self.aggregator.enqueue(item) => {
                        res.map_err(|_| QueueError::Stopped)?;
                        true
                    }
                    () = session_done.cancelled() => false,
                },
            };
            if !queued {
                break;
            }
            session.mark_message(&message, "");
        }

        debug!(topic = claim.topic(), partition = claim.partition(), "claim ended");
        Ok(())
    }
}

impl ClaimHandler {
    /// Retry `try_enqueue` until the queue accepts the item. Gives up only
    /// when the session ends, leaving the message unmarked.
    async fn push_spinning(
        &self,
        mut item: ClaimedMessage,
        session_done: &CancellationToken,
    ) -> Result<bool, QueueError> {
        loop {
            match self.aggregator.try_enqueue(item).await {
                Ok(()) => return Ok(true),
                Err(EnqueueError::Stopped(_)) => return Err(QueueError::Stopped),
                Err(EnqueueError::Full(back)) => {
                    if session_done.is_cancelled() {
                        return Ok(false);
                    }
                    item = back;
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

// ── Batch processor ──────────────────────────────────────────────────

struct ClaimedBatchProcessor {
    mode: DeliveryMode,
    callback: BatchCallback,
    kafka: KafkaConfig,
    log: LogConfig,
    group: String,
}

#[async_trait]
impl BatchProcessor<ClaimedMessage> for ClaimedBatchProcessor {
    async fn process(&self, _ctx: &CancellationToken, items: &[ClaimedMessage]) -> anyhow::Result<()> {
        let Some(last) = items.last() else {
            return Err(QueueError::EmptyBatch.into());
        };

        if self.mode == DeliveryMode::Consistency && last.session.cancellation().is_cancelled() {
            warn!(
                category = %self.log.category,
                group = %self.group,
                topic = %last.message.topic,
                partition = last.message.partition,
                offset = last.message.offset,
                msg_num = items.len(),
                "session ended before batch was processed, leaving it for redelivery"
            );
            return Ok(());
        }

        let messages: Vec<BrokerMessage> = items.iter().map(|item| item.message.clone()).collect();
        let context = BatchContext::from_message(last.cancel.clone(), &last.message, &self.kafka, &self.log);
        let span = context.span();

        let mut result = (self.callback)(context, messages).instrument(span.clone()).await;
        if result.is_ok() && self.mode == DeliveryMode::Consistency {
            result = last.session.commit().await.map_err(anyhow::Error::from);
        }

        span.in_scope(|| self.log_outcome(&last.message, items.len(), result.as_ref().err()));
        result
    }
}

impl ClaimedBatchProcessor {
    fn log_outcome(&self, last: &BrokerMessage, count: usize, err: Option<&anyhow::Error>) {
        match err {
            Some(err) => error!(
                category = %self.log.category,
                group = %self.group,
                topic = %last.topic,
                partition = last.partition,
                offset = last.offset,
                key = %last.key_str(),
                value = %log_value(last, &self.log),
                msg_num = count,
                address = ?self.kafka.consumer_hosts,
                error = %format!("{err:#}"),
                "consume batch failed"
            ),
            None if self.log.log_consumer => info!(
                category = %self.log.category,
                group = %self.group,
                topic = %last.topic,
                partition = last.partition,
                offset = last.offset,
                key = %last.key_str(),
                value = %log_value(last, &self.log),
                msg_num = count,
                "consume batch succeeded"
            ),
            None => {}
        }
    }
}
