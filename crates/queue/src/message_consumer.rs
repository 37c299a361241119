//! Per-message consumer: every claimed message is handed to the callback on
//! its own task, bounded by a fixed-size pool.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use microbatch_core::config::cpu_count;
use microbatch_core::{ConfigError, Environment, InitialOffset, KafkaConfig, LogConfig};

use crate::consumer::{
    BrokerMessage, ConsumerGroupHandler, GroupConnector, GroupSession, GroupSettings, PartitionClaim,
};
use crate::context::{log_value, BatchContext};
use crate::error::QueueError;

const CONSUME_RETRY_BACKOFF: Duration = Duration::from_secs(1);

pub type MessageCallback =
    Arc<dyn Fn(BatchContext, BrokerMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct MessageConsumerBuilder {
    connector: Arc<dyn GroupConnector>,
    topics: Vec<String>,
    group: String,
    pool_size: usize,
    initial_offset: Option<InitialOffset>,
    kafka: KafkaConfig,
    log: LogConfig,
    environment: Environment,
}

impl MessageConsumerBuilder {
    /// Maximum callbacks running at once. Defaults to the CPU count.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn initial_offset(mut self, offset: InitialOffset) -> Self {
        self.initial_offset = Some(offset);
        self
    }

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

    pub fn handler<F, Fut>(self, callback: F) -> MessageConsumer
    where
        F: Fn(BatchContext, BrokerMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        MessageConsumer {
            connector: self.connector,
            topics: self.topics,
            group: self.group,
            pool_size: self.pool_size.max(1),
            initial_offset: self.initial_offset,
            kafka: self.kafka,
            log: self.log,
            environment: self.environment,
            callback: Arc::new(move |ctx, message| Box::pin(callback(ctx, message))),
        }
    }
}

pub struct MessageConsumer {
    connector: Arc<dyn GroupConnector>,
    topics: Vec<String>,
    group: String,
    pool_size: usize,
    initial_offset: Option<InitialOffset>,
    kafka: KafkaConfig,
    log: LogConfig,
    environment: Environment,
    callback: MessageCallback,
}

impl MessageConsumer {
    pub fn builder(
        connector: Arc<dyn GroupConnector>,
        topics: Vec<String>,
        group: impl Into<String>,
    ) -> MessageConsumerBuilder {
        MessageConsumerBuilder {
            connector,
            topics,
            group: group.into(),
            pool_size: cpu_count(),
            initial_offset: None,
            kafka: KafkaConfig::default(),
            log: LogConfig::default(),
            environment: Environment::default(),
        }
    }

    pub fn group(&self) -> String {
        if self.environment.is_development() {
            format!("{}_{}", self.group, Environment::Dev)
        } else {
            self.group.clone()
        }
    }

    /// Consume until `cancel` fires. In-flight callbacks finish before the
    /// group is closed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), QueueError> {
        if self.topics.is_empty() {
            return Err(ConfigError::Missing("topics".into()).into());
        }
        if self.group.is_empty() {
            return Err(ConfigError::Missing("group".into()).into());
        }
        let group = self.group();
        let category = self.log.category.as_str();

        let settings = GroupSettings {
            client_id: self.kafka.client_id.clone(),
            brokers: self.kafka.consumer_hosts.clone(),
            auto_commit: true,
            initial_offset: self.initial_offset.unwrap_or(self.kafka.initial_offset),
        };
        let client = self.connector.connect(&group, &settings).await.map_err(|e| {
            error!(category, group = %group, address = ?self.kafka.consumer_hosts, error = %e, "consumer group connection failed");
            match e {
                QueueError::Connection(_) => e,
                other => QueueError::Connection(other.to_string()),
            }
        })?;

        let pool = Arc::new(Semaphore::new(self.pool_size));
        let handler: Arc<dyn ConsumerGroupHandler> = Arc::new(MessageHandler {
            pool: pool.clone(),
            cancel: cancel.clone(),
            callback: self.callback.clone(),
            kafka: self.kafka.clone(),
            log: self.log.clone(),
            group: group.clone(),
        });
        info!(category, group = %group, topics = ?self.topics, pool_size = self.pool_size, "message consumer started");

        while !cancel.is_cancelled() {
            if let Err(e) = client.consume(&cancel, &self.topics, handler.clone()).await {
                error!(category, group = %group, error = %e, "consume failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(CONSUME_RETRY_BACKOFF) => {}
                }
            }
        }

        // Every permit back in the pool means no callback is still running.
        match pool.acquire_many(self.pool_size as u32).await {
            Ok(_all) => debug!(category, group = %group, "in-flight messages finished"),
            Err(e) => warn!(category, group = %group, error = %e, "message pool closed early"),
        }
        if let Err(e) = client.close().await {
            warn!(category, group = %group, error = %e, "failed to close consumer group");
        }
        info!(category, group = %group, "message consumer stopped");
        Ok(())
    }
}

struct MessageHandler {
    pool: Arc<Semaphore>,
    cancel: CancellationToken,
    callback: MessageCallback,
    kafka: KafkaConfig,
    log: LogConfig,
    group: String,
}

#[async_trait]
impl ConsumerGroupHandler for MessageHandler {
    async fn cleanup(&self, session: &Arc<dyn GroupSession>) -> Result<(), QueueError> {
        if let Err(e) = session.commit().await {
            warn!(category = %self.log.category, group = %self.group, error = %e, "commit on session cleanup failed");
        }
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        mut claim: Box<dyn PartitionClaim>,
    ) -> Result<(), QueueError> {
        let session_done = session.cancellation().clone();
        loop {
            let message = tokio::select! {
                biased;
                () = session_done.cancelled() => break,
                next = claim.next_message() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            let permit = tokio::select! {
                permit = self.pool.clone().acquire_owned() => {
                    permit.map_err(|e| QueueError::Consume(e.to_string()))?
                }
                () = session_done.cancelled() => break,
            };

            let lag = claim.high_water_mark_offset() - message.offset;
            let job = MessageJob {
                cancel: self.cancel.clone(),
                callback: self.callback.clone(),
                kafka: self.kafka.clone(),
                log: self.log.clone(),
                group: self.group.clone(),
            };
            let marked = message.clone();
            tokio::spawn(async move {
                job.run(message, lag).await;
                drop(permit);
            });
            session.mark_message(&marked, "");
        }
        Ok(())
    }
}

struct MessageJob {
    cancel: CancellationToken,
    callback: MessageCallback,
    kafka: KafkaConfig,
    log: LogConfig,
    group: String,
}

impl MessageJob {
    async fn run(self, message: BrokerMessage, lag: i64) {
        let context = BatchContext::from_message(self.cancel.clone(), &message, &self.kafka, &self.log);
        let span = context.span();
        let key = message.key_str();
        let value = log_value(&message, &self.log);
        let (topic, partition, offset) = (message.topic.clone(), message.partition, message.offset);

        let result = (self.callback)(context, message).instrument(span.clone()).await;

        let _entered = span.enter();
        match result {
            Err(err) => error!(
                category = %self.log.category,
                group = %self.group,
                topic = %topic,
                partition,
                offset,
                lag,
                key = %key,
                value = %value,
                address = ?self.kafka.consumer_hosts,
                error = %format!("{err:#}"),
                "consume message failed"
            ),
            Ok(()) if self.log.log_consumer => info!(
                category = %self.log.category,
                group = %self.group,
                topic = %topic,
                partition,
                offset,
                lag,
                key = %key,
                value = %value,
                "consume message succeeded"
            ),
            Ok(()) => {}
        }
    }
}
