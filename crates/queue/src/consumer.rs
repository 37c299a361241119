//! Consumer-group abstraction over a partitioned-log broker.
//!
//! The binding never talks to a broker client directly. It consumes these
//! traits, which a client adapter (or [`crate::memory::MemoryBroker`])
//! implements: a connector creates a group, the group runs sessions, and each
//! session hands out one claim per assigned partition.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use microbatch_core::InitialOffset;

use crate::error::QueueError;

/// A single record header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl RecordHeader {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A message record read from a partition claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<RecordHeader>,
    /// When the broker appended the record.
    pub timestamp: DateTime<Utc>,
}

impl BrokerMessage {
    /// Value of the first header named `key`, decoded lossily.
    pub fn header(&self, key: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|h| h.key == key.as_bytes())
            .map(|h| String::from_utf8_lossy(&h.value).into_owned())
    }

    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

impl fmt::Display for BrokerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Settings a connector needs to join a consumer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub client_id: String,
    pub brokers: Vec<String>,
    /// When enabled, marked offsets are committed by the client in the
    /// background. When disabled, only [`GroupSession::commit`] persists them.
    pub auto_commit: bool,
    pub initial_offset: InitialOffset,
}

/// One generation of group membership. Ends on rebalance or shutdown.
#[async_trait]
pub trait GroupSession: Send + Sync {
    fn member_id(&self) -> &str;

    fn generation_id(&self) -> i32;

    /// Record `message` as processed. The next committed offset for its
    /// partition becomes `message.offset + 1`.
    fn mark_message(&self, message: &BrokerMessage, metadata: &str);

    /// Synchronously commit every marked offset to the broker.
    async fn commit(&self) -> Result<(), QueueError>;

    /// Fires when the session ends.
    fn cancellation(&self) -> &CancellationToken;
}

/// The ordered message stream of one topic-partition within a session.
#[async_trait]
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Offset the claim started reading from.
    fn initial_offset(&self) -> i64;

    /// Offset the next produced message will get.
    fn high_water_mark_offset(&self) -> i64;

    /// Next message in partition order, or `None` once the claim ends.
    async fn next_message(&mut self) -> Option<BrokerMessage>;
}

/// Callbacks invoked by a [`ConsumerGroup`] for each session.
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    /// Runs before any claim of a new session is consumed.
    async fn setup(&self, _session: &Arc<dyn GroupSession>) -> Result<(), QueueError> {
        Ok(())
    }

    /// Runs after every claim of the session has returned.
    async fn cleanup(&self, _session: &Arc<dyn GroupSession>) -> Result<(), QueueError> {
        Ok(())
    }

    /// Consume one claim until it ends. Called concurrently, once per claim.
    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: Box<dyn PartitionClaim>,
    ) -> Result<(), QueueError>;
}

/// A joined consumer group.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Run one session over `topics`, returning when it ends (rebalance,
    /// cancellation or error). Callers loop to rejoin.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// Creates consumer groups. Implemented by broker client adapters.
#[async_trait]
pub trait GroupConnector: Send + Sync {
    async fn connect(
        &self,
        group: &str,
        settings: &GroupSettings,
    ) -> Result<Arc<dyn ConsumerGroup>, QueueError>;
}
