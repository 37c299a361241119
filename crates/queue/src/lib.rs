pub mod aggregator;
pub mod batch_consumer;
pub mod consumer;
pub mod context;
pub mod error;
pub mod memory;
pub mod message_consumer;

pub use aggregator::{Aggregator, AggregatorBuilder, BatchProcessor, ErrorHandler, FailedBatch};
pub use batch_consumer::{BatchConsumer, BatchConsumerBuilder, ClaimedMessage, DeliveryMode};
pub use consumer::{
    BrokerMessage, ConsumerGroup, ConsumerGroupHandler, GroupConnector, GroupSession, GroupSettings,
    PartitionClaim, RecordHeader,
};
pub use context::{truncate_middle, BatchContext};
pub use error::{AggregatorError, EnqueueError, QueueError};
pub use memory::MemoryBroker;
pub use message_consumer::{MessageConsumer, MessageConsumerBuilder};
