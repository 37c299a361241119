//! Queue error types.

use std::fmt;

use thiserror::Error;

use microbatch_core::ConfigError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("commit error: {0}")]
    Commit(String),

    #[error("consume error: {0}")]
    Consume(String),

    #[error("batch contained no broker messages")]
    EmptyBatch,

    #[error("aggregator stopped, message not enqueued")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

/// Rejected aggregator configuration.
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("invalid aggregator config: {0}")]
    InvalidConfig(&'static str),
}

/// Enqueue failure. The rejected item is handed back to the caller.
#[derive(Error)]
pub enum EnqueueError<T> {
    #[error("event queue is full")]
    Full(T),

    #[error("aggregator has been stopped")]
    Stopped(T),
}

impl<T> EnqueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(item) | EnqueueError::Stopped(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, EnqueueError::Full(_))
    }
}

impl<T> fmt::Debug for EnqueueError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::Full(_) => f.write_str("Full(..)"),
            EnqueueError::Stopped(_) => f.write_str("Stopped(..)"),
        }
    }
}
