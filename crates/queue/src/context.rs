//! Per-batch processing context and log helpers.

use tokio_util::sync::CancellationToken;
use tracing::Span;

use microbatch_core::{KafkaConfig, LogConfig};

use crate::consumer::BrokerMessage;

/// Context handed to user callbacks alongside their messages.
#[derive(Debug, Clone)]
pub struct BatchContext {
    /// Consumer shutdown signal. Advisory: check it in long-running callbacks.
    pub cancel: CancellationToken,
    pub category: String,
    /// Request trace id carried in the message headers, if any.
    pub trace_id: Option<String>,
    /// Unique message id carried in the message headers, if any.
    pub msg_id: Option<String>,
}

impl BatchContext {
    /// Build a context from the correlation headers of `message`.
    pub fn from_message(
        cancel: CancellationToken,
        message: &BrokerMessage,
        kafka: &KafkaConfig,
        log: &LogConfig,
    ) -> Self {
        Self {
            cancel,
            category: log.category.clone(),
            trace_id: message.header(&kafka.trace_id_key),
            msg_id: message.header(&kafka.msg_id_key),
        }
    }

    /// Span carrying the correlation ids, entered around user callbacks.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "consume",
            category = %self.category,
            trace_id = self.trace_id.as_deref().unwrap_or(""),
            msg_id = self.msg_id.as_deref().unwrap_or(""),
        )
    }
}

/// Shorten `s` for logging: when longer than `limit` chars, keep `limit / 2`
/// chars from each end joined by `replacement`. A zero limit disables it.
pub fn truncate_middle(s: &str, limit: usize, replacement: &str) -> String {
    let len = s.chars().count();
    if limit == 0 || len <= limit {
        return s.to_string();
    }
    let half = limit / 2;
    let mut out = String::with_capacity(half * 2 + replacement.len());
    out.extend(s.chars().take(half));
    out.push_str(replacement);
    out.extend(s.chars().skip(len - half));
    out
}

/// Message value prepared for a log line.
pub fn log_value(message: &BrokerMessage, log: &LogConfig) -> String {
    truncate_middle(&message.value_str(), log.limit, &log.replace_str)
}
