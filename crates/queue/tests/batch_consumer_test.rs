//! Integration tests for the batch consumer over the in-memory broker.
//!
//! Covers both delivery modes end to end: offsets observed by the broker,
//! redelivery after rebalance and draining on shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use microbatch_core::{BatchConsumerConfig, Environment};
use microbatch_queue::{
    BatchConsumer, BatchContext, BrokerMessage, ConsumerGroup, ConsumerGroupHandler, GroupConnector,
    GroupSettings, MemoryBroker, QueueError, RecordHeader,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(100);
const TOPIC: &str = "orders";
const GROUP: &str = "billing";

fn config(batch_size: usize, pool_size: usize, linger_ms: u64) -> BatchConsumerConfig {
    BatchConsumerConfig {
        topics: vec![TOPIC.to_string()],
        group_name: GROUP.to_string(),
        batch_size,
        channel_buffer_size: 0,
        pool_size,
        linger_ms,
        initial_offset: None,
    }
}

fn broker(partitions: usize) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.create_topic(TOPIC, partitions);
    broker
}

fn produce(broker: &MemoryBroker, partition: i32, n: usize) {
    for i in 0..n {
        broker
            .produce(TOPIC, partition, format!("k{i}"), format!("v{i}"), vec![])
            .unwrap();
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn spawn(consumer: BatchConsumer, cancel: &CancellationToken) -> JoinHandle<Result<(), QueueError>> {
    let token = cancel.clone();
    tokio::spawn(async move { consumer.run(token).await })
}

/// Callback recording the offsets of every batch it is handed. Calls listed
/// in `fail_calls` (1-based) return an error.
fn recorder(
    calls: Arc<Mutex<Vec<Vec<i64>>>>,
    fail_calls: &'static [usize],
) -> impl Fn(BatchContext, Vec<BrokerMessage>) -> BoxFuture<'static, anyhow::Result<()>>
       + Send
       + Sync
       + 'static {
    move |_ctx: BatchContext, messages: Vec<BrokerMessage>| {
        let calls = calls.clone();
        let fut: BoxFuture<'static, anyhow::Result<()>> = Box::pin(async move {
            let n = {
                let mut calls = calls.lock().unwrap();
                calls.push(messages.iter().map(|m| m.offset).collect());
                calls.len()
            };
            if fail_calls.contains(&n) {
                anyhow::bail!("batch {n} rejected");
            }
            Ok(())
        });
        fut
    }
}

#[tokio::test]
async fn best_effort_delivers_every_message_and_commits() {
    let broker = broker(2);
    produce(&broker, 0, 10);
    produce(&broker, 1, 10);

    let seen = Arc::new(AtomicUsize::new(0));
    let largest = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let (seen, largest) = (seen.clone(), largest.clone());
        BatchConsumer::builder(Arc::new(broker.clone()), config(4, 2, 50)).best_effort(
            move |_ctx: BatchContext, messages: Vec<BrokerMessage>| {
                let (seen, largest) = (seen.clone(), largest.clone());
                async move {
                    seen.fetch_add(messages.len(), Ordering::SeqCst);
                    largest.fetch_max(messages.len(), Ordering::SeqCst);
                    Ok::<_, anyhow::Error>(())
                }
            },
        )
    };
    assert_eq!(consumer.workers(), 2);

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);
    wait_until(|| seen.load(Ordering::SeqCst) == 20).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert!(largest.load(Ordering::SeqCst) <= 4);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(10));
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 1), Some(10));
}

#[tokio::test]
async fn best_effort_advances_offsets_when_handler_fails() {
    let broker = broker(1);
    produce(&broker, 0, 6);

    let seen = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let seen = seen.clone();
        BatchConsumer::builder(Arc::new(broker.clone()), config(3, 1, 50)).best_effort(
            move |_ctx: BatchContext, messages: Vec<BrokerMessage>| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(messages.len(), Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
                }
            },
        )
    };

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);
    wait_until(|| seen.load(Ordering::SeqCst) == 6).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(6));
}

#[tokio::test]
async fn consistency_commits_only_after_successful_batch() {
    let broker = broker(1);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let consumer = BatchConsumer::builder(Arc::new(broker.clone()), config(3, 8, 10_000))
        .consistency(recorder(calls.clone(), &[1]));
    assert_eq!(consumer.workers(), 1);

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);

    produce(&broker, 0, 3);
    wait_until(|| calls.lock().unwrap().len() == 1).await;
    sleep(SETTLE).await;
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), None);

    produce(&broker, 0, 3);
    wait_until(|| broker.committed_offset(GROUP, TOPIC, 0) == Some(6)).await;
    assert_eq!(broker.commit_count(), 1);
    assert_eq!(*calls.lock().unwrap(), vec![vec![0, 1, 2], vec![3, 4, 5]]);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn consistency_commit_failure_is_not_silent() {
    let broker = broker(1);
    broker.fail_next_commits(1);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let consumer = BatchConsumer::builder(Arc::new(broker.clone()), config(3, 1, 10_000))
        .consistency(recorder(calls.clone(), &[]));

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);

    produce(&broker, 0, 3);
    wait_until(|| calls.lock().unwrap().len() == 1).await;
    sleep(SETTLE).await;
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), None);
    assert_eq!(broker.commit_count(), 0);

    produce(&broker, 0, 3);
    wait_until(|| broker.committed_offset(GROUP, TOPIC, 0) == Some(6)).await;
    assert_eq!(broker.commit_count(), 1);

    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn consistency_redelivers_failed_batch_after_rebalance() {
    let broker = broker(1);
    produce(&broker, 0, 3);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let consumer = BatchConsumer::builder(Arc::new(broker.clone()), config(3, 1, 10_000))
        .consistency(recorder(calls.clone(), &[1]));

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);

    wait_until(|| calls.lock().unwrap().len() == 1).await;
    broker.rebalance();
    wait_until(|| broker.committed_offset(GROUP, TOPIC, 0) == Some(3)).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], vec![0, 1, 2]);
    assert_eq!(calls[1], vec![0, 1, 2]);
}

#[tokio::test]
async fn consistency_leaves_partial_batch_uncommitted_on_shutdown() {
    let broker = broker(1);
    produce(&broker, 0, 5);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let consumer = BatchConsumer::builder(Arc::new(broker.clone()), config(100, 1, 10_000))
        .consistency(recorder(calls.clone(), &[]));

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);
    sleep(SETTLE).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    // The session ended before the partial batch flushed, so it is skipped
    // and left for the next group member.
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), None);
}

#[tokio::test]
async fn best_effort_flushes_partial_batch_on_shutdown() {
    let broker = broker(1);
    produce(&broker, 0, 5);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let consumer = BatchConsumer::builder(Arc::new(broker.clone()), config(100, 1, 10_000))
        .best_effort(recorder(calls.clone(), &[]));

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);
    // Marked on enqueue, so the offset shows every message is buffered.
    wait_until(|| broker.committed_offset(GROUP, TOPIC, 0) == Some(5)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(*calls.lock().unwrap(), vec![vec![0, 1, 2, 3, 4]]);
}

#[tokio::test]
async fn batch_context_carries_last_message_headers() {
    let broker = broker(1);
    for i in 0..2 {
        let headers = vec![
            RecordHeader::new("X-Request-Id", format!("trace-{i}")),
            RecordHeader::new("msgId", format!("msg-{i}")),
        ];
        broker.produce(TOPIC, 0, "k", "v", headers).unwrap();
    }

    let contexts = Arc::new(Mutex::new(Vec::new()));
    let consumer = {
        let contexts = contexts.clone();
        BatchConsumer::builder(Arc::new(broker.clone()), config(2, 1, 10_000)).best_effort(
            move |ctx: BatchContext, _messages: Vec<BrokerMessage>| {
                contexts.lock().unwrap().push((ctx.trace_id, ctx.msg_id));
                async { Ok::<_, anyhow::Error>(()) }
            },
        )
    };

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);
    wait_until(|| !contexts.lock().unwrap().is_empty()).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let contexts = contexts.lock().unwrap();
    assert_eq!(contexts[0].0.as_deref(), Some("trace-1"));
    assert_eq!(contexts[0].1.as_deref(), Some("msg-1"));
}

#[tokio::test]
async fn development_environment_joins_suffixed_group() {
    let broker = broker(1);
    produce(&broker, 0, 1);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let consumer = BatchConsumer::builder(Arc::new(broker.clone()), config(1, 1, 10_000))
        .environment(Environment::Dev)
        .best_effort(recorder(calls.clone(), &[]));
    assert_eq!(consumer.group(), "billing_dev");

    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);
    wait_until(|| calls.lock().unwrap().len() == 1).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(broker.committed_offset("billing_dev", TOPIC, 0), Some(1));
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), None);
}

#[tokio::test]
async fn run_rejects_missing_topics() {
    let mut cfg = config(4, 1, 100);
    cfg.topics.clear();
    let consumer = BatchConsumer::builder(Arc::new(MemoryBroker::new()), cfg)
        .best_effort(recorder(Arc::default(), &[]));

    let res = consumer.run(CancellationToken::new()).await;
    assert!(matches!(res, Err(QueueError::Config(_))));
}

#[tokio::test]
async fn run_reports_connection_failure() {
    struct Refuse;

    #[async_trait::async_trait]
    impl microbatch_queue::GroupConnector for Refuse {
        async fn connect(
            &self,
            _group: &str,
            _settings: &microbatch_queue::GroupSettings,
        ) -> Result<Arc<dyn microbatch_queue::ConsumerGroup>, QueueError> {
            Err(QueueError::Connection("no brokers reachable".into()))
        }
    }

    let consumer = BatchConsumer::builder(Arc::new(Refuse), config(4, 1, 100)).consistency(recorder(Arc::default(), &[]));
    let res = consumer.run(CancellationToken::new()).await;
    assert!(matches!(res, Err(QueueError::Connection(_))));
}

/// Connector over the memory broker whose group fails the first `failures`
/// consume calls and counts every call.
struct Flaky {
    broker: MemoryBroker,
    failures: usize,
    calls: Arc<AtomicUsize>,
}

struct FlakyGroup {
    inner: Arc<dyn ConsumerGroup>,
    failures: usize,
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl GroupConnector for Flaky {
    async fn connect(
        &self,
        group: &str,
        settings: &GroupSettings,
    ) -> Result<Arc<dyn ConsumerGroup>, QueueError> {
        Ok(Arc::new(FlakyGroup {
            inner: self.broker.connect(group, settings).await?,
            failures: self.failures,
            calls: self.calls.clone(),
        }))
    }
}

#[async_trait::async_trait]
impl ConsumerGroup for FlakyGroup {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), QueueError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(QueueError::Consume("broker unavailable".into()));
        }
        self.inner.consume(cancel, topics, handler).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn consume_error_is_retried_after_backoff() {
    let broker = broker(1);
    produce(&broker, 0, 5);
    let calls = Arc::new(AtomicUsize::new(0));
    let connector = Flaky {
        broker: broker.clone(),
        failures: 1,
        calls: calls.clone(),
    };

    let batches = Arc::new(Mutex::new(Vec::new()));
    let consumer =
        BatchConsumer::builder(Arc::new(connector), config(5, 1, 50)).best_effort(recorder(batches.clone(), &[]));
    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);

    wait_until(|| batches.lock().unwrap().iter().map(Vec::len).sum::<usize>() == 5).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(5));
}

#[tokio::test]
async fn cancel_interrupts_consume_retry_backoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let connector = Flaky {
        broker: broker(1),
        failures: usize::MAX,
        calls: calls.clone(),
    };
    let consumer =
        BatchConsumer::builder(Arc::new(connector), config(4, 1, 50)).consistency(recorder(Arc::default(), &[]));
    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);

    wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
    let started = std::time::Instant::now();
    cancel.cancel();
    let res = timeout(Duration::from_millis(500), handle)
        .await
        .expect("run kept sleeping after cancel");
    res.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_topic_does_not_spin_consume() {
    let calls = Arc::new(AtomicUsize::new(0));
    let connector = Flaky {
        broker: MemoryBroker::new(),
        failures: 0,
        calls: calls.clone(),
    };
    let consumer =
        BatchConsumer::builder(Arc::new(connector), config(4, 1, 50)).best_effort(recorder(Arc::default(), &[]));
    let cancel = CancellationToken::new();
    let handle = spawn(consumer, &cancel);

    sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    timeout(TIMEOUT, handle).await.unwrap().unwrap().unwrap();

    let calls = calls.load(Ordering::SeqCst);
    assert!((1..=2).contains(&calls), "consume called {calls} times");
}
