//! Micro-batch aggregator.
//!
//! Items are pushed into a bounded queue and drained by a fixed set of
//! worker tasks. Each worker owns its own batch and flushes it when either
//! the size threshold or the linger window is reached, whichever comes
//! first. Workers never share a batch, so the only shared resource on the
//! hot path is the queue itself.

use std::any::Any;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use microbatch_core::config::cpu_count;

use crate::error::{AggregatorError, EnqueueError};

const DEFAULT_BATCH_SIZE: usize = 8;
const DEFAULT_LINGER: Duration = Duration::from_secs(60);
const SAFE_STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Processor / error handler traits ─────────────────────────────────

/// Handles one flushed batch.
///
/// `ctx` is the token the aggregator was built with. It is advisory: the
/// aggregator never preempts a running batch, so long-running processors
/// should check it and return early.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync + 'static {
    async fn process(&self, ctx: &CancellationToken, items: &[T]) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> BatchProcessor<T> for F
where
    T: Send + Sync + 'static,
    F: Fn(&CancellationToken, &[T]) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, ctx: &CancellationToken, items: &[T]) -> anyhow::Result<()> {
        self(ctx, items).await
    }
}

/// A batch whose processor returned an error, handed to the [`ErrorHandler`].
pub struct FailedBatch<T> {
    pub ctx: CancellationToken,
    pub error: anyhow::Error,
    pub items: Vec<T>,
    /// The processor that failed, for handlers that retry in place.
    pub processor: Arc<dyn BatchProcessor<T>>,
    /// The owning aggregator, for handlers that re-enqueue.
    pub aggregator: Aggregator<T>,
}

/// Receives failed batches. Runs detached from the worker loop.
#[async_trait]
pub trait ErrorHandler<T>: Send + Sync + 'static {
    async fn handle(&self, failed: FailedBatch<T>);
}

#[async_trait]
impl<T, F, Fut> ErrorHandler<T> for F
where
    T: Send + Sync + 'static,
    F: Fn(FailedBatch<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, failed: FailedBatch<T>) {
        self(failed).await
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent configuration for an [`Aggregator`].
///
/// Defaults: `batch_size = 8`, `workers = CPU count`, `linger = 60s`,
/// `channel_buffer_size = workers`.
pub struct AggregatorBuilder<T> {
    processor: Arc<dyn BatchProcessor<T>>,
    ctx: CancellationToken,
    batch_size: usize,
    workers: usize,
    channel_buffer_size: usize,
    linger: Duration,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
}

impl<T: Send + Sync + 'static> AggregatorBuilder<T> {
    /// Token handed to every processor call and error handler.
    pub fn context(mut self, ctx: CancellationToken) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Queue capacity. Values below the worker count are raised to it.
    pub fn channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    pub fn error_handler<H: ErrorHandler<T>>(mut self, handler: H) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Aggregator<T>, AggregatorError> {
        if self.batch_size == 0 {
            return Err(AggregatorError::InvalidConfig("batch_size must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(AggregatorError::InvalidConfig("workers must be greater than zero"));
        }
        if self.linger.is_zero() {
            return Err(AggregatorError::InvalidConfig("linger must be greater than zero"));
        }

        let capacity = self.channel_buffer_size.max(self.workers);
        let (sender, receiver) = mpsc::channel(capacity);

        Ok(Aggregator {
            shared: Arc::new(Shared {
                ctx: self.ctx,
                batch_size: self.batch_size,
                workers: self.workers,
                linger: self.linger,
                capacity,
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                quit: CancellationToken::new(),
                processor: self.processor,
                error_handler: self.error_handler,
                handles: Mutex::new(Vec::new()),
            }),
        })
    }
}

// ── Aggregator ───────────────────────────────────────────────────────

/// Bounded queue plus `workers` batch-building tasks.
///
/// Cloning is cheap and every clone refers to the same queue and workers.
/// Once stopped an aggregator cannot be restarted.
pub struct Aggregator<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    ctx: CancellationToken,
    batch_size: usize,
    workers: usize,
    linger: Duration,
    capacity: usize,
    sender: mpsc::Sender<T>,
    // Workers take turns receiving single items; batches stay worker-local.
    receiver: tokio::sync::Mutex<mpsc::Receiver<T>>,
    quit: CancellationToken,
    processor: Arc<dyn BatchProcessor<T>>,
    error_handler: Option<Arc<dyn ErrorHandler<T>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> Clone for Aggregator<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Aggregator<T> {
    pub fn builder<P: BatchProcessor<T>>(processor: P) -> AggregatorBuilder<T> {
        let workers = cpu_count();
        AggregatorBuilder {
            processor: Arc::new(processor),
            ctx: CancellationToken::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers,
            channel_buffer_size: workers,
            linger: DEFAULT_LINGER,
            error_handler: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.shared.batch_size
    }

    pub fn workers(&self) -> usize {
        self.shared.workers
    }

    pub fn linger(&self) -> Duration {
        self.shared.linger
    }

    /// Queue capacity after flooring to the worker count.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Items waiting in the queue (not yet picked up by a worker).
    pub fn len(&self) -> usize {
        self.shared.sender.max_capacity() - self.shared.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push an item, waiting for queue capacity.
    ///
    /// Does not observe any cancellation; wrap it in `select!` or use
    /// [`try_enqueue`](Self::try_enqueue) when the wait must be abandonable.
    pub async fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        self.shared
            .sender
            .send(item)
            .await
            .map_err(|mpsc::error::SendError(item)| EnqueueError::Stopped(item))
    }

    /// Push an item without waiting.
    ///
    /// On a full queue this yields to the scheduler once and retries once
    /// more. A second failure returns [`EnqueueError::Full`] carrying the item,
    /// leaving the retry or drop decision to the caller.
    pub async fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        let item = match self.shared.sender.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(item)) => return Err(EnqueueError::Stopped(item)),
            Err(TrySendError::Full(item)) => item,
        };

        warn!(capacity = self.shared.capacity, "event queue is full, rescheduling");
        tokio::task::yield_now().await;

        match self.shared.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(item)) => Err(EnqueueError::Stopped(item)),
            Err(TrySendError::Full(item)) => {
                warn!(capacity = self.shared.capacity, "event queue is still full, item skipped");
                Err(EnqueueError::Full(item))
            }
        }
    }

    /// Spawn the worker tasks. Calling this twice spawns a second set.
    pub fn start(&self) {
        let shared = &self.shared;
        let mut handles = shared.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for index in 0..shared.workers {
            let aggregator = self.clone();
            handles.push(tokio::spawn(async move { aggregator.work(index).await }));
        }
        info!(
            workers = shared.workers,
            batch_size = shared.batch_size,
            linger_ms = shared.linger.as_millis() as u64,
            capacity = shared.capacity,
            "aggregator started"
        );
    }

    /// Signal the workers to quit and wait for them to exit.
    ///
    /// Each worker flushes its own partial batch before exiting. Items still
    /// sitting in the queue are not drained; use [`safe_stop`](Self::safe_stop)
    /// for that.
    pub async fn stop(&self) {
        self.shared.quit.cancel();

        let handles = std::mem::take(
            &mut *self.shared.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "aggregator worker ended abnormally");
            }
        }

        self.shared.receiver.lock().await.close();
        info!(undrained = self.len(), "aggregator stopped");
    }

    /// Wait for the queue to empty, then [`stop`](Self::stop).
    ///
    /// Every item enqueued before this call reaches the processor. Producers
    /// must stop first: items racing with the emptiness check may be lost.
    pub async fn safe_stop(&self) {
        if !self.is_empty() {
            let mut ticker = tokio::time::interval(SAFE_STOP_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if self.is_empty() {
                    break;
                }
                debug!(pending = self.len(), "waiting for aggregator queue to drain");
            }
        }
        self.stop().await;
    }

    /// Worker supervisor: re-enters the batch loop after a panic so the
    /// worker count stays constant. The batch in flight at the panic is lost.
    async fn work(self, index: usize) {
        loop {
            match AssertUnwindSafe(self.run_worker(index)).catch_unwind().await {
                Ok(()) => break,
                Err(panic) => {
                    error!(
                        worker = index,
                        panic = %panic_message(panic.as_ref()),
                        backtrace = %Backtrace::force_capture(),
                        "recovering aggregator worker after panic"
                    );
                }
            }
        }
        debug!(worker = index, "aggregator worker exited");
    }

    async fn run_worker(&self, index: usize) {
        let shared = &*self.shared;
        let mut batch: Vec<T> = Vec::with_capacity(shared.batch_size);

        // One timer per worker, re-armed per batch rather than re-created.
        let linger = tokio::time::sleep(shared.linger);
        tokio::pin!(linger);
        let mut armed = false;

        loop {
            tokio::select! {
                received = async { shared.receiver.lock().await.recv().await } => {
                    let Some(item) = received else {
                        // Queue closed underneath us.
                        if !batch.is_empty() {
                            self.flush(index, std::mem::take(&mut batch)).await;
                        }
                        break;
                    };

                    batch.push(item);
                    if batch.len() < shared.batch_size {
                        if batch.len() == 1 {
                            linger.as_mut().reset(Instant::now() + shared.linger);
                            armed = true;
                        }
                        continue;
                    }

                    armed = false;
                    let full = std::mem::replace(&mut batch, Vec::with_capacity(shared.batch_size));
                    self.flush(index, full).await;
                }
                () = &mut linger, if armed => {
                    armed = false;
                    if batch.is_empty() {
                        continue;
                    }
                    let partial = std::mem::replace(&mut batch, Vec::with_capacity(shared.batch_size));
                    self.flush(index, partial).await;
                }
                () = shared.quit.cancelled() => {
                    if !batch.is_empty() {
                        self.flush(index, std::mem::take(&mut batch)).await;
                    }
                    break;
                }
            }
        }
    }

    async fn flush(&self, index: usize, items: Vec<T>) {
        let shared = &*self.shared;
        let count = items.len();

        match shared.processor.process(&shared.ctx, &items).await {
            Ok(()) => info!(worker = index, items = count, "batch processed"),
            Err(err) => {
                error!(worker = index, items = count, error = %format!("{err:#}"), "batch processing failed");
                match &shared.error_handler {
                    Some(handler) => {
                        let handler = handler.clone();
                        let failed = FailedBatch {
                            ctx: shared.ctx.clone(),
                            error: err,
                            items,
                            processor: shared.processor.clone(),
                            aggregator: self.clone(),
                        };
                        tokio::spawn(async move { handler.handle(failed).await });
                    }
                    None => {
                        warn!(worker = index, items = count, "no error handler configured, failed batch skipped")
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
