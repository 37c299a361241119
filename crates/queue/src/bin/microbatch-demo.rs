//! microbatch-demo: runs a batch consumer against an in-process broker.
//!
//! Produces synthetic messages into a memory topic and consumes them in
//! batches, logging every batch. Useful for watching size and linger
//! flushes and the two delivery modes side by side.
//!
//! # Usage
//!
//! ```bash
//! microbatch-demo --mode consistency --messages 100 --interval-ms 20
//!
//! # Sizing from the environment (see microbatch-core config)
//! BATCH_SIZE=16 BATCH_LINGER_MS=500 microbatch-demo
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;

use microbatch_core::config::load_dotenv;
use microbatch_core::Config;
use microbatch_queue::{BatchConsumer, BatchContext, BrokerMessage, MemoryBroker, RecordHeader};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    BestEffort,
    Consistency,
}

/// Batch consumer demo over an in-memory broker.
#[derive(Parser, Debug)]
#[command(name = "microbatch-demo", version, about)]
struct Cli {
    /// Delivery mode.
    #[arg(long, env = "DEMO_MODE", value_enum, default_value = "best-effort")]
    mode: Mode,

    /// Topic to produce into and consume from.
    #[arg(long, env = "DEMO_TOPIC", default_value = "demo-events")]
    topic: String,

    /// Consumer group (overrides BATCH_GROUP).
    #[arg(long, env = "DEMO_GROUP", default_value = "demo")]
    group: String,

    #[arg(long, env = "DEMO_PARTITIONS", default_value_t = 3)]
    partitions: usize,

    /// Number of messages to produce (0 = until shutdown).
    #[arg(long, env = "DEMO_MESSAGES", default_value_t = 50)]
    messages: u64,

    /// Delay between produced messages.
    #[arg(long, env = "DEMO_INTERVAL_MS", default_value_t = 50)]
    interval_ms: u64,

    /// Fail every Nth batch (0 = never).
    #[arg(long, env = "DEMO_FAIL_EVERY", default_value_t = 0)]
    fail_every: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    config.batch.topics = vec![cli.topic.clone()];
    config.batch.group_name = cli.group.clone();
    config.log_summary();

    tracing::info!(?cli, "starting microbatch-demo");

    let broker = MemoryBroker::new();
    broker.create_topic(&cli.topic, cli.partitions);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });

    let producer = tokio::spawn(produce(
        broker.clone(),
        cli.topic.clone(),
        cli.partitions,
        cli.messages,
        cli.interval_ms,
        config.log.log_producer,
        cancel.clone(),
    ));

    let batches = Arc::new(AtomicU64::new(0));
    let fail_every = cli.fail_every;
    let callback = move |ctx: BatchContext, messages: Vec<BrokerMessage>| {
        let batches = batches.clone();
        async move {
            let n = batches.fetch_add(1, Ordering::SeqCst) + 1;
            let offsets: Vec<String> = messages.iter().map(ToString::to_string).collect();
            tracing::info!(batch = n, trace_id = ?ctx.trace_id, messages = ?offsets, "handling batch");
            if fail_every > 0 && n % fail_every == 0 {
                anyhow::bail!("synthetic failure on batch {n}");
            }
            Ok(())
        }
    };

    let builder = BatchConsumer::builder(Arc::new(broker.clone()), config.batch.clone())
        .kafka(config.kafka.clone())
        .log(config.log.clone())
        .environment(config.environment);
    let consumer = match cli.mode {
        Mode::BestEffort => builder.best_effort(callback),
        Mode::Consistency => builder.consistency(callback),
    };

    consumer.run(cancel).await?;
    if let Err(e) = producer.await {
        tracing::warn!(error = %e, "producer task ended abnormally");
    }

    for partition in 0..cli.partitions as i32 {
        tracing::info!(
            partition,
            high_water_mark = broker.high_water_mark(&cli.topic, partition),
            committed = ?broker.committed_offset(&consumer.group(), &cli.topic, partition),
            "final offsets"
        );
    }
    tracing::info!("microbatch-demo exited cleanly");
    Ok(())
}

async fn produce(
    broker: MemoryBroker,
    topic: String,
    partitions: usize,
    messages: u64,
    interval_ms: u64,
    log_each: bool,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    let mut seq = 0u64;
    while messages == 0 || seq < messages {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let partition = (seq % partitions.max(1) as u64) as i32;
        let headers = vec![
            RecordHeader::new("X-Request-Id", format!("trace-{seq}")),
            RecordHeader::new("msgId", format!("msg-{seq}")),
        ];
        let value = serde_json::json!({ "seq": seq }).to_string();
        match broker.produce(&topic, partition, format!("key-{seq}"), value, headers) {
            Ok(offset) if log_each => tracing::info!(topic = %topic, partition, offset, "produced"),
            Ok(_) => {}
            Err(e) => {
                tracing::error!(topic = %topic, partition, error = %e, "produce failed");
                return;
            }
        }
        seq += 1;
    }
    tracing::info!(produced = seq, "producer finished");
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                wait_signal(ctrl_c, "ctrl_c").await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        wait_signal(ctrl_c, "ctrl_c").await;
    }
}

/// Returns false when the signal listener itself failed.
async fn wait_signal(signal: impl std::future::Future<Output = std::io::Result<()>>, name: &str) -> bool {
    match signal.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(signal = name, error = %e, "failed to listen for signal");
            false
        }
    }
}
