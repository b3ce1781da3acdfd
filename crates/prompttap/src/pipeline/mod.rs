//! Stage wiring
//!
//! Every captured connection gets a worker task that runs reassembly,
//! extraction and correlation over its own queue. Fresh events fan in to a
//! single persistence task. Shutdown flushes completed work within a grace
//! period and drops partial messages.

pub mod counters;

pub use counters::{CounterSnapshot, PipelineCounters};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::capture::{ConnectionId, ConnectionOpener, ConnectionTap, Endpoint, TapMessage};
use crate::config::Config;
use crate::correlate::{Correlation, Correlator};
use crate::extract::{Classifier, DecoderRegistry, ExtractSettings, ExtractedEvent, Extraction, Extractor};
use crate::reassembly::{ConnectionReassembler, Reassembled};
use crate::storage::{Persisted, PersistenceAdapter, PromptRecord, WriteStatus};

/// Shared state every connection worker needs
#[derive(Clone)]
struct WorkerContext {
    config: Arc<Config>,
    classifier: Arc<Classifier>,
    registry: Arc<DecoderRegistry>,
    correlator: Arc<Correlator>,
    counters: Arc<PipelineCounters>,
    stop: CancellationToken,
}

pub struct Pipeline {
    context: WorkerContext,
    adapter: Arc<PersistenceAdapter>,
    workers: TaskTracker,
    persist_stop: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Start the persistence and sweeper tasks
    pub fn start(
        config: Arc<Config>,
        adapter: Arc<PersistenceAdapter>,
        counters: Arc<PipelineCounters>,
    ) -> Arc<Self> {
        Self::with_registry(
            config.clone(),
            adapter,
            counters,
            DecoderRegistry::with_defaults(&config.extract.rpc_methods),
        )
    }

    pub fn with_registry(
        config: Arc<Config>,
        adapter: Arc<PersistenceAdapter>,
        counters: Arc<PipelineCounters>,
        registry: DecoderRegistry,
    ) -> Arc<Self> {
        let (persist_tx, persist_rx) = mpsc::channel(config.pipeline.persist_queue.max(1));
        let correlator = Arc::new(Correlator::new(&config.dedup, persist_tx));
        let persist_stop = CancellationToken::new();
        let stop = CancellationToken::new();

        let persistence = tokio::spawn(run_persistence(
            persist_rx,
            adapter.clone(),
            counters.clone(),
            config.storage.user.clone(),
            persist_stop.clone(),
        ));
        let sweeper = tokio::spawn(run_sweeper(
            correlator.clone(),
            Duration::from_secs(config.dedup.sweep_interval_secs.max(1)),
            stop.clone(),
        ));

        Arc::new(Self {
            context: WorkerContext {
                classifier: Arc::new(Classifier::from_config(&config)),
                registry: Arc::new(registry),
                correlator,
                counters,
                stop,
                config,
            },
            adapter,
            workers: TaskTracker::new(),
            persist_stop,
            background: Mutex::new(vec![persistence, sweeper]),
        })
    }

    pub fn counters(&self) -> &Arc<PipelineCounters> {
        &self.context.counters
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.context.correlator
    }

    pub fn adapter(&self) -> &Arc<PersistenceAdapter> {
        &self.adapter
    }

    /// Connection workers still running
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    /// Stop workers, then drain the persistence queue, all within `grace`
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;

        self.context.stop.cancel();
        self.workers.close();
        if tokio::time::timeout(grace, self.workers.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.workers.len(),
                "Connection workers did not finish within the grace period"
            );
        }

        self.persist_stop.cancel();
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Background task panicked"),
                Err(_) => tracing::warn!("Persistence queue not drained within the grace period"),
            }
        }

        let snapshot = self.context.counters.snapshot();
        tracing::info!(
            persisted_primary = snapshot.persisted_primary,
            persisted_fallback = snapshot.persisted_fallback,
            write_failures = snapshot.write_failures,
            "Pipeline stopped"
        );
    }
}

impl ConnectionOpener for Pipeline {
    fn open(&self, connection: ConnectionId, endpoint: Endpoint) -> ConnectionTap {
        let config = &self.context.config;
        let (tx, rx) = mpsc::channel(config.pipeline.connection_queue.max(1));
        self.context.counters.connection_opened();

        tracing::debug!(connection = %connection, endpoint = %endpoint, "Connection opened");
        self.workers.spawn(run_worker(
            self.context.clone(),
            connection,
            endpoint.clone(),
            rx,
        ));

        ConnectionTap::new(
            connection,
            endpoint,
            tx,
            Duration::from_millis(config.proxy.capture_timeout_ms),
            self.context.counters.clone(),
        )
    }
}

async fn run_worker(
    ctx: WorkerContext,
    connection: ConnectionId,
    endpoint: Endpoint,
    mut rx: mpsc::Receiver<TapMessage>,
) {
    let mut reassembler = ConnectionReassembler::new(connection, endpoint, &ctx.config.reassembly);
    let mut extractor = Extractor::new(
        connection,
        ctx.classifier.clone(),
        ctx.registry.clone(),
        ExtractSettings::from(&ctx.config.extract),
    );
    let mut tick = tokio::time::interval(Duration::from_millis(ctx.config.reassembly.tick_ms.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(TapMessage::Captured(event)) => {
                    let out = reassembler.ingest(&event);
                    handle_reassembled(&ctx, connection, out, &mut extractor).await;
                }
                Some(TapMessage::Closed { .. }) | None => {
                    let out = reassembler.close();
                    handle_reassembled(&ctx, connection, out, &mut extractor).await;
                    handle_extractions(&ctx, connection, extractor.close()).await;
                    ctx.correlator.release_connection(connection);
                    break;
                }
            },
            _ = tick.tick() => {
                let now = Instant::now();
                let out = reassembler.tick(now);
                handle_reassembled(&ctx, connection, out, &mut extractor).await;
                handle_extractions(&ctx, connection, extractor.tick(now)).await;
            }
            _ = ctx.stop.cancelled() => {
                // Completed work is flushed; partial messages are dropped.
                while let Ok(TapMessage::Captured(event)) = rx.try_recv() {
                    let out = reassembler.ingest(&event);
                    handle_reassembled(&ctx, connection, out, &mut extractor).await;
                }
                handle_extractions(&ctx, connection, extractor.close()).await;
                ctx.correlator.release_connection(connection);
                break;
            }
        }
    }

    tracing::debug!(connection = %connection, "Connection worker finished");
}

async fn handle_reassembled(
    ctx: &WorkerContext,
    connection: ConnectionId,
    out: Vec<Reassembled>,
    extractor: &mut Extractor,
) {
    for item in out {
        match item {
            Reassembled::Message(message) => {
                ctx.counters.message_reassembled();
                let extractions = extractor.on_message(message);
                handle_extractions(ctx, connection, extractions).await;
            }
            Reassembled::Fault(error) => {
                ctx.counters.framing_fault();
                tracing::debug!(connection = %connection, error = %error, "Framing fault");
            }
        }
    }
}

async fn handle_extractions(ctx: &WorkerContext, connection: ConnectionId, extractions: Vec<Extraction>) {
    for extraction in extractions {
        match extraction {
            Extraction::Event(event) => {
                ctx.counters.event_extracted();
                match ctx.correlator.accept(*event, Instant::now()).await {
                    Ok(Correlation::Queued) => {}
                    Ok(Correlation::Duplicate) => ctx.counters.duplicate_suppressed(),
                    Err(e) => {
                        ctx.counters.write_failure();
                        tracing::error!(connection = %connection, error = %e, "Event dropped");
                    }
                }
            }
            Extraction::Discard(reason) => {
                ctx.counters.discarded();
                tracing::trace!(connection = %connection, reason = ?reason, "Message discarded");
            }
            Extraction::Fault(fault) => {
                ctx.counters.decode_fault();
                tracing::debug!(connection = %connection, error = %fault, "Decode fault");
            }
        }
    }
}

async fn run_persistence(
    mut rx: mpsc::Receiver<ExtractedEvent>,
    adapter: Arc<PersistenceAdapter>,
    counters: Arc<PipelineCounters>,
    user: String,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => persist(&adapter, &counters, &user, event).await,
                None => break,
            },
            _ = stop.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    persist(&adapter, &counters, &user, event).await;
                }
                break;
            }
        }
    }
}

async fn persist(adapter: &PersistenceAdapter, counters: &PipelineCounters, user: &str, event: ExtractedEvent) {
    let record = PromptRecord::from_event(&event, user);
    let fingerprint = record.fingerprint.clone();

    match adapter.persist(record).await {
        Ok(Persisted::Primary(WriteStatus::Inserted)) => {
            counters.persisted_primary();
            tracing::info!(fingerprint = %fingerprint, source = %event.source, "Prompt recorded");
        }
        Ok(Persisted::Fallback(WriteStatus::Inserted)) => {
            counters.persisted_fallback();
            tracing::info!(fingerprint = %fingerprint, source = %event.source, "Prompt recorded to fallback");
        }
        Ok(Persisted::Primary(WriteStatus::AlreadyPresent))
        | Ok(Persisted::Fallback(WriteStatus::AlreadyPresent)) => counters.already_present(),
        Err(e) => {
            counters.write_failure();
            tracing::error!(fingerprint = %fingerprint, error = %e, "Prompt lost");
        }
    }
}

async fn run_sweeper(correlator: Arc<Correlator>, interval: Duration, stop: CancellationToken) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tick.tick() => {
                let removed = correlator.sweep(Instant::now());
                if removed > 0 {
                    tracing::trace!(removed, "Dedup window swept");
                }
            }
        }
    }
}
