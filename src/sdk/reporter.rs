use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transport::TelemetrySink;
use crate::telemetry::TelemetryEvent;

#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Events queued before new ones are dropped.
    pub buffer: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            buffer: 1024,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Lossy hand-off from the evaluation path to a background batcher.
pub struct TelemetryReporter {
    queue: mpsc::Sender<TelemetryEvent>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryReporter {
    pub fn spawn(
        sink: Arc<dyn TelemetrySink>,
        config: ReporterConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (queue, events) = mpsc::channel(config.buffer.max(1));
        let handle = tokio::spawn(run(sink, config, events, shutdown));
        let reporter = Self {
            queue,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (reporter, handle)
    }

    /// Queue an event; if the queue is full the event is dropped.
    pub fn record(&self, event: TelemetryEvent) {
        if self.queue.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn run(
    sink: Arc<dyn TelemetrySink>,
    config: ReporterConfig,
    mut events: mpsc::Receiver<TelemetryEvent>,
    shutdown: CancellationToken,
) {
    let batch_size = config.batch_size.max(1);
    let mut batch = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush(&*sink, &mut batch, &shutdown).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&*sink, &mut batch, &shutdown).await;
                }
            }
        }
    }
    debug!(pending = batch.len(), "Telemetry reporter stopped");
}

async fn flush(sink: &dyn TelemetrySink, batch: &mut Vec<TelemetryEvent>, shutdown: &CancellationToken) {
    let events = std::mem::take(batch);
    let count = events.len();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        result = sink.send(events) => {
            if let Err(e) = result {
                debug!(error = %e, dropped = count, "Dropped telemetry batch");
            }
        }
    }
}
