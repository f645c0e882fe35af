use crate::buffer::IngestBuffer;
use crate::store::Store;
use chrono::Utc;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Default)]
pub struct IngestStats {
    pub messages_received: AtomicU64,
    pub readings_buffered: AtomicU64,
    pub decode_errors: AtomicU64,
    pub snapshot_errors: AtomicU64,
    pub buffer_evictions: AtomicU64,
    pub rows_written: AtomicU64,
    pub rows_lost: AtomicU64,
    pub last_flush_unix_ms: AtomicU64,
    pub last_batch_len: AtomicU64,
    pub average_flush_micros: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub readings_buffered: u64,
    pub decode_errors: u64,
    pub snapshot_errors: u64,
    pub buffer_evictions: u64,
    pub rows_written: u64,
    pub rows_lost: u64,
    pub last_flush_unix_ms: u64,
    pub last_batch_len: u64,
    pub average_flush_ms: f64,
    pub mqtt_connected: bool,
    pub last_error: Option<String>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            messages_received: load(&self.messages_received),
            readings_buffered: load(&self.readings_buffered),
            decode_errors: load(&self.decode_errors),
            snapshot_errors: load(&self.snapshot_errors),
            buffer_evictions: load(&self.buffer_evictions),
            rows_written: load(&self.rows_written),
            rows_lost: load(&self.rows_lost),
            last_flush_unix_ms: load(&self.last_flush_unix_ms),
            last_batch_len: load(&self.last_batch_len),
            average_flush_ms: load(&self.average_flush_micros) as f64 / 1000.0,
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Interval,
    Shutdown,
}

impl FlushReason {
    fn as_str(self) -> &'static str {
        match self {
            FlushReason::Interval => "interval",
            FlushReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written(u64),
    /// The drained batch did not commit and is gone.
    Lost(u64),
}

/// One flush cycle: take ownership of everything buffered, then write it in a
/// single transaction. A failed batch is counted as lost, not re-buffered.
pub async fn flush_once(
    store: &Store,
    buffer: &IngestBuffer,
    stats: &IngestStats,
    reason: FlushReason,
) -> FlushOutcome {
    let items = buffer.drain();
    if items.is_empty() {
        tracing::debug!(reason = reason.as_str(), "nothing buffered; skipping flush");
        return FlushOutcome::Empty;
    }

    let started = Instant::now();
    let len = items.len() as u64;
    match store.append_batch(&items).await {
        Ok(inserted) => {
            stats.rows_written.fetch_add(inserted, Ordering::Relaxed);
            stats.last_batch_len.store(len, Ordering::Relaxed);
            let now = Utc::now().timestamp_millis() as u64;
            stats.last_flush_unix_ms.store(now, Ordering::Relaxed);
            let micros = started.elapsed().as_micros() as u64;
            let prev = stats.average_flush_micros.load(Ordering::Relaxed);
            let avg = if prev == 0 {
                micros
            } else {
                (prev + micros) / 2
            };
            stats.average_flush_micros.store(avg, Ordering::Relaxed);
            stats.clear_error();
            tracing::info!(reason = reason.as_str(), rows = inserted, micros, "flushed readings batch");
            FlushOutcome::Written(inserted)
        }
        Err(err) => {
            stats.rows_lost.fetch_add(len, Ordering::Relaxed);
            stats.record_error(err.to_string());
            tracing::error!(
                reason = reason.as_str(),
                error = %err,
                lost = len,
                "failed to persist readings batch; batch dropped"
            );
            FlushOutcome::Lost(len)
        }
    }
}

/// Handle to the periodic flusher task.
pub struct FlusherHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<FlushOutcome>,
    store: Store,
    buffer: Arc<IngestBuffer>,
    stats: Arc<IngestStats>,
}

impl FlusherHandle {
    /// Stops the ticker and performs the final flush. Any in-flight interval cycle
    /// commits first, and this only returns once the final batch has committed (or
    /// been reported lost). If the task died, the final flush runs here instead.
    pub async fn shutdown(self) -> FlushOutcome {
        let _ = self.shutdown_tx.send(());
        match self.join.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(error = %err, "flusher task failed; flushing from shutdown");
                flush_once(&self.store, &self.buffer, &self.stats, FlushReason::Shutdown).await
            }
        }
    }
}

/// Cancels a task that feeds the buffer and waits until it is gone. Cancellation
/// lands at the next await point, so a message already being handled is appended
/// before this returns.
pub async fn stop_producer<T>(name: &str, handle: JoinHandle<T>) {
    handle.abort();
    if let Err(err) = handle.await {
        if !err.is_cancelled() {
            tracing::error!(task = name, error = %err, "task failed during shutdown");
        }
    }
}

pub fn spawn_flusher(
    store: Store,
    buffer: Arc<IngestBuffer>,
    stats: Arc<IngestStats>,
    flush_interval: Duration,
) -> FlusherHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let join = {
        let store = store.clone();
        let buffer = buffer.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + flush_interval;
            let mut ticker = tokio::time::interval_at(start, flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        flush_once(&store, &buffer, &stats, FlushReason::Interval).await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            flush_once(&store, &buffer, &stats, FlushReason::Shutdown).await
        })
    };

    FlusherHandle {
        shutdown_tx,
        join,
        store,
        buffer,
        stats,
    }
}
