use crate::buffer::IngestBuffer;
use crate::pipeline::IngestStats;
use crate::reading::{local_now, parse_sensor_message, Reading};
use crate::snapshot::SnapshotStore;
use chrono::NaiveDateTime;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Turns bus messages into readings. Everything here is synchronous and bounded:
/// a snapshot file replace and a buffer push, never a database write.
#[derive(Clone)]
pub struct MessageHandler {
    buffer: Arc<IngestBuffer>,
    snapshots: SnapshotStore,
    stats: Arc<IngestStats>,
}

impl MessageHandler {
    pub fn new(buffer: Arc<IngestBuffer>, snapshots: SnapshotStore, stats: Arc<IngestStats>) -> Self {
        Self {
            buffer,
            snapshots,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    #[cfg(test)]
    pub fn buffer(&self) -> Arc<IngestBuffer> {
        self.buffer.clone()
    }

    pub fn handle(&self, topic: &str, payload: &mut [u8]) -> Option<Reading> {
        self.handle_at(topic, payload, local_now())
    }

    /// Decodes with an explicit receive time. Bad input is logged once and
    /// dropped; it never surfaces as an error to the delivery loop.
    pub fn handle_at(
        &self,
        topic: &str,
        payload: &mut [u8],
        received_at: NaiveDateTime,
    ) -> Option<Reading> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);

        let reading = match parse_sensor_message(topic, payload, received_at) {
            Ok(reading) => reading,
            Err(err) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    topic = %topic,
                    payload_len = payload.len(),
                    error = %err,
                    "dropping sensor message"
                );
                return None;
            }
        };

        if let Err(err) = self.snapshots.put(&reading) {
            self.stats.snapshot_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                sensor_type = %reading.sensor_type,
                location = %reading.location,
                error = %err,
                "failed to write latest-value snapshot"
            );
        }

        if let Some(evicted) = self.buffer.append(reading.clone()) {
            self.stats.buffer_evictions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                sensor_type = %evicted.sensor_type,
                location = %evicted.location,
                timestamp = %evicted.timestamp_text(),
                capacity = self.buffer.capacity().unwrap_or_default(),
                "ingest buffer full; evicted oldest reading"
            );
        }
        self.stats.readings_buffered.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            sensor_type = %reading.sensor_type,
            location = %reading.location,
            value = reading.value,
            "buffered reading"
        );

        Some(reading)
    }
}
