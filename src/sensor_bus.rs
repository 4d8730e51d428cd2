//! Sensor Bus
//!
//! Ingests tagged readings and serves two kinds of queries:
//!
//! - `latest(sensor_id, header)`: last reading for a key, whatever its class
//! - `snapshot(deadline)`: all latest readings for one trigger cycle, waiting
//!   up to `deadline` for every configured synchronous header to arrive
//!
//! Asynchronous readings overwrite the previous value for their key and never
//! block. Synchronous readings count towards completeness only while fresh
//! (received within `synchronous_timeout` of the snapshot call) and only once:
//! a complete snapshot marks the readings it used as consumed.
//!
//! A snapshot that reaches its deadline returns `complete = false` with every
//! asynchronous value and any fresh synchronous ones. Stale synchronous
//! readings are never attached to a record.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::config::SensorConfig;
use crate::core::{SensorClass, SensorReading, SensorSnapshot};

#[derive(Debug)]
struct Entry {
    reading: SensorReading,
    received: Instant,
    consumed: bool,
}

type Key = (String, String);

/// Latest-value store for sensor readings with a synchronous wait primitive.
#[derive(Debug)]
pub struct SensorBus {
    config: SensorConfig,
    latest: RwLock<HashMap<Key, Entry>>,
    generation: watch::Sender<u64>,
}

impl SensorBus {
    pub fn new(config: SensorConfig) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            config,
            latest: RwLock::new(HashMap::new()),
            generation,
        }
    }

    /// Class assigned to `header` by configuration.
    pub fn classify(&self, header: &str) -> SensorClass {
        self.config.class_of(header)
    }

    /// Build a reading classified by configuration.
    pub fn reading(
        &self,
        sensor_id: impl Into<String>,
        header: impl Into<String>,
        payload: impl Into<String>,
    ) -> SensorReading {
        let header = header.into();
        let class = self.classify(&header);
        SensorReading::new(sensor_id, header, payload, class)
    }

    pub fn synchronous_timeout(&self) -> Duration {
        self.config.synchronous_timeout()
    }

    /// Store a reading and wake any waiting snapshot.
    pub async fn publish(&self, reading: SensorReading) {
        trace!(
            sensor = %reading.sensor_id,
            header = %reading.header,
            class = %reading.class,
            "Sensor reading"
        );
        let key = (reading.sensor_id.clone(), reading.header.clone());
        self.latest.write().await.insert(
            key,
            Entry {
                reading,
                received: Instant::now(),
                consumed: false,
            },
        );
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Latest reading for `(sensor_id, header)`.
    pub async fn latest(&self, sensor_id: &str, header: &str) -> Option<SensorReading> {
        self.latest
            .read()
            .await
            .get(&(sensor_id.to_string(), header.to_string()))
            .map(|e| e.reading.clone())
    }

    /// Every stored reading, ordered by sensor id then header.
    pub async fn all_latest(&self) -> Vec<SensorReading> {
        let mut readings: Vec<SensorReading> = self
            .latest
            .read()
            .await
            .values()
            .map(|e| e.reading.clone())
            .collect();
        readings.sort_by(|a, b| (&a.sensor_id, &a.header).cmp(&(&b.sensor_id, &b.header)));
        readings
    }

    /// Collect the readings for one cycle, waiting until `deadline` for the
    /// configured synchronous headers.
    pub async fn snapshot(&self, deadline: Instant) -> SensorSnapshot {
        let called = Instant::now();
        let timeout = self.config.synchronous_timeout();
        let mut changes = self.generation.subscribe();

        loop {
            {
                let mut latest = self.latest.write().await;
                if let Some(keys) = self.satisfying_keys(&latest, called, timeout) {
                    for key in &keys {
                        if let Some(entry) = latest.get_mut(key) {
                            entry.consumed = true;
                        }
                    }
                    return SensorSnapshot {
                        readings: Self::collect(&latest, called, timeout, &keys),
                        complete: true,
                    };
                }
            }

            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep_until(deadline) => break,
            }
        }

        let latest = self.latest.read().await;
        debug!(
            waiting_for = ?self.config.synchronous,
            "Sensor snapshot deadline reached, record is partial"
        );
        SensorSnapshot {
            readings: Self::collect(&latest, called, timeout, &[]),
            complete: false,
        }
    }

    /// Keys that together satisfy every synchronous header, or `None`.
    fn satisfying_keys(
        &self,
        latest: &HashMap<Key, Entry>,
        called: Instant,
        timeout: Duration,
    ) -> Option<Vec<Key>> {
        let mut keys = Vec::with_capacity(self.config.synchronous.len());
        for header in &self.config.synchronous {
            let key = latest
                .iter()
                .filter(|(k, e)| {
                    &k.1 == header
                        && e.reading.class == SensorClass::Synchronous
                        && !e.consumed
                        && is_fresh(e.received, called, timeout)
                })
                .max_by_key(|(_, e)| e.received)
                .map(|(k, _)| k.clone())?;
            keys.push(key);
        }
        Some(keys)
    }

    fn collect(
        latest: &HashMap<Key, Entry>,
        called: Instant,
        timeout: Duration,
        used: &[Key],
    ) -> Vec<SensorReading> {
        let mut readings: Vec<SensorReading> = latest
            .iter()
            .filter(|(key, e)| match e.reading.class {
                SensorClass::Asynchronous => true,
                SensorClass::Synchronous => {
                    used.contains(key) || (!e.consumed && is_fresh(e.received, called, timeout))
                }
            })
            .map(|(_, e)| e.reading.clone())
            .collect();
        readings.sort_by(|a, b| (&a.sensor_id, &a.header).cmp(&(&b.sensor_id, &b.header)));
        readings
    }
}

fn is_fresh(received: Instant, reference: Instant, timeout: Duration) -> bool {
    reference.saturating_duration_since(received) <= timeout
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bus_with_sync(headers: &[&str], timeout_ms: u64) -> SensorBus {
        SensorBus::new(SensorConfig {
            synchronous: headers.iter().map(|s| s.to_string()).collect(),
            synchronous_timeout_ms: timeout_ms,
            ..SensorConfig::default()
        })
    }

    #[tokio::test]
    async fn test_latest_returns_most_recent_async_reading() {
        let bus = bus_with_sync(&[], 100);
        bus.publish(bus.reading("ctd", "$CTCS", "R1")).await;
        bus.publish(bus.reading("ctd", "$CTCS", "R2")).await;

        let latest = bus.latest("ctd", "$CTCS").await.unwrap();
        assert_eq!(latest.payload, "R2");
        assert_eq!(latest.class, SensorClass::Asynchronous);
    }

    #[tokio::test]
    async fn test_snapshot_without_sync_headers_is_immediately_complete() {
        let bus = bus_with_sync(&[], 100);
        bus.publish(bus.reading("imu", "$IMUC", "x")).await;

        let start = Instant::now();
        let snap = bus.snapshot(start + Duration::from_secs(5)).await;
        assert!(snap.complete);
        assert_eq!(snap.readings.len(), 1);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_missing_sync_reading_returns_partial_at_deadline() {
        let bus = bus_with_sync(&["$OHPR"], 50);
        bus.publish(bus.reading("imu", "$IMUC", "x")).await;

        let start = Instant::now();
        let snap = bus.snapshot(start + Duration::from_millis(50)).await;
        let elapsed = start.elapsed();

        assert!(!snap.complete);
        assert_eq!(snap.readings.len(), 1, "async reading still attached");
        assert!(
            elapsed >= Duration::from_millis(45) && elapsed < Duration::from_millis(500),
            "snapshot should return at the deadline, took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_sync_reading_published_during_wait_completes_snapshot() {
        let bus = Arc::new(bus_with_sync(&["$OHPR"], 1000));
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                bus.publish(bus.reading("compass", "$OHPR", "heading")).await;
            })
        };

        let snap = bus.snapshot(Instant::now() + Duration::from_secs(1)).await;
        publisher.await.unwrap();
        assert!(snap.complete);
        assert_eq!(snap.readings[0].payload, "heading");
    }

    #[tokio::test]
    async fn test_sync_reading_is_consumed_once() {
        let bus = bus_with_sync(&["$OHPR"], 1000);
        bus.publish(bus.reading("compass", "$OHPR", "h1")).await;

        let first = bus.snapshot(Instant::now() + Duration::from_millis(30)).await;
        assert!(first.complete);

        let second = bus.snapshot(Instant::now() + Duration::from_millis(30)).await;
        assert!(!second.complete, "consumed reading must not satisfy a second cycle");
        assert!(second.readings.is_empty());
    }

    #[tokio::test]
    async fn test_stale_sync_reading_is_excluded() {
        let bus = bus_with_sync(&["$OHPR"], 20);
        bus.publish(bus.reading("compass", "$OHPR", "old")).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let snap = bus.snapshot(Instant::now() + Duration::from_millis(20)).await;
        assert!(!snap.complete);
        assert!(
            snap.readings.iter().all(|r| r.payload != "old"),
            "stale synchronous reading leaked into snapshot"
        );
        // still visible through latest()
        assert!(bus.latest("compass", "$OHPR").await.is_some());
    }
}
