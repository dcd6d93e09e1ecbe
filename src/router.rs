//! Reading router and rolling buffer
//!
//! Fans raw per-channel readings out from connected devices to
//! subscribers and maintains a bounded rolling history. Readings always
//! arrive in batches, never singly, which bounds downstream update
//! frequency; within one batch the latest-value map is written at most
//! once per sensor type so subscribers never see redundant updates.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::{debug, trace};
use tokio::sync::broadcast;

use crate::config::RouterConfig;
use crate::types::{
    DeviceKind, MotionSample, PeripheralId, PpgSample, SensorReading, SensorSample, SensorType,
};

/// One delivery of readings from a single peripheral, in source order.
#[derive(Debug, Clone)]
pub struct ReadingBatch {
    pub device: PeripheralId,
    pub kind: DeviceKind,
    pub readings: Vec<SensorReading>,
}

/// Delivery counters for one peripheral.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceStats {
    pub batches: u64,
    pub readings: u64,
    pub last_batch_at: Option<DateTime<Utc>>,
}

pub struct ReadingRouter {
    config: RouterConfig,
    /// Latest value per sensor type across all devices.
    latest: RwLock<HashMap<SensorType, SensorReading>>,
    /// Append-only rolling history with oldest-first chunk eviction.
    history: RwLock<VecDeque<SensorReading>>,
    stats: RwLock<HashMap<PeripheralId, DeviceStats>>,
    batches_tx: broadcast::Sender<ReadingBatch>,
    samples_tx: broadcast::Sender<SensorSample>,
}

impl ReadingRouter {
    pub fn new(config: RouterConfig) -> Self {
        let (batches_tx, _) = broadcast::channel(256);
        let (samples_tx, _) = broadcast::channel(256);
        Self {
            config,
            latest: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            stats: RwLock::new(HashMap::new()),
            batches_tx,
            samples_tx,
        }
    }

    /// Ingest one batch: merge into the latest-value map, append to the
    /// capped history, derive the per-device sample record, and re-emit
    /// the batch to subscribers.
    pub fn ingest(&self, batch: ReadingBatch) {
        if batch.readings.is_empty() {
            return;
        }

        self.merge_latest(&batch.readings);
        self.append_history(&batch.readings);
        self.count_delivery(&batch);

        if let Some(sample) = self.assemble_sample(&batch) {
            let _ = self.samples_tx.send(sample);
        }

        trace!(
            "[{}] routed batch of {} readings",
            batch.device,
            batch.readings.len()
        );
        let _ = self.batches_tx.send(batch);
    }

    /// Latest reading for a sensor type, if any has arrived.
    pub fn latest(&self, sensor_type: SensorType) -> Option<SensorReading> {
        self.latest
            .read()
            .ok()
            .and_then(|m| m.get(&sensor_type).cloned())
    }

    /// Snapshot of the rolling history for one sensor type, oldest first.
    pub fn history_for(&self, sensor_type: SensorType) -> Vec<SensorReading> {
        self.history
            .read()
            .map(|h| {
                h.iter()
                    .filter(|r| r.sensor_type == sensor_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total readings currently retained.
    pub fn history_len(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }

    /// Delivery counters for one peripheral. Zeroed until its first batch.
    pub fn stats_for(&self, device: &PeripheralId) -> DeviceStats {
        self.stats
            .read()
            .ok()
            .and_then(|s| s.get(device).copied())
            .unwrap_or_default()
    }

    /// Subscribe to re-emitted reading batches.
    pub fn batches(&self) -> broadcast::Receiver<ReadingBatch> {
        self.batches_tx.subscribe()
    }

    /// Subscribe to derived per-device sample records.
    pub fn samples(&self) -> broadcast::Receiver<SensorSample> {
        self.samples_tx.subscribe()
    }

    /// Single update per sensor type per batch: the last reading of each
    /// type in the batch wins.
    fn merge_latest(&self, readings: &[SensorReading]) {
        let mut newest: HashMap<SensorType, &SensorReading> = HashMap::new();
        for reading in readings {
            newest.insert(reading.sensor_type, reading);
        }
        if let Ok(mut latest) = self.latest.write() {
            for (sensor_type, reading) in newest {
                latest.insert(sensor_type, reading.clone());
            }
        }
    }

    fn count_delivery(&self, batch: &ReadingBatch) {
        if let Ok(mut stats) = self.stats.write() {
            let entry = stats.entry(batch.device.clone()).or_default();
            entry.batches += 1;
            entry.readings += batch.readings.len() as u64;
            entry.last_batch_at = Some(Utc::now());
        }
    }

    fn append_history(&self, readings: &[SensorReading]) {
        if let Ok(mut history) = self.history.write() {
            history.extend(readings.iter().cloned());
            if history.len() > self.config.history_capacity {
                // Drop a coarse chunk rather than one entry at a time.
                let excess = history.len() - self.config.history_capacity;
                let drop_count = excess.max(self.config.eviction_chunk).min(history.len());
                history.drain(..drop_count);
                debug!("evicted {} oldest readings from history", drop_count);
            }
        }
    }

    /// Build the device-kind-tagged sample record for a batch.
    ///
    /// Returns `None` when no channel value clears the validity floor,
    /// e.g. a near-zero optical signal with the ring off the finger.
    fn assemble_sample(&self, batch: &ReadingBatch) -> Option<SensorSample> {
        let valid = batch
            .readings
            .iter()
            .any(|r| r.value.abs() > self.config.validity_floor);
        if !valid {
            return None;
        }

        let timestamp: DateTime<Utc> = batch
            .readings
            .iter()
            .map(|r| r.timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        let mut sample = SensorSample::empty(batch.device.clone(), batch.kind, timestamp);

        let last = |t: SensorType| -> Option<f64> {
            batch
                .readings
                .iter()
                .rev()
                .find(|r| r.sensor_type == t)
                .map(|r| r.value)
        };

        match batch.kind {
            DeviceKind::OpticalRing => {
                if let Some(pulsatile) = last(SensorType::Ppg) {
                    sample.ppg = Some(PpgSample {
                        pulsatile,
                        infrared: last(SensorType::PpgInfrared),
                    });
                }
                let (x, y, z) = (
                    last(SensorType::AccelX),
                    last(SensorType::AccelY),
                    last(SensorType::AccelZ),
                );
                if let (Some(x), Some(y), Some(z)) = (x, y, z) {
                    sample.motion = Some(MotionSample { x, y, z });
                }
                sample.temperature = last(SensorType::Temperature);
                sample.battery = last(SensorType::Battery);
                sample.heart_rate = last(SensorType::HeartRate);
                sample.spo2 = last(SensorType::SpO2);
            }
            DeviceKind::EmgComparator => {
                sample.emg = last(SensorType::Emg);
                sample.battery = last(SensorType::Battery);
            }
        }

        sample.has_any_channel().then_some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ring_id() -> PeripheralId {
        PeripheralId::Simulated(Uuid::new_v4())
    }

    fn batch(device: &PeripheralId, kind: DeviceKind, readings: Vec<SensorReading>) -> ReadingBatch {
        ReadingBatch {
            device: device.clone(),
            kind,
            readings,
        }
    }

    #[test]
    fn test_latest_takes_last_per_type_in_batch() {
        let router = ReadingRouter::new(RouterConfig::default());
        let id = ring_id();
        router.ingest(batch(
            &id,
            DeviceKind::OpticalRing,
            vec![
                SensorReading::new(SensorType::Ppg, 10.0),
                SensorReading::new(SensorType::Ppg, 20.0),
                SensorReading::new(SensorType::HeartRate, 68.0),
            ],
        ));

        assert_eq!(router.latest(SensorType::Ppg).unwrap().value, 20.0);
        assert_eq!(router.latest(SensorType::HeartRate).unwrap().value, 68.0);
    }

    #[test]
    fn test_history_evicts_coarse_chunks() {
        let config = RouterConfig {
            history_capacity: 100,
            eviction_chunk: 25,
            ..RouterConfig::default()
        };
        let router = ReadingRouter::new(config);
        let id = ring_id();

        for _ in 0..11 {
            let readings: Vec<SensorReading> = (0..10)
                .map(|i| SensorReading::new(SensorType::Ppg, f64::from(i) + 1.0))
                .collect();
            router.ingest(batch(&id, DeviceKind::OpticalRing, readings));
        }

        // 110 ingested; one chunk of 25 evicted once the cap was crossed.
        assert_eq!(router.history_len(), 85);
    }

    #[test]
    fn test_batch_below_validity_floor_produces_no_sample() {
        let router = ReadingRouter::new(RouterConfig::default());
        let id = ring_id();
        let mut samples = router.samples();

        router.ingest(batch(
            &id,
            DeviceKind::OpticalRing,
            vec![
                SensorReading::new(SensorType::Ppg, 0.0),
                SensorReading::new(SensorType::PpgInfrared, 0.0),
            ],
        ));
        assert!(samples.try_recv().is_err());

        // A real optical value clears the floor.
        router.ingest(batch(
            &id,
            DeviceKind::OpticalRing,
            vec![SensorReading::new(SensorType::Ppg, 1234.5)],
        ));
        let sample = samples.try_recv().unwrap();
        assert_eq!(sample.ppg.unwrap().pulsatile, 1234.5);
    }

    #[test]
    fn test_device_kind_routes_channels() {
        let router = ReadingRouter::new(RouterConfig::default());
        let ring = ring_id();
        let emg = ring_id();
        let mut samples = router.samples();

        router.ingest(batch(
            &ring,
            DeviceKind::OpticalRing,
            vec![
                SensorReading::new(SensorType::Ppg, 500.0),
                SensorReading::new(SensorType::AccelX, 0.1),
                SensorReading::new(SensorType::AccelY, 0.2),
                SensorReading::new(SensorType::AccelZ, 0.9),
            ],
        ));
        router.ingest(batch(
            &emg,
            DeviceKind::EmgComparator,
            vec![SensorReading::new(SensorType::Emg, 42.0)],
        ));

        let ring_sample = samples.try_recv().unwrap();
        assert_eq!(ring_sample.kind, DeviceKind::OpticalRing);
        assert!(ring_sample.ppg.is_some());
        assert!(ring_sample.motion.is_some());
        assert!(ring_sample.emg.is_none());

        let emg_sample = samples.try_recv().unwrap();
        assert_eq!(emg_sample.kind, DeviceKind::EmgComparator);
        assert_eq!(emg_sample.emg, Some(42.0));
        assert!(emg_sample.ppg.is_none());
    }

    #[test]
    fn test_batch_reemitted_to_subscribers() {
        let router = ReadingRouter::new(RouterConfig::default());
        let id = ring_id();
        let mut batches = router.batches();

        router.ingest(batch(
            &id,
            DeviceKind::OpticalRing,
            vec![SensorReading::new(SensorType::Ppg, 1.0)],
        ));

        let received = batches.try_recv().unwrap();
        assert_eq!(received.device, id);
        assert_eq!(received.readings.len(), 1);
    }

    #[test]
    fn test_stats_count_batches_per_device() {
        let router = ReadingRouter::new(RouterConfig::default());
        let a = ring_id();
        let b = ring_id();

        for _ in 0..3 {
            router.ingest(batch(
                &a,
                DeviceKind::OpticalRing,
                vec![
                    SensorReading::new(SensorType::Ppg, 1.0),
                    SensorReading::new(SensorType::PpgInfrared, 2.0),
                ],
            ));
        }
        router.ingest(batch(
            &b,
            DeviceKind::EmgComparator,
            vec![SensorReading::new(SensorType::Emg, 3.0)],
        ));

        let stats_a = router.stats_for(&a);
        assert_eq!(stats_a.batches, 3);
        assert_eq!(stats_a.readings, 6);
        assert!(stats_a.last_batch_at.is_some());

        let stats_b = router.stats_for(&b);
        assert_eq!(stats_b.batches, 1);
        assert_eq!(router.stats_for(&ring_id()).batches, 0);
    }

    #[test]
    fn test_empty_batch_is_ignored() {
        let router = ReadingRouter::new(RouterConfig::default());
        let id = ring_id();
        let mut batches = router.batches();

        router.ingest(batch(&id, DeviceKind::OpticalRing, vec![]));
        assert!(batches.try_recv().is_err());
        assert_eq!(router.history_len(), 0);
    }
}
