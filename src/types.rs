//! Shared value types for the connectivity and signal-processing engine.
//!
//! Everything here is an immutable snapshot once constructed: readings,
//! beat features and biomarker results are never revised after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity for one physical peripheral.
///
/// Reconnection reuses retry and readiness state keyed by this identity
/// across distinct low-level connection objects, so it must survive
/// disconnect/reconnect cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeripheralId {
    /// A real 6-byte BLE MAC address.
    Mac([u8; 6]),
    /// A simulated peripheral identified by UUID.
    Simulated(Uuid),
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeripheralId::Mac(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            PeripheralId::Simulated(u) => write!(f, "sim:{}", u),
        }
    }
}

/// Which kind of device produced a batch of readings.
///
/// Channel semantics differ per device type: the optical ring carries
/// PPG/SpO2/temperature channels, the comparison device carries an
/// EMG-style channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Primary optical (PPG) wearable.
    OpticalRing,
    /// EMG-style comparison device.
    EmgComparator,
}

/// One logical sensor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorType {
    /// Pulsatile optical channel (green LED).
    Ppg,
    /// Infrared optical channel, carries the DC baseline.
    PpgInfrared,
    AccelX,
    AccelY,
    AccelZ,
    Temperature,
    Battery,
    HeartRate,
    SpO2,
    /// Muscle-activity channel on the comparison device.
    Emg,
}

/// A single timestamped sensor value. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_type: SensorType,
    pub value: f64,
    /// Optional per-reading quality indicator (0.0 poor .. 1.0 excellent).
    pub quality: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    pub fn new(sensor_type: SensorType, value: f64) -> Self {
        Self {
            sensor_type,
            value,
            quality: None,
            timestamp: Utc::now(),
        }
    }
}

/// Inertial sub-record of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Optical sub-record of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PpgSample {
    /// Pulsatile (green) channel.
    pub pulsatile: f64,
    /// Infrared DC channel, when the device reports it.
    pub infrared: Option<f64>,
}

/// A coherent multi-channel snapshot at one timestamp, tagged with the
/// device kind that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub device: PeripheralId,
    pub kind: DeviceKind,
    pub timestamp: DateTime<Utc>,
    pub ppg: Option<PpgSample>,
    pub motion: Option<MotionSample>,
    pub temperature: Option<f64>,
    pub battery: Option<f64>,
    pub heart_rate: Option<f64>,
    pub spo2: Option<f64>,
    pub emg: Option<f64>,
}

impl SensorSample {
    pub fn empty(device: PeripheralId, kind: DeviceKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            device,
            kind,
            timestamp,
            ppg: None,
            motion: None,
            temperature: None,
            battery: None,
            heart_rate: None,
            spo2: None,
            emg: None,
        }
    }

    /// Whether any channel carries a value at all.
    pub fn has_any_channel(&self) -> bool {
        self.ppg.is_some()
            || self.motion.is_some()
            || self.temperature.is_some()
            || self.battery.is_some()
            || self.heart_rate.is_some()
            || self.spo2.is_some()
            || self.emg.is_some()
    }
}

/// One detected cardiac beat with onset/peak/offset landmarks.
///
/// Indices refer into the analyzed window; times are seconds from the
/// start of that window. Ordered by `peak_time` in detector output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatFeature {
    pub onset_index: usize,
    pub peak_index: usize,
    pub offset_index: usize,
    pub onset_time: f64,
    pub peak_time: f64,
    pub offset_time: f64,
    pub rise_time: f64,
    pub fall_time: f64,
    pub peak_amplitude: f64,
    pub onset_amplitude: f64,
    /// Mean of the infrared DC channel around the beat, when available.
    pub ir_dc_mean: Option<f64>,
}

/// Time-domain HRV statistics over a set of RR intervals, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvStats {
    pub sdnn_ms: f64,
    pub rmssd_ms: f64,
    /// Number of intervals the statistics were computed from.
    pub interval_count: usize,
}

/// Leading singular values of the delay-embedded RR matrix.
///
/// `ratio` is `s1 / s2` and is `None` when the second singular value is
/// numerically zero (a perfectly periodic rhythm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HrvSvdResult {
    pub s1: f64,
    pub s2: Option<f64>,
    pub ratio: Option<f64>,
}

/// Baseline drift summary of the infrared DC channel.
///
/// A positive `shift` means the baseline has dropped over the window,
/// which the design treats as a probable occlusion/contraction event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrDcResult {
    /// Current low-passed baseline value.
    pub dc_value: f64,
    /// Rolling mean over the configured window (default 5 s).
    pub rolling_mean: f64,
    /// Mean of the early reference sub-window minus mean of the full window.
    pub shift: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peripheral_id_display() {
        let mac = PeripheralId::Mac([0xA0, 0x12, 0x00, 0xFF, 0x01, 0x02]);
        assert_eq!(mac.to_string(), "A0:12:00:FF:01:02");

        let sim = PeripheralId::Simulated(Uuid::nil());
        assert!(sim.to_string().starts_with("sim:"));
    }

    #[test]
    fn test_peripheral_id_equality_across_kinds() {
        let mac = PeripheralId::Mac([0; 6]);
        let sim = PeripheralId::Simulated(Uuid::nil());
        assert_ne!(mac, sim);
    }

    #[test]
    fn test_reading_survives_json_boundary() {
        let reading = SensorReading::new(SensorType::PpgInfrared, 98_432.0);
        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("PpgInfrared"));

        let back: SensorReading = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reading);
    }

    #[test]
    fn test_biomarker_result_serializes_optional_fields() {
        let result = HrvSvdResult {
            s1: 4.2,
            s2: Some(0.7),
            ratio: Some(6.0),
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: HrvSvdResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);

        // An undefined ratio crosses the boundary as null, not an error.
        let periodic: HrvSvdResult = serde_json::from_str(
            r#"{"s1":3.0,"s2":null,"ratio":null}"#,
        )
        .unwrap();
        assert!(periodic.ratio.is_none());
    }

    #[test]
    fn test_empty_sample_has_no_channels() {
        let sample = SensorSample::empty(
            PeripheralId::Simulated(Uuid::nil()),
            DeviceKind::OpticalRing,
            Utc::now(),
        );
        assert!(!sample.has_any_channel());
    }
}
