//! Tuned parameters for the DSP components and connection policies.
//!
//! The numeric defaults here are tuned values, not derived constraints:
//! callers may override any of them per instance. Nothing in the engine
//! validates data against these as invariants.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters for the pulse beat detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeatDetectorConfig {
    /// Sample rate of the optical waveform in Hz.
    pub sample_rate_hz: f64,
    /// Band-pass low cutoff in Hz. Removes baseline wander.
    pub band_low_hz: f64,
    /// Band-pass high cutoff in Hz. Removes high-frequency noise.
    pub band_high_hz: f64,
    /// Minimum spacing between accepted peaks in seconds.
    /// The 0.4 s default caps the detectable rate at 150/min.
    pub min_peak_distance_s: f64,
    /// Prominence threshold as a fraction of the filtered signal's
    /// standard deviation. The check is skipped when the computed
    /// threshold is non-positive.
    pub prominence_std_fraction: f64,
    /// Look-back/look-ahead window in seconds used to bound the
    /// onset/offset search at the edges of the peak sequence.
    pub edge_search_window_s: f64,
}

impl Default for BeatDetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50.0,
            band_low_hz: 0.5,
            band_high_hz: 8.0,
            min_peak_distance_s: 0.4,
            prominence_std_fraction: 0.5,
            edge_search_window_s: 0.3,
        }
    }
}

/// Parameters for the infrared DC occlusion analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrDcConfig {
    /// Sample rate of the infrared channel in Hz.
    pub sample_rate_hz: f64,
    /// Low-pass cutoff isolating the slow baseline, in Hz.
    pub cutoff_hz: f64,
    /// Rolling-mean window in seconds.
    pub window_s: f64,
    /// Early reference sub-window in seconds used for the shift value.
    pub reference_s: f64,
    /// Cap on the streaming ring buffer in seconds.
    pub ring_capacity_s: f64,
}

impl Default for IrDcConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50.0,
            cutoff_hz: 0.8,
            window_s: 5.0,
            reference_s: 1.0,
            ring_capacity_s: 60.0,
        }
    }
}

/// Parameters for HRV interval extraction and the SVD biomarker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HrvConfig {
    /// Cap on the retained beat peak-time history.
    pub max_peak_history: usize,
    /// Shortest physiologically plausible RR interval in seconds (180 bpm).
    pub min_rr_s: f64,
    /// Longest physiologically plausible RR interval in seconds (40 bpm).
    pub max_rr_s: f64,
    /// Delay-embedding dimension: each matrix row is this many
    /// consecutive intervals.
    pub embedding_dim: usize,
}

impl Default for HrvConfig {
    fn default() -> Self {
        Self {
            max_peak_history: 100,
            min_rr_s: 0.33,
            max_rr_s: 1.5,
            embedding_dim: 3,
        }
    }
}

/// Parameters for the readiness orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Per-step timeout for mandatory discovery steps.
    pub step_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(10),
        }
    }
}

/// Parameters for the reconnection and liveness policy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum reconnection attempts before giving up.
    pub max_attempts: u32,
    /// Delay before each reconnection attempt.
    pub retry_delay: Duration,
    /// How often to poll signal strength while devices are connected.
    pub rssi_poll_interval: Duration,
    /// A peripheral with no traffic or signal update for this long is
    /// reported as stale.
    pub staleness_window: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_secs(2),
            rssi_poll_interval: Duration::from_secs(10),
            staleness_window: Duration::from_secs(30),
        }
    }
}

/// Parameters for the reading router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Cap on the rolling reading history.
    pub history_capacity: usize,
    /// How many entries to drop at once when the cap is exceeded.
    pub eviction_chunk: usize,
    /// A batch whose optical channel never exceeds this floor produces
    /// no sample record (near-zero signal means no tissue contact).
    pub validity_floor: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            eviction_chunk: 100,
            validity_floor: 1e-3,
        }
    }
}

/// Aggregate configuration for the whole engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub orchestrator: OrchestratorConfig,
    pub reconnect: ReconnectConfig,
    pub router: RouterConfig,
    pub beats: BeatDetectorConfig,
    pub ir_dc: IrDcConfig,
    pub hrv: HrvConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_physiological() {
        let hrv = HrvConfig::default();
        // 180 bpm .. 40 bpm
        assert!((hrv.min_rr_s - 0.33).abs() < 1e-9);
        assert!((hrv.max_rr_s - 1.5).abs() < 1e-9);

        let beats = BeatDetectorConfig::default();
        assert!(beats.band_low_hz < beats.band_high_hz);
        // 0.4 s spacing caps detection at 150 bpm.
        assert!((60.0 / beats.min_peak_distance_s - 150.0).abs() < 1e-9);
    }
}
