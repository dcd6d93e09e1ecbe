//! Infrared DC baseline and occlusion analysis
//!
//! Isolates the slow DC drift of the optical signal with a low-pass
//! filter and summarizes it as a rolling mean plus a *shift* value:
//! mean of an early reference sub-window minus mean of the full window.
//! A positive shift means the baseline has dropped, which the design
//! treats as a probable tissue occlusion/contraction event.

use std::collections::VecDeque;

use super::filter::ButterworthFilter;
use crate::config::IrDcConfig;
use crate::types::IrDcResult;

fn mean(values: impl Iterator<Item = f64>, len: usize) -> f64 {
    if len == 0 {
        return 0.0;
    }
    values.sum::<f64>() / len as f64
}

/// Whole-array batch analyzer.
pub struct IrDcAnalyzer {
    config: IrDcConfig,
    filter: ButterworthFilter,
}

impl IrDcAnalyzer {
    pub fn new(config: IrDcConfig) -> Self {
        let filter = ButterworthFilter::low_pass(config.sample_rate_hz, config.cutoff_hz);
        Self { config, filter }
    }

    /// Analyze one window of the infrared channel.
    ///
    /// Empty input yields an all-zero result; the streaming contract is
    /// that thin data never raises.
    pub fn analyze(&self, signal: &[f64]) -> IrDcResult {
        if signal.is_empty() {
            return IrDcResult {
                dc_value: 0.0,
                rolling_mean: 0.0,
                shift: 0.0,
            };
        }

        let baseline = self.filter.filter_zero_phase(signal);
        let window_len = ((self.config.window_s * self.config.sample_rate_hz) as usize)
            .clamp(1, baseline.len());
        let window = &baseline[baseline.len() - window_len..];
        let window_mean = mean(window.iter().copied(), window.len());

        // Rolling mean at the newest sample: the centered window clamps
        // to its trailing half at the array edge.
        let tail_len = (window_len / 2 + 1).min(baseline.len());
        let tail = &baseline[baseline.len() - tail_len..];
        let rolling_mean = mean(tail.iter().copied(), tail.len());

        let reference_len = ((self.config.reference_s * self.config.sample_rate_hz) as usize)
            .clamp(1, window.len());
        let reference_mean = mean(window[..reference_len].iter().copied(), reference_len);

        IrDcResult {
            dc_value: *baseline.last().unwrap_or(&0.0),
            rolling_mean,
            shift: reference_mean - window_mean,
        }
    }
}

/// Streaming analyzer: one low-passed sample at a time into a bounded
/// ring buffer, with the rolling mean and shift available as running
/// aggregates.
pub struct StreamingIrDc {
    config: IrDcConfig,
    filter: ButterworthFilter,
    ring: VecDeque<f64>,
    capacity: usize,
}

impl StreamingIrDc {
    pub fn new(config: IrDcConfig) -> Self {
        let filter = ButterworthFilter::low_pass(config.sample_rate_hz, config.cutoff_hz);
        let capacity = ((config.ring_capacity_s * config.sample_rate_hz) as usize).max(1);
        Self {
            config,
            filter,
            ring: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed one raw infrared sample. Returns the low-passed baseline
    /// sample. Intended to run inline on the notification thread.
    pub fn push(&mut self, raw: f64) -> f64 {
        let baseline = self.filter.apply(raw);
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(baseline);
        baseline
    }

    /// Mean of the most recent rolling window. Zero before any data.
    pub fn current_rolling_mean(&self) -> f64 {
        let window = self.window();
        mean(window.iter().copied(), window.len())
    }

    /// Shift over the most recent rolling window: early reference mean
    /// minus full-window mean. Zero before any data.
    pub fn current_shift(&self) -> f64 {
        let window = self.window();
        if window.is_empty() {
            return 0.0;
        }
        let reference_len = ((self.config.reference_s * self.config.sample_rate_hz) as usize)
            .clamp(1, window.len());
        let reference_mean = mean(window[..reference_len].iter().copied(), reference_len);
        reference_mean - mean(window.iter().copied(), window.len())
    }

    /// Samples currently buffered.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Clear the ring and the filter's recursive state.
    pub fn reset(&mut self) {
        self.ring.clear();
        self.filter.reset();
    }

    fn window(&self) -> Vec<f64> {
        let window_len = ((self.config.window_s * self.config.sample_rate_hz) as usize).max(1);
        let skip = self.ring.len().saturating_sub(window_len);
        self.ring.iter().skip(skip).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn ir_signal(offset: f64, fs: f64, seconds: f64) -> Vec<f64> {
        let n = (seconds * fs) as usize;
        (0..n)
            .map(|i| offset + 100.0 * (2.0 * PI * 1.0 * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn test_rolling_mean_settles_to_true_mean() {
        // Spec scenario: 50 Hz-sampled 1 Hz sine of amplitude 100
        // through the 0.8 Hz low-pass; the 5 s rolling mean stabilizes
        // near the waveform's true mean.
        let analyzer = IrDcAnalyzer::new(IrDcConfig::default());
        let signal = ir_signal(1000.0, 50.0, 30.0);

        let result = analyzer.analyze(&signal);
        assert!(
            (result.rolling_mean - 1000.0).abs() < 15.0,
            "rolling mean {} drifted from 1000",
            result.rolling_mean
        );
    }

    #[test]
    fn test_rolling_mean_is_trailing_half_window_mean() {
        let config = IrDcConfig::default();
        let analyzer = IrDcAnalyzer::new(config.clone());
        let signal = ir_signal(1000.0, 50.0, 30.0);
        let result = analyzer.analyze(&signal);

        let baseline = ButterworthFilter::low_pass(config.sample_rate_hz, config.cutoff_hz)
            .filter_zero_phase(&signal);
        let window_len = (config.window_s * config.sample_rate_hz) as usize;
        let lo = baseline.len() - (window_len / 2 + 1);
        let expected =
            baseline[lo..].iter().sum::<f64>() / (baseline.len() - lo) as f64;
        assert!((result.rolling_mean - expected).abs() < 1e-9);
    }

    #[test]
    fn test_baseline_drop_yields_positive_shift() {
        let analyzer = IrDcAnalyzer::new(IrDcConfig::default());
        // Steady at 1000, dropping to 900 inside the final window.
        let mut signal = vec![1000.0; 50 * 18];
        signal.extend(vec![900.0; 50 * 2]);

        let result = analyzer.analyze(&signal);
        assert!(result.shift > 10.0, "shift {} not positive", result.shift);
    }

    #[test]
    fn test_steady_baseline_yields_near_zero_shift() {
        let analyzer = IrDcAnalyzer::new(IrDcConfig::default());
        let signal = vec![1000.0; 50 * 20];
        let result = analyzer.analyze(&signal);
        assert!(result.shift.abs() < 1.0, "shift {} on steady input", result.shift);
    }

    #[test]
    fn test_empty_input_yields_zero_result() {
        let analyzer = IrDcAnalyzer::new(IrDcConfig::default());
        let result = analyzer.analyze(&[]);
        assert_eq!(result.dc_value, 0.0);
        assert_eq!(result.rolling_mean, 0.0);
        assert_eq!(result.shift, 0.0);
    }

    #[test]
    fn test_streaming_ring_is_bounded_to_one_minute() {
        let config = IrDcConfig::default();
        let capacity = (config.ring_capacity_s * config.sample_rate_hz) as usize;
        let mut streaming = StreamingIrDc::new(config);

        // Two minutes of input only ever retains one minute.
        for i in 0..(capacity * 2) {
            streaming.push(1000.0 + (i % 7) as f64);
        }
        assert_eq!(streaming.len(), capacity);
    }

    #[test]
    fn test_streaming_mean_tracks_baseline() {
        let mut streaming = StreamingIrDc::new(IrDcConfig::default());
        for &x in &ir_signal(1000.0, 50.0, 30.0) {
            streaming.push(x);
        }
        let mean = streaming.current_rolling_mean();
        assert!((mean - 1000.0).abs() < 10.0, "streaming mean {}", mean);
    }

    #[test]
    fn test_streaming_empty_aggregates_are_zero() {
        let streaming = StreamingIrDc::new(IrDcConfig::default());
        assert_eq!(streaming.current_rolling_mean(), 0.0);
        assert_eq!(streaming.current_shift(), 0.0);
        assert!(streaming.is_empty());
    }

    #[test]
    fn test_reset_clears_ring_and_filter() {
        let mut streaming = StreamingIrDc::new(IrDcConfig::default());
        streaming.push(500.0);
        streaming.push(600.0);
        streaming.reset();
        assert!(streaming.is_empty());
        assert_eq!(streaming.current_rolling_mean(), 0.0);
    }
}
