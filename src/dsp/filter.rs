//! Butterworth filtering, batch and streaming
//!
//! A 4th-order Butterworth filter built from cascaded second-order
//! sections. Low-pass mode cascades two sections with the standard
//! 4th-order Q pair; band-pass mode cascades a high-pass section at the
//! low cutoff with a low-pass section at the high cutoff.
//!
//! Batch use goes through [`ButterworthFilter::filter_zero_phase`]
//! (forward, then backward, cancelling phase lag) for windowed
//! analysis; streaming use goes through [`ButterworthFilter::apply`]
//! one sample at a time, with [`ButterworthFilter::reset`] clearing the
//! recursive state.

use std::f64::consts::{PI, SQRT_2};

/// Q values of the two second-order sections of a 4th-order Butterworth.
const BUTTER4_Q: [f64; 2] = [0.541_196_100_146_197, 1.306_562_964_876_376];

/// Second-order section in transposed direct form II.
#[derive(Debug, Clone)]
struct Biquad {
    b: [f64; 3],
    a1: f64,
    a2: f64,
    z: [f64; 2],
}

impl Biquad {
    fn lowpass(sample_rate_hz: f64, cutoff_hz: f64, q: f64) -> Self {
        let k = (PI * cutoff_hz / sample_rate_hz).tan();
        let k2 = k * k;
        let norm = 1.0 / (1.0 + k / q + k2);
        Self {
            b: [k2 * norm, 2.0 * k2 * norm, k2 * norm],
            a1: 2.0 * (k2 - 1.0) * norm,
            a2: (1.0 - k / q + k2) * norm,
            z: [0.0, 0.0],
        }
    }

    fn highpass(sample_rate_hz: f64, cutoff_hz: f64, q: f64) -> Self {
        let k = (PI * cutoff_hz / sample_rate_hz).tan();
        let k2 = k * k;
        let norm = 1.0 / (1.0 + k / q + k2);
        Self {
            b: [norm, -2.0 * norm, norm],
            a1: 2.0 * (k2 - 1.0) * norm,
            a2: (1.0 - k / q + k2) * norm,
            z: [0.0, 0.0],
        }
    }

    fn process(&mut self, x: f64) -> f64 {
        let y = self.b[0] * x + self.z[0];
        self.z[0] = self.b[1] * x - self.a1 * y + self.z[1];
        self.z[1] = self.b[2] * x - self.a2 * y;
        y
    }

    /// Set the internal state to the DC steady state for a constant
    /// input `x0`, and return the corresponding steady output. Priming
    /// suppresses the startup transient that a zero state would smear
    /// over the first seconds of output.
    fn prime(&mut self, x0: f64) -> f64 {
        let dc_gain = (self.b[0] + self.b[1] + self.b[2]) / (1.0 + self.a1 + self.a2);
        let y0 = dc_gain * x0;
        self.z[0] = y0 - self.b[0] * x0;
        self.z[1] = self.b[2] * x0 - self.a2 * y0;
        y0
    }

    fn reset(&mut self) {
        self.z = [0.0, 0.0];
    }
}

/// Filter topology selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterMode {
    /// Single-cutoff low-pass (two cascaded sections).
    LowPass { cutoff_hz: f64 },
    /// Low/high cutoff pair: high-pass at `low_hz` into low-pass at
    /// `high_hz`.
    BandPass { low_hz: f64, high_hz: f64 },
}

/// A configurable Butterworth filter with independent batch and
/// streaming entry points.
#[derive(Debug, Clone)]
pub struct ButterworthFilter {
    stages: Vec<Biquad>,
    primed: bool,
}

impl ButterworthFilter {
    pub fn new(mode: FilterMode, sample_rate_hz: f64) -> Self {
        let stages = match mode {
            FilterMode::LowPass { cutoff_hz } => BUTTER4_Q
                .iter()
                .map(|&q| Biquad::lowpass(sample_rate_hz, cutoff_hz, q))
                .collect(),
            FilterMode::BandPass { low_hz, high_hz } => vec![
                Biquad::highpass(sample_rate_hz, low_hz, SQRT_2 / 2.0),
                Biquad::lowpass(sample_rate_hz, high_hz, SQRT_2 / 2.0),
            ],
        };
        Self {
            stages,
            primed: false,
        }
    }

    pub fn low_pass(sample_rate_hz: f64, cutoff_hz: f64) -> Self {
        Self::new(FilterMode::LowPass { cutoff_hz }, sample_rate_hz)
    }

    pub fn band_pass(sample_rate_hz: f64, low_hz: f64, high_hz: f64) -> Self {
        Self::new(FilterMode::BandPass { low_hz, high_hz }, sample_rate_hz)
    }

    /// Streaming single-sample application. Maintains recursive state
    /// across calls; suitable for inline use on the notification thread.
    ///
    /// The first sample after construction or [`Self::reset`] primes
    /// the state to its DC steady point, so streaming starts without a
    /// startup transient and matches the batch first pass exactly.
    pub fn apply(&mut self, x: f64) -> f64 {
        if !self.primed {
            self.primed = true;
            return self
                .stages
                .iter_mut()
                .fold(x, |acc, stage| stage.prime(acc));
        }
        self.stages.iter_mut().fold(x, |acc, stage| stage.process(acc))
    }

    /// Clear the streaming state.
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
        self.primed = false;
    }

    /// Single forward pass over a whole signal, from zero state. Leaves
    /// the streaming state of `self` untouched.
    pub fn filter_batch(&self, signal: &[f64]) -> Vec<f64> {
        let mut fresh = self.fresh();
        signal.iter().map(|&x| fresh.apply(x)).collect()
    }

    /// Zero-phase batch filtering: forward pass, then a second pass over
    /// the reversed output. Phase lag from the two passes cancels, at
    /// the cost of doubling the effective order.
    pub fn filter_zero_phase(&self, signal: &[f64]) -> Vec<f64> {
        if signal.is_empty() {
            return Vec::new();
        }
        let forward = self.filter_batch(signal);
        let reversed: Vec<f64> = forward.into_iter().rev().collect();
        let mut backward = self.filter_batch(&reversed);
        backward.reverse();
        backward
    }

    fn fresh(&self) -> Self {
        let mut clone = self.clone();
        clone.reset();
        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq_hz: f64, sample_rate_hz: f64, seconds: f64, amplitude: f64) -> Vec<f64> {
        let n = (seconds * sample_rate_hz) as usize;
        (0..n)
            .map(|i| amplitude * (2.0 * PI * freq_hz * i as f64 / sample_rate_hz).sin())
            .collect()
    }

    fn rms(signal: &[f64]) -> f64 {
        (signal.iter().map(|x| x * x).sum::<f64>() / signal.len() as f64).sqrt()
    }

    #[test]
    fn test_streaming_matches_batch_first_pass() {
        let template = ButterworthFilter::band_pass(50.0, 0.5, 8.0);
        let signal = sine(1.5, 50.0, 4.0, 100.0);

        let batch = template.filter_batch(&signal);
        let mut streaming = template.clone();
        streaming.reset();
        for (i, &x) in signal.iter().enumerate() {
            let y = streaming.apply(x);
            assert!(
                (y - batch[i]).abs() < 1e-12,
                "sample {} diverged: {} vs {}",
                i,
                y,
                batch[i]
            );
        }
    }

    #[test]
    fn test_lowpass_passes_dc() {
        let filter = ButterworthFilter::low_pass(50.0, 0.8);
        let signal = vec![10.0; 50 * 30];
        let out = filter.filter_batch(&signal);
        // After settling, the DC level comes through at unity gain.
        assert!((out.last().unwrap() - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_lowpass_attenuates_above_cutoff() {
        let filter = ButterworthFilter::low_pass(50.0, 0.8);
        let signal = sine(5.0, 50.0, 10.0, 1.0);
        let out = filter.filter_batch(&signal);
        // 5 Hz through a 0.8 Hz 4th-order low-pass: > 30 dB down.
        let settled = &out[out.len() / 2..];
        assert!(rms(settled) < 0.03, "rms = {}", rms(settled));
    }

    #[test]
    fn test_bandpass_removes_dc_offset() {
        let filter = ButterworthFilter::band_pass(50.0, 0.5, 8.0);
        let signal: Vec<f64> = sine(2.0, 50.0, 20.0, 1.0)
            .into_iter()
            .map(|x| x + 500.0)
            .collect();
        let out = filter.filter_zero_phase(&signal);
        let settled = &out[out.len() / 4..3 * out.len() / 4];
        let mean = settled.iter().sum::<f64>() / settled.len() as f64;
        assert!(mean.abs() < 0.1, "residual offset = {}", mean);
    }

    #[test]
    fn test_zero_phase_has_no_lag_in_band() {
        let filter = ButterworthFilter::band_pass(50.0, 0.5, 8.0);
        let signal = sine(2.0, 50.0, 20.0, 1.0);
        let out = filter.filter_zero_phase(&signal);
        // Away from the edges, a passband sine comes back in place.
        let mid = signal.len() / 4..3 * signal.len() / 4;
        for i in mid {
            assert!(
                (out[i] - signal[i]).abs() < 0.05,
                "sample {}: {} vs {}",
                i,
                out[i],
                signal[i]
            );
        }
    }

    #[test]
    fn test_reset_clears_streaming_state() {
        let mut filter = ButterworthFilter::band_pass(50.0, 0.5, 8.0);
        let signal = sine(2.0, 50.0, 2.0, 1.0);
        let first: Vec<f64> = signal.iter().map(|&x| filter.apply(x)).collect();
        filter.reset();
        let second: Vec<f64> = signal.iter().map(|&x| filter.apply(x)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        let filter = ButterworthFilter::low_pass(50.0, 0.8);
        assert!(filter.filter_zero_phase(&[]).is_empty());
        assert!(filter.filter_batch(&[]).is_empty());
    }
}
