//! Pulse beat detection
//!
//! Turns a raw optical waveform into discrete cardiac beats with
//! onset/peak/offset landmarks. The waveform is mean-removed and
//! band-pass filtered (zero-phase), candidate peaks are gated by a
//! minimum physiological spacing and a prominence threshold derived
//! from the signal's own standard deviation, and each surviving peak is
//! bracketed by its nearest preceding and following local minima.

use log::debug;

use super::filter::ButterworthFilter;
use crate::config::BeatDetectorConfig;
use crate::types::BeatFeature;

pub struct BeatDetector {
    config: BeatDetectorConfig,
    filter: ButterworthFilter,
}

impl BeatDetector {
    pub fn new(config: BeatDetectorConfig) -> Self {
        let filter = ButterworthFilter::band_pass(
            config.sample_rate_hz,
            config.band_low_hz,
            config.band_high_hz,
        );
        Self { config, filter }
    }

    /// Detect beats in a raw optical waveform.
    ///
    /// Returns beats ordered by peak time. Fewer than two accepted
    /// peaks yields an empty result; thin or degenerate input never
    /// errors.
    pub fn detect(&self, signal: &[f64]) -> Vec<BeatFeature> {
        if signal.len() < 3 {
            return Vec::new();
        }
        let fs = self.config.sample_rate_hz;

        let mean = signal.iter().sum::<f64>() / signal.len() as f64;
        let centered: Vec<f64> = signal.iter().map(|x| x - mean).collect();
        let filtered = self.filter.filter_zero_phase(&centered);

        let peaks = self.accept_peaks(&filtered);
        if peaks.len() < 2 {
            return Vec::new();
        }

        let edge = (self.config.edge_search_window_s * fs) as usize;
        let mut beats = Vec::with_capacity(peaks.len());
        for (i, &peak) in peaks.iter().enumerate() {
            // Bound the minima search by the neighboring accepted peak,
            // or a fixed window at the ends of the sequence.
            let lower = match i {
                0 => peak.saturating_sub(edge),
                _ => peaks[i - 1],
            };
            let upper = match peaks.get(i + 1) {
                Some(&next) => next,
                None => (peak + edge + 1).min(filtered.len()),
            };

            let onset = match argmin(&filtered, lower, peak) {
                Some(idx) => idx,
                None => {
                    debug!("discarding peak at {}: no onset window", peak);
                    continue;
                }
            };
            let offset = match argmin(&filtered, peak + 1, upper) {
                Some(idx) => idx,
                None => {
                    debug!("discarding peak at {}: no offset window", peak);
                    continue;
                }
            };
            if !(onset < peak && peak < offset && offset < filtered.len()) {
                debug!(
                    "discarding peak at {}: landmark ordering violated ({}, {}, {})",
                    peak, onset, peak, offset
                );
                continue;
            }

            let onset_time = onset as f64 / fs;
            let peak_time = peak as f64 / fs;
            let offset_time = offset as f64 / fs;
            beats.push(BeatFeature {
                onset_index: onset,
                peak_index: peak,
                offset_index: offset,
                onset_time,
                peak_time,
                offset_time,
                rise_time: peak_time - onset_time,
                fall_time: offset_time - peak_time,
                peak_amplitude: filtered[peak],
                onset_amplitude: filtered[onset],
                ir_dc_mean: None,
            });
        }
        beats
    }

    /// Local maxima gated by prominence and minimum spacing. When two
    /// candidates fall within the minimum distance, the taller one wins.
    fn accept_peaks(&self, filtered: &[f64]) -> Vec<usize> {
        let std_dev = std_deviation(filtered);
        let threshold = self.config.prominence_std_fraction * std_dev;
        let check_prominence = threshold > 0.0;
        let min_distance = (self.config.min_peak_distance_s * self.config.sample_rate_hz) as usize;

        let mut accepted: Vec<usize> = Vec::new();
        for i in 1..filtered.len() - 1 {
            if !(filtered[i] > filtered[i - 1] && filtered[i] >= filtered[i + 1]) {
                continue;
            }
            if check_prominence && filtered[i] <= threshold {
                continue;
            }
            match accepted.last() {
                Some(&last) if i - last < min_distance => {
                    if filtered[i] > filtered[last] {
                        let tail = accepted.len() - 1;
                        accepted[tail] = i;
                    }
                }
                _ => accepted.push(i),
            }
        }
        accepted
    }
}

/// Index of the smallest value in `signal[lo..hi)`, or `None` for an
/// empty or out-of-range window.
fn argmin(signal: &[f64], lo: usize, hi: usize) -> Option<usize> {
    let hi = hi.min(signal.len());
    if lo >= hi {
        return None;
    }
    let mut best = lo;
    for i in lo..hi {
        if signal[i] < signal[best] {
            best = i;
        }
    }
    Some(best)
}

fn std_deviation(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let mean = signal.iter().sum::<f64>() / signal.len() as f64;
    let variance = signal.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / signal.len() as f64;
    variance.sqrt()
}
