//! Heart-rate-variability statistics and the SVD shape biomarker
//!
//! Maintains a sorted, capped history of beat peak times, derives
//! windowed RR intervals gated to the physiological range, and computes
//! SDNN/RMSSD plus the distinguishing biomarker: the two leading
//! singular values of a delay-embedded RR matrix and their ratio.
//!
//! The ratio is reported as-is; no classification threshold is applied
//! here because no clinically validated cutoff exists for it.

use log::trace;
use nalgebra::DMatrix;

use crate::config::HrvConfig;
use crate::types::{HrvStats, HrvSvdResult};

/// Second singular values below this are treated as numerically zero,
/// leaving the ratio undefined (a perfectly periodic rhythm).
const SINGULAR_EPSILON: f64 = 1e-9;

pub struct HrvAnalyzer {
    config: HrvConfig,
    /// Beat peak times in seconds, ascending, capped to
    /// `config.max_peak_history` with oldest-first eviction.
    peak_times: Vec<f64>,
}

impl HrvAnalyzer {
    pub fn new(config: HrvConfig) -> Self {
        Self {
            config,
            peak_times: Vec::new(),
        }
    }

    /// Record one beat peak time (seconds on the caller's timeline).
    /// Keeps the history sorted regardless of arrival order.
    pub fn record_peak(&mut self, time_s: f64) {
        let idx = self.peak_times.partition_point(|&t| t <= time_s);
        self.peak_times.insert(idx, time_s);
        if self.peak_times.len() > self.config.max_peak_history {
            let excess = self.peak_times.len() - self.config.max_peak_history;
            self.peak_times.drain(..excess);
        }
    }

    pub fn peak_count(&self) -> usize {
        self.peak_times.len()
    }

    pub fn clear(&mut self) {
        self.peak_times.clear();
    }

    /// Successive RR intervals whose peaks fall inside `[start, end]`,
    /// including the one interval reaching back before the window and
    /// the one reaching past it when those neighbors exist. Intervals
    /// outside the physiological range are discarded.
    pub fn rr_intervals(&self, start_s: f64, end_s: f64) -> Vec<f64> {
        let first_in = self.peak_times.partition_point(|&t| t < start_s);
        let past_last = self.peak_times.partition_point(|&t| t <= end_s);
        if first_in >= past_last {
            return Vec::new();
        }
        let lo = first_in.saturating_sub(1);
        let hi = (past_last + 1).min(self.peak_times.len());

        self.peak_times[lo..hi]
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .filter(|&rr| {
                let keep = rr >= self.config.min_rr_s && rr <= self.config.max_rr_s;
                if !keep {
                    trace!("discarding non-physiological RR interval {:.3} s", rr);
                }
                keep
            })
            .collect()
    }

    /// SDNN and RMSSD over a set of intervals, in milliseconds.
    /// `None` with fewer than two intervals.
    pub fn stats(intervals: &[f64]) -> Option<HrvStats> {
        if intervals.len() < 2 {
            return None;
        }
        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        let variance = intervals.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let sdnn_ms = variance.sqrt() * 1000.0;

        let sq_diff_sum: f64 = intervals
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).powi(2))
            .sum();
        let rmssd_ms = (sq_diff_sum / (intervals.len() - 1) as f64).sqrt() * 1000.0;

        Some(HrvStats {
            sdnn_ms,
            rmssd_ms,
            interval_count: intervals.len(),
        })
    }

    /// The delay-embedded SVD biomarker.
    ///
    /// Builds a matrix whose rows are sliding windows of
    /// `embedding_dim` consecutive intervals, decomposes it, and
    /// reports the two leading singular values and their ratio. Fewer
    /// intervals than the embedding dimension plus one yields `None`
    /// rather than an error.
    pub fn svd_biomarker(&self, intervals: &[f64]) -> Option<HrvSvdResult> {
        let dim = self.config.embedding_dim;
        if dim == 0 || intervals.len() < dim + 1 {
            return None;
        }
        let rows = intervals.len() - dim + 1;
        let matrix = DMatrix::from_fn(rows, dim, |r, c| intervals[r + c]);
        let singular = matrix.singular_values();

        let s1 = singular[0];
        let s2 = (singular.len() > 1).then(|| singular[1]);
        let ratio = match s2 {
            Some(s2) if s2 > SINGULAR_EPSILON => Some(s1 / s2),
            _ => None,
        };
        Some(HrvSvdResult { s1, s2, ratio })
    }

    /// Intervals, time-domain statistics, and the SVD biomarker for one
    /// window in a single call.
    pub fn analyze_window(
        &self,
        start_s: f64,
        end_s: f64,
    ) -> (Vec<f64>, Option<HrvStats>, Option<HrvSvdResult>) {
        let intervals = self.rr_intervals(start_s, end_s);
        let stats = Self::stats(&intervals);
        let svd = self.svd_biomarker(&intervals);
        (intervals, stats, svd)
    }
}
