//! Real-time signal-processing pipeline
//!
//! Transforms the raw optical waveform into beats and biomarkers:
//! Butterworth filtering (batch zero-phase and streaming), pulse beat
//! detection, infrared DC baseline/occlusion analysis, and HRV
//! statistics with the delay-embedded SVD shape biomarker.
//!
//! Nothing in this module errors on thin or malformed data: empty
//! arrays, `None` biomarkers, and zero-value defaults are the contract,
//! because continuous streaming must never stall on a transient gap.

pub mod beats;
pub mod filter;
pub mod hrv;
pub mod irdc;
