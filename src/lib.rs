//! Pulselink: BLE connectivity and signal processing for wearable
//! biosensors.
//!
//! The crate connects to a primary optical (PPG) ring and an optional
//! EMG-style comparison device over BLE, drives each peripheral through
//! capability negotiation to streaming readiness, recovers from
//! unexpected disconnections, routes decoded readings to subscribers,
//! and turns the optical waveform into beats, HRV statistics, and the
//! delay-embedded SVD biomarker.
//!
//! [`engine::PulselinkEngine`] is the facade; everything else is a
//! component it wires together.

pub mod ble;
pub mod config;
pub mod dsp;
pub mod engine;
pub mod router;
pub mod types;
