//! BLE connectivity layer
//!
//! Provides the transport abstraction, the per-peripheral readiness state
//! machine, the discovery orchestrator, the reconnection policy, and an
//! in-process simulated transport for testing without hardware.

pub mod orchestrator;
pub mod readiness;
pub mod reconnect;
pub mod simulated;
pub mod transport;

use thiserror::Error;

use crate::types::PeripheralId;

#[derive(Error, Debug)]
pub enum BleError {
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(PeripheralId),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peripheral not connected")]
    NotConnected,

    #[error("Gave up after {attempts} reconnection attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Notification setup failed: {0}")]
    NotifySetupFailed(String),

    #[error("Step '{step}' timed out")]
    StepTimeout { step: &'static str },

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Registry busy")]
    Busy,
}
