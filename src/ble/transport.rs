//! BLE transport trait definition and event stream
//!
//! Defines the abstract central-role interface the engine drives. The
//! in-process simulator implements it for tests; a hardware-backed
//! implementation conforms to the same trait. Device-specific byte-level
//! parsing lives behind the transport, so characteristic updates arrive
//! as already-decoded reading batches.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::BleError;
use crate::types::{DeviceKind, PeripheralId, SensorReading};

/// An event surfaced by the transport's radio stack.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peripheral appeared during scanning.
    DeviceDiscovered {
        id: PeripheralId,
        kind: DeviceKind,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// The radio link to a peripheral came up.
    DeviceConnected { id: PeripheralId },
    /// The radio link went down. `error` is present for unexpected
    /// disconnections and absent for user-initiated ones.
    DeviceDisconnected {
        id: PeripheralId,
        error: Option<String>,
    },
    /// The adapter itself changed availability.
    AdapterStateChanged { available: bool },
    /// A batch of decoded readings from a notifying characteristic.
    /// Batches are always non-empty and delivered per peripheral in
    /// source order.
    ReadingBatch {
        id: PeripheralId,
        kind: DeviceKind,
        readings: Vec<SensorReading>,
    },
    /// A signal-strength update for a connected peripheral.
    Rssi { id: PeripheralId, rssi: i16 },
    /// A transport-level error not tied to one peripheral.
    TransportError { message: String },
}

/// BLE central role: scanning, connecting, and the GATT operations the
/// readiness orchestrator drives.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Start scanning for peripherals.
    async fn start_scan(&self) -> Result<(), BleError>;

    /// Stop scanning.
    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Open a radio link to a peripheral.
    async fn connect(&self, id: &PeripheralId) -> Result<(), BleError>;

    /// Close the radio link to a peripheral.
    async fn disconnect(&self, id: &PeripheralId) -> Result<(), BleError>;

    /// Whether the radio link to a peripheral is currently up.
    ///
    /// The orchestrator re-checks this before and after every discovery
    /// step, because disconnection can race with any async operation.
    fn is_connected(&self, id: &PeripheralId) -> bool;

    /// Discover GATT services. Returns the number found.
    async fn discover_services(&self, id: &PeripheralId) -> Result<usize, BleError>;

    /// Discover characteristics of the discovered services. Returns the
    /// number found.
    async fn discover_characteristics(&self, id: &PeripheralId) -> Result<usize, BleError>;

    /// Enable notifications on the primary data characteristic.
    async fn enable_primary_notifications(&self, id: &PeripheralId) -> Result<(), BleError>;

    /// Enable notifications on the secondary channel. Best-effort: a
    /// device without the channel returns `BleError::Unsupported`.
    async fn enable_secondary_notifications(&self, id: &PeripheralId) -> Result<(), BleError>;

    /// Write the device configuration (sample rates, LED currents).
    /// Best-effort.
    async fn apply_device_configuration(&self, id: &PeripheralId) -> Result<(), BleError>;

    /// Read the current signal strength of a connected peripheral.
    async fn read_rssi(&self, id: &PeripheralId) -> Result<i16, BleError>;

    /// Subscribe to transport events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
