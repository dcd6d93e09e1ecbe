//! Per-peripheral connection readiness state machine
//!
//! Tracks how far each peripheral has progressed through connection and
//! capability negotiation toward streaming usability. Exactly one
//! readiness value exists per peripheral at any time; transitions along
//! the happy path are strictly monotonic and never skip a state, while
//! `Disconnected` and `Failed` are reachable from anywhere.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use super::BleError;
use crate::types::{DeviceKind, PeripheralId};

/// How far a peripheral has progressed toward streaming readiness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionReadiness {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    ServicesDiscovered,
    DiscoveringCharacteristics,
    CharacteristicsDiscovered,
    EnablingNotifications,
    Ready,
    /// Negotiation failed; carries a human-readable reason. Recoverable
    /// only via a fresh connect attempt.
    Failed(String),
}

impl ConnectionReadiness {
    /// Position along the happy path. `Failed` sits outside it.
    fn rank(&self) -> u8 {
        match self {
            ConnectionReadiness::Disconnected => 0,
            ConnectionReadiness::Connecting => 1,
            ConnectionReadiness::Connected => 2,
            ConnectionReadiness::DiscoveringServices => 3,
            ConnectionReadiness::ServicesDiscovered => 4,
            ConnectionReadiness::DiscoveringCharacteristics => 5,
            ConnectionReadiness::CharacteristicsDiscovered => 6,
            ConnectionReadiness::EnablingNotifications => 7,
            ConnectionReadiness::Ready => 8,
            ConnectionReadiness::Failed(_) => u8::MAX,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionReadiness::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionReadiness::Failed(_))
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// `Disconnected` and `Failed` are reachable from any state;
    /// `Connecting` restarts the path from `Disconnected` or `Failed`;
    /// everything else must advance exactly one step.
    fn allows(&self, next: &ConnectionReadiness) -> bool {
        match next {
            ConnectionReadiness::Disconnected | ConnectionReadiness::Failed(_) => true,
            ConnectionReadiness::Connecting => matches!(
                self,
                ConnectionReadiness::Disconnected | ConnectionReadiness::Failed(_)
            ),
            _ => !self.is_failed() && next.rank() == self.rank() + 1,
        }
    }
}

/// A readiness change published to subscribers.
#[derive(Debug, Clone)]
pub struct ReadinessChange {
    pub id: PeripheralId,
    pub readiness: ConnectionReadiness,
    pub at: DateTime<Utc>,
}

/// Denormalized per-peripheral view for list/summary consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralSnapshot {
    pub id: PeripheralId,
    pub kind: DeviceKind,
    pub name: Option<String>,
    pub readiness: ConnectionReadiness,
    pub last_seen: DateTime<Utc>,
}

struct DeviceRecord {
    kind: DeviceKind,
    name: Option<String>,
    readiness: ConnectionReadiness,
    last_seen: DateTime<Utc>,
}

/// Registry of known peripherals keyed by stable identity.
///
/// Keyed by `PeripheralId` rather than any low-level connection handle,
/// so reconnection reuses the same logical record across distinct
/// underlying connections. Every applied transition updates the record,
/// the denormalized summary list, and the change broadcast in one lock
/// scope, so no observer can see them disagree.
pub struct DeviceRegistry {
    records: RwLock<HashMap<PeripheralId, DeviceRecord>>,
    changes_tx: broadcast::Sender<ReadinessChange>,
    summary_tx: watch::Sender<Vec<PeripheralSnapshot>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(64);
        let (summary_tx, _) = watch::channel(Vec::new());
        Self {
            records: RwLock::new(HashMap::new()),
            changes_tx,
            summary_tx,
        }
    }

    /// Register a discovered peripheral. Idempotent: re-discovery only
    /// refreshes the name and last-seen timestamp.
    pub fn register(
        &self,
        id: &PeripheralId,
        kind: DeviceKind,
        name: Option<String>,
    ) -> Result<(), BleError> {
        let mut records = self.records.write().map_err(|_| BleError::Busy)?;
        let entry = records.entry(id.clone()).or_insert_with(|| DeviceRecord {
            kind,
            name: None,
            readiness: ConnectionReadiness::Disconnected,
            last_seen: Utc::now(),
        });
        if name.is_some() {
            entry.name = name;
        }
        entry.last_seen = Utc::now();
        drop(records);
        self.publish_summary();
        Ok(())
    }

    /// Whether a peripheral has ever been registered.
    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.records
            .read()
            .map(|r| r.contains_key(id))
            .unwrap_or(false)
    }

    /// Current readiness of a peripheral, if registered.
    pub fn readiness(&self, id: &PeripheralId) -> Option<ConnectionReadiness> {
        self.records
            .read()
            .ok()
            .and_then(|r| r.get(id).map(|rec| rec.readiness.clone()))
    }

    /// Device kind of a peripheral, if registered.
    pub fn kind(&self, id: &PeripheralId) -> Option<DeviceKind> {
        self.records.read().ok().and_then(|r| r.get(id).map(|rec| rec.kind))
    }

    /// Attempt a readiness transition for one peripheral.
    ///
    /// Returns `Ok(true)` when applied and published, `Ok(false)` when
    /// rejected as a regression or skip (logged, never fatal), and an
    /// error only for unknown peripherals or a poisoned registry.
    pub fn transition(
        &self,
        id: &PeripheralId,
        next: ConnectionReadiness,
    ) -> Result<bool, BleError> {
        let mut records = self.records.write().map_err(|_| BleError::Busy)?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| BleError::UnknownPeripheral(id.clone()))?;

        if record.readiness == next {
            return Ok(false);
        }
        if !record.readiness.allows(&next) {
            warn!(
                "[{}] rejected readiness transition {:?} -> {:?}",
                id, record.readiness, next
            );
            return Ok(false);
        }

        debug!("[{}] readiness {:?} -> {:?}", id, record.readiness, next);
        record.readiness = next.clone();
        record.last_seen = Utc::now();
        drop(records);

        self.publish_summary();
        // Nobody listening is fine.
        let _ = self.changes_tx.send(ReadinessChange {
            id: id.clone(),
            readiness: next,
            at: Utc::now(),
        });
        Ok(true)
    }

    /// Subscribe to readiness changes.
    pub fn changes(&self) -> broadcast::Receiver<ReadinessChange> {
        self.changes_tx.subscribe()
    }

    /// Watch the denormalized summary list.
    pub fn summary(&self) -> watch::Receiver<Vec<PeripheralSnapshot>> {
        self.summary_tx.subscribe()
    }

    /// All peripherals currently at or past `Connected` on the happy path.
    pub fn connected_ids(&self) -> Vec<PeripheralId> {
        self.records
            .read()
            .map(|records| {
                records
                    .iter()
                    .filter(|(_, rec)| {
                        !rec.readiness.is_failed()
                            && rec.readiness.rank() >= ConnectionReadiness::Connected.rank()
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn publish_summary(&self) {
        if let Ok(records) = self.records.read() {
            let snapshot: Vec<PeripheralSnapshot> = records
                .iter()
                .map(|(id, rec)| PeripheralSnapshot {
                    id: id.clone(),
                    kind: rec.kind,
                    name: rec.name.clone(),
                    readiness: rec.readiness.clone(),
                    last_seen: rec.last_seen,
                })
                .collect();
            let _ = self.summary_tx.send(snapshot);
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sim_id() -> PeripheralId {
        PeripheralId::Simulated(Uuid::new_v4())
    }

    fn registry_with(id: &PeripheralId) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry
            .register(id, DeviceKind::OpticalRing, Some("ring".into()))
            .unwrap();
        registry
    }

    #[test]
    fn test_happy_path_is_stepwise() {
        let id = sim_id();
        let registry = registry_with(&id);

        let path = [
            ConnectionReadiness::Connecting,
            ConnectionReadiness::Connected,
            ConnectionReadiness::DiscoveringServices,
            ConnectionReadiness::ServicesDiscovered,
            ConnectionReadiness::DiscoveringCharacteristics,
            ConnectionReadiness::CharacteristicsDiscovered,
            ConnectionReadiness::EnablingNotifications,
            ConnectionReadiness::Ready,
        ];
        for state in path {
            assert!(registry.transition(&id, state).unwrap());
        }
        assert!(registry.readiness(&id).unwrap().is_ready());
    }

    #[test]
    fn test_no_state_skipping() {
        let id = sim_id();
        let registry = registry_with(&id);

        registry.transition(&id, ConnectionReadiness::Connecting).unwrap();
        // Jumping straight to Ready must be rejected.
        assert!(!registry.transition(&id, ConnectionReadiness::Ready).unwrap());
        assert_eq!(
            registry.readiness(&id).unwrap(),
            ConnectionReadiness::Connecting
        );
    }

    #[test]
    fn test_no_regression_on_happy_path() {
        let id = sim_id();
        let registry = registry_with(&id);

        registry.transition(&id, ConnectionReadiness::Connecting).unwrap();
        registry.transition(&id, ConnectionReadiness::Connected).unwrap();
        assert!(!registry
            .transition(&id, ConnectionReadiness::Connecting)
            .unwrap());
    }

    #[test]
    fn test_disconnected_and_failed_reachable_from_anywhere() {
        let id = sim_id();
        let registry = registry_with(&id);

        registry.transition(&id, ConnectionReadiness::Connecting).unwrap();
        registry.transition(&id, ConnectionReadiness::Connected).unwrap();
        assert!(registry
            .transition(&id, ConnectionReadiness::Failed("timeout".into()))
            .unwrap());

        // Failed is recoverable only via a fresh connect attempt.
        assert!(!registry
            .transition(&id, ConnectionReadiness::Connected)
            .unwrap());
        assert!(registry
            .transition(&id, ConnectionReadiness::Connecting)
            .unwrap());

        assert!(registry
            .transition(&id, ConnectionReadiness::Disconnected)
            .unwrap());
    }

    #[test]
    fn test_ready_recoverable_only_via_disconnect() {
        let id = sim_id();
        let registry = registry_with(&id);

        for state in [
            ConnectionReadiness::Connecting,
            ConnectionReadiness::Connected,
            ConnectionReadiness::DiscoveringServices,
            ConnectionReadiness::ServicesDiscovered,
            ConnectionReadiness::DiscoveringCharacteristics,
            ConnectionReadiness::CharacteristicsDiscovered,
            ConnectionReadiness::EnablingNotifications,
            ConnectionReadiness::Ready,
        ] {
            registry.transition(&id, state).unwrap();
        }
        assert!(!registry
            .transition(&id, ConnectionReadiness::Connecting)
            .unwrap());
        assert!(registry
            .transition(&id, ConnectionReadiness::Disconnected)
            .unwrap());
    }

    #[test]
    fn test_unknown_peripheral_errors() {
        let registry = DeviceRegistry::new();
        let result = registry.transition(&sim_id(), ConnectionReadiness::Connecting);
        assert!(matches!(result, Err(BleError::UnknownPeripheral(_))));
    }

    #[test]
    fn test_summary_tracks_transitions() {
        let id = sim_id();
        let registry = registry_with(&id);
        let summary = registry.summary();

        registry.transition(&id, ConnectionReadiness::Connecting).unwrap();
        let list = summary.borrow();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].readiness, ConnectionReadiness::Connecting);
    }
}
