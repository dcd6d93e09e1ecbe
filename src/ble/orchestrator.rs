//! Discovery and readiness orchestrator
//!
//! Drives a freshly connected peripheral through the ordered negotiation
//! sequence: discover services, discover characteristics, enable primary
//! notifications, enable the secondary channel (best-effort), apply the
//! device configuration (best-effort), then mark it ready.
//!
//! Every mandatory step is raced against a fixed timeout; whichever side
//! finishes first wins and the loser is dropped. The radio link is
//! re-checked before and after every step because disconnection can race
//! with any of them; a dead link aborts cleanly to `Disconnected` instead
//! of continuing against a stale handle.

use std::future::Future;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::time::timeout;

use super::readiness::{ConnectionReadiness, DeviceRegistry};
use super::transport::BleTransport;
use super::BleError;
use crate::config::OrchestratorConfig;
use crate::types::PeripheralId;

/// Why a negotiation sequence stopped short of `Ready`.
enum Abort {
    /// The link dropped mid-sequence; not a failure of the peripheral.
    LinkLost,
    /// A mandatory step failed or timed out.
    Step(String),
}

impl From<BleError> for Abort {
    fn from(e: BleError) -> Self {
        Abort::Step(e.to_string())
    }
}

pub struct ReadinessOrchestrator {
    transport: Arc<dyn BleTransport>,
    registry: Arc<DeviceRegistry>,
    config: OrchestratorConfig,
}

impl ReadinessOrchestrator {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        registry: Arc<DeviceRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            transport,
            registry,
            config,
        }
    }

    /// Run the full negotiation sequence for one connected peripheral.
    ///
    /// One orchestrator task per peripheral at a time: all readiness
    /// transitions for the peripheral flow through this single task, so
    /// no two transitions can be in flight concurrently.
    pub async fn run(&self, id: PeripheralId) {
        match self.negotiate(&id).await {
            Ok(()) => {
                self.set(&id, ConnectionReadiness::Ready);
                info!("[{}] ready for streaming", id);
            }
            Err(Abort::LinkLost) => {
                info!("[{}] link lost mid-discovery, aborting negotiation", id);
                self.set(&id, ConnectionReadiness::Disconnected);
            }
            Err(Abort::Step(reason)) => {
                error!("[{}] negotiation failed: {}", id, reason);
                self.set(&id, ConnectionReadiness::Failed(reason));
            }
        }
    }

    async fn negotiate(&self, id: &PeripheralId) -> Result<(), Abort> {
        self.check_link(id)?;
        self.set(id, ConnectionReadiness::DiscoveringServices);
        let services = self
            .mandatory("service discovery", self.transport.discover_services(id))
            .await?;
        self.check_link(id)?;
        if services == 0 {
            return Err(Abort::Step("service discovery returned no services".into()));
        }
        self.set(id, ConnectionReadiness::ServicesDiscovered);

        self.set(id, ConnectionReadiness::DiscoveringCharacteristics);
        let characteristics = self
            .mandatory(
                "characteristic discovery",
                self.transport.discover_characteristics(id),
            )
            .await?;
        self.check_link(id)?;
        if characteristics == 0 {
            return Err(Abort::Step(
                "characteristic discovery returned no characteristics".into(),
            ));
        }
        self.set(id, ConnectionReadiness::CharacteristicsDiscovered);

        self.set(id, ConnectionReadiness::EnablingNotifications);
        self.mandatory(
            "primary notification enable",
            self.transport.enable_primary_notifications(id),
        )
        .await?;
        self.check_link(id)?;

        // Secondary channel and device configuration are best-effort:
        // a failure is logged and the sequence continues.
        self.best_effort(
            id,
            "secondary notification enable",
            self.transport.enable_secondary_notifications(id),
        )
        .await;
        self.check_link(id)?;

        self.best_effort(
            id,
            "device configuration",
            self.transport.apply_device_configuration(id),
        )
        .await;
        self.check_link(id)?;

        Ok(())
    }

    /// Race a mandatory step against the step timeout. The losing branch
    /// is dropped, which cancels it.
    async fn mandatory<T>(
        &self,
        step: &'static str,
        op: impl Future<Output = Result<T, BleError>>,
    ) -> Result<T, BleError> {
        match timeout(self.config.step_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BleError::StepTimeout { step }),
        }
    }

    /// Run a best-effort step under the same timeout, degrading to a
    /// diagnostic log on failure.
    async fn best_effort(
        &self,
        id: &PeripheralId,
        step: &'static str,
        op: impl Future<Output = Result<(), BleError>>,
    ) {
        match timeout(self.config.step_timeout, op).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] best-effort {} failed: {}", id, step, e),
            Err(_) => warn!("[{}] best-effort {} timed out", id, step),
        }
    }

    fn check_link(&self, id: &PeripheralId) -> Result<(), Abort> {
        if self.transport.is_connected(id) {
            Ok(())
        } else {
            Err(Abort::LinkLost)
        }
    }

    fn set(&self, id: &PeripheralId, state: ConnectionReadiness) {
        if let Err(e) = self.registry.transition(id, state) {
            warn!("[{}] readiness transition error: {}", id, e);
        }
    }
}
