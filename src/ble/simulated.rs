//! In-process BLE simulator
//!
//! Provides a simulated radio through which scripted peripherals can be
//! discovered, connected, and driven through GATT negotiation entirely
//! in-process. Per-step latency and failure injection make the timeout,
//! abort, and reconnection semantics testable under tokio virtual time
//! without real hardware.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::transport::{BleTransport, TransportEvent};
use super::BleError;
use crate::types::{DeviceKind, PeripheralId, SensorReading};

/// One step of the simulated GATT negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimStep {
    DiscoverServices,
    DiscoverCharacteristics,
    EnablePrimaryNotifications,
    EnableSecondaryNotifications,
    ApplyConfiguration,
}

/// What a scripted step does when the central drives it.
#[derive(Debug, Clone)]
pub enum StepBehavior {
    /// Complete normally.
    Succeed,
    /// Complete with an error carrying the given reason.
    Fail(String),
    /// The device does not implement this capability at all.
    Unsupported,
    /// Never complete. The central's timeout race must cancel it.
    Hang,
    /// Complete normally but drop the radio link as a side effect,
    /// modeling a disconnect racing the discovery sequence.
    DropLink,
}

fn step_name(step: SimStep) -> &'static str {
    match step {
        SimStep::DiscoverServices => "service discovery",
        SimStep::DiscoverCharacteristics => "characteristic discovery",
        SimStep::EnablePrimaryNotifications => "primary notifications",
        SimStep::EnableSecondaryNotifications => "secondary notifications",
        SimStep::ApplyConfiguration => "device configuration",
    }
}

/// A scripted peripheral definition.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub name: String,
    pub kind: DeviceKind,
    /// Services reported by service discovery.
    pub services: usize,
    /// Characteristics reported by characteristic discovery.
    pub characteristics: usize,
    pub rssi: i16,
    /// Random RSSI spread applied per read; zero keeps reads exact.
    pub rssi_jitter: i16,
    /// Latency applied to connect and to every negotiation step.
    pub step_latency: Duration,
    steps: HashMap<SimStep, StepBehavior>,
    /// Number of upcoming connect attempts that will fail.
    fail_next_connects: u32,
}

impl SimPeripheral {
    /// A well-behaved primary optical device.
    pub fn optical_ring(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: DeviceKind::OpticalRing,
            services: 3,
            characteristics: 6,
            rssi: -55,
            rssi_jitter: 0,
            step_latency: Duration::ZERO,
            steps: HashMap::new(),
            fail_next_connects: 0,
        }
    }

    /// A well-behaved EMG-style comparison device. It carries no
    /// secondary notification channel.
    pub fn emg_comparator(name: &str) -> Self {
        let mut steps = HashMap::new();
        steps.insert(
            SimStep::EnableSecondaryNotifications,
            StepBehavior::Unsupported,
        );
        Self {
            name: name.to_string(),
            kind: DeviceKind::EmgComparator,
            services: 2,
            characteristics: 3,
            rssi: -60,
            rssi_jitter: 0,
            step_latency: Duration::ZERO,
            steps,
            fail_next_connects: 0,
        }
    }

    /// Script one negotiation step.
    pub fn set_step(&mut self, step: SimStep, behavior: StepBehavior) {
        self.steps.insert(step, behavior);
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_connects(&mut self, n: u32) {
        self.fail_next_connects = n;
    }
}

struct SimState {
    config: SimPeripheral,
    connected: bool,
}

/// The simulated radio. Implements [`BleTransport`] for the engine and
/// exposes scripting hooks for tests.
pub struct SimNetwork {
    peripherals: Mutex<HashMap<PeripheralId, SimState>>,
    scanning: AtomicBool,
    adapter_available: AtomicBool,
    events_tx: broadcast::Sender<TransportEvent>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            peripherals: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
            adapter_available: AtomicBool::new(true),
            events_tx,
        })
    }

    /// Add a scripted peripheral to the simulated radio environment.
    pub fn add_peripheral(&self, config: SimPeripheral) -> PeripheralId {
        let id = PeripheralId::Simulated(Uuid::new_v4());
        if let Ok(mut peripherals) = self.peripherals.lock() {
            peripherals.insert(
                id.clone(),
                SimState {
                    config,
                    connected: false,
                },
            );
        }
        id
    }

    /// Whether a scan is currently active.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Power the simulated adapter on or off. Scanning is rejected
    /// while it is off.
    pub fn set_adapter_available(&self, available: bool) {
        self.adapter_available.store(available, Ordering::SeqCst);
        let _ = self
            .events_tx
            .send(TransportEvent::AdapterStateChanged { available });
    }

    /// Script further connect-attempt failures for a peripheral.
    pub fn fail_next_connects(&self, id: &PeripheralId, n: u32) {
        if let Ok(mut peripherals) = self.peripherals.lock() {
            if let Some(state) = peripherals.get_mut(id) {
                state.config.fail_next_connects = n;
            }
        }
    }

    /// Tear down the link from the peripheral side. An `error` makes it
    /// an unexpected disconnection; `None` models a clean teardown.
    pub fn force_disconnect(&self, id: &PeripheralId, error: Option<String>) {
        let was_connected = self
            .peripherals
            .lock()
            .ok()
            .and_then(|mut p| p.get_mut(id).map(|s| std::mem::replace(&mut s.connected, false)))
            .unwrap_or(false);
        if was_connected {
            let _ = self.events_tx.send(TransportEvent::DeviceDisconnected {
                id: id.clone(),
                error,
            });
        }
    }

    /// Deliver a batch of decoded readings from a connected peripheral.
    pub fn emit_batch(&self, id: &PeripheralId, readings: Vec<SensorReading>) {
        let kind = match self.peripherals.lock() {
            Ok(p) => match p.get(id) {
                Some(state) if state.connected => state.config.kind,
                _ => return,
            },
            Err(_) => return,
        };
        let _ = self.events_tx.send(TransportEvent::ReadingBatch {
            id: id.clone(),
            kind,
            readings,
        });
    }

    fn with_state<T>(
        &self,
        id: &PeripheralId,
        f: impl FnOnce(&mut SimState) -> T,
    ) -> Result<T, BleError> {
        let mut peripherals = self.peripherals.lock().map_err(|_| BleError::Busy)?;
        let state = peripherals
            .get_mut(id)
            .ok_or_else(|| BleError::UnknownPeripheral(id.clone()))?;
        Ok(f(state))
    }

    /// Run one scripted negotiation step for a connected peripheral.
    async fn run_step(
        &self,
        id: &PeripheralId,
        step: SimStep,
    ) -> Result<(), BleError> {
        let (behavior, latency, connected) = self.with_state(id, |state| {
            (
                state
                    .config
                    .steps
                    .get(&step)
                    .cloned()
                    .unwrap_or(StepBehavior::Succeed),
                state.config.step_latency,
                state.connected,
            )
        })?;
        if !connected {
            return Err(BleError::NotConnected);
        }
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        match behavior {
            StepBehavior::Succeed => Ok(()),
            StepBehavior::Unsupported => Err(BleError::Unsupported(step_name(step))),
            StepBehavior::Fail(reason) => Err(match step {
                SimStep::DiscoverServices | SimStep::DiscoverCharacteristics => {
                    BleError::DiscoveryFailed(reason)
                }
                SimStep::EnablePrimaryNotifications | SimStep::EnableSecondaryNotifications => {
                    BleError::NotifySetupFailed(reason)
                }
                SimStep::ApplyConfiguration => BleError::ConnectionFailed(reason),
            }),
            StepBehavior::Hang => {
                // Held open forever; the caller's timeout race drops us.
                std::future::pending::<()>().await;
                unreachable!()
            }
            StepBehavior::DropLink => {
                self.force_disconnect(id, Some("link supervision timeout".into()));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BleTransport for SimNetwork {
    async fn start_scan(&self) -> Result<(), BleError> {
        if !self.adapter_available.load(Ordering::SeqCst) {
            return Err(BleError::AdapterUnavailable("adapter powered off".into()));
        }
        self.scanning.store(true, Ordering::SeqCst);
        let discovered: Vec<TransportEvent> = {
            let peripherals = self.peripherals.lock().map_err(|_| BleError::Busy)?;
            peripherals
                .iter()
                .map(|(id, state)| TransportEvent::DeviceDiscovered {
                    id: id.clone(),
                    kind: state.config.kind,
                    name: Some(state.config.name.clone()),
                    rssi: Some(state.config.rssi),
                })
                .collect()
        };
        for event in discovered {
            let _ = self.events_tx.send(event);
        }
        debug!("simulated scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.scanning.store(false, Ordering::SeqCst);
        debug!("simulated scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), BleError> {
        let (latency, fail) = self.with_state(id, |state| {
            let fail = state.config.fail_next_connects > 0;
            if fail {
                state.config.fail_next_connects -= 1;
            }
            (state.config.step_latency, fail)
        })?;
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(BleError::ConnectionFailed("peripheral unreachable".into()));
        }
        self.with_state(id, |state| state.connected = true)?;
        let _ = self
            .events_tx
            .send(TransportEvent::DeviceConnected { id: id.clone() });
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), BleError> {
        let was_connected = self.with_state(id, |state| {
            std::mem::replace(&mut state.connected, false)
        })?;
        if was_connected {
            // No error: user-initiated teardown.
            let _ = self.events_tx.send(TransportEvent::DeviceDisconnected {
                id: id.clone(),
                error: None,
            });
        }
        Ok(())
    }

    fn is_connected(&self, id: &PeripheralId) -> bool {
        self.peripherals
            .lock()
            .ok()
            .and_then(|p| p.get(id).map(|s| s.connected))
            .unwrap_or(false)
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<usize, BleError> {
        self.run_step(id, SimStep::DiscoverServices).await?;
        self.with_state(id, |state| state.config.services)
    }

    async fn discover_characteristics(&self, id: &PeripheralId) -> Result<usize, BleError> {
        self.run_step(id, SimStep::DiscoverCharacteristics).await?;
        self.with_state(id, |state| state.config.characteristics)
    }

    async fn enable_primary_notifications(&self, id: &PeripheralId) -> Result<(), BleError> {
        self.run_step(id, SimStep::EnablePrimaryNotifications).await
    }

    async fn enable_secondary_notifications(&self, id: &PeripheralId) -> Result<(), BleError> {
        self.run_step(id, SimStep::EnableSecondaryNotifications).await
    }

    async fn apply_device_configuration(&self, id: &PeripheralId) -> Result<(), BleError> {
        self.run_step(id, SimStep::ApplyConfiguration).await
    }

    async fn read_rssi(&self, id: &PeripheralId) -> Result<i16, BleError> {
        let (connected, rssi, jitter) = self.with_state(id, |state| {
            (state.connected, state.config.rssi, state.config.rssi_jitter)
        })?;
        if !connected {
            return Err(BleError::NotConnected);
        }
        let rssi = if jitter > 0 {
            rssi + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            rssi
        };
        Ok(rssi)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}
