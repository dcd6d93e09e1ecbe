//! Engine facade wiring transport, readiness, routing, and analysis
//!
//! Owns the background tasks that drive the system: the transport event
//! pump, the readiness watcher, and the liveness poll loop. Consumers
//! interact through this facade only; the components underneath never
//! call each other directly, they meet here.
//!
//! Scanning stops automatically once a peripheral reaches `Ready`, so
//! the radio is not kept busy while data is streaming. Remembered
//! peripherals are reconnected automatically when they reappear in a
//! scan.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::ble::orchestrator::ReadinessOrchestrator;
use crate::ble::readiness::{ConnectionReadiness, DeviceRegistry, PeripheralSnapshot, ReadinessChange};
use crate::ble::reconnect::{ReconnectEvent, ReconnectPolicy};
use crate::ble::transport::{BleTransport, TransportEvent};
use crate::ble::BleError;
use crate::config::EngineConfig;
use crate::dsp::beats::BeatDetector;
use crate::dsp::hrv::HrvAnalyzer;
use crate::dsp::irdc::IrDcAnalyzer;
use crate::router::{ReadingBatch, ReadingRouter};
use crate::types::{BeatFeature, HrvStats, HrvSvdResult, IrDcResult, PeripheralId, SensorSample};

pub struct PulselinkEngine {
    transport: Arc<dyn BleTransport>,
    registry: Arc<DeviceRegistry>,
    router: Arc<ReadingRouter>,
    reconnect: Arc<ReconnectPolicy>,
    orchestrator: Arc<ReadinessOrchestrator>,
    beat_detector: BeatDetector,
    ir_dc: IrDcAnalyzer,
    hrv: Mutex<HrvAnalyzer>,
    /// Peripherals to reconnect automatically when rediscovered.
    remembered: Mutex<HashSet<PeripheralId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Back-reference for handing owned clones to spawned tasks.
    me: Weak<Self>,
}

impl PulselinkEngine {
    pub fn new(transport: Arc<dyn BleTransport>, config: EngineConfig) -> Arc<Self> {
        let registry = Arc::new(DeviceRegistry::new());
        let router = Arc::new(ReadingRouter::new(config.router));
        let reconnect = ReconnectPolicy::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            config.reconnect,
        );
        let orchestrator = Arc::new(ReadinessOrchestrator::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            config.orchestrator,
        ));
        Arc::new_cyclic(|me| Self {
            transport,
            registry,
            router,
            reconnect,
            orchestrator,
            beat_detector: BeatDetector::new(config.beats),
            ir_dc: IrDcAnalyzer::new(config.ir_dc),
            hrv: Mutex::new(HrvAnalyzer::new(config.hrv)),
            remembered: Mutex::new(HashSet::new()),
            tasks: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    /// Spawn the background tasks. Call once before any scanning.
    pub fn start(&self) {
        let engine = match self.me.upgrade() {
            Some(engine) => engine,
            None => return,
        };
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(_) => return,
        };
        if !tasks.is_empty() {
            return;
        }

        let pump = Arc::clone(&engine);
        // Subscribe before spawning so events emitted between `start()`
        // returning and the task's first poll are not dropped.
        let events = self.transport.events();
        tasks.push(tokio::spawn(async move {
            pump.pump_events(events).await;
        }));

        tasks.push(tokio::spawn(async move {
            engine.watch_readiness().await;
        }));

        tasks.push(self.reconnect.spawn_liveness());
        info!("engine started");
    }

    /// Abort all background tasks.
    pub fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        info!("engine stopped");
    }

    pub async fn start_scan(&self) -> Result<(), BleError> {
        self.transport.start_scan().await
    }

    pub async fn stop_scan(&self) -> Result<(), BleError> {
        self.transport.stop_scan().await
    }

    /// Connect to a previously discovered peripheral.
    ///
    /// Cancels any in-flight reconnection for the same identity first,
    /// so a user-initiated connect never races the retry loop.
    pub async fn connect(&self, id: &PeripheralId) -> Result<(), BleError> {
        if !self.registry.contains(id) {
            return Err(BleError::UnknownPeripheral(id.clone()));
        }
        self.reconnect.cancel(id);
        self.registry.transition(id, ConnectionReadiness::Connecting)?;
        match self.transport.connect(id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = self
                    .registry
                    .transition(id, ConnectionReadiness::Disconnected);
                Err(e)
            }
        }
    }

    /// Disconnect from a peripheral. Cancels any pending reconnection;
    /// the resulting disconnect event carries no error and triggers no
    /// retry.
    pub async fn disconnect(&self, id: &PeripheralId) -> Result<(), BleError> {
        self.reconnect.cancel(id);
        self.transport.disconnect(id).await
    }

    /// Mark a peripheral for automatic connection whenever a scan
    /// rediscovers it.
    pub fn remember(&self, id: &PeripheralId) {
        if let Ok(mut remembered) = self.remembered.lock() {
            remembered.insert(id.clone());
        }
    }

    pub fn forget(&self, id: &PeripheralId) {
        if let Ok(mut remembered) = self.remembered.lock() {
            remembered.remove(id);
        }
    }

    /// Detect beats in one window of the optical waveform and fold their
    /// peak times into the HRV history. `window_start_s` places the
    /// window on the engine's continuous timeline.
    pub fn detect_beats(&self, signal: &[f64], window_start_s: f64) -> Vec<BeatFeature> {
        let beats = self.beat_detector.detect(signal);
        if let Ok(mut hrv) = self.hrv.lock() {
            for beat in &beats {
                hrv.record_peak(window_start_s + beat.peak_time);
            }
        }
        beats
    }

    /// Analyze one window of the infrared DC channel.
    pub fn analyze_ir_dc(&self, signal: &[f64]) -> IrDcResult {
        self.ir_dc.analyze(signal)
    }

    /// The SVD biomarker over beats recorded in `[start_s, end_s]`.
    pub fn calculate_svd_biomarker(&self, start_s: f64, end_s: f64) -> Option<HrvSvdResult> {
        let hrv = self.hrv.lock().ok()?;
        let intervals = hrv.rr_intervals(start_s, end_s);
        hrv.svd_biomarker(&intervals)
    }

    /// Intervals, time-domain HRV statistics, and the SVD biomarker for
    /// one window of recorded beats.
    pub fn analyze_window(
        &self,
        start_s: f64,
        end_s: f64,
    ) -> (Vec<f64>, Option<HrvStats>, Option<HrvSvdResult>) {
        match self.hrv.lock() {
            Ok(hrv) => hrv.analyze_window(start_s, end_s),
            Err(_) => (Vec::new(), None, None),
        }
    }

    pub fn readiness_changes(&self) -> broadcast::Receiver<ReadinessChange> {
        self.registry.changes()
    }

    pub fn summary(&self) -> tokio::sync::watch::Receiver<Vec<PeripheralSnapshot>> {
        self.registry.summary()
    }

    pub fn reading_batches(&self) -> broadcast::Receiver<ReadingBatch> {
        self.router.batches()
    }

    pub fn samples(&self) -> broadcast::Receiver<SensorSample> {
        self.router.samples()
    }

    pub fn reconnect_events(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.reconnect.events()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<ReadingRouter> {
        &self.router
    }

    async fn pump_events(
        self: Arc<Self>,
        mut events: broadcast::Receiver<TransportEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event pump lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered { id, kind, name, .. } => {
                if let Err(e) = self.registry.register(&id, kind, name) {
                    warn!("[{}] registration failed: {}", id, e);
                    return;
                }
                let remembered = self
                    .remembered
                    .lock()
                    .map(|r| r.contains(&id))
                    .unwrap_or(false);
                let idle = matches!(
                    self.registry.readiness(&id),
                    Some(ConnectionReadiness::Disconnected) | Some(ConnectionReadiness::Failed(_))
                );
                if remembered && idle {
                    if let Some(engine) = self.me.upgrade() {
                        info!("[{}] remembered peripheral rediscovered, connecting", id);
                        tokio::spawn(async move {
                            if let Err(e) = engine.connect(&id).await {
                                warn!("[{}] automatic connect failed: {}", id, e);
                            }
                        });
                    }
                }
            }
            TransportEvent::DeviceConnected { id } => {
                self.reconnect.on_connected(&id);
                // The Connecting step may already be in place from a
                // manual connect or a retry loop.
                let _ = self.registry.transition(&id, ConnectionReadiness::Connecting);
                if let Err(e) = self.registry.transition(&id, ConnectionReadiness::Connected) {
                    warn!("[{}] connected transition failed: {}", id, e);
                    return;
                }
                let orchestrator = Arc::clone(&self.orchestrator);
                tokio::spawn(async move {
                    orchestrator.run(id).await;
                });
            }
            TransportEvent::DeviceDisconnected { id, error } => {
                if let Err(e) = self
                    .registry
                    .transition(&id, ConnectionReadiness::Disconnected)
                {
                    warn!("[{}] disconnect transition failed: {}", id, e);
                }
                match error {
                    Some(reason) => {
                        warn!("[{}] unexpected disconnection: {}", id, reason);
                        self.reconnect.schedule(id);
                    }
                    None => info!("[{}] disconnected", id),
                }
            }
            TransportEvent::ReadingBatch { id, kind, readings } => {
                self.reconnect.note_activity(&id);
                self.router.ingest(ReadingBatch {
                    device: id,
                    kind,
                    readings,
                });
            }
            TransportEvent::Rssi { id, .. } => {
                self.reconnect.note_activity(&id);
            }
            TransportEvent::AdapterStateChanged { available } => {
                info!("adapter available: {}", available);
            }
            TransportEvent::TransportError { message } => {
                warn!("transport error: {}", message);
            }
        }
    }

    /// Stop scanning as soon as any peripheral reaches `Ready`.
    async fn watch_readiness(self: Arc<Self>) {
        let mut changes = self.registry.changes();
        loop {
            match changes.recv().await {
                Ok(change) if change.readiness.is_ready() => {
                    info!("[{}] ready, stopping scan", change.id);
                    if let Err(e) = self.transport.stop_scan().await {
                        warn!("stopping scan failed: {}", e);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
