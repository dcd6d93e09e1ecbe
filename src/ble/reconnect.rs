//! Reconnection and liveness policy
//!
//! Recovers from unexpected disconnections without user intervention.
//! Retry bookkeeping is keyed by stable peripheral identity so recovery
//! for one device never interferes with another, and so a manual
//! connect or disconnect can cancel the retry loop for exactly the
//! device the user acted on.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};

use super::readiness::{ConnectionReadiness, DeviceRegistry};
use super::transport::BleTransport;
use super::BleError;
use crate::config::ReconnectConfig;
use crate::types::PeripheralId;

/// Events emitted by the policy.
#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    /// A reconnection attempt is starting.
    Attempt { id: PeripheralId, attempt: u32 },
    /// The radio link came back up under policy control.
    Recovered { id: PeripheralId },
    /// The attempt budget is exhausted. Emitted exactly once per loss;
    /// no further attempts happen until a manual connect.
    GaveUp { id: PeripheralId, attempts: u32 },
    /// A connected peripheral has produced no traffic or signal update
    /// within the staleness window.
    ConnectionStale { id: PeripheralId },
}

pub struct ReconnectPolicy {
    transport: Arc<dyn BleTransport>,
    registry: Arc<DeviceRegistry>,
    config: ReconnectConfig,
    /// In-flight retry task per peripheral identity.
    retries: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
    /// Last observed traffic or signal update per peripheral.
    last_activity: Mutex<HashMap<PeripheralId, Instant>>,
    /// Peripherals already reported stale (cleared when traffic resumes).
    stale_reported: Mutex<HashSet<PeripheralId>>,
    events_tx: broadcast::Sender<ReconnectEvent>,
    /// Back-reference for handing owned clones to spawned tasks.
    me: Weak<Self>,
}

impl ReconnectPolicy {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        registry: Arc<DeviceRegistry>,
        config: ReconnectConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(64);
        Arc::new_cyclic(|me| Self {
            transport,
            registry,
            config,
            retries: Mutex::new(HashMap::new()),
            last_activity: Mutex::new(HashMap::new()),
            stale_reported: Mutex::new(HashSet::new()),
            events_tx,
            me: me.clone(),
        })
    }

    /// Subscribe to policy events.
    pub fn events(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events_tx.subscribe()
    }

    /// Record traffic (a reading batch) or a signal update for a
    /// peripheral. Resets the staleness clock.
    pub fn note_activity(&self, id: &PeripheralId) {
        if let Ok(mut activity) = self.last_activity.lock() {
            activity.insert(id.clone(), Instant::now());
        }
        if let Ok(mut stale) = self.stale_reported.lock() {
            stale.remove(id);
        }
    }

    /// Cancel any in-flight reconnection attempt for a peripheral.
    ///
    /// Called before every manual connect or disconnect so user intent
    /// never races the retry loop.
    pub fn cancel(&self, id: &PeripheralId) {
        if let Ok(mut retries) = self.retries.lock() {
            if let Some(handle) = retries.remove(id) {
                handle.abort();
                info!("[{}] cancelled pending reconnection", id);
            }
        }
    }

    /// A connection came up (by any path): clear retry state and start
    /// the staleness clock.
    pub fn on_connected(&self, id: &PeripheralId) {
        self.cancel(id);
        self.note_activity(id);
    }

    /// Begin the retry loop for a peripheral after an unexpected
    /// disconnection. A loop already in flight for this identity is
    /// left alone.
    pub fn schedule(&self, id: PeripheralId) {
        let policy = match self.me.upgrade() {
            Some(policy) => policy,
            None => return,
        };
        let mut retries = match self.retries.lock() {
            Ok(retries) => retries,
            Err(_) => return,
        };
        if let Some(existing) = retries.get(&id) {
            if !existing.is_finished() {
                return;
            }
        }

        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            policy.retry_loop(task_id).await;
        });
        retries.insert(id, handle);
    }

    async fn retry_loop(self: Arc<Self>, id: PeripheralId) {
        let max = self.config.max_attempts;
        for attempt in 1..=max {
            sleep(self.config.retry_delay).await;
            let _ = self.events_tx.send(ReconnectEvent::Attempt {
                id: id.clone(),
                attempt,
            });
            if let Err(e) = self.registry.transition(&id, ConnectionReadiness::Connecting) {
                warn!("[{}] retry transition error: {}", id, e);
            }
            match self.transport.connect(&id).await {
                Ok(()) => {
                    info!("[{}] reconnected on attempt {}", id, attempt);
                    let _ = self.events_tx.send(ReconnectEvent::Recovered { id: id.clone() });
                    self.finish(&id);
                    return;
                }
                Err(e) => {
                    warn!("[{}] reconnection attempt {}/{} failed: {}", id, attempt, max, e);
                    let _ = self
                        .registry
                        .transition(&id, ConnectionReadiness::Disconnected);
                }
            }
        }
        let _ = self.events_tx.send(ReconnectEvent::GaveUp {
            id: id.clone(),
            attempts: max,
        });
        if let Err(e) = self.registry.transition(
            &id,
            ConnectionReadiness::Failed(
                BleError::RetriesExhausted { attempts: max }.to_string(),
            ),
        ) {
            warn!("[{}] gave-up transition error: {}", id, e);
        }
        self.finish(&id);
    }

    /// Remove this identity's retry entry without aborting (the task is
    /// finishing on its own).
    fn finish(&self, id: &PeripheralId) {
        if let Ok(mut retries) = self.retries.lock() {
            retries.remove(id);
        }
    }

    /// Run the liveness poll loop. While any peripherals are connected,
    /// polls signal strength on a fixed interval and reports staleness
    /// when a device goes quiet for longer than the threshold window.
    pub fn spawn_liveness(&self) -> JoinHandle<()> {
        let policy = self.me.upgrade();
        tokio::spawn(async move {
            let policy = match policy {
                Some(policy) => policy,
                None => return,
            };
            let mut ticker = interval(policy.config.rssi_poll_interval);
            loop {
                ticker.tick().await;
                let ids = policy.registry.connected_ids();
                if ids.is_empty() {
                    continue;
                }
                for id in ids {
                    policy.poll_one(&id).await;
                }
            }
        })
    }

    async fn poll_one(&self, id: &PeripheralId) {
        let signal_ok = match self.transport.read_rssi(id).await {
            Ok(_rssi) => true,
            Err(e) => {
                warn!("[{}] RSSI poll failed: {}", id, e);
                false
            }
        };

        let last = self
            .last_activity
            .lock()
            .ok()
            .and_then(|a| a.get(id).copied());
        let quiet_too_long = match last {
            Some(at) => at.elapsed() >= self.config.staleness_window,
            // Connected but never produced anything: judge from nothing,
            // treat as stale only once the poll itself fails.
            None => !signal_ok,
        };

        if quiet_too_long || !signal_ok {
            let first_report = self
                .stale_reported
                .lock()
                .map(|mut s| s.insert(id.clone()))
                .unwrap_or(false);
            if first_report {
                warn!("[{}] connection stale: no traffic within threshold", id);
                let _ = self
                    .events_tx
                    .send(ReconnectEvent::ConnectionStale { id: id.clone() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::simulated::{SimNetwork, SimPeripheral};
    use crate::types::DeviceKind;
    use std::time::Duration;

    fn setup(
        peripheral: SimPeripheral,
        config: ReconnectConfig,
    ) -> (Arc<SimNetwork>, Arc<DeviceRegistry>, Arc<ReconnectPolicy>, PeripheralId) {
        let network = SimNetwork::new();
        let id = network.add_peripheral(peripheral);
        let registry = Arc::new(DeviceRegistry::new());
        registry
            .register(&id, DeviceKind::OpticalRing, None)
            .unwrap();
        let policy = ReconnectPolicy::new(network.clone(), registry.clone(), config);
        (network, registry, policy, id)
    }

    fn drain(rx: &mut broadcast::Receiver<ReconnectEvent>) -> Vec<ReconnectEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_exactly_once_after_max_attempts() {
        let config = ReconnectConfig::default();
        let mut ring = SimPeripheral::optical_ring("ring");
        ring.fail_connects(config.max_attempts);
        let (_, registry, policy, id) = setup(ring, config.clone());
        let mut rx = policy.events();

        policy.schedule(id.clone());
        // Enough virtual time for every attempt plus slack.
        tokio::time::sleep(config.retry_delay * (config.max_attempts + 2)).await;

        let events = drain(&mut rx);
        let attempts = events
            .iter()
            .filter(|e| matches!(e, ReconnectEvent::Attempt { .. }))
            .count();
        let gave_up = events
            .iter()
            .filter(|e| matches!(e, ReconnectEvent::GaveUp { .. }))
            .count();
        assert_eq!(attempts, config.max_attempts as usize);
        assert_eq!(gave_up, 1);
        match registry.readiness(&id).unwrap() {
            ConnectionReadiness::Failed(reason) => {
                assert!(reason.contains("Gave up after"), "reason: {}", reason);
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        // No further attempts after giving up.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_reconnect_clears_retry_state() {
        let config = ReconnectConfig::default();
        let mut ring = SimPeripheral::optical_ring("ring");
        ring.fail_connects(2);
        let (network, _, policy, id) = setup(ring, config.clone());
        let mut rx = policy.events();

        policy.schedule(id.clone());
        tokio::time::sleep(config.retry_delay * (config.max_attempts + 2)).await;

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ReconnectEvent::Recovered { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ReconnectEvent::GaveUp { .. })));
        assert!(network.is_connected(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_retry() {
        let config = ReconnectConfig::default();
        let mut ring = SimPeripheral::optical_ring("ring");
        ring.fail_connects(u32::MAX);
        let (_, _, policy, id) = setup(ring, config.clone());
        let mut rx = policy.events();

        policy.schedule(id.clone());
        policy.cancel(&id);
        tokio::time::sleep(config.retry_delay * 4).await;

        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_idempotent_per_identity() {
        let config = ReconnectConfig::default();
        let mut ring = SimPeripheral::optical_ring("ring");
        ring.fail_connects(u32::MAX);
        let (_, _, policy, id) = setup(ring, config.clone());
        let mut rx = policy.events();

        policy.schedule(id.clone());
        policy.schedule(id.clone());
        tokio::time::sleep(config.retry_delay + Duration::from_millis(100)).await;

        // One loop, not two: a single first attempt.
        let attempts = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, ReconnectEvent::Attempt { attempt: 1, .. }))
            .count();
        assert_eq!(attempts, 1);
        policy.cancel(&id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_reported_once_until_traffic_resumes() {
        let config = ReconnectConfig {
            rssi_poll_interval: Duration::from_secs(1),
            staleness_window: Duration::from_secs(3),
            ..ReconnectConfig::default()
        };
        let (network, registry, policy, id) = setup(SimPeripheral::optical_ring("ring"), config);
        network.connect(&id).await.unwrap();
        registry.transition(&id, ConnectionReadiness::Connecting).unwrap();
        registry.transition(&id, ConnectionReadiness::Connected).unwrap();
        policy.note_activity(&id);

        let mut rx = policy.events();
        let liveness = policy.spawn_liveness();

        // Quiet for well past the staleness window.
        tokio::time::sleep(Duration::from_secs(10)).await;
        let stale = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, ReconnectEvent::ConnectionStale { .. }))
            .count();
        assert_eq!(stale, 1);

        // Traffic resumes, then goes quiet again: reported once more.
        policy.note_activity(&id);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let stale = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, ReconnectEvent::ConnectionStale { .. }))
            .count();
        assert_eq!(stale, 1);

        liveness.abort();
    }
}
