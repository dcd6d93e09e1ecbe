//! Demo monitor that runs the full engine against the in-process
//! simulated radio: discovers a ring and a comparison device, waits for
//! streaming readiness, feeds a synthetic pulse waveform through the
//! router, and periodically prints beats, HRV statistics, and the SVD
//! biomarker.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use log::info;
use tokio::time::sleep;

use pulselink::ble::simulated::{SimNetwork, SimPeripheral};
use pulselink::config::EngineConfig;
use pulselink::engine::PulselinkEngine;
use pulselink::types::{PeripheralId, SensorReading, SensorType};

const SAMPLE_RATE_HZ: f64 = 50.0;
const PULSE_HZ: f64 = 1.2;
const ANALYSIS_WINDOW_S: f64 = 20.0;

/// Emit one second of synthetic ring data per tick: a pulsatile channel
/// riding on a slowly drifting infrared baseline.
fn spawn_waveform_source(network: Arc<SimNetwork>, id: PeripheralId) {
    tokio::spawn(async move {
        let samples_per_batch = SAMPLE_RATE_HZ as usize;
        let mut n: u64 = 0;
        loop {
            let mut readings = Vec::with_capacity(samples_per_batch * 2);
            for _ in 0..samples_per_batch {
                let t = n as f64 / SAMPLE_RATE_HZ;
                let pulsatile = 2048.0 + 120.0 * (2.0 * PI * PULSE_HZ * t).sin();
                let infrared = 98_000.0 - 2.0 * t.min(300.0);
                readings.push(SensorReading::new(SensorType::Ppg, pulsatile));
                readings.push(SensorReading::new(SensorType::PpgInfrared, infrared));
                n += 1;
            }
            network.emit_batch(&id, readings);
            sleep(Duration::from_secs(1)).await;
        }
    });
}

async fn wait_for_ready(engine: &Arc<PulselinkEngine>, id: &PeripheralId) -> Result<()> {
    let mut changes = engine.readiness_changes();
    let deadline = sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            change = changes.recv() => {
                match change {
                    Ok(change) if change.id == *id && change.readiness.is_ready() => return Ok(()),
                    Ok(change) => info!("[{}] {:?}", change.id, change.readiness),
                    Err(e) => bail!("readiness stream ended: {}", e),
                }
            }
            _ = &mut deadline => bail!("[{}] never reached readiness", id),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    println!("Starting ring monitor (simulated radio)");

    let network = SimNetwork::new();
    let ring = network.add_peripheral(SimPeripheral::optical_ring("pulse-ring"));
    let emg = network.add_peripheral(SimPeripheral::emg_comparator("jaw-sensor"));

    let engine = PulselinkEngine::new(network.clone(), EngineConfig::default());
    engine.start();
    engine.remember(&ring);
    engine.remember(&emg);

    engine.start_scan().await?;
    wait_for_ready(&engine, &ring).await?;
    println!("[{}] streaming ready", ring);

    let snapshot = engine.summary().borrow().clone();
    println!("peripherals: {}", serde_json::to_string_pretty(&snapshot)?);

    spawn_waveform_source(network.clone(), ring.clone());
    let started = Instant::now();

    for _ in 0..3 {
        sleep(Duration::from_secs_f64(ANALYSIS_WINDOW_S)).await;
        let elapsed = started.elapsed().as_secs_f64();
        let window_start = elapsed - ANALYSIS_WINDOW_S;

        let ppg: Vec<f64> = engine
            .router()
            .history_for(SensorType::Ppg)
            .iter()
            .map(|r| r.value)
            .collect();
        let infrared: Vec<f64> = engine
            .router()
            .history_for(SensorType::PpgInfrared)
            .iter()
            .map(|r| r.value)
            .collect();

        let beats = engine.detect_beats(&ppg, window_start);
        let ir = engine.analyze_ir_dc(&infrared);
        let (intervals, stats, svd) = engine.analyze_window(0.0, elapsed);

        println!(
            "window {:.0}-{:.0}s: {} beats, {} RR intervals",
            window_start,
            elapsed,
            beats.len(),
            intervals.len()
        );
        println!(
            "  IR baseline {:.1} (rolling {:.1}, shift {:+.2})",
            ir.dc_value, ir.rolling_mean, ir.shift
        );
        if let Some(stats) = stats {
            println!(
                "  SDNN {:.1} ms, RMSSD {:.1} ms over {} intervals",
                stats.sdnn_ms, stats.rmssd_ms, stats.interval_count
            );
        }
        if let Some(svd) = svd {
            match svd.ratio {
                Some(ratio) => println!("  SVD s1 {:.3}, ratio {:.2}", svd.s1, ratio),
                None => println!("  SVD s1 {:.3}, rhythm fully periodic", svd.s1),
            }
        }
    }

    engine.disconnect(&ring).await?;
    engine.stop();
    println!("Done");
    Ok(())
}
