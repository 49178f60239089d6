//! Scripted session against the in-memory transport.

use crate::cli::app::Config;
use crate::messages::{MessagePriority, Payload};
use crate::network::{LinkManager, SimulatedTransport, Transport};
use anyhow::{ensure, Result};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, instrument};

const TICK: Duration = Duration::from_millis(100);

/// Overrides for a single `pairlink simulate` run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationOptions {
    pub duration: Duration,
    pub loss_rate: Option<f64>,
    pub latency: Option<Duration>,
    /// Companion goes out of reach at this offset
    pub outage_at: Option<Duration>,
    pub outage_length: Duration,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub packets_streamed: u64,
    pub diagnostics: Payload,
}

/// Drive a workout-shaped session: one GPS fix and heart rate per second,
/// a rep and a state message every five seconds, and an emergency stop at
/// the end. An optional outage flips reachability off and back on.
#[instrument(skip(config))]
pub async fn run_simulation(config: &Config, options: SimulationOptions) -> Result<SimulationReport> {
    let loss_rate = options.loss_rate.unwrap_or(config.simulator.loss_rate);
    ensure!(
        (0.0..=1.0).contains(&loss_rate),
        "loss rate must be within [0, 1], got {}",
        loss_rate
    );

    let transport = Arc::new(
        SimulatedTransport::connected().with_seed(options.seed.unwrap_or(config.simulator.seed)),
    );
    transport.set_loss_rate(loss_rate);
    transport.set_latency(
        options
            .latency
            .unwrap_or(Duration::from_millis(config.simulator.latency_ms)),
    );

    let manager = Arc::new(LinkManager::new(
        transport.clone() as Arc<dyn Transport>,
        config.to_link_config(),
    ));
    manager.start_stream();

    let sent = Arc::new(AtomicU64::new(0));
    let delivered = Arc::new(AtomicU64::new(0));
    let mut packets = 0u64;
    let mut senders = JoinSet::new();

    let ticks = (options.duration.as_millis() / TICK.as_millis()).max(1) as u64;
    let outage = options
        .outage_at
        .map(|start| (start, start + options.outage_length));

    for tick in 0..ticks {
        let elapsed = TICK * tick as u32;

        if let Some((start, end)) = outage {
            if elapsed == start {
                info!("Simulating companion outage");
                manager.on_transport_event(transport.set_reachable(false));
            } else if elapsed == end {
                info!("Companion back in reach");
                manager.on_transport_event(transport.set_reachable(true));
            }
        }

        if tick % 10 == 0 {
            let second = tick / 10;
            let latitude = 37.3349 + second as f64 * 0.0001;
            if manager.stream_location(latitude, -122.009, 8.5, 5.0) {
                packets += 1;
            }
            if manager.stream_heart_rate(150.0 + (second % 20) as f64) {
                packets += 1;
            }

            if second % 5 == 0 {
                let rep = (second / 5 + 1) as u32;
                if manager.stream_rep_completion(rep, 5.2, 40.0) {
                    packets += 1;
                }

                let mut update = Payload::new();
                update.insert("type".to_string(), json!("workout_update"));
                update.insert("rep".to_string(), json!(rep));
                sent.fetch_add(1, Ordering::Relaxed);
                let manager = manager.clone();
                let delivered = delivered.clone();
                senders.spawn(async move {
                    if manager.send(update, MessagePriority::High).await {
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        }

        tokio::time::sleep(TICK).await;
    }

    if let Some((_, end)) = outage {
        if end >= options.duration {
            manager.on_transport_event(transport.set_reachable(true));
        }
    }
    manager.stream_emergency_stop();

    // let in-flight sends settle, bounded so a dead link cannot hang the run
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while senders.join_next().await.is_some() {}
    })
    .await;
    senders.abort_all();

    manager.stop_stream();
    let diagnostics = manager.diagnostics();
    manager.shutdown();

    Ok(SimulationReport {
        messages_sent: sent.load(Ordering::Relaxed),
        messages_delivered: delivered.load(Ordering::Relaxed),
        packets_streamed: packets,
        diagnostics,
    })
}
