//! Simulateur de node group : publie des heartbeats actifs avec résultats
//! encodés pour un load test, puis un heartbeat inactif qui le termine.
//!
//! FLEET_NG_ID et FLEET_LOAD_TEST_ID sont requis ; MQTT_HOST, MQTT_PORT,
//! FLEET_ROUNDS et FLEET_TOPIC sont optionnels.

use anyhow::{Context, Result};
use dlt_devkit::{HeartbeatBuilder, NodeResultsBuilder};
use log::{error, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::time::{sleep, Duration};

const CLIENT_ID: &str = "dlt-fleet-sim";
const NODES: [&str; 2] = ["sim-node-1", "sim-node-2"];

struct SimConfig {
    host: String,
    port: u16,
    topic: String,
    node_group_id: String,
    load_test_id: String,
    rounds: u32,
}

impl SimConfig {
    fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Ok(Self {
            host: var("MQTT_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: var("MQTT_PORT").map(|p| p.parse()).transpose().context("invalid MQTT_PORT")?.unwrap_or(1883),
            topic: var("FLEET_TOPIC").unwrap_or_else(|| "manager".into()),
            node_group_id: var("FLEET_NG_ID").context("FLEET_NG_ID is required")?,
            load_test_id: var("FLEET_LOAD_TEST_ID").context("FLEET_LOAD_TEST_ID is required")?,
            rounds: var("FLEET_ROUNDS").map(|r| r.parse()).transpose().context("invalid FLEET_ROUNDS")?.unwrap_or(3),
        })
    }
}

/// Une succès par node et par round, un échec 500 tous les deux rounds
fn round_results(round: u32) -> String {
    let mut builder = NodeResultsBuilder::new();
    for node in NODES {
        builder = builder.node(node).success(20 + u64::from(round) * 5);
        if round % 2 == 1 {
            builder = builder.failure(500, "simulated upstream failure");
        }
    }
    builder.build()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cfg = SimConfig::from_env()?;
    info!("🚀 Simulating node group {} for load test {}", cfg.node_group_id, cfg.load_test_id);

    let mut mqttoptions = MqttOptions::new(CLIENT_ID, cfg.host.clone(), cfg.port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let pump = tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("✅ Connected to broker"),
                Ok(_) => {}
                Err(e) => {
                    warn!("⚠️ MQTT connection error: {}. Reconnecting...", e);
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    for round in 0..cfg.rounds {
        let heartbeat = HeartbeatBuilder::new(cfg.node_group_id.as_str())
            .nodes(&NODES)
            .active(&cfg.load_test_id)
            .node_updates(round_results(round));
        if let Err(e) = client.publish(cfg.topic.as_str(), QoS::AtLeastOnce, false, heartbeat.to_bytes()).await {
            error!("❌ Active heartbeat {} failed: {}", round, e);
        } else {
            info!("💓 Active heartbeat {}/{}", round + 1, cfg.rounds);
        }
        sleep(Duration::from_secs(1)).await;
    }

    let done = HeartbeatBuilder::new(cfg.node_group_id.as_str())
        .nodes(&NODES)
        .load_test_id(&cfg.load_test_id);
    client
        .publish(cfg.topic.as_str(), QoS::AtLeastOnce, false, done.to_bytes())
        .await
        .context("inactive heartbeat failed")?;
    info!("🏁 Inactive heartbeat sent");

    // laisse l'event loop flusher les publications en attente
    sleep(Duration::from_secs(1)).await;
    pump.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odd_rounds_carry_failures() {
        let even = round_results(0);
        let odd = round_results(1);
        assert!(even.contains("sim-node-1") && even.contains("sim-node-2"));
        assert!(odd.len() > even.len());
    }
}
