/**
 * DLT KERNEL - Plan de contrôle des load tests distribués
 *
 * RÔLE : Bootstrap de tous les modules : config, store, router heartbeat,
 * dispatcher de commandes, listener MQTT, API HTTP.
 *
 * ARCHITECTURE : les node groups publient leurs heartbeats sur un topic
 * unique, le kernel suit leur santé, collecte les résultats des tests en
 * cours et produit un summary par test terminé.
 */

mod aggregator;
mod config;
mod decoder;
mod dispatcher;
mod error;
mod health;
mod http;
mod lifecycle;
mod logging;
mod models;
mod mqtt;
mod router;
mod state;
mod store;

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::load_config;
use crate::state::KernelState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();
    logging::init_logging();

    let cfg = load_config().await;
    tracing::info!(
        mqtt = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        heartbeat_topic = %cfg.mqtt.heartbeat_topic,
        "configuration loaded"
    );

    let (mqtt_client, eventloop) = mqtt::create_client(&cfg.mqtt);
    let kernel = KernelState::from_config(&cfg, Arc::new(mqtt_client.clone()))
        .await
        .context("failed to open store")?;

    mqtt::spawn_heartbeat_listener(
        mqtt_client,
        eventloop,
        cfg.mqtt.heartbeat_topic.clone(),
        kernel.router.clone(),
        kernel.health_tracker.clone(),
    );

    if cfg.http.api_key.is_none() {
        tracing::warn!("no api key configured, admin API is open");
    }
    let app = http::build_router(kernel.app_state(cfg.http.api_key.clone()));

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    tracing::info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}
