use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::store::StoreTimeouts;

pub const CONFIG_PATH_VAR: &str = "DLT_KERNEL_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub store: StoreConf,
    pub timeouts: TimeoutsConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Topic sur lequel les node groups publient leurs heartbeats
    pub heartbeat_topic: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "dlt-kernel".into(),
            keep_alive_secs: 15,
            heartbeat_topic: "manager".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub api_key: Option<String>,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            api_key: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct StoreConf {
    /// Absent : store en mémoire uniquement
    pub data_file: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct TimeoutsConf {
    pub point_ms: u64,
    pub scan_ms: u64,
}

impl Default for TimeoutsConf {
    fn default() -> Self {
        Self {
            point_ms: 10_000,
            scan_ms: 60_000,
        }
    }
}

impl From<TimeoutsConf> for StoreTimeouts {
    fn from(conf: TimeoutsConf) -> Self {
        StoreTimeouts {
            point: Duration::from_millis(conf.point_ms),
            scan: Duration::from_millis(conf.scan_ms),
        }
    }
}

impl KernelConfig {
    pub fn parse(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// MQTT_HOST, MQTT_PORT, DLT_API_KEY, DLT_DATA_FILE
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST").filter(|h| !h.trim().is_empty()) {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            match port.trim().parse() {
                Ok(port) => self.mqtt.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid MQTT_PORT"),
            }
        }
        if let Some(key) = lookup("DLT_API_KEY") {
            self.http.api_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        if let Some(file) = lookup("DLT_DATA_FILE").filter(|f| !f.trim().is_empty()) {
            self.store.data_file = Some(PathBuf::from(file));
        }
    }

    pub fn store_timeouts(&self) -> StoreTimeouts {
        self.timeouts.into()
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| "kernel.yaml".into());
    let mut config = read_config_file(Path::new(&path)).await;
    config.apply_env_overrides(|name| std::env::var(name).ok());
    config
}

async fn read_config_file(path: &Path) -> KernelConfig {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no config file, using defaults");
        return KernelConfig::default();
    }
    let txt = match fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "config unreadable, using defaults");
            return KernelConfig::default();
        }
    };
    KernelConfig::parse(&txt).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        KernelConfig::default()
    })
}
