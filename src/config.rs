use eyre::{eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Channel label: what kind of payload a subscribed bus channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    #[serde(rename = "vehicle_2k")]
    Vehicle2k,
    #[serde(rename = "vehicle_4k")]
    Vehicle4k,
    #[serde(rename = "vehicle_raw_4k")]
    VehicleRaw4k,
    #[serde(rename = "ped_2k")]
    Ped2k,
    Stats,
    Queue,
    Incident,
    SqliteSt,
    SqliteLt,
    SqliteRt,
    PresenceVehicle,
    PresenceWait,
    PresenceCross,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub ip: String,
    pub port: u16,
    pub channel: String,
    pub label: Label,
    #[serde(default)]
    pub send_to: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Grpc,
    Volt,
    Redis,
    Sqlite,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcMode {
    Java,
    Sharp,
}

/// Companion columnar endpoint used by the RPC sink's `sharp` mode.
#[derive(Debug, Clone, Deserialize)]
pub struct CompanionConfig {
    pub ip: String,
    pub port: u16,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(rename = "type")]
    pub kind: ServerKind,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub name: String,
    pub mode: Option<RpcMode>,
    pub cam_id: Option<String>,
    pub channel: Option<String>,
    pub database: Option<String>,
    pub table: Option<String>,
    pub companion: Option<CompanionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    pub database: String,
    pub table: String,
    /// Retry worker tick, in seconds.
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Inference endpoint the stage posts JPEG frames to.
    pub endpoint: String,
    /// Class-name table, one name per line.
    pub names: String,
    /// Square input size the model expects.
    pub input_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    pub enabled: bool,
    pub plate_detector_model: Option<ModelConfig>,
    #[serde(rename = "OCR_model")]
    pub ocr_model: Option<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRemoteConfig {
    pub host: String,
    pub port: u16,
    pub car_image_path_2k: String,
    pub car_image_path_4k: String,
    pub queue_image_path: String,
    pub abnormal_image_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionRemap {
    pub cam_id: String,
    pub lane: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SpecialSiteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dir: BTreeMap<String, DirectionRemap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            path: None,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "redis_rcv")]
    pub channels: Vec<ChannelConfig>,
    pub servers: Vec<ServerConfig>,
    pub sqlite: SpoolConfig,
    pub merge: MergeConfig,
    #[serde(rename = "OCR")]
    pub ocr: OcrConfig,
    pub image_remote: ImageRemoteConfig,
    #[serde(default)]
    pub special_site: SpecialSiteConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| eyre!("failed to read config {}: {e}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| eyre!("failed to parse config {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(eyre!("no receive channels configured"));
        }
        for ch in &self.channels {
            if ch.channel.is_empty() {
                return Err(eyre!("receive channel with empty channel name"));
            }
        }
        if self.sqlite.interval == 0 {
            return Err(eyre!("sqlite retry interval must be > 0"));
        }
        for server in &self.servers {
            match server.kind {
                ServerKind::Manual => {
                    if server.cam_id.is_none() {
                        return Err(eyre!("manual server entry without cam_id"));
                    }
                }
                ServerKind::Grpc => {
                    if server.mode.is_none() {
                        return Err(eyre!("grpc server '{}' without mode", server.name));
                    }
                    if server.name.is_empty() {
                        return Err(eyre!("grpc server entry without name"));
                    }
                }
                ServerKind::Sqlite => {
                    if server.database.is_none() || server.table.is_none() {
                        return Err(eyre!(
                            "sqlite server '{}' needs database and table",
                            server.name
                        ));
                    }
                }
                ServerKind::Redis => {
                    if server.name.is_empty() {
                        return Err(eyre!("server entry without name"));
                    }
                    if server.channel.is_none() {
                        return Err(eyre!("redis server '{}' without channel", server.name));
                    }
                }
                ServerKind::Volt => {
                    if server.name.is_empty() {
                        return Err(eyre!("server entry without name"));
                    }
                }
            }
        }
        if self.ocr.enabled
            && (self.ocr.plate_detector_model.is_none() || self.ocr.ocr_model.is_none())
        {
            return Err(eyre!("OCR enabled but model endpoints are not configured"));
        }
        if self.special_site.enabled {
            for key in self.special_site.dir.keys() {
                if !matches!(key.as_str(), "straight" | "left" | "right") {
                    return Err(eyre!("unknown special_site direction '{key}'"));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "redis_rcv": [
                {"ip": "127.0.0.1", "port": 6379, "channel": "veh2k",
                 "label": "vehicle_2k", "send_to": ["L4", "MW"]},
                {"ip": "127.0.0.1", "port": 6379, "channel": "presence",
                 "label": "presence_vehicle", "send_to": ["BUS"]}
            ],
            "servers": [
                {"type": "grpc", "ip": "10.0.0.2", "port": 50051, "name": "MW",
                 "mode": "java"},
                {"type": "volt", "ip": "10.0.0.3", "port": 8080, "name": "L4"},
                {"type": "redis", "ip": "127.0.0.1", "port": 6379, "name": "BUS",
                 "channel": "out"},
                {"type": "sqlite", "name": "LOCAL", "database": "./main.db",
                 "table": "main_table"}
            ],
            "sqlite": {"database": "./spool.db", "table": "failed_messages",
                       "interval": 30},
            "merge": {"enabled": true},
            "OCR": {"enabled": false},
            "image_remote": {"host": "10.0.0.9", "port": 8000,
                "car_image_path_2k": "/remote/2k",
                "car_image_path_4k": "/remote/4k",
                "queue_image_path": "/remote/queue",
                "abnormal_image_path": "/remote/abnormal"},
            "special_site": {"enabled": true, "dir": {
                "straight": {"cam_id": "CAM-S", "lane": [3, 4]},
                "left": {"cam_id": "CAM-L", "lane": [1]},
                "right": {"cam_id": "CAM-R", "lane": [5]}
            }},
            "log": {"path": null, "level": "debug"}
        }"#
    }

    #[test]
    fn sample_config_parses() {
        let config: Config = serde_json::from_str(sample()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].label, Label::Vehicle2k);
        assert_eq!(config.servers[0].mode, Some(RpcMode::Java));
        assert_eq!(config.sqlite.interval, 30);
        assert_eq!(config.log.level, "debug");
        assert!(config.special_site.enabled);
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config: Config = serde_json::from_str(sample()).unwrap();
        config.sqlite.interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ocr_without_models_rejected() {
        let mut config: Config = serde_json::from_str(sample()).unwrap();
        config.ocr.enabled = true;
        assert!(config.validate().is_err());
    }
}
