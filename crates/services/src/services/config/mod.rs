use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

pub const CONFIG_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cors_origins: vec![],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: String,
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8001".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

/// Bounds enforced on submitted research parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct LimitsConfig {
    pub min_query_chars: usize,
    pub max_query_chars: usize,
    pub min_subtopics: i32,
    pub max_subtopics: i32,
    pub min_total_words: i32,
    pub max_total_words: i32,
    pub deep_total_depth: i32,
    pub deep_total_breadth: i32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_query_chars: 3,
            max_query_chars: 2000,
            min_subtopics: 1,
            max_subtopics: 10,
            min_total_words: 500,
            max_total_words: 10000,
            deep_total_depth: 3,
            deep_total_breadth: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct DispatcherConfig {
    pub max_concurrent_executions: usize,
    /// `None` disables the wall-clock limit.
    pub task_timeout_secs: Option<u64>,
    pub cancel_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 4,
            task_timeout_secs: Some(3600),
            cancel_grace_secs: 10,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct ProgressBusConfig {
    pub observer_queue_capacity: usize,
}

impl Default for ProgressBusConfig {
    fn default() -> Self {
        Self {
            observer_queue_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TS)]
#[serde(default)]
pub struct Config {
    pub config_version: String,
    pub server: ServerConfig,
    pub database_url: Option<String>,
    pub engine: EngineConfig,
    pub limits: LimitsConfig,
    pub dispatcher: DispatcherConfig,
    pub progress_bus: ProgressBusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION.to_string(),
            server: ServerConfig::default(),
            database_url: None,
            engine: EngineConfig::default(),
            limits: LimitsConfig::default(),
            dispatcher: DispatcherConfig::default(),
            progress_bus: ProgressBusConfig::default(),
        }
    }
}

impl From<String> for Config {
    fn from(raw_config: String) -> Self {
        match serde_json::from_str::<Config>(&raw_config) {
            Ok(mut config) => {
                if config.config_version != CONFIG_VERSION {
                    tracing::info!(
                        "Config version {} upgraded to {}",
                        config.config_version,
                        CONFIG_VERSION
                    );
                    config.config_version = CONFIG_VERSION.to_string();
                }
                config
            }
            Err(e) => {
                tracing::warn!("Config parse failed: {}, using default", e);
                Self::default()
            }
        }
    }
}

impl Config {
    /// Applies environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("BACKEND_PORT").or_else(|| lookup("PORT")) {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("RESEARCH_ENGINE_URL") {
            self.engine.base_url = url;
        }
        if let Some(secs) = lookup("RESEARCH_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env("RESEARCH_TASK_TIMEOUT_SECS", &secs)?;
            self.dispatcher.task_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(max) = lookup("RESEARCH_MAX_CONCURRENT") {
            self.dispatcher.max_concurrent_executions =
                parse_env::<usize>("RESEARCH_MAX_CONCURRENT", &max)?.max(1);
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Loads the config file, falling back to defaults when it is missing or unreadable.
pub async fn load_config_from_file(config_path: &Path) -> Config {
    match tokio::fs::read_to_string(config_path).await {
        Ok(raw_config) => Config::from(raw_config),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("No config file at {:?}, using defaults", config_path);
            Config::default()
        }
        Err(e) => {
            tracing::warn!("Failed to read config {:?}: {}, using defaults", config_path, e);
            Config::default()
        }
    }
}

pub async fn save_config_to_file(config: &Config, config_path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw_config = serde_json::to_string_pretty(config)?;
    tokio::fs::write(config_path, raw_config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let raw = r#"{ "dispatcher": { "max_concurrent_executions": 2 } }"#;
        let config = Config::from(raw.to_string());
        assert_eq!(config.dispatcher.max_concurrent_executions, 2);
        assert_eq!(config.dispatcher.task_timeout_secs, Some(3600));
        assert_eq!(config.limits.max_query_chars, 2000);
        assert_eq!(config.config_version, CONFIG_VERSION);
    }

    #[test]
    fn garbage_falls_back_to_default() {
        let config = Config::from("not json".to_string());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("HOST", "0.0.0.0"),
            ("PORT", "9100"),
            ("RESEARCH_ENGINE_URL", "http://engine:9000"),
            ("RESEARCH_TASK_TIMEOUT_SECS", "0"),
            ("RESEARCH_MAX_CONCURRENT", "8"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.engine.base_url, "http://engine:9000");
        assert_eq!(config.dispatcher.task_timeout_secs, None);
        assert_eq!(config.dispatcher.max_concurrent_executions, 8);
    }

    #[test]
    fn bad_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == "PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.engine.base_url = "http://saved:1234".to_string();
        save_config_to_file(&config, &path).await.unwrap();

        let loaded = load_config_from_file(&path).await;
        assert_eq!(loaded, config);

        let missing = load_config_from_file(&dir.path().join("absent.json")).await;
        assert_eq!(missing, Config::default());
    }
}
