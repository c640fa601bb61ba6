//! # Configuration Loading
//!
//! Loads [`CourierConfig`] from defaults, a TOML file and the environment.

use crate::{config::CourierConfig, Error, Result};
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

const CONFIG_FILE_NAMES: [&str; 2] = ["courier.toml", "config.toml"];

/// Configuration loader with support for multiple sources
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("./config"),
                dirs::config_dir().map_or_else(|| PathBuf::from("/etc"), |dir| dir.join("courier")),
            ],
            explicit_file: None,
            env_prefix: "COURIER".to_string(),
        }
    }

    /// Add a search path for configuration files
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Use exactly this file instead of searching
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration from all available sources
    pub fn load(&self) -> Result<CourierConfig> {
        let mut config_value = toml::Value::try_from(CourierConfig::default()).map_err(|e| {
            Error::Configuration { message: format!("Failed to serialize default config: {e}") }
        })?;

        if let Some(config_path) = self.find_config_file() {
            let file_config = load_config_file(&config_path)?;
            config_value = merge_config(config_value, file_config);
            info!("Loaded configuration file: {}", config_path.display());
        } else {
            debug!("No configuration file found in search paths");
        }

        let overrides = self.collect_env_vars(env::vars());
        for (key, value) in &overrides {
            let parts: Vec<&str> = key.split('.').collect();
            set_nested_value(&mut config_value, &parts, value);
        }
        debug!(count = overrides.len(), "Applied environment overrides");

        let config: CourierConfig = config_value.try_into().map_err(|e| Error::Configuration {
            message: format!("Failed to deserialize config: {e}"),
        })?;
        config.validate_all()?;

        info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string, on top of the defaults
    pub fn load_from_str(&self, content: &str) -> Result<CourierConfig> {
        let defaults = toml::Value::try_from(CourierConfig::default()).map_err(|e| {
            Error::Configuration { message: format!("Failed to serialize default config: {e}") }
        })?;
        let parsed = content.parse::<toml::Value>().map_err(|e| Error::Configuration {
            message: format!("Failed to parse config: {e}"),
        })?;
        let config: CourierConfig =
            merge_config(defaults, parsed).try_into().map_err(|e| Error::Configuration {
                message: format!("Failed to deserialize config: {e}"),
            })?;
        config.validate_all()?;
        Ok(config)
    }

    /// Get the effective search paths being used
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(file) = &self.explicit_file {
            return Some(file.clone());
        }

        for search_path in &self.search_paths {
            for config_name in CONFIG_FILE_NAMES {
                let config_path = search_path.join(config_name);
                if config_path.exists() {
                    debug!("Found config file: {}", config_path.display());
                    return Some(config_path);
                }
            }
        }

        None
    }

    /// `COURIER_PAGING__FULL_SIZE=10` becomes `paging.full_size = 10`.
    fn collect_env_vars(
        &self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> HashMap<String, String> {
        let prefix = format!("{}_", self.env_prefix);
        vars.filter_map(|(key, value)| {
            key.strip_prefix(&prefix)
                .map(|rest| (rest.to_lowercase().replace("__", "."), value))
        })
        .collect()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn load_config_file(path: &Path) -> Result<toml::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
        message: format!("Failed to read config file {}: {}", path.display(), e),
    })?;

    content.parse::<toml::Value>().map_err(|e| Error::Configuration {
        message: format!("Failed to parse config file {}: {}", path.display(), e),
    })
}

fn merge_config(mut base: toml::Value, override_value: toml::Value) -> toml::Value {
    if let (toml::Value::Table(base_table), toml::Value::Table(override_table)) =
        (&mut base, override_value)
    {
        for (key, value) in override_table {
            match base_table.get_mut(&key) {
                Some(existing) if existing.is_table() && value.is_table() => {
                    *existing = merge_config(existing.clone(), value);
                },
                Some(existing) => *existing = value,
                None => {
                    base_table.insert(key, value);
                },
            }
        }
    }
    base
}

fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: &str) {
    let toml::Value::Table(table) = config else {
        return;
    };
    match parts {
        [] => {},
        [leaf] => {
            table.insert((*leaf).to_string(), parse_env_value(value));
        },
        [head, rest @ ..] => {
            let entry = table
                .entry((*head).to_string())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            set_nested_value(entry, rest, value);
        },
    }
}

fn parse_env_value(value: &str) -> toml::Value {
    if let Ok(bool_val) = value.parse::<bool>() {
        return toml::Value::Boolean(bool_val);
    }
    if let Ok(int_val) = value.parse::<i64>() {
        return toml::Value::Integer(int_val);
    }
    if let Ok(float_val) = value.parse::<f64>() {
        return toml::Value::Float(float_val);
    }
    toml::Value::String(value.to_string())
}
