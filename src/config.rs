// src/config.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::env;
use crate::logging::LogSettings;
use crate::rabbitmq::ConnectionOptions;

fn default_protocol() -> String {
    "amqp".to_string()
}
fn default_heartbeat() -> u16 {
    30
}
fn default_reconnect() -> u64 {
    5
}

/// Accepts strings, numbers and booleans. Environment overrides are parsed
/// as JSON, so a numeric password arrives as a number.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(de::Error::custom(format!("expected a string, found {}", other))),
    }
}

/// A named broker block, e.g.
/// `{"host": "h1,h2", "username": "app", "password": "secret", "options": {"heartbeat": 10}}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Comma-separated `host[:port]` list, tried round-robin.
    #[serde(deserialize_with = "lenient_string")]
    pub host: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub username: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub password: String,
    #[serde(default)]
    pub vhost: Option<String>,
    #[serde(default)]
    pub options: BrokerOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOptions {
    /// Seconds.
    #[serde(default = "default_heartbeat")]
    pub heartbeat: u16,
    /// Seconds between reconnect attempts.
    #[serde(default = "default_reconnect")]
    pub reconnect: u64,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            heartbeat: default_heartbeat(),
            reconnect: default_reconnect(),
        }
    }
}

impl BrokerConfig {
    pub fn hosts(&self) -> Vec<String> {
        self.host
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// One URL per host, credentials URL-encoded.
    pub fn urls(&self) -> Vec<String> {
        let credentials = if self.username.is_empty() {
            String::new()
        } else {
            format!(
                "{}:{}@",
                urlencoding::encode(&self.username),
                urlencoding::encode(&self.password)
            )
        };
        let vhost = self
            .vhost
            .as_deref()
            .map(|v| format!("/{}", urlencoding::encode(v)))
            .unwrap_or_default();
        self.hosts()
            .iter()
            .map(|host| {
                format!(
                    "{}://{}{}{}?heartbeat={}",
                    self.protocol, credentials, host, vhost, self.options.heartbeat
                )
            })
            .collect()
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            heartbeat: self.options.heartbeat,
            reconnect_interval: Duration::from_secs(self.options.reconnect),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts().is_empty() {
            return Err(anyhow!("Configuration error: host cannot be empty"));
        }
        if self.options.reconnect == 0 {
            return Err(anyhow!("Configuration error: options.reconnect must be at least 1 second"));
        }
        Ok(())
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("options", &self.options)
            .finish()
    }
}

/// Layered settings: defaults, then a JSON file, then the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    root: Value,
}

impl Settings {
    /// Loads `.env`, the configuration file and the process environment.
    pub fn load() -> Result<Self> {
        env::bootstrap();
        let vars = env::vars();
        let lower_case = env::lower_case_keys();

        let path = match env::config_path() {
            Some(path) => Some(path),
            None => find_config_file(),
        };
        let file = match path {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };

        Ok(Self::from_sources(defaults(), file, vars, lower_case))
    }

    /// Merges the layers; later layers win key by key.
    pub fn from_sources<I>(defaults: Value, file: Option<Value>, vars: I, lower_case: bool) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = defaults;
        if let Some(file) = file {
            merge(&mut root, file);
        }
        for (key, value) in vars {
            let key = if lower_case { key.to_lowercase() } else { key };
            let path: Vec<&str> = key.split(env::SEPARATOR).filter(|s| !s.is_empty()).collect();
            if path.is_empty() {
                continue;
            }
            insert_path(&mut root, &path, parse_value(&value));
        }
        Self { root }
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Looks up a `.`-separated path, e.g. `rabbitmq.options.heartbeat`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.root, |value, segment| value.get(segment))
    }

    pub fn section<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .get(name)
            .ok_or_else(|| anyhow!("Configuration section '{}' is missing", name))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("Configuration section '{}' is invalid", name))
    }

    pub fn broker(&self, name: &str) -> Result<BrokerConfig> {
        let config: BrokerConfig = self.section(name)?;
        config
            .validate()
            .with_context(|| format!("Broker configuration '{}' is invalid", name))?;
        Ok(config)
    }

    pub fn log_settings(&self) -> Result<LogSettings> {
        serde_json::from_value(self.root.clone()).context("Logging configuration is invalid")
    }
}

fn defaults() -> Value {
    serde_json::json!({
        "log_level": "debug",
        "dev_log": false,
    })
}

/// First existing default location, if any.
pub fn find_config_file() -> Option<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from("config.json")),
        ("Config directory", PathBuf::from("config/config.json")),
    ];
    for (location_name, path) in locations {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path);
        }
    }

    let home_config = home::home_dir()?.join(".rabbit-core.json");
    if home_config.exists() {
        debug!("Found config file in home directory: {}", home_config.display());
        return Some(home_config);
    }
    None
}

pub fn read_config_file(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .context("Configuration file contains invalid JSON")?;
    if !value.is_object() {
        return Err(anyhow!(
            "Configuration file {} must contain a JSON object",
            path.display()
        ));
    }
    Ok(value)
}

/// Numbers, booleans and JSON documents are parsed; anything else stays a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn insert_path(node: &mut Value, path: &[&str], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        insert_path(child, rest, value);
    }
}
