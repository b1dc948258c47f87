// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_FILE: &str = "RustRabbitRPC.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RustRabbitConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default)]
    pub opts: ConnectionOpts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOpts {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_interval_in_seconds: u16,
    #[serde(default = "default_reconnect_time")]
    pub reconnect_time_in_seconds: u64,
    /// 0 retries forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConfig {
    #[serde(default = "default_request_queue")]
    pub request_queue: String,
    #[serde(default = "default_reply_queue")]
    pub reply_queue: String,
    /// Unset leaves requests pending until their reply arrives.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

// Default values
fn default_hosts() -> Vec<String> { vec!["localhost".to_string()] }
fn default_port() -> u16 { 5672 }
fn default_user() -> String { "guest".to_string() }
fn default_vhost() -> String { "/".to_string() }
fn default_connection_name() -> String { "RustRabbitRPC".to_string() }
fn default_heartbeat() -> u16 { 5 }
fn default_reconnect_time() -> u64 { 2 }
fn default_request_queue() -> String { "rpc.requests".to_string() }
fn default_reply_queue() -> String { "rpc.replies".to_string() }

impl Default for ConnectionOpts {
    fn default() -> Self {
        Self {
            heartbeat_interval_in_seconds: default_heartbeat(),
            reconnect_time_in_seconds: default_reconnect_time(),
            max_reconnect_attempts: 0,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_queue: default_request_queue(),
            reply_queue: default_reply_queue(),
            request_timeout_ms: None,
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

impl BrokerConfig {
    pub fn new(password: &str) -> Self {
        Self {
            hosts: default_hosts(),
            port: default_port(),
            user: default_user(),
            password: password.to_string(),
            vhost: default_vhost(),
            connection_name: default_connection_name(),
            opts: ConnectionOpts::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.password.is_empty() {
            return Err(anyhow!("Configuration error: broker.password is required"));
        }
        if self.hosts.is_empty() {
            return Err(anyhow!("Configuration error: broker.hosts cannot be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("Configuration error: broker.port is invalid"));
        }
        Ok(())
    }

    pub fn reconnect_time(&self) -> Duration {
        Duration::from_secs(self.opts.reconnect_time_in_seconds)
    }

    /// One AMQP URL per candidate host. Hosts given as full URLs are kept
    /// as they are.
    pub fn urls(&self) -> Vec<String> {
        self.hosts
            .iter()
            .map(|host| {
                if host.starts_with("amqp://") || host.starts_with("amqps://") {
                    host.clone()
                } else {
                    format!(
                        "amqp://{}:{}@{}:{}/{}?heartbeat={}",
                        encode_component(&self.user),
                        encode_component(&self.password),
                        host,
                        self.port,
                        encode_component(&self.vhost),
                        self.opts.heartbeat_interval_in_seconds
                    )
                }
            })
            .collect()
    }

    /// Applies `AMQP_*` overrides from `lookup` (the environment in practice).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(hosts) = lookup("AMQP_HOSTS") {
            self.hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(port) = lookup("AMQP_PORT") {
            self.port = port.parse().context(format!("AMQP_PORT is not a valid port: {}", port))?;
        }
        if let Some(user) = lookup("AMQP_USER") {
            self.user = user;
        }
        if let Some(password) = lookup("AMQP_PASSWORD") {
            self.password = password;
        }
        if let Some(vhost) = lookup("AMQP_VHOST") {
            self.vhost = vhost;
        }
        Ok(())
    }
}

fn encode_component(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02x}", byte)),
        }
    }
    encoded
}

// Configuration loading and management functions
pub fn find_config_file() -> Option<PathBuf> {
    let config_dir = Path::new("config").join(CONFIG_FILE);
    let locations = [
        ("Current directory", Path::new(CONFIG_FILE)),
        ("Current directory (alternative)", config_dir.as_path()),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Some(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Some(home_config);
        }
    }

    None
}

pub fn load_config_from(path: &Path) -> Result<RustRabbitConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")
}

/// File (if any) plus environment overrides, validated.
pub fn load_config() -> Result<RustRabbitConfig> {
    dotenv::dotenv().ok();

    let mut config = match find_config_file() {
        Some(path) => load_config_from(&path)?,
        None => {
            debug!("No config file found, using defaults and environment");
            RustRabbitConfig {
                broker: BrokerConfig::new(""),
                rpc: RpcConfig::default(),
            }
        }
    };

    config.broker.apply_overrides(|key| std::env::var(key).ok())?;
    config.broker.validate()?;
    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let default_config = RustRabbitConfig {
        broker: BrokerConfig::new("guest"),
        rpc: RpcConfig::default(),
    };

    let json = serde_json::to_string_pretty(&default_config)
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
