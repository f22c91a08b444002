use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker in `variables` that allows every parameter key.
pub const ALLOW_ALL_VARIABLES: &str = "-";
pub const HEALTH_PATH: &str = "/v1/healthz";
/// Largest packet the MQTT remaining-length field can describe.
pub const MAX_PACKET_SIZE: usize = 268_435_455;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub broker: Broker,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for Broker {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keepalive_secs: default_keepalive_secs(),
            max_packet_size: default_max_packet_size(),
            client_id_prefix: default_client_id_prefix(),
            username: None,
            password: None,
        }
    }
}

/// Per-route broker address. Unset members come from the global `broker`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOverride {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Methods {
    Get,
    Post,
    #[default]
    All,
}

impl Methods {
    pub fn allows_get(self) -> bool {
        matches!(self, Methods::Get | Methods::All)
    }

    pub fn allows_post(self) -> bool {
        matches!(self, Methods::Post | Methods::All)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Enctype {
    Url,
    Multipart,
    #[default]
    All,
}

impl Enctype {
    pub fn reads_query(self) -> bool {
        matches!(self, Enctype::Url | Enctype::All)
    }

    pub fn accepts_urlencoded(self) -> bool {
        matches!(self, Enctype::Url | Enctype::All)
    }

    pub fn accepts_multipart(self) -> bool {
        matches!(self, Enctype::Multipart | Enctype::All)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub broker: Option<BrokerOverride>,
    pub pub_topic: String,
    pub sub_topic: String,
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    #[serde(default)]
    pub checks: BTreeMap<String, String>,
    #[serde(default)]
    pub methods: Methods,
    #[serde(default)]
    pub enctype: Enctype,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Route {
    /// Allowed parameter keys, or `None` when every key is allowed.
    pub fn allow_list(&self) -> Option<Vec<String>> {
        let vars = self.variables.as_ref()?;
        if vars.iter().any(|v| v == ALLOW_ALL_VARIABLES) {
            return None;
        }
        Some(vars.clone())
    }

    /// The global broker with this route's host and port applied on top.
    pub fn resolved_broker(&self, global: &Broker) -> Broker {
        let mut broker = global.clone();
        if let Some(o) = &self.broker {
            if let Some(host) = &o.host {
                broker.host = host.clone();
            }
            if let Some(port) = o.port {
                broker.port = port;
            }
        }
        broker
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_max_packet_size() -> usize {
    MAX_PACKET_SIZE
}

fn default_client_id_prefix() -> String {
    "mqttgate".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_qos() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    5_000
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

/// Checks the schema cannot express. Also run on configs built in code.
pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    check_broker("broker", &cfg.broker)?;
    if cfg.routes.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "at least one route is required".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    for (i, route) in cfg.routes.iter().enumerate() {
        let at = format!("routes[{i}]");
        if !route.path.starts_with('/') || !route.path.chars().all(is_path_char) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{at}.path={} must start with '/' and use only A-Z a-z 0-9 . _ ~ / -",
                route.path
            )));
        }
        if route.path == HEALTH_PATH {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{at}.path={HEALTH_PATH} is reserved"
            )));
        }
        if !seen.insert(route.path.as_str()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{at}.path={} is configured more than once",
                route.path
            )));
        }
        if route.pub_topic.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{at}.pub_topic must not be empty"
            )));
        }
        if route.sub_topic.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{at}.sub_topic must not be empty"
            )));
        }
        if route.qos > 2 {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{at}.qos={} is not a valid level; supported: 0, 1, 2",
                route.qos
            )));
        }
        if route.timeout_ms == 0 {
            return Err(ConfigError::UnsupportedConfig(format!(
                "{at}.timeout_ms must be >= 1"
            )));
        }
        check_broker(&format!("{at}.broker"), &route.resolved_broker(&cfg.broker))?;
    }
    Ok(())
}

fn check_broker(at: &str, broker: &Broker) -> Result<(), ConfigError> {
    if broker.host.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "{at}.host must not be empty"
        )));
    }
    if broker.port == 0 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "{at}.port must be in 1..=65535"
        )));
    }
    if broker.keepalive_secs == 0 {
        return Err(ConfigError::UnsupportedConfig(format!(
            "{at}.keepalive_secs must be >= 1"
        )));
    }
    if broker.max_packet_size == 0 || broker.max_packet_size > MAX_PACKET_SIZE {
        return Err(ConfigError::UnsupportedConfig(format!(
            "{at}.max_packet_size must be in 1..={MAX_PACKET_SIZE}"
        )));
    }
    if broker.password.is_some() && broker.username.is_none() {
        return Err(ConfigError::UnsupportedConfig(format!(
            "{at}.password requires {at}.username"
        )));
    }
    Ok(())
}

/// Literal path characters only, so a route never turns into a capture or
/// wildcard when handed to the router.
fn is_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '~' | '/' | '-')
}
