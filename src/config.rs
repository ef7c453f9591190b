//! Client configuration
//!
//! [`ClientOptions`] is the runtime builder handed to [`crate::Client::new`];
//! it is immutable once the client exists. [`ClientConfig`] is the TOML file
//! form of the same settings, converted with [`ClientConfig::into_options`].

use crate::client::router::MessageHandler;
use crate::client::Client;
use crate::error::ClientError;
use crate::packet::{qos_from_u8, LastWill, ProtocolVersion};
use crate::store::{FileStore, MemoryStore, Store};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Callback invoked after every accepted connect, including reconnects
pub type OnConnectHandler = Arc<dyn Fn(&Client) + Send + Sync>;

/// Callback invoked when an established connection is lost
pub type ConnectionLostHandler = Arc<dyn Fn(&Client, &ClientError) + Send + Sync>;

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RECONNECT_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MESSAGE_CHANNEL_DEPTH: usize = 100;

/// TLS settings for `ssl://`, `tls://` and `mqtts://` brokers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TlsOptions {
    /// PEM file with the CA certificates to trust, webpki roots when unset
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain for mutual TLS
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`
    pub client_key: Option<PathBuf>,
    /// Name to verify the broker certificate against, the broker host when unset
    pub server_name: Option<String>,
}

/// Runtime client options
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) brokers: Vec<String>,
    pub(crate) client_id: String,
    pub(crate) username: Option<String>,
    pub(crate) password: Option<Vec<u8>>,
    pub(crate) keep_alive: Duration,
    pub(crate) clean_session: bool,
    pub(crate) auto_reconnect: bool,
    pub(crate) max_reconnect_interval: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) protocol_pinned: bool,
    pub(crate) will: Option<LastWill>,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) default_handler: Option<MessageHandler>,
    pub(crate) on_connect: Option<OnConnectHandler>,
    pub(crate) on_connection_lost: Option<ConnectionLostHandler>,
    pub(crate) message_channel_depth: usize,
    pub(crate) tls: Option<TlsOptions>,
    pub(crate) log_dispatch: Option<tracing::Dispatch>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            brokers: Vec::new(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            clean_session: true,
            auto_reconnect: true,
            max_reconnect_interval: DEFAULT_MAX_RECONNECT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            protocol_version: ProtocolVersion::V311,
            protocol_pinned: false,
            will: None,
            store: None,
            default_handler: None,
            on_connect: None,
            on_connection_lost: None,
            message_channel_depth: DEFAULT_MESSAGE_CHANNEL_DEPTH,
            tls: None,
            log_dispatch: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("brokers", &self.brokers)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("max_reconnect_interval", &self.max_reconnect_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("protocol_version", &self.protocol_version)
            .field("protocol_pinned", &self.protocol_pinned)
            .field("will", &self.will)
            .field("has_store", &self.store.is_some())
            .field("message_channel_depth", &self.message_channel_depth)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a broker URL such as `tcp://localhost:1883`; brokers are tried
    /// in the order added
    pub fn add_broker(mut self, url: impl Into<String>) -> Self {
        self.brokers.push(url.into());
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Keepalive interval, truncated to whole seconds; zero disables keepalive
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn max_reconnect_interval(mut self, max: Duration) -> Self {
        self.max_reconnect_interval = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Pin the protocol version; a pinned version never falls back
    pub fn protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self.protocol_pinned = true;
        self
    }

    pub fn will(mut self, will: LastWill) -> Self {
        self.will = Some(will);
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Handler for publications that match no subscribed filter
    pub fn default_handler(mut self, handler: MessageHandler) -> Self {
        self.default_handler = Some(handler);
        self
    }

    pub fn on_connect(mut self, handler: OnConnectHandler) -> Self {
        self.on_connect = Some(handler);
        self
    }

    pub fn on_connection_lost(mut self, handler: ConnectionLostHandler) -> Self {
        self.on_connection_lost = Some(handler);
        self
    }

    /// Capacity of the outbound and inbound message queues
    pub fn message_channel_depth(mut self, depth: usize) -> Self {
        self.message_channel_depth = depth;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Send the client's logs to `dispatch` instead of the dispatcher that
    /// is current when the client is created
    pub fn with_log_dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.log_dispatch = Some(dispatch);
        self
    }

    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn get_client_id(&self) -> &str {
        &self.client_id
    }

    pub fn get_keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn is_clean_session(&self) -> bool {
        self.clean_session
    }

    pub(crate) fn keep_alive_secs(&self) -> u16 {
        self.keep_alive.as_secs().min(u16::MAX as u64) as u16
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if self.brokers.is_empty() {
            return Err(ClientError::InvalidOptions(
                "at least one broker is required".to_string(),
            ));
        }
        if self.message_channel_depth == 0 {
            return Err(ClientError::InvalidOptions(
                "message_channel_depth must be positive".to_string(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ClientError::InvalidOptions(
                "a password requires a username".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// File configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// `[mqtt]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URLs, tried in order
    pub brokers: Vec<String>,
    #[serde(default)]
    pub client_id: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_reconnect_interval_secs")]
    pub max_reconnect_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 3 or 4; setting it pins the version and disables fallback
    pub protocol_version: Option<u8>,
    #[serde(default = "default_message_channel_depth")]
    pub message_channel_depth: usize,
    pub will: Option<WillSection>,
    pub tls: Option<TlsOptions>,
}

/// `[mqtt.will]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// `[store]` section; without a directory the in-memory store is used
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    pub directory: Option<PathBuf>,
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default)]
    pub include_spans: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_spans: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_secs() -> u64 {
    DEFAULT_KEEP_ALIVE.as_secs()
}

fn default_max_reconnect_interval_secs() -> u64 {
    DEFAULT_MAX_RECONNECT_INTERVAL.as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT.as_secs()
}

fn default_message_channel_depth() -> usize {
    DEFAULT_MESSAGE_CHANNEL_DEPTH
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.brokers.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.brokers must list at least one broker".to_string(),
            ));
        }
        if let Some(level) = self.mqtt.protocol_version {
            if ProtocolVersion::from_level(level).is_none() {
                return Err(ConfigError::InvalidConfig(format!(
                    "mqtt.protocol_version must be 3 or 4, got {level}"
                )));
            }
        }
        if let Some(will) = &self.mqtt.will {
            qos_from_u8(will.qos).map_err(|e| {
                ConfigError::InvalidConfig(format!("mqtt.will.qos: {e}"))
            })?;
        }
        if self.mqtt.message_channel_depth == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.message_channel_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get MQTT username from its environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        get_env_var_optional(self.mqtt.username_env.as_deref())
    }

    /// Get MQTT password from its environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        get_env_var_optional(self.mqtt.password_env.as_deref())
    }

    /// Build runtime options; credentials are resolved from the environment now
    pub fn into_options(self) -> Result<ClientOptions, ConfigError> {
        self.validate()?;
        let username = match &self.mqtt.username_env {
            Some(name) => Some(
                std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))?,
            ),
            None => None,
        };
        let password = self.get_mqtt_password();

        let mut options = ClientOptions::new()
            .client_id(self.mqtt.client_id)
            .keep_alive(Duration::from_secs(self.mqtt.keep_alive_secs))
            .clean_session(self.mqtt.clean_session)
            .auto_reconnect(self.mqtt.auto_reconnect)
            .max_reconnect_interval(Duration::from_secs(self.mqtt.max_reconnect_interval_secs))
            .connect_timeout(Duration::from_secs(self.mqtt.connect_timeout_secs))
            .message_channel_depth(self.mqtt.message_channel_depth);

        for broker in self.mqtt.brokers {
            options = options.add_broker(broker);
        }
        if let Some(username) = username {
            options = options.credentials(username, password.unwrap_or_default());
        }
        if let Some(version) = self.mqtt.protocol_version.and_then(ProtocolVersion::from_level) {
            options = options.protocol_version(version);
        }
        if let Some(will) = self.mqtt.will {
            let qos = qos_from_u8(will.qos)
                .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.will.qos: {e}")))?;
            options = options.will(LastWill::new(will.topic, will.payload, qos, will.retain));
        }
        if let Some(tls) = self.mqtt.tls {
            options = options.tls(tls);
        }
        let store: Arc<dyn Store> = match self.store.directory {
            Some(directory) => Arc::new(FileStore::new(directory)),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(options.store(store))
    }
}

fn get_env_var_optional(env_var_name: Option<&str>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
brokers = ["tcp://primary:1883", "ssl://backup:8883"]
client_id = "sensor-7"
keep_alive_secs = 15
clean_session = false
protocol_version = 3

[mqtt.will]
topic = "sensors/sensor-7/status"
payload = "offline"
qos = 1
retain = true

[mqtt.tls]
ca_file = "/etc/ssl/broker-ca.pem"

[store]
directory = "/var/lib/mqttlink"

[logging]
level = "debug"
format = "json"
"#;

        let config = ClientConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.mqtt.brokers.len(), 2);
        assert_eq!(config.mqtt.protocol_version, Some(3));
        assert_eq!(config.logging.format, "json");

        let options = config.into_options().unwrap();
        assert_eq!(options.brokers()[1], "ssl://backup:8883");
        assert_eq!(options.get_client_id(), "sensor-7");
        assert_eq!(options.keep_alive_secs(), 15);
        assert!(!options.is_clean_session());
        assert!(options.protocol_pinned);
        assert_eq!(options.protocol_version, ProtocolVersion::V31);
        let will = options.will.as_ref().unwrap();
        assert_eq!(will.payload.as_ref(), b"offline");
        assert!(will.retain);
        assert!(options.tls.is_some());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[mqtt]
brokers = ["tcp://localhost:1883"]
"#;

        let config = ClientConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert!(config.mqtt.clean_session);
        assert!(config.mqtt.auto_reconnect);
        assert_eq!(config.store, StoreSection::default());
        assert_eq!(config.logging.level, "info");

        let options = config.into_options().unwrap();
        assert!(!options.protocol_pinned);
        assert_eq!(options.protocol_version, ProtocolVersion::V311);
    }

    #[test]
    fn test_invalid_protocol_version() {
        let toml_content = r#"
[mqtt]
brokers = ["tcp://localhost:1883"]
protocol_version = 5
"#;
        let result = ClientConfig::from_toml(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_will_qos() {
        let toml_content = r#"
[mqtt]
brokers = ["tcp://localhost:1883"]

[mqtt.will]
topic = "t"
qos = 3
"#;
        let result = ClientConfig::from_toml(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_broker_list_rejected() {
        let result = ClientConfig::from_toml("[mqtt]\nbrokers = []\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_username_env_var() {
        let toml_content = r#"
[mqtt]
brokers = ["tcp://localhost:1883"]
username_env = "MQTTLINK_TEST_USERNAME_THAT_IS_NEVER_SET"
"#;
        let config = ClientConfig::from_toml(toml_content).unwrap();
        assert!(matches!(
            config.into_options(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_options_validation() {
        assert!(ClientOptions::new().validate().is_err());
        assert!(ClientOptions::new()
            .add_broker("tcp://localhost:1883")
            .validate()
            .is_ok());
        assert!(ClientOptions::new()
            .add_broker("tcp://localhost:1883")
            .message_channel_depth(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let options = ClientOptions::new().credentials("user", "hunter2");
        let rendered = format!("{options:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
