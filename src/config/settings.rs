use std::time::Duration;

use serde::Deserialize;

use crate::broker::options::QueueOptions;
use crate::connector::ClientOptions;

/// Top-level configuration settings for the application.
///
/// Includes settings for the server, the broker, the default options of
/// queues created without explicit options, and the client connector.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub queue: QueueOptions,
    pub client: ClientSettings,
}

/// Configuration settings for the server.
///
/// Defines the address the server binds to and where persistent queues
/// are stored.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
}

impl ServerSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration settings for the broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    /// Period of the redelivery sweeper.
    pub sweep_interval_ms: u64,
    /// Queues are stored under `server.data_dir` and restored on start.
    pub persistent: bool,
}

impl BrokerSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Configuration settings for the client connector.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    pub url: String,
    pub name: Option<String>,
    pub acknowledge_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub auto_acknowledge: bool,
}

impl ClientSettings {
    pub fn to_options(&self) -> ClientOptions {
        ClientOptions {
            name: self.name.clone(),
            acknowledge_timeout: Duration::from_millis(self.acknowledge_timeout_ms),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            auto_acknowledge: self.auto_acknowledge,
            ..ClientOptions::default()
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Every field is optional; missing values are filled from the defaults.
/// `QueueOptions` fills its own missing fields, so the queue section needs no partial type.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub queue: Option<QueueOptions>,
    pub client: Option<PartialClientSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub sweep_interval_ms: Option<u64>,
    pub persistent: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialClientSettings {
    pub url: Option<String>,
    pub name: Option<String>,
    pub acknowledge_timeout_ms: Option<u64>,
    pub response_timeout_ms: Option<u64>,
    pub auto_acknowledge: Option<bool>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                data_dir: "data".to_string(),
            },
            broker: BrokerSettings {
                sweep_interval_ms: 1000,
                persistent: false,
            },
            queue: QueueOptions::default(),
            client: ClientSettings {
                url: "ws://127.0.0.1:8080".to_string(),
                name: None,
                acknowledge_timeout_ms: 15_000,
                response_timeout_ms: 15_000,
                auto_acknowledge: false,
            },
        }
    }
}
