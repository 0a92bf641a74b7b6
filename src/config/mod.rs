mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, ClientSettings, ServerSettings, Settings};

/// Prefix of the environment variables read by `load_config`, e.g.
/// `RELAYMQ_SERVER__PORT` or `RELAYMQ_QUEUE__ACKNOWLEDGE_TIMEOUT_MS`.
pub const ENV_PREFIX: &str = "RELAYMQ";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing every configuration section
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config` with an explicit file (extension optional, the
/// file itself optional).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    // keys contain underscores, so sections are separated by a double one
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial))
}

fn merge(partial: PartialSettings) -> Settings {
    let default = Settings::default();
    let server = partial.server.as_ref();
    let broker = partial.broker.as_ref();
    let client = partial.client.as_ref();

    Settings {
        server: ServerSettings {
            host: server
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: server.and_then(|s| s.port).unwrap_or(default.server.port),
            data_dir: server
                .and_then(|s| s.data_dir.clone())
                .unwrap_or(default.server.data_dir),
        },
        broker: BrokerSettings {
            sweep_interval_ms: broker
                .and_then(|b| b.sweep_interval_ms)
                .unwrap_or(default.broker.sweep_interval_ms),
            persistent: broker
                .and_then(|b| b.persistent)
                .unwrap_or(default.broker.persistent),
        },
        queue: partial.queue.unwrap_or(default.queue),
        client: ClientSettings {
            url: client
                .and_then(|c| c.url.clone())
                .unwrap_or(default.client.url),
            name: client.and_then(|c| c.name.clone()).or(default.client.name),
            acknowledge_timeout_ms: client
                .and_then(|c| c.acknowledge_timeout_ms)
                .unwrap_or(default.client.acknowledge_timeout_ms),
            response_timeout_ms: client
                .and_then(|c| c.response_timeout_ms)
                .unwrap_or(default.client.response_timeout_ms),
            auto_acknowledge: client
                .and_then(|c| c.auto_acknowledge)
                .unwrap_or(default.client.auto_acknowledge),
        },
    }
}
