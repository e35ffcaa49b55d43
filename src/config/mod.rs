mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ConsumerSettings, LogSettings, PartialBrokerSettings,
    PartialConsumerSettings, PartialLogSettings, PartialSettings, Settings,
};

/// Environment variables are read as `POPSUB__<SECTION>__<KEY>`.
pub const ENV_PREFIX: &str = "POPSUB";

/// Loads the configuration from `config/default` and environment variables,
/// merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as [`load_config`] but reads the optional file at `path` (extension
/// picks the format, as with `config::File::with_name`).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("consumer.topics")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
