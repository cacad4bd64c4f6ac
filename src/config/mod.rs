//! The `config` module loads the bus settings.
//!
//! Sources, later ones winning: built-in defaults, an optional
//! `config/default.{toml,json,yaml}` file, then `SERVICEBUS__*` environment
//! variables (for example `SERVICEBUS__BROKER__BUFFER_THRESHOLD=100`).

mod settings;

use std::time::Duration;

use config::{Config, Environment, File};

use crate::broker::dispatcher::{DispatcherConfig, normalize_threshold};
use crate::utils::error::BusError;
use settings::PartialSettings;

pub use settings::{BrokerSettings, LoggingSettings, Settings};

pub fn load_config() -> Result<Settings, BusError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("SERVICEBUS")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let broker = partial.broker.as_ref();
    Ok(Settings {
        broker: BrokerSettings {
            processing_mode: broker
                .and_then(|b| b.processing_mode)
                .unwrap_or(default.broker.processing_mode),
            buffer_threshold: normalize_threshold(
                broker
                    .and_then(|b| b.buffer_threshold)
                    .unwrap_or(default.broker.buffer_threshold),
            ),
            workers: broker
                .and_then(|b| b.workers)
                .unwrap_or(default.broker.workers)
                .max(1),
            batch_size: broker
                .and_then(|b| b.batch_size)
                .unwrap_or(default.broker.batch_size)
                .max(1),
            idle_interval_ms: broker
                .and_then(|b| b.idle_interval_ms)
                .unwrap_or(default.broker.idle_interval_ms),
        },
        logging: LoggingSettings {
            level: partial
                .logging
                .and_then(|l| l.level)
                .unwrap_or(default.logging.level),
        },
    })
}

impl From<&BrokerSettings> for DispatcherConfig {
    fn from(settings: &BrokerSettings) -> Self {
        DispatcherConfig::default()
            .with_processing_mode(settings.processing_mode)
            .with_buffer_threshold(settings.buffer_threshold)
            .with_workers(settings.workers)
            .with_batch_size(settings.batch_size)
            .with_idle_interval(Duration::from_millis(settings.idle_interval_ms))
    }
}

#[cfg(test)]
mod tests;
