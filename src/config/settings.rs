use serde::Deserialize;

use crate::broker::dispatcher::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_THRESHOLD, DEFAULT_IDLE_INTERVAL_MS, DEFAULT_WORKERS,
    ProcessingMode,
};

/// Top-level configuration settings for the application.
///
/// Includes settings for both the message broker and logging.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Configuration settings for the broker.
///
/// Controls how messages are distributed and how many undelivered messages
/// are kept.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub processing_mode: ProcessingMode,
    /// `-1` disables eviction of pending messages.
    pub buffer_threshold: i64,
    pub workers: usize,
    pub batch_size: usize,
    pub idle_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings as read from the sources; anything missing falls back to the defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub processing_mode: Option<ProcessingMode>,
    pub buffer_threshold: Option<i64>,
    pub workers: Option<usize>,
    pub batch_size: Option<usize>,
    pub idle_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            processing_mode: ProcessingMode::Sequential,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
        }
    }
}
