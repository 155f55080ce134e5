use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files. If None, no file logging.
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// Log rotation: "hourly", "daily", "never".
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,

    /// Whether to also output to console (stdout).
    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "ferrofs-mds".into()
}

fn default_rotation() -> String {
    "daily".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: default_rotation(),
            json_format: false,
            console_output: true,
        }
    }
}

type BoxedLayer = Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync>;

fn console_layer(config: &LogConfig) -> Option<BoxedLayer> {
    if !config.console_output {
        return None;
    }
    if config.json_format {
        Some(Box::new(fmt::layer().json()))
    } else {
        Some(Box::new(fmt::layer()))
    }
}

fn file_layer(config: &LogConfig) -> (Option<BoxedLayer>, Option<WorkerGuard>) {
    let Some(ref log_dir) = config.log_dir else {
        return (None, None);
    };

    let rotation = match config.rotation.as_str() {
        "hourly" => rolling::Rotation::HOURLY,
        "never" => rolling::Rotation::NEVER,
        _ => rolling::Rotation::DAILY,
    };

    let appender = rolling::RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(log_dir)
        .expect("failed to create rolling file appender");

    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    let layer: BoxedLayer = if config.json_format {
        Box::new(fmt::layer().json().with_writer(non_blocking))
    } else {
        Box::new(fmt::layer().with_writer(non_blocking))
    };

    (Some(layer), Some(guard))
}

/// Initialize the logging system. Should be called once at program startup.
/// Returns a guard that must be held alive for the duration of the program
/// (for the non-blocking file writer).
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if let Some(layer) = console_layer(config) {
        layers.push(layer);
    }
    let (file, guard) = file_layer(config);
    if let Some(layer) = file {
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .init();

    guard
}
