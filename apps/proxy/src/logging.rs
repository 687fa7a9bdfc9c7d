// SPDX-FileCopyrightText: © 2025 StreamScribe Contributors
//
// SPDX-License-Identifier: MPL-2.0

use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::{Config, LogFormat};

type DynLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn env_filter_or_level(default_level: tracing::Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.as_str()))
}

/// Initialize logging based on configuration.
///
/// `DEBUG=true` forces debug-level output regardless of `LOG_LEVEL`.
/// A non-empty `LOG_FILE` adds a non-blocking file layer in the
/// configured format.
///
/// # Errors
///
/// Returns an error if the log file's directory cannot be created.
pub fn init_logging(
    config: &Config,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, Box<dyn std::error::Error>> {
    let level: tracing::Level =
        if config.debug { tracing::Level::DEBUG } else { config.log_level.clone().into() };

    let mut guard = None;
    let mut layers: Vec<DynLayer> = Vec::new();

    layers.push(tracing_subscriber::fmt::layer().with_filter(env_filter_or_level(level)).boxed());

    if !config.log_file.is_empty() {
        let log_path = std::path::Path::new(&config.log_file);
        let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let log_filename =
            log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("streamscribe.log"));

        std::fs::create_dir_all(log_dir)
            .map_err(|e| format!("Failed to create log directory {}: {e}", log_dir.display()))?;

        let file_appender = tracing_appender::rolling::never(log_dir, log_filename);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let file_layer: DynLayer = match config.log_format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .json()
                .with_filter(env_filter_or_level(level))
                .boxed(),
            LogFormat::Text => tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter_or_level(level))
                .boxed(),
        };
        layers.push(file_layer);
    }

    tracing_subscriber::registry().with(layers).init();

    Ok(guard)
}
