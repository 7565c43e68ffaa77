//! Logging
//!
//! tracing によるログ初期化（コンソール・ローテーションファイル・JSON）

use anyhow::{Context, Result};
use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig, RotationStrategy};

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// EnvFilterを作成（`RUST_LOG` が設定されていればそちらを優先）
pub fn build_env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn format_layer<W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.with_line_number(true).boxed(),
    }
}

/// ログシステムを初期化
///
/// The returned guard flushes the file appender on drop; keep it alive for
/// the lifetime of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if config.console {
        layers.push(format_layer(config.format, std::io::stderr, true));
    }

    if let Some(dir) = &config.directory {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let file_appender = match config.rotation {
            RotationStrategy::Daily => rolling::daily(dir, &config.file_prefix),
            RotationStrategy::Hourly => rolling::hourly(dir, &config.file_prefix),
            RotationStrategy::Never => rolling::never(dir, &config.file_prefix),
        };
        let (writer, file_guard) = non_blocking(file_appender);
        layers.push(format_layer(config.format, writer, false));
        guard = Some(file_guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(build_env_filter(&config.level))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!(
        "Logging initialised (level: {}, console: {}, directory: {:?})",
        config.level,
        config.console,
        config.directory
    );

    Ok(guard)
}
