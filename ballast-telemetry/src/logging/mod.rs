//! `tracing` subscriber setup.
//!
//! Each configured output gets its own formatting layer under one
//! `EnvFilter`. Files are written off-thread and always as JSON lines.

mod config;

pub use config::{LogConfig, LogFormat, LogOutput, Rotation};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{
        self, MakeWriter,
        format::{DefaultFields, Format, FmtSpan},
    },
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Installs the global subscriber described by `config`.
///
/// Hold on to the returned guards until shutdown; dropping one stops its
/// file writer and loses whatever it still buffers.
///
/// ```no_run
/// use ballast_telemetry::logging::{init_logging, LogConfig};
///
/// let _guards = init_logging(&LogConfig::default()).expect("logging");
/// ```
pub fn init_logging(config: &LogConfig) -> Result<Vec<WorkerGuard>, LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| LoggingError::InvalidConfig(format!("level '{}': {e}", config.level)))?;

    let mut guards = Vec::new();
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(config.outputs.len());
    for output in &config.outputs {
        let layer = match output {
            LogOutput::Stdout => stdout_layer(config),
            LogOutput::File {
                path,
                file_name,
                rotation,
            } => {
                std::fs::create_dir_all(path)?;
                let appender = match rotation {
                    Rotation::Hourly => tracing_appender::rolling::hourly(path, file_name),
                    Rotation::Daily => tracing_appender::rolling::daily(path, file_name),
                    Rotation::Never => tracing_appender::rolling::never(path, file_name),
                };
                let (writer, guard) = tracing_appender::non_blocking(appender);
                guards.push(guard);
                base_layer(config, writer)
                    .with_ansi(false)
                    .json()
                    .flatten_event(true)
                    .boxed()
            }
        };
        layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized(e.to_string()))?;

    Ok(guards)
}

fn base_layer<W>(config: &LogConfig, writer: W) -> fmt::Layer<Registry, DefaultFields, Format, W>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if config.include_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(config.include_thread_id)
        .with_file(config.include_file_info)
        .with_line_number(config.include_file_info)
        .with_span_events(span_events)
}

fn stdout_layer(config: &LogConfig) -> BoxedLayer {
    let base = base_layer(config, std::io::stdout);
    match config.format {
        LogFormat::Json => base.json().flatten_event(true).boxed(),
        LogFormat::Compact => base.compact().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
    }
}

/// Why the subscriber could not be installed.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// A file output's directory could not be created.
    #[error("cannot create log directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),

    /// The filter directive does not parse.
    #[error("invalid logging configuration: {0}")]
    InvalidConfig(String),

    /// Another subscriber was installed first.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(String),
}
