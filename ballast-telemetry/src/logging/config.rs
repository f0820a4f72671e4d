//! Logging configuration types.
//!
//! ```yaml
//! logging:
//!   level: info,ballast_engine=debug
//!   format: compact
//!   outputs:
//!     - type: stdout
//!     - type: file
//!       path: /var/log/ballast
//!       rotation: hourly
//! ```

use serde::{Deserialize, Serialize};

/// Where engine events go and how they look.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info,ballast_risk=debug`. `RUST_LOG`
    /// wins when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Stdout rendering. Files are always JSON.
    #[serde(default)]
    pub format: LogFormat,

    /// Sinks.
    #[serde(default = "default_outputs")]
    pub outputs: Vec<LogOutput>,

    /// Thread ids on every line.
    #[serde(default)]
    pub include_thread_id: bool,

    /// Source file and line on every line.
    #[serde(default)]
    pub include_file_info: bool,

    /// Emit a line when an operation span (allocation, risk evaluation,
    /// breaker transition) closes, with its busy and idle time.
    #[serde(default)]
    pub include_span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            outputs: default_outputs(),
            include_thread_id: false,
            include_file_info: false,
            include_span_events: false,
        }
    }
}

impl LogConfig {
    /// Replaces the filter directive.
    #[must_use]
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// True if any output writes to disk.
    #[must_use]
    pub fn writes_files(&self) -> bool {
        self.outputs
            .iter()
            .any(|o| matches!(o, LogOutput::File { .. }))
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_outputs() -> Vec<LogOutput> {
    vec![LogOutput::Stdout]
}

fn default_file_name() -> String {
    "ballast.log".to_string()
}

/// Stdout rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Single-line text, for terminals
    Compact,
    /// Multi-line text with span context
    Pretty,
}

/// A log sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogOutput {
    /// Standard output
    Stdout,
    /// Rolling JSON files in a directory
    File {
        /// Directory, created if missing
        path: String,
        /// File name prefix
        #[serde(default = "default_file_name")]
        file_name: String,
        /// Rollover period
        #[serde(default)]
        rotation: Rotation,
    },
}

/// File rollover period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    /// New file every hour
    Hourly,
    /// New file every day
    #[default]
    Daily,
    /// A single file
    Never,
}
