//! Runtime settings sections.

use serde::{Deserialize, Serialize};

/// Worker pool sizing for callback and timer dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Threads that run event callbacks and session commands.
    /// Default: 2
    #[serde(default = "DispatchConfig::default_worker_threads")]
    pub worker_threads: usize,

    /// Threads that run presentation clock timers.
    /// Default: 1
    #[serde(default = "DispatchConfig::default_timer_threads")]
    pub timer_threads: usize,

    /// Prefix for dispatcher thread names.
    /// Default: mediaweave
    #[serde(default = "DispatchConfig::default_thread_name")]
    pub thread_name: String,
}

impl DispatchConfig {
    fn default_worker_threads() -> usize {
        2
    }

    fn default_timer_threads() -> usize {
        1
    }

    fn default_thread_name() -> String {
        "mediaweave".to_string()
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_threads: Self::default_worker_threads(),
            timer_threads: Self::default_timer_threads(),
            thread_name: Self::default_thread_name(),
        }
    }
}

/// Session playback limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on the playback rate the session will advertise,
    /// regardless of what its sinks support.
    /// Default: 8.0
    #[serde(default = "SessionConfig::default_max_rate")]
    pub max_rate: f32,

    /// Whether negative rates may be requested at all.
    /// Default: false
    #[serde(default)]
    pub allow_reverse: bool,
}

impl SessionConfig {
    fn default_max_rate() -> f32 {
        8.0
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_rate: Self::default_max_rate(),
            allow_reverse: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter directive (trace, debug, info, warn, error, or an EnvFilter string).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}
