//! Plugin runtime error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("unknown job '{job}' for plugin {plugin}")]
    UnknownJob { plugin: String, job: String },

    #[error("invalid time unit: {0}")]
    InvalidTimeUnit(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("{function} of plugin {plugin} timed out after {timeout_ms} ms")]
    Timeout {
        plugin: String,
        function: String,
        timeout_ms: u64,
    },

    #[error("{function} of plugin {plugin} panicked")]
    Panicked { plugin: String, function: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("job store error: {0}")]
    JobStore(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PluginError {
    /// Shorthand for plugin code reporting a failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }

    /// Faults of the runtime itself rather than of plugin code.
    ///
    /// These are the only errors allowed to stop a worker loop.
    pub fn is_runtime_fault(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Cache(_) | Self::JobStore(_) | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_invalid_descriptor() {
        let err = PluginError::InvalidDescriptor("missing name".into());
        assert_eq!(err.to_string(), "invalid descriptor: missing name");
    }

    #[test]
    fn test_display_unknown_job() {
        let err = PluginError::UnknownJob {
            plugin: "geoip".into(),
            job: "refresh".into(),
        };
        assert_eq!(err.to_string(), "unknown job 'refresh' for plugin geoip");
    }

    #[test]
    fn test_display_timeout() {
        let err = PluginError::Timeout {
            plugin: "geoip".into(),
            function: "processEvent".into(),
            timeout_ms: 1500,
        };
        assert_eq!(
            err.to_string(),
            "processEvent of plugin geoip timed out after 1500 ms"
        );
    }

    #[test]
    fn test_display_panicked() {
        let err = PluginError::Panicked {
            plugin: "geoip".into(),
            function: "onEvent".into(),
        };
        assert_eq!(err.to_string(), "onEvent of plugin geoip panicked");
    }

    #[test]
    fn test_display_fuel_exhausted() {
        let err = PluginError::FuelExhausted("my-plugin".into());
        assert_eq!(
            err.to_string(),
            "execution timeout: plugin my-plugin exceeded fuel limit"
        );
    }

    #[test]
    fn test_handler_shorthand() {
        let err = PluginError::handler("network unreachable");
        assert!(matches!(err, PluginError::Handler(_)));
        assert_eq!(err.to_string(), "handler error: network unreachable");
    }

    // ── Fault classification ──────────────────────────────────────────

    #[test]
    fn test_runtime_faults() {
        assert!(PluginError::Cache("down".into()).is_runtime_fault());
        assert!(PluginError::JobStore("down".into()).is_runtime_fault());
        assert!(PluginError::Database(sea_orm::DbErr::Custom("x".into())).is_runtime_fault());
    }

    #[test]
    fn test_plugin_faults_are_not_runtime_faults() {
        assert!(!PluginError::handler("boom").is_runtime_fault());
        assert!(!PluginError::Panicked {
            plugin: "p".into(),
            function: "f".into()
        }
        .is_runtime_fault());
        assert!(!PluginError::InvalidConfig("bad".into()).is_runtime_fault());
    }

    // ── From conversions ──────────────────────────────────────────────

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: PluginError = io_err.into();
        assert!(matches!(err, PluginError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("bad json{{{").unwrap_err();
        let err: PluginError = json_err.into();
        assert!(matches!(err, PluginError::Serialization(_)));
    }

    #[test]
    fn test_error_source_chain() {
        use std::error::Error;
        let err: PluginError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(err.source().is_some());
        assert!(PluginError::Sandbox("trap".into()).source().is_none());
    }
}
