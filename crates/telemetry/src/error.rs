//! Error types for the telemetry core.

/// Errors raised while configuring the registries or starting the publishers.
///
/// Runtime operations on invalid identifiers never produce these; they return
/// neutral values instead. Delivery failures are retried and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("{kind} registry is full (capacity {capacity})")]
    CapacityExceeded { kind: &'static str, capacity: usize },

    #[error("{kind} named '{name}' already exists")]
    DuplicateName { kind: &'static str, name: String },

    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },

    #[error("{what} '{value}' is too long (limit {limit} bytes)")]
    NameTooLong {
        what: &'static str,
        value: String,
        limit: usize,
    },

    #[error("Invalid format template: {0}")]
    InvalidFormat(String),

    #[error("Scale must be non-zero")]
    InvalidScale,

    #[error("Failed to allocate string buffer of {0} bytes")]
    AllocationFailed(usize),

    #[error("Publication task already running: {0}")]
    AlreadyRunning(&'static str),

    #[error("No tokio runtime available to spawn {0}")]
    NoRuntime(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TelemetryError>;
