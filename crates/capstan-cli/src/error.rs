//! Error types for the CLI

use capstan_common::telemetry::TelemetryError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure reported by the lifecycle library
    #[error(transparent)]
    Capstan(#[from] capstan_common::Error),

    /// The tracing subscriber could not be installed
    #[error("logging setup failed: {0}")]
    Telemetry(#[from] TelemetryError),
}
