use thiserror::Error;

/// Errors raised by the recording pipeline.
///
/// Variants follow the failure classes of a recording session: configuration
/// problems are fatal before anything starts, device and encoder failures are
/// fatal for one camera only, metadata failures are logged by the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to load configuration: {0}")]
    ConfigSource(#[from] config::ConfigError),

    #[error("camera make '{0}' is not supported (known makes: {1})")]
    UnknownMake(String, String),

    #[error("device error during {operation}: {message}")]
    Device {
        operation: &'static str,
        message: String,
    },

    #[error("grab failed: {0}")]
    Grab(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn device(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Device {
            operation,
            message: err.to_string(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
