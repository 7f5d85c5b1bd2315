use thiserror::Error;

use crate::gateway::config::ConfigError;
use crate::gateway::store::StoreError;
use crate::gateway::upstream::UpstreamFailure;

/// Startup and wiring failures. Request-path errors are
/// [`crate::gateway::GatewayError`].
#[derive(Debug, Error)]
pub enum TollgateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("counter store: {0}")]
    Store(#[from] StoreError),
    #[error("upstream client: {0}")]
    Upstream(#[from] UpstreamFailure),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("logging: {0}")]
    Logging(String),
    #[error("unsupported option: {0}")]
    Unsupported(String),
}

impl From<tracing_subscriber::util::TryInitError> for TollgateError {
    fn from(err: tracing_subscriber::util::TryInitError) -> Self {
        Self::Logging(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TollgateError>;
