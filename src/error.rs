use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing required environment variable {0}")]
    Config(&'static str),
    #[error("invalid value for environment variable {0}")]
    ConfigValue(&'static str),
    #[error("failed to obtain signed url: {0}")]
    SignedUrl(String),
    #[error("failed to connect to voice agent: {0}")]
    BridgeConnect(String),
    #[error("store operation failed: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("media stream error: {0}")]
    MediaStream(&'static str),
}

/// Origination failures are subtyped because the coordinator's retry policy
/// depends on which one it got.
#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("destination not permitted by provider")]
    NumberNotAllowed,
    #[error("provider unreachable: {0}")]
    TransientConnection(String),
    #[error("provider api error: {0}")]
    Api(String),
}

pub async fn handle_error(e: impl std::error::Error) {
    // TODO: We may want to do more than just print the message...
    error!("ERROR: {e}")
}
