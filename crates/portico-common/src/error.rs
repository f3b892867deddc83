use thiserror::Error;

/// All error conditions surfaced by the gateway.
///
/// Dispatch errors (`PageNotFound`, `NoAvailableCluster`, `OpenCircuit`,
/// `Downstream`) are rendered as JSON error bodies; configuration and
/// store errors abort startup or are logged during reloads.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Page not found")]
    PageNotFound,

    #[error("No available cluster")]
    NoAvailableCluster,

    #[error("circuit breaker is open")]
    OpenCircuit,

    #[error("too many requests in half-open state")]
    TooManyProbes,

    #[error("downstream request failed: {0}")]
    Downstream(String),

    #[error("combine request timeout")]
    CombineTimeout,

    #[error("permission denied")]
    NoPermission,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("context pool has been closed")]
    PoolClosed,

    #[error("invalid plugin flag: {0}")]
    PluginFlag(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::Downstream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
