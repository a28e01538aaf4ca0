/// Domain-specific error types for the control plane.
/// Collaborator failures surface as `EngineError`. The loop must:
/// - Continue running on recoverable errors
/// - Never let a gate or detector failure escape its own boundary
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("broker API error: {status} {body}")]
    BrokerApi { status: u16, body: String },

    #[error("market data error: {0}")]
    MarketData(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),
}

impl EngineError {
    /// Connectivity failures route to the network-failure handler.
    pub fn is_network(&self) -> bool {
        matches!(self, EngineError::Network(_) | EngineError::Timeout(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout(e.to_string())
        } else {
            EngineError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Parse(e.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Network(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure inside a single risk gate. The pipeline converts it into a
/// synthetic result according to the gate's `ErrorPolicy`.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("data source failure: {0}")]
    DataSource(String),

    #[error("computation failed: {0}")]
    Computation(String),
}

impl From<EngineError> for GateError {
    fn from(e: EngineError) -> Self {
        GateError::DataSource(e.to_string())
    }
}
