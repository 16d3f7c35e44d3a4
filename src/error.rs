// =============================================================================
// Error Taxonomy
// =============================================================================
//
// One typed error enum for the whole engine, matching the five error kinds the
// tick pipeline distinguishes: transient infra failures (logged and
// swallowed), data invariant violations (fatal to the tick, not the process),
// client protocol errors (replied to, session stays live), transport errors
// and heartbeat timeouts (session closed). `main` and other process-boundary
// code use `anyhow::Result` instead; this type is for the engine internals.
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("transient infra error: {0}")]
    Transient(String),

    #[error("data invariant violated: {0}")]
    InvariantViolation(String),

    #[error("client protocol error: {0}")]
    ClientProtocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::ClientProtocol(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transient(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_error_message_includes_source() {
        let err: EngineError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, EngineError::Database(_)));
        assert!(err.to_string().contains("database error"));
    }

    #[test]
    fn invariant_violation_is_distinct_from_transient() {
        let a = EngineError::InvariantViolation("weights do not sum to 1.0".into());
        let b = EngineError::Transient("bus unreachable".into());
        assert_ne!(a.to_string(), b.to_string());
    }
}
