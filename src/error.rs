/// Errors with a meaning of their own inside the bus.
///
/// Application flow still uses `anyhow`; these variants exist where callers
/// need to tell failure kinds apart (a bad credential only skips its own
/// account, a missing dispatch entry only drops its own event).
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("invalid {protocol} credential: {reason}")]
    Config {
        protocol: &'static str,
        reason: String,
    },

    #[error("{protocol} transport error: {source}")]
    Transport {
        protocol: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("token request failed: {0}")]
    Token(String),

    #[error("no outbound sender registered for adapter '{0}'")]
    DispatchNotFound(String),

    #[error("adapter '{0}' is already registered")]
    DuplicateAdapter(String),

    #[error("trigger '{0}' is already registered")]
    DuplicateTrigger(String),

    #[error("{operation} is not allowed in phase {phase:?}")]
    Phase {
        operation: &'static str,
        phase: crate::router::Phase,
    },
}

impl BusError {
    pub fn transport(
        protocol: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        BusError::Transport {
            protocol,
            source: source.into(),
        }
    }
}
