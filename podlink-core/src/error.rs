use thiserror::Error;

pub type Result<T, E = CoreError> = core::result::Result<T, E>;

/// Error taxonomy shared by every tunnel-core crate.
///
/// Each variant corresponds to one of the kinds named in the error
/// handling design: per-packet errors never surface as `CoreError`
/// (they are counted and dropped at the call site); everything that
/// does reach this type is either a per-connection or per-listener
/// fault.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("resolve: {0}")]
    Resolve(String),
    #[error("unreachable: {0}")]
    Unreachable(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("closed")]
    Closed,
    #[error("framing: {0}")]
    Framing(String),
    #[error("chain exhausted after {attempts} attempt(s)")]
    ChainExhausted { attempts: u32 },
    #[error("resource: {0}")]
    Resource(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn resolve(msg: impl Into<String>) -> Self {
        Self::Resolve(msg.into())
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::Unreachable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::Resource(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether this error should be treated as `Closed` by an RPC-layer
    /// collaborator rather than surfaced as a typed failure (per the
    /// propagation policy in the error handling design).
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        CoreError::Config(e.to_string())
    }
}
