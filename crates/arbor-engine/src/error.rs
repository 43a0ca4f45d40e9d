use arbor_core::errors::GatewayError;
use arbor_settings::SettingsError;
use arbor_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid config: {0}")]
    InvalidConfig(#[from] SettingsError),

    #[error("document is empty: {0}")]
    EmptyDocument(String),

    #[error("offset out of range: {0}")]
    OffsetOutOfRange(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Whether rerunning the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Gateway(e) => e.is_retryable() || matches!(e, GatewayError::Timeout(_)),
            Self::Store(e) => e.is_retryable(),
            Self::Source(_) => true,
            Self::InvalidConfig(_)
            | Self::EmptyDocument(_)
            | Self::OffsetOutOfRange(_)
            | Self::NotFound(_)
            | Self::Internal(_) => false,
        }
    }

    /// Structural violations indicate a caller or configuration bug.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::EmptyDocument(_) | Self::OffsetOutOfRange(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}
