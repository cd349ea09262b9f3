// Engine error taxonomy
// Every invariant violation surfaces with a specific kind, never a generic failure.

use crate::provider::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Login failed, or a session token is unknown, expired, or revoked.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Same fingerprint already accepted for this kind in the current cycle.
    #[error("duplicate evidence: {0}")]
    DuplicateEvidence(String),

    /// Ledger window is shorter than the configured minimum. Internal signal:
    /// `advance` keeps the SME pending instead of surfacing this to callers.
    #[error("insufficient transaction history: {months} of {required} months")]
    InsufficientData { months: u32, required: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    /// Role or ownership mismatch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Retryable provider failure. Surfaced only once the retry budget is spent.
    #[error("provider temporarily unavailable: {0}")]
    TransientProviderFailure(String),

    /// Permanent provider rejection (e.g. revoked bank link). Maps to a
    /// rejected linked-account evidence item, never retried.
    #[error("provider rejected the link: {0}")]
    TerminalProviderFailure(String),

    /// Unknown or malformed marketplace filter key/value.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Malformed or incomplete request payload.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Stable machine-readable code, used in API responses and log fields.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidCredentials => "INVALID_CREDENTIALS",
            EngineError::DuplicateEvidence(_) => "DUPLICATE_EVIDENCE",
            EngineError::InsufficientData { .. } => "INSUFFICIENT_DATA",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Unauthorized(_) => "UNAUTHORIZED",
            EngineError::TransientProviderFailure(_) => "PROVIDER_TRANSIENT",
            EngineError::TerminalProviderFailure(_) => "PROVIDER_TERMINAL",
            EngineError::InvalidFilter(_) => "INVALID_FILTER",
            EngineError::Validation(_) => "INVALID_REQUEST",
            EngineError::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Transient(msg) => EngineError::TransientProviderFailure(msg),
            ProviderError::Terminal(msg) => EngineError::TerminalProviderFailure(msg),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
