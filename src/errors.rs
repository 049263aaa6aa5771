use thiserror::Error;

/// Per-exchange fetch failure. Cloneable so an outcome can live inside a
/// shared snapshot instead of aborting the whole combined fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("exchange unreachable: {0}")]
    Unreachable(String),

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("symbol not listed on exchange")]
    SymbolNotFound,
}

impl FetchError {
    /// Stable marker used by the API layer when serializing error outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Unreachable(_) => "unreachable",
            FetchError::RateLimited => "rate_limited",
            FetchError::MalformedResponse(_) => "malformed_response",
            FetchError::SymbolNotFound => "symbol_not_found",
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("history persistence unavailable: {0}")]
    Unavailable(String),

    #[error("history write failed: {0}")]
    WriteFailed(String),

    #[error("corrupt history data: {0}")]
    CorruptData(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid symbol {0:?}: only uppercase Latin letters, digits and hyphen")]
    InvalidSymbolChars(String),
}
