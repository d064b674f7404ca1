//! Error types for the Bridgeswap Client SDK.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Bridgeswap Client SDK.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure or 5xx from the LP or an RPC endpoint.
    ///
    /// Retried by [`crate::utils::retry_with_backoff`] up to the policy limit.
    #[error("Request error: {0}")]
    Request(String),

    /// Semantic rejection of data returned by the intermediary (bad total,
    /// bad price, bad signature, bad claim hash). Never retried.
    #[error("Intermediary error: {0}")]
    Intermediary(String),

    /// Bad caller input (malformed LNURL, wrong parameters).
    #[error("User error: {0}")]
    User(String),

    /// Operation invoked while the swap is in a state that does not allow it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// PSBT funding failed because the wallet lacks funds.
    #[error("Not enough balance: {0}")]
    NotEnoughBalance(String),

    /// Quote or HTLC expired during the operation.
    #[error("Expired: {0}")]
    Expired(String),

    /// Cooperative cancellation; carries the cancel reason verbatim.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The on-chain contract reported the swap closed; unrecoverable.
    #[error("Catastrophic failure: {0}")]
    CatastrophicFailure(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Parse error.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Bitcoin-related error.
    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the default LP retry policy may retry after this error.
    ///
    /// Intermediary rejections are final; everything transport-shaped is
    /// worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Intermediary(_)
                | Error::User(_)
                | Error::InvalidState(_)
                | Error::Cancelled(_)
                | Error::Expired(_)
                | Error::CatastrophicFailure(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", err))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Request(err.to_string())
    }
}
