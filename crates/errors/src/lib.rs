//! Stable error taxonomy shared by every core component.
//!
//! Every [`GatewayError`] carries a stable numeric code in the ranges laid
//! out by the external error envelope: Internal (1xxx), Input (2xxx),
//! Resource (3xxx), Conflict (4xxx), NotImplemented (5xxx), NotFound (6xxx),
//! Auth (7xxx). The code and [`Category`] are what the HTTP layer maps onto
//! a status and a JSON `{errorCode, description}` body; everything else in
//! the core only ever sees the enum.

use thiserror::Error;

/// Error category, used by the HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Internal,
    Input,
    Resource,
    Conflict,
    NotFound,
    NotImplemented,
    Auth,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("unexpected rpc failure: {0}")]
    UnexpectedRpcFailure(String),
    #[error("gas estimate failed: {0}")]
    GasEstimateFailed(String),
    #[error("receipt fetch failed: {0}")]
    ReceiptFetchFailed(String),
    #[error("retries exhausted after {attempts} attempts: {last_cause}")]
    RetriesExhausted { attempts: u32, last_cause: String },

    #[error("missing request body")]
    MissingBody,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("unsupported content type")]
    BadContentType,
    #[error("failed to parse json: {0}")]
    JsonParseError(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("empty input")]
    EmptyInput,
    #[error("unknown subscription type: {0}")]
    UnknownSubscriptionType(String),
    #[error("failed to parse query: {0}")]
    QueryParseError(String),
    #[error("unsupported topic: {0}")]
    UnsupportedTopic(String),

    #[error("mailbox queue limit reached")]
    MailboxQueueLimitReached,

    #[error("cannot discard: queue does not exist")]
    DiscardNonExistentQueue,
    #[error("duplicate subscription id")]
    DuplicateSubscriptionId,

    #[error("not implemented")]
    NotImplemented,

    #[error("queue not found")]
    QueueNotFound,
    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("AAD verification failed")]
    FailedAadVerification,

    #[error("operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Stable integer code surfaced in the error envelope.
    pub fn code(&self) -> i64 {
        match self {
            Self::TransactionFailed(_) => 1000,
            Self::UnexpectedRpcFailure(_) => 1001,
            Self::GasEstimateFailed(_) => 1002,
            Self::ReceiptFetchFailed(_) => 1003,
            Self::RetriesExhausted { .. } => 1004,

            Self::MissingBody => 2000,
            Self::BodyTooLarge => 2001,
            Self::BadContentType => 2002,
            Self::JsonParseError(_) => 2003,
            Self::InvalidAddress(_) => 2004,
            Self::InvalidHex(_) => 2005,
            Self::EmptyInput => 2006,
            Self::UnknownSubscriptionType(_) => 2007,
            Self::QueryParseError(_) => 2008,
            Self::UnsupportedTopic(_) => 2009,

            Self::MailboxQueueLimitReached => 3000,

            Self::DiscardNonExistentQueue => 4000,
            Self::DuplicateSubscriptionId => 4001,

            Self::NotImplemented => 5000,

            Self::QueueNotFound => 6001,
            Self::SubscriptionNotFound => 6002,

            Self::AuthenticationFailed(_) => 7001,
            Self::FailedAadVerification => 7002,

            // Cancellation is not surfaced over the wire; callers translate
            // it before it ever reaches the HTTP layer. Keep a code anyway
            // so logging and metrics have something stable to key on.
            Self::Cancelled => 9000,
        }
    }

    pub fn category(&self) -> Category {
        match self {
            Self::TransactionFailed(_)
            | Self::UnexpectedRpcFailure(_)
            | Self::GasEstimateFailed(_)
            | Self::ReceiptFetchFailed(_)
            | Self::RetriesExhausted { .. } => Category::Internal,

            Self::MissingBody
            | Self::BodyTooLarge
            | Self::BadContentType
            | Self::JsonParseError(_)
            | Self::InvalidAddress(_)
            | Self::InvalidHex(_)
            | Self::EmptyInput
            | Self::UnknownSubscriptionType(_)
            | Self::QueryParseError(_)
            | Self::UnsupportedTopic(_) => Category::Input,

            Self::MailboxQueueLimitReached => Category::Resource,

            Self::DiscardNonExistentQueue | Self::DuplicateSubscriptionId => Category::Conflict,

            Self::NotImplemented => Category::NotImplemented,

            Self::QueueNotFound | Self::SubscriptionNotFound => Category::NotFound,

            Self::AuthenticationFailed(_) | Self::FailedAadVerification => Category::Auth,

            Self::Cancelled => Category::Internal,
        }
    }

    /// Builds the error recorded for a caught panic in a user handler.
    pub fn from_panic(payload: &str) -> Self {
        Self::UnexpectedRpcFailure(format!("handler panicked: {payload}"))
    }
}
