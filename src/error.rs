//! Error taxonomy for a watch run.
//!
//! Only [`ConfigError`] and [`StoreError::Unavailable`] end a run. Adapter and
//! notifier errors are recovered, collected and reported in the run summary.

use thiserror::Error;

/// Invalid or incomplete configuration. Fatal, raised before any adapter call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no products configured")]
    NoProducts,
    #[error("product #{index} has an empty name")]
    EmptyProductName { index: usize },
    #[error("product {product:?} has a negative max_price_pln")]
    NegativeThreshold { product: String },
    #[error("product {product:?} has an invalid pattern: {reason}")]
    InvalidPattern { product: String, reason: String },
    #[error("product {product:?} references unknown store {store:?}")]
    UnknownStore { product: String, store: String },
    #[error("product {product:?} has no stores")]
    NoStores { product: String },
    #[error("store id must not be empty")]
    EmptyStoreId,
    #[error("store {0:?} is defined more than once")]
    DuplicateStore(String),
    #[error("store {store:?} has an invalid setting: {reason}")]
    InvalidStore { store: String, reason: String },
    #[error("missing secret {0} (set it in the environment)")]
    MissingSecret(&'static str),
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
}

/// Failure of a single adapter call. Recovered: the (product, store) pair is skipped.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("search term must not be empty")]
    InvalidTerm,
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),
    #[error("rate limited by {host}")]
    RateLimited { host: String },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("request budget of {limit} requests exhausted for this run")]
    BudgetExhausted { limit: u32 },
    #[error("search timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl AdapterError {
    /// Transient failures worth another attempt after a backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Self::UnexpectedStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// Request URLs carry API keys and bot tokens; strip them before wrapping.
impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.without_url())
    }
}

/// Offer store failure.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database itself cannot be reached or written. Fatal for a run.
    #[error("offer store unavailable: {context}: {source}")]
    Unavailable {
        context: String,
        #[source]
        source: sqlx::Error,
    },
    /// A single row could not be decoded. Logged and skipped.
    #[error("malformed offer record {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl StoreError {
    pub(crate) fn unavailable(context: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let context = context.into();
        move |source| Self::Unavailable { context, source }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Failure of one notification channel. Recovered: other channels still run.
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    #[error("authentication rejected (status {status})")]
    Auth { status: u16 },
    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("send timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.without_url())
    }
}

impl NotifyError {
    /// Map a non-success HTTP response into the matching variant.
    pub(crate) fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth { status },
            _ => Self::Rejected { status, body },
        }
    }
}
