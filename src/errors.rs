//! Typed error enums for each module boundary.
//!
//! Library-internal failures are typed (`thiserror`) so callers can match on
//! them; the orchestration layer (pipeline/cycle) converts everything into
//! bookkeeping rather than propagating `Result` across a company boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentifierError {
    #[error("invalid identifier '{0}': expected 11 or 14 digits after normalization")]
    InvalidIdentifier(String),
}

#[derive(Error, Debug)]
pub enum InspectError {
    #[error("unreadable xml: {0}")]
    UnreadableXml(String),
    #[error("missing required field '{field}'")]
    MissingFields { field: &'static str },
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("network failure: {0}")]
    Network(#[from] reqwest::Error),
    #[error("http status {status}")]
    Http { status: u16 },
    #[error("api error: {message}")]
    ApiError { message: String },
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to decode response body: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("io error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to (de)serialize state: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid month key '{0}', expected MM-YYYY or YYYY-MM")]
    InvalidMonthKey(String),
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("io error staging '{path}': {source}")]
    Stage {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error copying to target '{path}': {source}")]
    CopyToTarget {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transaction record error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Aggregates the module-local error types a fetch step can surface;
/// callers above the fetchers only need to know "which layer failed".
#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Inspect(#[from] InspectError),
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("io error reading manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to open spreadsheet: {0}")]
    Spreadsheet(String),
    #[error("manifest is missing required column '{0}'")]
    MissingColumn(&'static str),
    #[error("network failure fetching manifest: {0}")]
    Network(#[from] reqwest::Error),
}
