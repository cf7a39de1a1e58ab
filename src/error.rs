//! Crate-wide error taxonomy.
//!
//! Mirrors the propagation policy of the acquisition pipeline: drivers and
//! classifiers never throw for ordinary failures, they encode them as a
//! [`crate::outcome::AcquisitionOutcome`] with an [`crate::outcome::ErrorKind`]
//! tag. `TitanError` is reserved for the narrow set of infrastructure faults
//! that legitimately cross the core boundary (queue storage unreachable,
//! configuration invalid, a driver panicked).

use thiserror::Error;

/// Top-level error type returned by the few Titan operations that can fail
/// outside of the classified-outcome path.
#[derive(Debug, Error)]
pub enum TitanError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("captcha task queue storage error: {0}")]
    Infrastructure(String),

    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("orchestration deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("orchestration was cancelled")]
    Cancelled,

    #[error("driver '{0}' panicked: {1}")]
    DriverCrash(&'static str, String),
}

pub type TitanResult<T> = Result<T, TitanError>;
