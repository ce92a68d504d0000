//! Error taxonomy for one collection cycle.

use thiserror::Error;

/// Failures a cycle can run into, one variant per pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Request timed out, returned a non-success status, or the body was not
    /// a JSON array of objects.
    #[error("network failure: {0}")]
    Network(String),

    /// Database unreachable or credentials rejected.
    #[error("database connection failed: {0}")]
    Connection(#[source] sqlx::Error),

    /// A statement in the batch upsert failed; the transaction was rolled back.
    #[error("batch write failed, rolled back: {0}")]
    Write(#[source] sqlx::Error),

    /// A statistics query failed.
    #[error("statistics query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A numeric field held a value that cannot be read as a number.
    #[error("malformed record: field `{field}` has non-numeric value {value}")]
    MalformedRecord { field: &'static str, value: String },
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Network(format!("request timed out: {err}"))
        } else {
            PipelineError::Network(err.to_string())
        }
    }
}
