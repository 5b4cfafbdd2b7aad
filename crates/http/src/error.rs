//! Error types for the request guard layer

/// Errors from guard configuration
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// A classification rule pattern failed to compile
    #[error("invalid classification pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
