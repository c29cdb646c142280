//! Learning subsystem error types.

/// Errors that can occur in the abacus_learn crate.
///
/// Two tiers of callers exist. Telemetry-path code (execution recording,
/// policy updates, metrics sampling) catches every variant at the service
/// boundary and logs it; nothing on that path may fail the tool call being
/// observed. Query-path code (feedback submission, metrics queries,
/// recommendations) returns these to the caller directly.
#[derive(Debug, thiserror::Error)]
pub enum LearnError {
    /// The backing store failed or is unreachable.
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// No ledger row exists for the given execution id.
    #[error("Unknown execution id: {0}")]
    NotFound(String),

    /// Caller-supplied input failed validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Reward or policy arithmetic produced a non-finite value.
    #[error("Computation error: {0}")]
    Computation(String),

    /// JSON (de)serialization of a stored payload failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LearnError>;
