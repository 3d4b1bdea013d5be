//! Error types for the cache stack

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// A single tier's failure inside a multi-tier store fan-out
#[derive(Debug)]
pub struct TierFault {
    /// Name of the tier that failed
    pub tier: String,
    /// The error the tier raised
    pub error: Box<Error>,
}

fn fmt_faults(faults: &[TierFault]) -> String {
    faults
        .iter()
        .map(|f| format!("{}: {}", f.tier, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur in the cache stack
#[derive(Error, Debug)]
pub enum Error {
    /// Out-of-domain value supplied to a configuration surface
    #[error("invalid value '{value}' for option '{option}': expected {expected}")]
    Configuration {
        option: String,
        value: String,
        expected: String,
    },

    /// A strategy operation received meta data not produced by itself
    #[error("meta data kind mismatch: expected '{expected}', found '{actual}'; reset the stack before switching strategies")]
    InvalidMetaDataKind { expected: String, actual: String },

    /// Backend write failure
    #[error("storage write failed for '{id}': {reason}")]
    StorageWriteFailed { id: String, reason: String },

    /// Backend read failure
    #[error("storage read failed for '{id}': {reason}")]
    StorageReadFailed { id: String, reason: String },

    /// Operation attempted while the stack is not in the active state
    #[error("cache stack is {state}; call reset() before further operations")]
    StackInvalidState { state: String },

    /// One or more tiers failed during a multi-tier store
    #[error("store failed on {} tier(s): {}", faults.len(), fmt_faults(faults))]
    TierStoreFailed { faults: Vec<TierFault> },

    /// Meta data blob could not be encoded or decoded
    #[error("meta data encoding failed: {0}")]
    MetaDataEncoding(String),
}

// =============================================================================
// Tests
// =============================================================================
