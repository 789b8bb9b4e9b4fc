//! Error types for signing key operations.
//!
//! Every lifecycle operation returns [`Result`], so callers can tell a
//! definitive `false` from a verification apart from the conditions below.

/// Errors raised by the key generator, the signature store and the signing service.
///
/// # Error Categories
///
/// - **Generation**: `KeyGenerationExhausted`, `DuplicateSignature`, `EntropyUnavailable`
/// - **Lookup**: `KeyDoesNotExist`
/// - **Usage**: `RateLimitExceeded`
/// - **Rotation**: `AlreadyRotated`, `KeyInactive`
/// - **Storage**: `StoreUnavailable`
/// - **Validation**: `InvalidRequest`
#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    /// Every generated candidate collided with an existing signature.
    ///
    /// Callers may retry later or raise the configured byte length.
    #[error("Unable to generate a unique signature after {attempts} attempts")]
    KeyGenerationExhausted { attempts: u32 },

    /// The store refused an insert because the signature already exists.
    ///
    /// Retried transparently by the signing service and only surfaced from
    /// the store itself.
    #[error("Signature already exists")]
    DuplicateSignature,

    /// No record matches the given signature.
    #[error("This key does not exist")]
    KeyDoesNotExist,

    /// The key was verified too often inside the current window.
    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Any failure of the underlying database.
    ///
    /// This wraps any sqlx::Error using the `#[from]` attribute, so store
    /// code can use `?` on queries directly.
    #[error("Signature store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    /// The operating system random source could not be read.
    #[error("Entropy source unavailable: {0}")]
    EntropyUnavailable(String),

    /// Rotation refused because the key was already superseded.
    #[error("Key has already been rotated")]
    AlreadyRotated,

    /// Rotation refused because the key is disabled.
    #[error("Cannot rotate a disabled key")]
    KeyInactive,

    /// Arguments or configuration values are out of range.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for signing operations.
pub type Result<T> = std::result::Result<T, SigningError>;
