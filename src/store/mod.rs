//! Persistence of signature records.
//!
//! The signing service only talks to [`SignatureStore`]; the store owns all
//! concurrency control. Implementations:
//! - [`postgres::PgSignatureStore`]: the `signatures` table via sqlx
//! - [`memory::InMemorySignatureStore`]: process-local, for tests and embedding

use async_trait::async_trait;

use crate::error::Result;
use crate::models::signature::{SignatureFilter, SignatureRecord};

pub mod memory;
pub mod postgres;

pub use memory::InMemorySignatureStore;
pub use postgres::PgSignatureStore;

/// Change applied to a record while its row is locked.
///
/// Returning an error aborts the change and nothing is persisted. Stores may
/// invoke it more than once when a transaction has to be retried.
pub type RecordMutation = Box<dyn Fn(&mut SignatureRecord) -> Result<()> + Send + Sync>;

/// Deactivates a locked record and yields the record that replaces it.
pub type RecordRotation = Box<dyn Fn(&mut SignatureRecord) -> Result<SignatureRecord> + Send + Sync>;

/// Transactional access to signature records.
#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Insert a new record.
    ///
    /// Uniqueness is checked atomically with the write.
    ///
    /// # Errors
    ///
    /// - `DuplicateSignature`: the signature is already taken
    async fn insert(&self, record: SignatureRecord) -> Result<SignatureRecord>;

    async fn find_by_signature(&self, signature: &str) -> Result<Option<SignatureRecord>>;

    /// Persist every mutable field of an existing record.
    ///
    /// # Errors
    ///
    /// - `KeyDoesNotExist`: no record has this signature
    async fn update(&self, record: &SignatureRecord) -> Result<SignatureRecord>;

    /// Locked read-modify-write of a single record.
    ///
    /// Returns `Ok(None)` when no record has this signature. Concurrent calls
    /// for the same signature are serialized.
    async fn modify(
        &self,
        signature: &str,
        mutation: RecordMutation,
    ) -> Result<Option<SignatureRecord>>;

    /// Replace a record with a successor in one atomic step.
    ///
    /// The old record is locked, passed to `rotation`, written back, and the
    /// returned successor is inserted before anything becomes visible.
    ///
    /// # Errors
    ///
    /// - `KeyDoesNotExist`: no record has this signature
    /// - `DuplicateSignature`: the successor signature is already taken
    async fn replace(&self, signature: &str, rotation: RecordRotation) -> Result<SignatureRecord>;

    /// Records matching `filter`, oldest first.
    async fn list_all(&self, filter: &SignatureFilter) -> Result<Vec<SignatureRecord>>;

    /// Permanently remove a record. Returns whether one was removed.
    async fn delete(&self, signature: &str) -> Result<bool>;
}
