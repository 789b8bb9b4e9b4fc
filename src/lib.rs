//! Signing keys - issuance, verification, expiration and rotation.
//!
//! Signing keys are random hex tokens used for single-use actions (email
//! verification, password reset) and longer-lived API access. Each key is
//! valid within one scope, can expire, and is rate limited per key.
//!
//! # Architecture
//!
//! - **Storage**: PostgreSQL with sqlx ([`store::PgSignatureStore`]), or an
//!   in-memory store for tests and embedding
//! - **Generation**: OS random bytes, hex encoded
//! - **Rate limiting**: fixed window counters kept on each record
//! - **Orchestration**: [`SigningService`]

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ExpirationPolicy, SigningConfig};
pub use error::{Result, SigningError};
pub use models::signature::{SignatureFilter, SignatureRecord};
pub use services::key_generator::KeyGenerator;
pub use services::rate_limiter::{RateLimitPolicy, RateLimiter};
pub use services::signing_service::{
    MAX_GENERATION_ATTEMPTS, RotationOptions, RotationSweep, SigningService,
};
pub use store::{InMemorySignatureStore, PgSignatureStore, SignatureStore};
