//! Data models representing database entities.
//!
//! This module contains all data structures that map to database tables.

/// Signing key record and query filter
pub mod signature;
