//! Business logic services.
//!
//! Services contain the key lifecycle logic separated from persistence.

pub mod key_generator;
pub mod rate_limiter;
pub mod signing_service;
