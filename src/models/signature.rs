//! Signature record model.
//!
//! A signature is a random hex token granting one capability inside a scope
//! (e.g. "email_verification", "api"). Records are soft-disabled rather than
//! deleted so the issuance and rotation history stays auditable.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{Result, SigningError};

/// Represents a signing key record from the database.
///
/// # Database Table
///
/// Maps to the `signatures` table. Each record:
/// - Is identified by a unique `signature`
/// - Is valid only while `active` and before `expiration`
/// - Carries its own fixed-window rate limit counters
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SignatureRecord {
    /// Storage identity
    pub id: Uuid,

    /// The token value handed to the key holder (hex encoded)
    pub signature: String,

    /// Namespace the key is valid for
    pub scope: String,

    /// Absolute expiry instant, `None` when the key never expires
    pub expiration: Option<DateTime<Utc>>,

    /// Lifetime in hours requested at issuance (0 = no expiry)
    ///
    /// Rotation reuses this value so the successor gets the same lifetime
    /// counted from the moment of rotation.
    pub expiration_hours: i32,

    /// Soft-disable flag, independent of `expiration`
    pub active: bool,

    /// Owner of the key, stored lowercase
    pub email: Option<String>,

    /// Issuance time
    pub created_at: DateTime<Utc>,

    /// Time of the last admitted verification
    pub last_accessed_at: Option<DateTime<Utc>>,

    /// Verifications counted in the current rate limit window
    pub rate_limit_calls: i32,

    /// Start of the current rate limit window
    pub rate_limit_window_start: Option<DateTime<Utc>>,

    /// Signature this key replaced when it was issued by rotation
    pub previous_signature: Option<String>,

    /// Whether this key has been superseded by rotation
    pub rotated: bool,
}

impl SignatureRecord {
    /// Build a fresh record issued at `now`.
    ///
    /// `expiration_hours == 0` produces a key without expiration.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: the lifetime does not fit the column or overflows the calendar
    pub fn issue(
        signature: String,
        scope: String,
        expiration_hours: u32,
        active: bool,
        email: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let stored_hours = i32::try_from(expiration_hours).map_err(|_| {
            SigningError::InvalidRequest(format!(
                "Expiration of {expiration_hours} hours is too large"
            ))
        })?;

        let expiration = if expiration_hours == 0 {
            None
        } else {
            let expires_at = now
                .checked_add_signed(Duration::hours(i64::from(expiration_hours)))
                .ok_or_else(|| {
                    SigningError::InvalidRequest(format!(
                        "Expiration of {expiration_hours} hours is out of range"
                    ))
                })?;
            Some(expires_at)
        };

        Ok(Self {
            id: Uuid::new_v4(),
            signature,
            scope,
            expiration,
            expiration_hours: stored_hours,
            active,
            email,
            created_at: now,
            last_accessed_at: None,
            rate_limit_calls: 0,
            rate_limit_window_start: None,
            previous_signature: None,
            rotated: false,
        })
    }

    /// Whether the expiration instant has been reached at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiration, Some(expiration) if expiration <= now)
    }

    /// A record is valid iff it is active and not yet expired.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired_at(now)
    }

    /// Lifetime to hand down to a rotated successor.
    pub fn inherited_expiration_hours(&self) -> u32 {
        u32::try_from(self.expiration_hours).unwrap_or(0)
    }
}

/// Criteria for listing signature records.
///
/// Every `None` field matches all records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureFilter {
    pub active: Option<bool>,
    pub scope: Option<String>,
    pub email: Option<String>,
    pub previous_signature: Option<String>,

    /// Only records with an expiration at or before this instant
    pub expiring_before: Option<DateTime<Utc>>,
}

impl SignatureFilter {
    pub fn active_only() -> Self {
        Self {
            active: Some(true),
            ..Self::default()
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into().to_lowercase());
        self
    }

    pub fn with_previous_signature(mut self, signature: impl Into<String>) -> Self {
        self.previous_signature = Some(signature.into());
        self
    }

    pub fn expiring_before(mut self, instant: DateTime<Utc>) -> Self {
        self.expiring_before = Some(instant);
        self
    }

    /// Evaluate the filter against a record in memory.
    pub fn matches(&self, record: &SignatureRecord) -> bool {
        if self.active.is_some_and(|active| record.active != active) {
            return false;
        }
        if self.scope.as_ref().is_some_and(|scope| &record.scope != scope) {
            return false;
        }
        if self
            .email
            .as_ref()
            .is_some_and(|email| record.email.as_ref() != Some(email))
        {
            return false;
        }
        if self
            .previous_signature
            .as_ref()
            .is_some_and(|previous| record.previous_signature.as_ref() != Some(previous))
        {
            return false;
        }
        if let Some(cutoff) = self.expiring_before {
            return matches!(record.expiration, Some(expiration) if expiration <= cutoff);
        }
        true
    }
}
