//! Signing service - key lifecycle and verification.
//!
//! This service handles:
//! - Issuing unique signatures with bounded collision retries
//! - Scoped verification with per-key rate limiting
//! - Expiration and rotation of keys
//! - Read-only queries over issued keys
//!
//! The service holds no mutable state of its own; every durable change goes
//! through the [`SignatureStore`], which provides the locking.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ExpirationPolicy, SigningConfig};
use crate::error::{Result, SigningError};
use crate::models::signature::{SignatureFilter, SignatureRecord};
use crate::services::key_generator::KeyGenerator;
use crate::services::rate_limiter::RateLimiter;
use crate::store::{RecordMutation, RecordRotation, SignatureStore};

/// Attempts at generating a signature that does not collide with an existing one.
pub const MAX_GENERATION_ATTEMPTS: u32 = 5;

/// Overrides applied to the successor of a rotated key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationOptions {
    /// Lifetime of the new key in hours, inherited from the old key when `None`
    pub expiration_hours: Option<u32>,

    /// Scope of the new key, inherited from the old key when `None`
    pub scope: Option<String>,
}

/// Selects the keys a batch rotation replaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationSweep {
    /// Rotate keys expiring within this many hours
    pub within_hours: u32,

    /// Only keys in this scope, every scope when `None`
    pub scope: Option<String>,

    /// Skip inactive keys; inactive keys are still refused in safe mode
    pub only_active: bool,

    /// Overrides applied to every successor
    pub successor: RotationOptions,
}

impl Default for RotationSweep {
    fn default() -> Self {
        Self {
            within_hours: 1,
            scope: None,
            only_active: true,
            successor: RotationOptions::default(),
        }
    }
}

/// Issues, verifies, expires and rotates signing keys.
#[derive(Clone)]
pub struct SigningService {
    store: Arc<dyn SignatureStore>,
    generator: KeyGenerator,
    rate_limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    config: SigningConfig,
}

impl SigningService {
    /// Create a service over `store`.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: the configuration does not validate
    pub fn new(store: Arc<dyn SignatureStore>, config: SigningConfig) -> Result<Self> {
        config.validate()?;

        let rate_limiter = match config.rate_limit {
            Some(policy) => RateLimiter::new(policy),
            None => RateLimiter::disabled(),
        };

        Ok(Self {
            store,
            generator: KeyGenerator::new(config.byte_len),
            rate_limiter,
            clock: Arc::new(SystemClock),
            config,
        })
    }

    /// Replace the time source, e.g. with a [`ManualClock`](crate::clock::ManualClock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SigningConfig {
        &self.config
    }

    /// Issue a new signing key.
    ///
    /// # Process
    ///
    /// 1. Resolve the lifetime (`None`/`0` goes through the expiration policy)
    /// 2. Generate a candidate signature
    /// 3. Insert it; on a collision regenerate, up to `MAX_GENERATION_ATTEMPTS`
    ///
    /// # Arguments
    ///
    /// * `scope` - Namespace the key is valid for (must not be empty)
    /// * `expiration_hours` - Lifetime in hours
    /// * `active` - Whether the key is usable right away
    /// * `email` - Optional owner, stored lowercase
    ///
    /// # Returns
    ///
    /// The plaintext signature
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: empty scope, rejected missing lifetime, or lifetime out of range
    /// - `KeyGenerationExhausted`: every candidate collided
    /// - `EntropyUnavailable`, `StoreUnavailable`
    pub async fn write_key(
        &self,
        scope: &str,
        expiration_hours: Option<u32>,
        active: bool,
        email: Option<&str>,
    ) -> Result<String> {
        let scope = validate_scope(scope)?;
        let hours = self.resolve_expiration(expiration_hours)?;
        let email = normalize_email(email);

        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let signature = self.generator.generate()?;
            let record = SignatureRecord::issue(
                signature,
                scope.clone(),
                hours,
                active,
                email.clone(),
                self.clock.now(),
            )?;

            match self.store.insert(record).await {
                Ok(record) => {
                    info!(
                        signature = redact(&record.signature),
                        scope = %record.scope,
                        expiration_hours = hours,
                        active,
                        "Signing key issued"
                    );
                    return Ok(record.signature);
                }
                Err(SigningError::DuplicateSignature) => {
                    warn!(attempt, "Signature collision, regenerating");
                }
                Err(error) => return Err(error),
            }
        }

        Err(SigningError::KeyGenerationExhausted {
            attempts: MAX_GENERATION_ATTEMPTS,
        })
    }

    /// Verify a signature for `scope`.
    ///
    /// Rate limiting is applied to every existing key before scope and
    /// validity are looked at, so a throttled caller learns nothing about
    /// why a key would have been rejected. A key found past its expiration
    /// is deactivated in the same write.
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: scope matches and the key is active and unexpired
    /// - `Ok(false)`: the key exists but is not valid for this scope right now
    ///
    /// # Errors
    ///
    /// - `KeyDoesNotExist`: no key has this signature (not rate limited)
    /// - `RateLimitExceeded`: too many verifications in the current window
    pub async fn verify_key(&self, signature: &str, scope: &str) -> Result<bool> {
        let now = self.clock.now();
        let rate_limiter = self.rate_limiter;

        let mutation: RecordMutation = Box::new(move |record: &mut SignatureRecord| {
            rate_limiter.admit(record, now)?;
            if record.active && record.is_expired_at(now) {
                record.active = false;
            }
            Ok(())
        });

        let record = match self.store.modify(signature, mutation).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(signature = redact(signature), "Verification of unknown key");
                return Err(SigningError::KeyDoesNotExist);
            }
            Err(error @ SigningError::RateLimitExceeded { .. }) => {
                warn!(signature = redact(signature), "Verification rate limited");
                return Err(error);
            }
            Err(error) => return Err(error),
        };

        let valid = record.scope == scope && record.is_valid_at(now);
        debug!(
            signature = redact(signature),
            scope,
            valid,
            "Signing key verified"
        );

        Ok(valid)
    }

    /// Disable a key.
    ///
    /// Idempotent: expiring an already inactive key succeeds again.
    ///
    /// # Errors
    ///
    /// - `KeyDoesNotExist`: no key has this signature
    pub async fn expire_key(&self, signature: &str) -> Result<bool> {
        let mutation: RecordMutation = Box::new(|record: &mut SignatureRecord| {
            record.active = false;
            Ok(())
        });

        match self.store.modify(signature, mutation).await? {
            Some(_) => {
                info!(signature = redact(signature), "Signing key expired");
                Ok(true)
            }
            None => Err(SigningError::KeyDoesNotExist),
        }
    }

    /// Replace a key with a new one carrying the same scope, owner and lifetime.
    pub async fn rotate_key(&self, signature: &str) -> Result<String> {
        self.rotate_key_with(signature, RotationOptions::default())
            .await
    }

    /// Replace a key with a new one, optionally overriding scope or lifetime.
    ///
    /// The old key is deactivated and marked rotated in the same transaction
    /// that inserts the successor, so exactly one of them is valid at any
    /// point in time.
    ///
    /// # Errors
    ///
    /// - `KeyDoesNotExist`: no key has this signature
    /// - `AlreadyRotated`, `KeyInactive`: refused in safe mode
    /// - `KeyGenerationExhausted`: every successor candidate collided
    pub async fn rotate_key_with(&self, signature: &str, options: RotationOptions) -> Result<String> {
        let scope = options.scope.as_deref().map(validate_scope).transpose()?;
        let hours = match options.expiration_hours {
            Some(hours) => Some(self.resolve_expiration(Some(hours))?),
            None => None,
        };
        let safe_mode = self.config.safe_mode;

        for attempt in 1..=MAX_GENERATION_ATTEMPTS {
            let successor_signature = self.generator.generate()?;
            let now = self.clock.now();
            let scope = scope.clone();

            let rotation: RecordRotation = Box::new(move |old: &mut SignatureRecord| {
                if safe_mode && old.rotated {
                    return Err(SigningError::AlreadyRotated);
                }
                if safe_mode && !old.active {
                    return Err(SigningError::KeyInactive);
                }

                old.active = false;
                old.rotated = true;

                let mut successor = SignatureRecord::issue(
                    successor_signature.clone(),
                    scope.clone().unwrap_or_else(|| old.scope.clone()),
                    hours.unwrap_or_else(|| old.inherited_expiration_hours()),
                    true,
                    old.email.clone(),
                    now,
                )?;
                successor.previous_signature = Some(old.signature.clone());

                Ok(successor)
            });

            match self.store.replace(signature, rotation).await {
                Ok(successor) => {
                    info!(
                        signature = redact(signature),
                        successor = redact(&successor.signature),
                        scope = %successor.scope,
                        "Signing key rotated"
                    );
                    return Ok(successor.signature);
                }
                Err(SigningError::DuplicateSignature) => {
                    warn!(attempt, "Successor signature collision, regenerating");
                }
                Err(error) => return Err(error),
            }
        }

        Err(SigningError::KeyGenerationExhausted {
            attempts: MAX_GENERATION_ATTEMPTS,
        })
    }

    /// Rotate every active key in `scope` that expires within `within_hours`.
    ///
    /// Shorthand for [`rotate_expiring_keys_with`](Self::rotate_expiring_keys_with)
    /// with inherited successor properties.
    pub async fn rotate_expiring_keys(
        &self,
        within_hours: u32,
        scope: Option<&str>,
    ) -> Result<Vec<(String, String)>> {
        let sweep = RotationSweep {
            within_hours,
            scope: scope.map(str::to_string),
            ..RotationSweep::default()
        };

        self.rotate_expiring_keys_with(&sweep).await
    }

    /// Rotate every key selected by `sweep`.
    ///
    /// Intended for a periodic background job. Keys that were already
    /// rotated are never rotated again. Keys refused by safe mode, including
    /// ones rotated or disabled by someone else between listing and
    /// rotating, are skipped.
    ///
    /// # Returns
    ///
    /// `(old signature, new signature)` pairs, oldest key first
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: the window reaches past the supported calendar
    ///   range, or the successor scope override is empty
    pub async fn rotate_expiring_keys_with(
        &self,
        sweep: &RotationSweep,
    ) -> Result<Vec<(String, String)>> {
        if let Some(scope) = &sweep.successor.scope {
            validate_scope(scope)?;
        }

        let cutoff = Duration::try_hours(i64::from(sweep.within_hours))
            .and_then(|window| self.clock.now().checked_add_signed(window))
            .ok_or_else(|| {
                SigningError::InvalidRequest(format!(
                    "Rotation window of {} hours is out of range",
                    sweep.within_hours
                ))
            })?;

        let mut filter = if sweep.only_active {
            SignatureFilter::active_only()
        } else {
            SignatureFilter::default()
        };
        filter = filter.expiring_before(cutoff);
        if let Some(scope) = &sweep.scope {
            filter = filter.with_scope(scope.clone());
        }

        let candidates = self.store.list_all(&filter).await?;
        let mut rotated = Vec::with_capacity(candidates.len());

        for record in candidates.into_iter().filter(|record| !record.rotated) {
            match self
                .rotate_key_with(&record.signature, sweep.successor.clone())
                .await
            {
                Ok(successor) => rotated.push((record.signature, successor)),
                Err(SigningError::AlreadyRotated | SigningError::KeyInactive) => {
                    debug!(
                        signature = redact(&record.signature),
                        "Skipping key refused by safe mode"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        info!(
            count = rotated.len(),
            within_hours = sweep.within_hours,
            "Rotated expiring keys"
        );
        Ok(rotated)
    }

    /// All issued keys, optionally only the active ones.
    pub async fn get_all(&self, active_only: bool) -> Result<Vec<SignatureRecord>> {
        let filter = if active_only {
            SignatureFilter::active_only()
        } else {
            SignatureFilter::default()
        };

        self.store.list_all(&filter).await
    }

    pub async fn get_key(&self, signature: &str) -> Result<Option<SignatureRecord>> {
        self.store.find_by_signature(signature).await
    }

    pub async fn query_keys(&self, filter: &SignatureFilter) -> Result<Vec<SignatureRecord>> {
        self.store.list_all(filter).await
    }

    /// Permanently remove a key. Administrative use only.
    pub async fn delete_key(&self, signature: &str) -> Result<bool> {
        let deleted = self.store.delete(signature).await?;
        if deleted {
            warn!(signature = redact(signature), "Signing key deleted");
        }
        Ok(deleted)
    }

    fn resolve_expiration(&self, requested: Option<u32>) -> Result<u32> {
        match requested {
            Some(hours) if hours > 0 => Ok(hours),
            _ => match self.config.expiration_policy {
                ExpirationPolicy::NoExpiry => Ok(0),
                ExpirationPolicy::DefaultHours(hours) => Ok(hours),
                ExpirationPolicy::Reject => Err(SigningError::InvalidRequest(
                    "An expiration in hours is required".to_string(),
                )),
            },
        }
    }
}

fn validate_scope(scope: &str) -> Result<String> {
    if scope.trim().is_empty() {
        return Err(SigningError::InvalidRequest(
            "Scope must not be empty".to_string(),
        ));
    }
    Ok(scope.to_string())
}

fn normalize_email(email: Option<&str>) -> Option<String> {
    email
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .map(str::to_lowercase)
}

/// Leading characters of a signature, safe to log.
fn redact(signature: &str) -> &str {
    signature.get(..8).unwrap_or(signature)
}
