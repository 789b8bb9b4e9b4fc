//! Per-key verification rate limiting.
//!
//! Uses a fixed window whose counters live on the signature record itself,
//! so the store's row lock serializes concurrent verifications of one key.
//!
//! # Algorithm
//!
//! 1. Reset the window when it never started or `now - start >= interval`
//! 2. Reject when the window already holds `max_calls` verifications
//! 3. Otherwise count the call and stamp `last_accessed_at`

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SigningError};
use crate::models::signature::SignatureRecord;

/// Default verifications allowed per window.
pub const DEFAULT_MAX_CALLS: u32 = 2;

/// Default window length in seconds.
pub const DEFAULT_INTERVAL_SECS: i64 = 5;

/// Longest accepted window, one year.
pub const MAX_INTERVAL_SECS: i64 = 365 * 24 * 60 * 60;

/// How many verifications a single key may see per interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_calls: u32,
    pub interval: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_calls: u32, interval: Duration) -> Self {
        Self {
            max_calls,
            interval,
        }
    }

    /// Policy with a window of `seconds`.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: `seconds` is outside `1..=MAX_INTERVAL_SECS`
    pub fn per_seconds(max_calls: u32, seconds: i64) -> Result<Self> {
        if !(1..=MAX_INTERVAL_SECS).contains(&seconds) {
            return Err(SigningError::InvalidRequest(format!(
                "Rate limit interval must be between 1 and {MAX_INTERVAL_SECS} seconds, got {seconds}"
            )));
        }

        let interval = Duration::try_seconds(seconds).ok_or_else(|| {
            SigningError::InvalidRequest(format!(
                "Rate limit interval of {seconds} seconds is out of range"
            ))
        })?;
        Ok(Self::new(max_calls, interval))
    }

    /// Check the window length is positive and at most `MAX_INTERVAL_SECS`.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: the interval is out of range
    pub fn validate(&self) -> Result<()> {
        if self.interval <= Duration::zero() || self.interval.num_seconds() > MAX_INTERVAL_SECS {
            return Err(SigningError::InvalidRequest(format!(
                "Rate limit interval must be positive and at most {MAX_INTERVAL_SECS} seconds"
            )));
        }
        Ok(())
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALLS, Duration::seconds(DEFAULT_INTERVAL_SECS))
    }
}

/// Applies a [`RateLimitPolicy`] to locked signature records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiter {
    policy: Option<RateLimitPolicy>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy: Some(policy),
        }
    }

    /// A limiter that admits every call but still tracks last access.
    pub fn disabled() -> Self {
        Self { policy: None }
    }

    pub fn policy(&self) -> Option<RateLimitPolicy> {
        self.policy
    }

    /// Count one verification against `record` at `now`.
    ///
    /// The record is only mutated when the call is admitted, so a rejected
    /// call leaves both window fields untouched.
    ///
    /// # Errors
    ///
    /// - `RateLimitExceeded`: the current window is full
    pub fn admit(&self, record: &mut SignatureRecord, now: DateTime<Utc>) -> Result<()> {
        let Some(policy) = self.policy else {
            record.last_accessed_at = Some(now);
            return Ok(());
        };

        let (window_start, elapsed, calls) = match record.rate_limit_window_start {
            Some(start) if now - start < policy.interval => {
                (start, now - start, record.rate_limit_calls)
            }
            _ => (now, Duration::zero(), 0),
        };

        if i64::from(calls) >= i64::from(policy.max_calls) {
            let remaining = policy
                .interval
                .checked_sub(&elapsed)
                .unwrap_or(policy.interval);
            return Err(SigningError::RateLimitExceeded {
                retry_after_secs: retry_after(remaining),
            });
        }

        record.rate_limit_window_start = Some(window_start);
        record.rate_limit_calls = calls.saturating_add(1);
        record.last_accessed_at = Some(now);
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

/// Whole seconds left in the window, rounded up.
fn retry_after(remaining: Duration) -> u64 {
    let millis = remaining.num_milliseconds().max(0);
    u64::try_from(millis).unwrap_or(0).div_ceil(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_record(now: DateTime<Utc>) -> SignatureRecord {
        SignatureRecord::issue("00ff".to_string(), "test".to_string(), 0, true, None, now).unwrap()
    }

    #[test]
    fn test_first_call_opens_window() {
        let now = Utc::now();
        let mut record = fresh_record(now);

        RateLimiter::default().admit(&mut record, now).unwrap();

        assert_eq!(record.rate_limit_calls, 1);
        assert_eq!(record.rate_limit_window_start, Some(now));
        assert_eq!(record.last_accessed_at, Some(now));
    }

    #[test]
    fn test_rejects_call_over_limit() {
        let now = Utc::now();
        let limiter = RateLimiter::new(RateLimitPolicy::per_seconds(2, 5).unwrap());
        let mut record = fresh_record(now);

        limiter.admit(&mut record, now).unwrap();
        limiter
            .admit(&mut record, now + Duration::seconds(1))
            .unwrap();
        let before = record.clone();

        let result = limiter.admit(&mut record, now + Duration::seconds(2));
        assert!(matches!(
            result,
            Err(SigningError::RateLimitExceeded {
                retry_after_secs: 3
            })
        ));
        // Rejected calls do not touch the record
        assert_eq!(record, before);
    }

    #[test]
    fn test_window_resets_on_boundary() {
        let now = Utc::now();
        let limiter = RateLimiter::new(RateLimitPolicy::per_seconds(1, 5).unwrap());
        let mut record = fresh_record(now);

        limiter.admit(&mut record, now).unwrap();
        assert!(
            limiter
                .admit(&mut record, now + Duration::milliseconds(4_999))
                .is_err()
        );

        let boundary = now + Duration::seconds(5);
        limiter.admit(&mut record, boundary).unwrap();
        assert_eq!(record.rate_limit_calls, 1);
        assert_eq!(record.rate_limit_window_start, Some(boundary));
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after(Duration::milliseconds(1_200)), 2);
        assert_eq!(retry_after(Duration::zero()), 0);
        assert_eq!(retry_after(Duration::seconds(-1)), 0);
    }

    #[test]
    fn test_per_seconds_rejects_out_of_range() {
        for seconds in [0, -5, MAX_INTERVAL_SECS + 1, i64::MAX, i64::MIN] {
            assert!(matches!(
                RateLimitPolicy::per_seconds(1, seconds),
                Err(SigningError::InvalidRequest(_))
            ));
        }

        let policy = RateLimitPolicy::per_seconds(1, MAX_INTERVAL_SECS).unwrap();
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_huge_interval() {
        let policy = RateLimitPolicy::new(1, Duration::days(365 * 300_000));
        assert!(matches!(
            policy.validate(),
            Err(SigningError::InvalidRequest(_))
        ));
        assert!(RateLimitPolicy::new(1, Duration::zero()).validate().is_err());
    }

    #[test]
    fn test_rejection_with_huge_interval_does_not_overflow() {
        // Window end lies past the calendar's upper bound
        let now = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::days(365 * 300_000)));
        let mut record = fresh_record(now);

        limiter.admit(&mut record, now).unwrap();
        let result = limiter.admit(&mut record, now + Duration::hours(1));

        assert!(matches!(
            result,
            Err(SigningError::RateLimitExceeded { retry_after_secs }) if retry_after_secs > 0
        ));
    }

    #[test]
    fn test_disabled_limiter_only_tracks_access() {
        let now = Utc::now();
        let limiter = RateLimiter::disabled();
        let mut record = fresh_record(now);

        for _ in 0..100 {
            limiter.admit(&mut record, now).unwrap();
        }

        assert_eq!(record.rate_limit_calls, 0);
        assert_eq!(record.last_accessed_at, Some(now));
        assert!(limiter.policy().is_none());
    }
}
