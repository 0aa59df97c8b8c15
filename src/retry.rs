//! Retry decisions for network operations.
//!
//! [`RetryPolicy::should_retry`] is a pure function of its inputs: jitter is
//! drawn from an RNG seeded by the [`RetryState`], so asking twice gives the
//! same answer. The caller does the actual waiting.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::transport::{ErrorClass, TransportError};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default backoff base.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Default backoff ceiling.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outcome of consulting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub backoff: Duration,
}

impl RetryDecision {
    pub fn give_up() -> Self {
        Self {
            retry: false,
            backoff: Duration::ZERO,
        }
    }
}

/// Per-operation retry bookkeeping. Reset for every page.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempt_count: u32,
    last_error: Option<TransportError>,
    started_at: Instant,
    jitter_seed: u64,
}

impl RetryState {
    pub fn new() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn with_seed(jitter_seed: u64) -> Self {
        Self {
            attempt_count: 0,
            last_error: None,
            started_at: Instant::now(),
            jitter_seed,
        }
    }

    /// Retries performed so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn last_error(&self) -> Option<&TransportError> {
        self.last_error.as_ref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn jitter_seed(&self) -> u64 {
        self.jitter_seed
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, DEFAULT_BASE_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_retries,
            base_backoff,
            max_backoff,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decides whether `error` should be retried given what has happened so far.
    pub fn should_retry(&self, state: &RetryState, error: &TransportError) -> RetryDecision {
        // Unknown failures are not retried: the call may not be idempotent
        if !error.classification.is_retryable() {
            return RetryDecision::give_up();
        }

        if state.attempt_count >= self.max_retries {
            return RetryDecision::give_up();
        }

        let mut backoff = self.backoff_for(state);
        if matches!(
            error.classification,
            ErrorClass::RateLimited | ErrorClass::ServerError
        ) {
            if let Some(hint) = error.retry_after {
                backoff = backoff.max(hint.min(self.max_backoff));
            }
        }

        RetryDecision {
            retry: true,
            backoff,
        }
    }

    /// Records a failed attempt that is about to be retried.
    pub fn advance(&self, state: &mut RetryState, error: TransportError) {
        state.attempt_count += 1;
        state.last_error = Some(error);
    }

    /// `base * 2^attempt + random(0, base)`, capped at the ceiling.
    fn backoff_for(&self, state: &RetryState) -> Duration {
        let exponential = 2u32
            .checked_pow(state.attempt_count)
            .and_then(|factor| self.base_backoff.checked_mul(factor))
            .unwrap_or(self.max_backoff);

        let base_ms = self.base_backoff.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            let mut rng =
                StdRng::seed_from_u64(state.jitter_seed ^ u64::from(state.attempt_count));
            Duration::from_millis(rng.random_range(0..base_ms))
        };

        exponential.saturating_add(jitter).min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(classification: ErrorClass) -> TransportError {
        TransportError::new(classification, "test")
    }

    fn state_after(policy: &RetryPolicy, retries: u32) -> RetryState {
        let mut state = RetryState::with_seed(42);
        for _ in 0..retries {
            policy.advance(&mut state, error(ErrorClass::ServerError));
        }
        state
    }

    #[test]
    fn test_retries_transient_classes() {
        let policy = RetryPolicy::default();
        let state = RetryState::with_seed(1);

        for class in [
            ErrorClass::TransientNetwork,
            ErrorClass::RateLimited,
            ErrorClass::ServerError,
        ] {
            assert!(policy.should_retry(&state, &error(class)).retry, "{}", class);
        }
    }

    #[test]
    fn test_never_retries_client_error() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(&RetryState::with_seed(1), &error(ErrorClass::ClientError));
        assert_eq!(decision, RetryDecision::give_up());
    }

    #[test]
    fn test_never_retries_unknown() {
        let policy = RetryPolicy::default();
        let decision = policy.should_retry(&RetryState::with_seed(1), &error(ErrorClass::Unknown));
        assert!(!decision.retry);
    }

    #[test]
    fn test_stops_after_max_retries() {
        let policy = RetryPolicy::default();
        let err = error(ErrorClass::ServerError);

        assert!(policy.should_retry(&state_after(&policy, 2), &err).retry);
        assert!(!policy.should_retry(&state_after(&policy, 3), &err).retry);
        assert!(!policy.should_retry(&state_after(&policy, 10), &err).retry);
    }

    #[test]
    fn test_same_input_same_decision() {
        let policy = RetryPolicy::default();
        let err = error(ErrorClass::TransientNetwork);

        for retries in 0..3 {
            let state = state_after(&policy, retries);
            let first = policy.should_retry(&state, &err);
            let second = policy.should_retry(&state, &err);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_backoff_bounds() {
        let base = Duration::from_millis(100);
        let policy = RetryPolicy::new(5, base, Duration::from_secs(30));
        let err = error(ErrorClass::ServerError);

        for retries in 0..5u32 {
            let decision = policy.should_retry(&state_after(&policy, retries), &err);
            let floor = base * 2u32.pow(retries);
            assert!(decision.backoff >= floor, "attempt {}: {:?}", retries, decision.backoff);
            assert!(decision.backoff < floor + base, "attempt {}: {:?}", retries, decision.backoff);
        }
    }

    #[test]
    fn test_backoff_capped_at_ceiling() {
        let policy = RetryPolicy::new(40, Duration::from_millis(500), Duration::from_secs(2));
        let err = error(ErrorClass::ServerError);

        let decision = policy.should_retry(&state_after(&policy, 10), &err);
        assert_eq!(decision.backoff, Duration::from_secs(2));

        // 2^35 overflows u32
        let decision = policy.should_retry(&state_after(&policy, 35), &err);
        assert_eq!(decision.backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_base_has_no_jitter() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::from_secs(1));
        let decision = policy.should_retry(&RetryState::with_seed(9), &error(ErrorClass::ServerError));
        assert!(decision.retry);
        assert_eq!(decision.backoff, Duration::ZERO);
    }

    #[test]
    fn test_retry_after_hint_raises_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(30));
        let err = error(ErrorClass::RateLimited).with_retry_after(Some(Duration::from_secs(5)));

        let decision = policy.should_retry(&RetryState::with_seed(3), &err);
        assert_eq!(decision.backoff, Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_hint_is_capped() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(2));
        let err = error(ErrorClass::RateLimited).with_retry_after(Some(Duration::from_secs(600)));

        let decision = policy.should_retry(&RetryState::with_seed(3), &err);
        assert_eq!(decision.backoff, Duration::from_secs(2));
    }

    #[test]
    fn test_advance_tracks_state() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::with_seed(0);
        assert_eq!(state.attempt_count(), 0);
        assert!(state.last_error().is_none());

        policy.advance(&mut state, error(ErrorClass::TransientNetwork));
        policy.advance(&mut state, error(ErrorClass::RateLimited));
        assert_eq!(state.attempt_count(), 2);
        assert_eq!(
            state.last_error().map(|e| e.classification),
            Some(ErrorClass::RateLimited)
        );
    }
}
