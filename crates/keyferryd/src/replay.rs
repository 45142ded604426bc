//! Timestamp and nonce replay defence for decrypted envelopes.

use keyferry_proto::types::REPLAY_NONCE_LEN;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Why an envelope was refused.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    /// The sender timestamp is older than the replay window.
    #[error("timestamp older than replay window")]
    Stale,
    /// The sender timestamp is further ahead than the allowed skew.
    #[error("timestamp too far in the future")]
    FromFuture,
    /// This `(device, nonce)` pair was already seen inside the window.
    #[error("duplicate nonce")]
    Duplicate,
}

type ReplayKey = (String, [u8; REPLAY_NONCE_LEN]);

/// Remembers `(device_id, replay_nonce)` pairs for one replay window.
///
/// Entries are collected lazily on every check, so memory is bounded by the
/// accepted message rate times the window.
#[derive(Debug)]
pub struct ReplayCache {
    seen: Mutex<HashMap<ReplayKey, u64>>,
    window_ms: u64,
    max_skew_ms: u64,
}

impl ReplayCache {
    /// Creates a cache accepting timestamps in
    /// `[now - window_ms, now + max_skew_ms]`.
    #[must_use]
    pub fn new(window_ms: u64, max_skew_ms: u64) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window_ms,
            max_skew_ms,
        }
    }

    /// Validates the timestamp and records the nonce.
    ///
    /// # Errors
    ///
    /// Returns [`ReplayError`] if the timestamp is out of range or the nonce
    /// was already recorded for this device inside the window. A refused
    /// envelope is not recorded.
    pub fn check_and_record(
        &self,
        device_id: &str,
        nonce: &[u8; REPLAY_NONCE_LEN],
        timestamp_ms: u64,
        now_ms: u64,
    ) -> Result<(), ReplayError> {
        if timestamp_ms < now_ms.saturating_sub(self.window_ms) {
            return Err(ReplayError::Stale);
        }
        if timestamp_ms > now_ms.saturating_add(self.max_skew_ms) {
            return Err(ReplayError::FromFuture);
        }

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let window = self.window_ms;
        // Keyed by sender timestamp: once it falls out of the window the
        // envelope is stale anyway.
        seen.retain(|_, ts| now_ms.saturating_sub(*ts) <= window);

        let key = (device_id.to_owned(), *nonce);
        if seen.contains_key(&key) {
            return Err(ReplayError::Duplicate);
        }
        seen.insert(key, timestamp_ms);
        Ok(())
    }

    /// Number of nonces currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no nonces are remembered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const N1: [u8; REPLAY_NONCE_LEN] = [1; REPLAY_NONCE_LEN];
    const N2: [u8; REPLAY_NONCE_LEN] = [2; REPLAY_NONCE_LEN];

    fn cache() -> ReplayCache {
        ReplayCache::new(1_000, 100)
    }

    #[test]
    fn fresh_nonce_accepted_once() {
        let c = cache();
        assert!(c.check_and_record("d", &N1, 5_000, 5_000).is_ok());
        assert_eq!(
            c.check_and_record("d", &N1, 5_000, 5_001),
            Err(ReplayError::Duplicate)
        );
        assert!(c.check_and_record("d", &N2, 5_000, 5_001).is_ok());
    }

    #[test]
    fn same_nonce_from_other_device_is_distinct() {
        let c = cache();
        assert!(c.check_and_record("a", &N1, 5_000, 5_000).is_ok());
        assert!(c.check_and_record("b", &N1, 5_000, 5_000).is_ok());
    }

    #[test]
    fn timestamp_bounds_are_inclusive() {
        let c = cache();
        assert!(c.check_and_record("d", &N1, 4_000, 5_000).is_ok());
        assert!(c.check_and_record("d", &N2, 5_100, 5_000).is_ok());
    }

    #[test]
    fn stale_and_future_timestamps_rejected() {
        let c = cache();
        assert_eq!(
            c.check_and_record("d", &N1, 3_999, 5_000),
            Err(ReplayError::Stale)
        );
        assert_eq!(
            c.check_and_record("d", &N1, 5_101, 5_000),
            Err(ReplayError::FromFuture)
        );
        assert!(c.is_empty());
    }

    #[test]
    fn nonce_reusable_after_window_is_collected() {
        let c = cache();
        assert!(c.check_and_record("d", &N1, 5_000, 5_000).is_ok());
        assert!(c.check_and_record("d", &N1, 6_001, 6_001).is_ok());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn early_clock_does_not_underflow() {
        let c = cache();
        assert!(c.check_and_record("d", &N1, 0, 10).is_ok());
    }

    #[test]
    fn future_stamped_nonce_outlives_receipt_window() {
        let c = cache();
        assert!(c.check_and_record("d", &N1, 5_100, 5_000).is_ok());
        assert_eq!(
            c.check_and_record("d", &N1, 5_100, 6_050),
            Err(ReplayError::Duplicate)
        );
    }
}
