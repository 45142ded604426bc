//! Policy gates between a decrypted inject request and the injector.
//!
//! The arming gate and the approval gate are independent: each can be
//! required, and each can block on its own. Neither is aware of the other.

use crate::capabilities::{CapabilityError, FocusTarget};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Process-wide arm window.
#[derive(Debug, Default)]
pub struct ArmGate {
    armed_until: Mutex<Option<u64>>,
}

impl ArmGate {
    /// Creates a disarmed gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms until `now_ms + ttl_ms`, replacing any earlier window.
    pub fn arm(&self, now_ms: u64, ttl_ms: u64) -> u64 {
        let until = now_ms.saturating_add(ttl_ms);
        *self.lock() = Some(until);
        until
    }

    /// Removes the window.
    pub fn disarm(&self) {
        *self.lock() = None;
    }

    /// Whether the window is open at `now_ms`.
    #[must_use]
    pub fn is_armed(&self, now_ms: u64) -> bool {
        matches!(*self.lock(), Some(until) if now_ms < until)
    }

    /// Closes an open window and returns its end; `None` if not armed.
    pub fn try_consume(&self, now_ms: u64) -> Option<u64> {
        let mut guard = self.lock();
        match *guard {
            Some(until) if now_ms < until => {
                *guard = None;
                Some(until)
            }
            _ => None,
        }
    }

    /// Puts back a window taken by [`Self::try_consume`] unless a newer one
    /// was set in the meantime.
    pub fn restore(&self, until: u64) {
        let mut guard = self.lock();
        if guard.is_none() {
            *guard = Some(until);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<u64>> {
        self.armed_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-device approval windows for two-person workflows.
#[derive(Debug, Default)]
pub struct ApprovalGate {
    approved_until: Mutex<HashMap<String, u64>>,
}

impl ApprovalGate {
    /// Creates a gate with no approvals.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an approval window for `device_id`.
    pub fn approve(&self, device_id: &str, now_ms: u64, ttl_ms: u64) -> u64 {
        let until = now_ms.saturating_add(ttl_ms);
        let mut map = self.lock();
        map.retain(|_, u| now_ms < *u);
        map.insert(device_id.to_owned(), until);
        until
    }

    /// Whether `device_id` has an open window at `now_ms`.
    #[must_use]
    pub fn is_approved(&self, device_id: &str, now_ms: u64) -> bool {
        matches!(self.lock().get(device_id), Some(&until) if now_ms < until)
    }

    /// Closes an open window for `device_id`; `None` if there was none.
    pub fn try_consume(&self, device_id: &str, now_ms: u64) -> Option<u64> {
        let mut map = self.lock();
        match map.get(device_id) {
            Some(&until) if now_ms < until => {
                map.remove(device_id);
                Some(until)
            }
            _ => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.approved_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Allow/deny lists applied to the foreground target.
///
/// Patterns match case-insensitively as substrings of either the process
/// name or the window title. Deny wins over allow.
#[derive(Debug, Clone, Default)]
pub struct TargetPolicy {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl TargetPolicy {
    /// Builds a policy; empty patterns are ignored.
    #[must_use]
    pub fn new(allow: &[String], deny: &[String]) -> Self {
        let norm = |v: &[String]| {
            v.iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            allow: norm(allow),
            deny: norm(deny),
        }
    }

    /// Whether any list is non-empty. An unconfigured policy never consults
    /// the focus inspector.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.allow.is_empty() || !self.deny.is_empty()
    }

    /// Decides whether injection into the inspected target is allowed.
    ///
    /// An inspection error denies whenever the policy is configured.
    #[must_use]
    pub fn permits(&self, target: &Result<FocusTarget, CapabilityError>) -> bool {
        if !self.is_configured() {
            return true;
        }
        let Ok(target) = target else {
            return false;
        };
        let process = target.process.to_lowercase();
        let title = target.title.to_lowercase();
        let hit = |p: &String| process.contains(p.as_str()) || title.contains(p.as_str());

        if self.deny.iter().any(hit) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(hit)
    }
}
