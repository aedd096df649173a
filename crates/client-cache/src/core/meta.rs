//! Per-client statistics.
//!
//! Reference counts and timestamps are mutated from several tasks at once
//! (reconcilers returning from `get`, the orphan pruner, the callback
//! dispatcher), so everything here is atomic and mutation goes through the
//! increment/decrement helpers only.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Mutable counters attached to one cached client
#[derive(Debug)]
pub struct ClientStats {
    created_at: DateTime<Utc>,
    ref_count: AtomicI64,
    last_referenced_at: AtomicI64,
}

impl ClientStats {
    /// Fresh stats stamped with the current time
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            ref_count: AtomicI64::new(0),
            last_referenced_at: AtomicI64::new(now.timestamp()),
        }
    }

    /// When the client was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time elapsed since creation
    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Current reference count
    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Record a new reference; returns the updated count
    pub fn increment_ref(&self) -> i64 {
        self.touch();
        self.ref_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop a reference, clamping at zero; returns the updated count
    pub fn decrement_ref(&self) -> i64 {
        let mut current = self.ref_count.load(Ordering::Relaxed);
        loop {
            let next = (current - 1).max(0);
            match self.ref_count.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Record that the client was just handed out
    pub fn touch(&self) {
        self.last_referenced_at
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// When the client was last handed out
    pub fn last_referenced_at(&self) -> DateTime<Utc> {
        let ts = self.last_referenced_at.load(Ordering::Relaxed);
        Utc.timestamp_opt(ts, 0).single().unwrap_or(self.created_at)
    }
}

impl Default for ClientStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_count_round_trip() {
        let stats = ClientStats::new();
        assert_eq!(stats.ref_count(), 0);
        assert_eq!(stats.increment_ref(), 1);
        assert_eq!(stats.increment_ref(), 2);
        assert_eq!(stats.decrement_ref(), 1);
        assert_eq!(stats.decrement_ref(), 0);
    }

    #[test]
    fn decrement_clamps_at_zero() {
        let stats = ClientStats::new();
        assert_eq!(stats.decrement_ref(), 0);
        assert_eq!(stats.ref_count(), 0);
    }

    #[test]
    fn age_is_monotonic() {
        let stats = ClientStats::new();
        let first = stats.age();
        assert!(stats.age() >= first);
    }
}
