//! Per-device daily quota counters
//!
//! One row per (device, UTC calendar day). Counters only ever grow within a
//! day; rollover happens implicitly because the next day is a fresh key.
//! The increment runs under the map entry's shard lock, so concurrent
//! requests from the same device cannot lose updates or both sneak past
//! the limit.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// The quota classes a device spends from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaClass {
    OracleCalls,
    OracleTokens,
    Dreams,
    Telegrams,
    Postcards,
}

impl QuotaClass {
    pub fn name(self) -> &'static str {
        match self {
            QuotaClass::OracleCalls => "oracle_calls",
            QuotaClass::OracleTokens => "oracle_tokens",
            QuotaClass::Dreams => "dreams",
            QuotaClass::Telegrams => "telegrams",
            QuotaClass::Postcards => "postcards",
        }
    }
}

/// Counter row for one device on one day
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayCounters {
    pub oracle_calls: u64,
    pub oracle_tokens: u64,
    pub dreams: u64,
    pub telegrams: u64,
    pub postcards: u64,
}

impl DayCounters {
    fn get(&self, class: QuotaClass) -> u64 {
        match class {
            QuotaClass::OracleCalls => self.oracle_calls,
            QuotaClass::OracleTokens => self.oracle_tokens,
            QuotaClass::Dreams => self.dreams,
            QuotaClass::Telegrams => self.telegrams,
            QuotaClass::Postcards => self.postcards,
        }
    }

    fn get_mut(&mut self, class: QuotaClass) -> &mut u64 {
        match class {
            QuotaClass::OracleCalls => &mut self.oracle_calls,
            QuotaClass::OracleTokens => &mut self.oracle_tokens,
            QuotaClass::Dreams => &mut self.dreams,
            QuotaClass::Telegrams => &mut self.telegrams,
            QuotaClass::Postcards => &mut self.postcards,
        }
    }
}

/// Keyed by (device public key, "YYYY-MM-DD" UTC)
type CounterKey = (String, String);

pub struct RateLimiter {
    counters: DashMap<CounterKey, DayCounters>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Today's key, UTC
    pub fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Spend `amount` from a quota class, refusing if it would cross the
    /// daily limit. Returns the new counter value on success.
    pub fn check_and_increment(
        &self,
        public_key: &str,
        class: QuotaClass,
        amount: u64,
        limit: u64,
    ) -> ApiResult<u64> {
        self.check_and_increment_on(public_key, &Self::today(), class, amount, limit)
    }

    /// Same as `check_and_increment` with an explicit day key; rollover
    /// behavior is tested through this seam.
    pub fn check_and_increment_on(
        &self,
        public_key: &str,
        day: &str,
        class: QuotaClass,
        amount: u64,
        limit: u64,
    ) -> ApiResult<u64> {
        let key = (public_key.to_string(), day.to_string());
        let mut entry = self.counters.entry(key).or_default();

        let counter = entry.get_mut(class);
        let current = *counter;
        if current.saturating_add(amount) > limit {
            return Err(ApiError::RateLimited {
                counter: class.name(),
                limit,
                current,
            });
        }
        *counter += amount;
        Ok(*counter)
    }

    /// How much of a quota class is left today
    pub fn remaining_today(&self, public_key: &str, class: QuotaClass, limit: u64) -> u64 {
        let key = (public_key.to_string(), Self::today());
        let used = self
            .counters
            .get(&key)
            .map(|c| c.get(class))
            .unwrap_or(0);
        limit.saturating_sub(used)
    }

    /// Drop rows for days other than today; runs before every snapshot
    /// export so stale days never reach disk
    pub fn prune(&self) {
        let today = Self::today();
        self.counters.retain(|(_, day), _| *day == today);
    }

    /// Export all rows for the persistence snapshot
    pub fn snapshot(&self) -> Vec<(CounterKey, DayCounters)> {
        self.counters
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Restore rows from a persistence snapshot
    pub fn restore(&self, rows: Vec<(CounterKey, DayCounters)>) {
        for (key, counters) in rows {
            self.counters.insert(key, counters);
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increments_until_limit() {
        let limiter = RateLimiter::new();

        for i in 1..=20 {
            let value = limiter
                .check_and_increment_on("dev", "2026-08-26", QuotaClass::Dreams, 1, 20)
                .unwrap();
            assert_eq!(value, i);
        }

        // 21st post of the day is refused, counter unchanged
        let err = limiter
            .check_and_increment_on("dev", "2026-08-26", QuotaClass::Dreams, 1, 20)
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::RateLimited {
                counter: "dreams",
                limit: 20,
                current: 20
            }
        ));
    }

    #[test]
    fn test_day_rollover_resets() {
        let limiter = RateLimiter::new();

        for _ in 0..20 {
            limiter
                .check_and_increment_on("dev", "2026-08-26", QuotaClass::Dreams, 1, 20)
                .unwrap();
        }
        assert!(limiter
            .check_and_increment_on("dev", "2026-08-26", QuotaClass::Dreams, 1, 20)
            .is_err());

        // First post of the next UTC day succeeds
        let value = limiter
            .check_and_increment_on("dev", "2026-08-27", QuotaClass::Dreams, 1, 20)
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_classes_are_independent() {
        let limiter = RateLimiter::new();

        limiter
            .check_and_increment_on("dev", "2026-08-26", QuotaClass::Dreams, 20, 20)
            .unwrap();
        // Dreams exhausted, telegrams untouched
        assert!(limiter
            .check_and_increment_on("dev", "2026-08-26", QuotaClass::Telegrams, 1, 50)
            .is_ok());
    }

    #[test]
    fn test_bulk_amount_refused_at_boundary() {
        let limiter = RateLimiter::new();

        limiter
            .check_and_increment_on("dev", "2026-08-26", QuotaClass::OracleTokens, 9_500, 10_000)
            .unwrap();
        assert!(limiter
            .check_and_increment_on("dev", "2026-08-26", QuotaClass::OracleTokens, 501, 10_000)
            .is_err());
        assert!(limiter
            .check_and_increment_on("dev", "2026-08-26", QuotaClass::OracleTokens, 500, 10_000)
            .is_ok());
    }

    #[test]
    fn test_concurrent_increments_no_lost_updates() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            handles.push(std::thread::spawn(move || {
                let mut granted = 0u64;
                for _ in 0..10 {
                    if limiter
                        .check_and_increment_on("dev", "2026-08-26", QuotaClass::Telegrams, 1, 50)
                        .is_ok()
                    {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 80 attempts against a limit of 50: exactly 50 granted
        assert_eq!(total, 50);
    }

    #[test]
    fn test_prune_drops_stale_days() {
        let limiter = RateLimiter::new();
        limiter
            .check_and_increment_on("dev", "2020-01-01", QuotaClass::Dreams, 1, 20)
            .unwrap();
        limiter
            .check_and_increment("dev", QuotaClass::Dreams, 3, 20)
            .unwrap();

        limiter.prune();

        let rows = limiter.snapshot();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0 .1, RateLimiter::today());
        // Today's spend survives the sweep
        assert_eq!(limiter.remaining_today("dev", QuotaClass::Dreams, 20), 17);
    }

    #[test]
    fn test_remaining_today() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.remaining_today("dev", QuotaClass::Dreams, 20), 20);

        limiter
            .check_and_increment("dev", QuotaClass::Dreams, 3, 20)
            .unwrap();
        assert_eq!(limiter.remaining_today("dev", QuotaClass::Dreams, 20), 17);
    }
}
