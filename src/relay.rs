//! Store-and-forward relay for encrypted telegrams
//!
//! Payloads are ciphertext end to end; the relay never decrypts and never
//! validates plaintext structure. Polling an inbox returns undelivered
//! telegrams oldest-first and marks them delivered under the same inbox
//! lock. Delivery is at-most-once per poll, but a crash between read and
//! persist can redeliver; callers needing stronger guarantees must
//! deduplicate on telegram id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::{DeviceKey, Telegram};

pub struct TelegramRelay {
    /// Inbox per recipient; vec order is arrival order
    inboxes: DashMap<DeviceKey, Vec<Telegram>>,
}

impl TelegramRelay {
    pub fn new() -> Self {
        Self {
            inboxes: DashMap::new(),
        }
    }

    /// Store an undelivered telegram in the recipient's inbox
    pub fn deposit(&self, telegram: Telegram) {
        self.inboxes
            .entry(telegram.to_public_key.clone())
            .or_default()
            .push(telegram);
    }

    /// Fetch up to `limit` undelivered telegrams, oldest first, and mark
    /// every returned one delivered in the same operation.
    pub fn poll_inbox(&self, recipient: &str, limit: usize) -> Vec<Telegram> {
        let Some(mut inbox) = self.inboxes.get_mut(recipient) else {
            return Vec::new();
        };

        let now = Utc::now();
        let mut delivered = Vec::new();
        for telegram in inbox.iter_mut() {
            if delivered.len() >= limit {
                break;
            }
            if telegram.delivered {
                continue;
            }
            telegram.delivered = true;
            telegram.delivered_at = Some(now);
            delivered.push(telegram.clone());
        }
        delivered
    }

    /// Drop telegrams past their expiry, delivered or not. Returns the
    /// number removed.
    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut inbox in self.inboxes.iter_mut() {
            let before = inbox.len();
            inbox.retain(|t| t.expires_at.map(|e| e > now).unwrap_or(true));
            removed += before - inbox.len();
        }
        removed
    }

    pub fn undelivered_count(&self) -> usize {
        self.inboxes
            .iter()
            .map(|r| r.value().iter().filter(|t| !t.delivered).count())
            .sum()
    }

    pub fn snapshot(&self) -> Vec<Telegram> {
        self.inboxes.iter().flat_map(|r| r.value().clone()).collect()
    }

    pub fn restore(&self, telegrams: Vec<Telegram>) {
        for telegram in telegrams {
            self.inboxes
                .entry(telegram.to_public_key.clone())
                .or_default()
                .push(telegram);
        }
        // Arrival order within each inbox
        for mut inbox in self.inboxes.iter_mut() {
            inbox.sort_by_key(|t| t.created_at);
        }
    }
}

impl Default for TelegramRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn telegram(from: &str, to: &str, created_at: DateTime<Utc>) -> Telegram {
        Telegram {
            id: Uuid::new_v4(),
            from_public_key: from.to_string(),
            to_public_key: to.to_string(),
            encrypted_content: "b64ciphertext".to_string(),
            content_nonce: "aabb".to_string(),
            sender_encryption_key: "cc".repeat(32),
            signature: "sig".to_string(),
            delivered: false,
            delivered_at: None,
            created_at,
            expires_at: Some(created_at + Duration::days(7)),
        }
    }

    #[test]
    fn test_poll_marks_delivered() {
        let relay = TelegramRelay::new();
        relay.deposit(telegram("a", "b", Utc::now()));

        let first = relay.poll_inbox("b", 50);
        assert_eq!(first.len(), 1);
        assert!(first[0].delivered);
        assert!(first[0].delivered_at.is_some());

        // Second poll returns nothing
        assert!(relay.poll_inbox("b", 50).is_empty());
        assert_eq!(relay.undelivered_count(), 0);
    }

    #[test]
    fn test_poll_oldest_first() {
        let relay = TelegramRelay::new();
        let base = Utc::now();
        for i in 0..3 {
            relay.deposit(telegram("a", "b", base + Duration::seconds(i)));
        }

        let polled = relay.poll_inbox("b", 50);
        assert_eq!(polled.len(), 3);
        assert!(polled[0].created_at <= polled[1].created_at);
        assert!(polled[1].created_at <= polled[2].created_at);
    }

    #[test]
    fn test_poll_respects_limit() {
        let relay = TelegramRelay::new();
        for _ in 0..5 {
            relay.deposit(telegram("a", "b", Utc::now()));
        }

        assert_eq!(relay.poll_inbox("b", 2).len(), 2);
        assert_eq!(relay.poll_inbox("b", 50).len(), 3);
    }

    #[test]
    fn test_inboxes_are_isolated() {
        let relay = TelegramRelay::new();
        relay.deposit(telegram("a", "b", Utc::now()));
        relay.deposit(telegram("a", "c", Utc::now()));

        assert_eq!(relay.poll_inbox("b", 50).len(), 1);
        assert_eq!(relay.poll_inbox("c", 50).len(), 1);
        assert!(relay.poll_inbox("a", 50).is_empty());
    }

    #[test]
    fn test_cleanup_expired_regardless_of_delivery() {
        let relay = TelegramRelay::new();
        let old = Utc::now() - Duration::days(10);
        relay.deposit(telegram("a", "b", old)); // expired, undelivered
        let mut delivered_old = telegram("a", "b", old);
        delivered_old.delivered = true;
        relay.deposit(delivered_old); // expired, delivered
        relay.deposit(telegram("a", "b", Utc::now())); // fresh

        assert_eq!(relay.cleanup_expired(Utc::now()), 2);
        assert_eq!(relay.poll_inbox("b", 50).len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_order() {
        let relay = TelegramRelay::new();
        let base = Utc::now();
        for i in 0..3 {
            relay.deposit(telegram("a", "b", base + Duration::seconds(i)));
        }

        let restored = TelegramRelay::new();
        restored.restore(relay.snapshot());

        let polled = restored.poll_inbox("b", 50);
        assert_eq!(polled.len(), 3);
        assert!(polled[0].created_at <= polled[2].created_at);
    }
}
