//! Packet fingerprinting against duplicate delivery.
//!
//! A store-and-forward mesh retransmits packets along multiple paths, so the
//! same logical message routinely arrives more than once. The TTL window
//! must outlast typical retransmission windows; duplicates inside it are
//! expected traffic, not errors.

use meshtastic::protobufs;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::time::Instant;

/// Window within which an identical fingerprint is treated as a duplicate.
pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Composite fingerprint of one routed application packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub port: u32,
    pub from: u32,
    pub packet_id: u32,
    pub channel: u32,
}

impl DedupeKey {
    /// Fingerprint for a text-message packet.
    pub fn text(from: u32, packet_id: u32, channel: u32) -> Self {
        Self {
            port: protobufs::PortNum::TextMessageApp as u32,
            from,
            packet_id,
            channel,
        }
    }
}

/// TTL-bounded set of recently seen packet fingerprints.
///
/// Touched by exactly one consumer processing frames one at a time; the
/// at-most-once guarantee needs no further locking.
#[derive(Debug)]
pub struct PacketDedupe {
    ttl: Duration,
    seen: HashMap<DedupeKey, Instant>,
}

impl PacketDedupe {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_DEDUPE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: HashMap::new(),
        }
    }

    /// Accept a fingerprint at most once per TTL window.
    ///
    /// Returns `true` when the key is new (and marks it seen), `false` when
    /// it is a duplicate within the window.
    pub fn check_and_mark(&mut self, key: DedupeKey) -> bool {
        let now = Instant::now();
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);

        match self.seen.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

impl Default for PacketDedupe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_ttl_is_rejected() {
        let mut dedupe = PacketDedupe::new();
        let key = DedupeKey::text(0x11111111, 42, 0);

        assert!(dedupe.check_and_mark(key));
        assert!(!dedupe.check_and_mark(key));

        time::advance(Duration::from_secs(60)).await;
        assert!(!dedupe.check_and_mark(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmission_after_ttl_is_accepted() {
        let mut dedupe = PacketDedupe::new();
        let key = DedupeKey::text(0x11111111, 42, 0);

        assert!(dedupe.check_and_mark(key));
        time::advance(DEFAULT_DEDUPE_TTL + Duration::from_secs(1)).await;
        assert!(dedupe.check_and_mark(key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_are_independent() {
        let mut dedupe = PacketDedupe::new();
        assert!(dedupe.check_and_mark(DedupeKey::text(1, 42, 0)));
        assert!(dedupe.check_and_mark(DedupeKey::text(2, 42, 0)));
        assert!(dedupe.check_and_mark(DedupeKey::text(1, 43, 0)));
        assert!(dedupe.check_and_mark(DedupeKey::text(1, 42, 1)));
        assert_eq!(dedupe.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_pruned() {
        let mut dedupe = PacketDedupe::with_ttl(Duration::from_secs(10));
        assert!(dedupe.check_and_mark(DedupeKey::text(1, 1, 0)));
        time::advance(Duration::from_secs(11)).await;
        assert!(dedupe.check_and_mark(DedupeKey::text(2, 2, 0)));
        // The first entry aged out during the second check.
        assert_eq!(dedupe.len(), 1);
    }
}
