//! Bounded, time-windowed cache of recently processed event keys.
//!
//! Two independent duplicate checks share one store:
//! - the identity path (`is_duplicate`), keyed by [`key::derive_key`], with a
//!   1 second tolerance window;
//! - the content path (`is_content_duplicate`), keyed by a content
//!   fingerprint for payloads without a stable id, with a 5 second window.
//!
//! Cleanup is opportunistic: every lookup first drops records older than
//! `max_age`, then trims the oldest records down to `max_entries`. There is no
//! background task.

pub mod key;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use key::{derive_key, has_stable_id};

/// Default maximum number of records.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Default maximum record age.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300); // 5 minutes

/// Repeats of an identity key closer than this are duplicates.
pub const IDENTITY_TOLERANCE: Duration = Duration::from_millis(1000);

/// Repeats of a content fingerprint closer than this are duplicates.
pub const CONTENT_TOLERANCE: Duration = Duration::from_millis(5000);

const CONTENT_KIND: &str = "content";

/// First observation of a key. Never updated on a repeat.
#[derive(Debug, Clone)]
struct Record {
    kind: String,
    seen_at_millis: i64,
}

/// Read-only diagnostics over the current records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub total_processed: usize,
    /// Live records per event kind; content-path records count as `content`.
    pub by_kind: BTreeMap<String, usize>,
    /// Milliseconds since the epoch, 0 when empty.
    pub oldest_timestamp: i64,
    /// Milliseconds since the epoch, 0 when empty.
    pub newest_timestamp: i64,
}

pub struct DedupCache {
    records: HashMap<String, Record>,
    max_entries: usize,
    max_age: Duration,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_AGE)
    }

    pub fn with_limits(max_entries: usize, max_age: Duration) -> Self {
        Self {
            records: HashMap::new(),
            max_entries: max_entries.max(1),
            max_age,
        }
    }

    /// Identity-path check. Records the key on first sight.
    pub fn is_duplicate(&mut self, key: &str, kind: &str, timestamp: &str) -> bool {
        self.is_duplicate_at(key, kind, timestamp, Utc::now())
    }

    pub fn is_duplicate_at(
        &mut self,
        key: &str,
        kind: &str,
        timestamp: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.check(key, kind, timestamp, IDENTITY_TOLERANCE, now)
    }

    /// Content-path check for payloads that carry no stable id.
    pub fn is_content_duplicate(
        &mut self,
        content: &str,
        sender_id: &str,
        conversation_id: &str,
        timestamp: &str,
    ) -> bool {
        self.is_content_duplicate_at(content, sender_id, conversation_id, timestamp, Utc::now())
    }

    pub fn is_content_duplicate_at(
        &mut self,
        content: &str,
        sender_id: &str,
        conversation_id: &str,
        timestamp: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let key = content_key(content, sender_id, conversation_id);
        self.check(&key, CONTENT_KIND, timestamp, CONTENT_TOLERANCE, now)
    }

    fn check(
        &mut self,
        key: &str,
        kind: &str,
        timestamp: &str,
        tolerance: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let now_millis = now.timestamp_millis();
        self.cleanup(now_millis);

        // Unparseable timestamps fall back to the observation time.
        let seen_at_millis = parse_millis(timestamp).unwrap_or(now_millis);

        if let Some(existing) = self.records.get(key) {
            let delta = existing.seen_at_millis.abs_diff(seen_at_millis);
            // Outside the window this is a new occurrence in the same bucket;
            // the first record keeps its timestamp.
            return u128::from(delta) < tolerance.as_millis();
        }

        if self.records.len() >= self.max_entries {
            self.evict_oldest(self.records.len() + 1 - self.max_entries);
        }
        self.records.insert(
            key.to_string(),
            Record {
                kind: kind.to_string(),
                seen_at_millis,
            },
        );
        false
    }

    /// Age-based eviction, then capacity-based eviction.
    fn cleanup(&mut self, now_millis: i64) {
        let max_age_millis = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        self.records
            .retain(|_, r| now_millis.saturating_sub(r.seen_at_millis) <= max_age_millis);

        if self.records.len() > self.max_entries {
            self.evict_oldest(self.records.len() - self.max_entries);
        }
    }

    fn evict_oldest(&mut self, count: usize) {
        let mut by_age: Vec<(i64, String)> = self
            .records
            .iter()
            .map(|(k, r)| (r.seen_at_millis, k.clone()))
            .collect();
        by_age.sort();
        for (_, key) in by_age.into_iter().take(count) {
            self.records.remove(&key);
        }
    }

    /// Empty the cache. Test isolation and resets only.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let mut stamps = self.records.values().map(|r| r.seen_at_millis);
        let Some(first) = stamps.next() else {
            return CacheStats::default();
        };
        let (oldest, newest) = stamps.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
        let mut by_kind = BTreeMap::new();
        for record in self.records.values() {
            *by_kind.entry(record.kind.clone()).or_insert(0) += 1;
        }
        CacheStats {
            total_processed: self.records.len(),
            by_kind,
            oldest_timestamp: oldest,
            newest_timestamp: newest,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.contains_key(key)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Fingerprint used by the content path.
pub fn content_key(content: &str, sender_id: &str, conversation_id: &str) -> String {
    format!("{CONTENT_KIND}:{conversation_id}:{sender_id}:{content}")
}

fn parse_millis(timestamp: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.timestamp_millis())
}
