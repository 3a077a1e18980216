//! Inbound dispatcher: validate, deduplicate, route.
//!
//! Frames are processed strictly in arrival order. Handlers for a kind run in
//! registration order; each is isolated, so an error or panic in one never
//! prevents the rest from running.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::dedup::{CacheStats, DedupCache, derive_key, has_stable_id, key};
use crate::frame::{Frame, MalformedFrame, kind};

type Handler = Box<dyn Fn(&Frame) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// What happened to one raw frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { handlers: usize, failures: usize },
    /// Seen before within the tolerance window. Not an error.
    Duplicate,
    Malformed(MalformedFrame),
    /// New, but nobody is registered for this kind.
    Unhandled,
    /// Heartbeat request from the server; the caller answers it.
    Ping,
    Pong,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub unhandled: u64,
    pub handler_failures: u64,
}

pub struct InboundDispatcher {
    handlers: HashMap<String, Vec<(HandlerId, Handler)>>,
    next_id: u64,
    cache: DedupCache,
    content_dedup: bool,
    stats: DispatchStats,
}

impl InboundDispatcher {
    pub fn new(cache: DedupCache) -> Self {
        Self {
            handlers: HashMap::new(),
            next_id: 0,
            cache,
            content_dedup: false,
            stats: DispatchStats::default(),
        }
    }

    /// Route id-less `message` frames through the content fingerprint path.
    pub fn with_content_dedup(mut self, enabled: bool) -> Self {
        self.content_dedup = enabled;
        self
    }

    /// Register a handler for `kind`. Handlers run in registration order.
    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Frame) -> anyhow::Result<()> + Send + 'static,
    {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(kind.into())
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn off(&mut self, id: HandlerId) -> bool {
        for list in self.handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.get(kind).map_or(0, Vec::len)
    }

    /// Process one raw frame. Never fails; the outcome is informational.
    pub fn on_frame(&mut self, raw: &str) -> DispatchOutcome {
        self.on_frame_at(raw, Utc::now())
    }

    /// [`on_frame`](Self::on_frame) against an explicit clock for cache aging.
    pub fn on_frame_at(&mut self, raw: &str, now: DateTime<Utc>) -> DispatchOutcome {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(error = %e, len = raw.len(), "dropping malformed frame");
                return DispatchOutcome::Malformed(e);
            }
        };
        self.dispatch(&frame, now)
    }

    fn dispatch(&mut self, frame: &Frame, now: DateTime<Utc>) -> DispatchOutcome {
        if frame.is_ping() {
            return DispatchOutcome::Ping;
        }
        if frame.is_pong() {
            return DispatchOutcome::Pong;
        }

        if self.is_duplicate(frame, now) {
            self.stats.duplicates += 1;
            debug!(kind = %frame.kind, timestamp = %frame.timestamp, "duplicate frame absorbed");
            return DispatchOutcome::Duplicate;
        }

        let Some(handlers) = self.handlers.get(&frame.kind).filter(|h| !h.is_empty()) else {
            self.stats.unhandled += 1;
            debug!(kind = %frame.kind, "no handler registered");
            return DispatchOutcome::Unhandled;
        };

        let mut failures = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(frame))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(kind = %frame.kind, handler = id.0, error = %e, "handler failed");
                }
                Err(panic) => {
                    failures += 1;
                    warn!(
                        kind = %frame.kind,
                        handler = id.0,
                        panic = %panic_message(&panic),
                        "handler panicked"
                    );
                }
            }
        }

        let delivered = handlers.len();
        self.stats.delivered += 1;
        self.stats.handler_failures += failures as u64;
        DispatchOutcome::Delivered {
            handlers: delivered,
            failures,
        }
    }

    /// Identity path, or the content path for id-less messages when enabled.
    fn is_duplicate(&mut self, frame: &Frame, now: DateTime<Utc>) -> bool {
        let payload = &frame.payload;
        if self.content_dedup && frame.kind == kind::MESSAGE && !has_stable_id(&frame.kind, payload)
        {
            let content = key::field(payload, "content");
            if !content.is_empty() {
                return self.cache.is_content_duplicate_at(
                    &content,
                    &key::field(payload, "sender_id"),
                    &key::field(payload, "conversation_id"),
                    &frame.timestamp,
                    now,
                );
            }
        }
        let dedup_key = derive_key(&frame.kind, payload, &frame.timestamp);
        self.cache
            .is_duplicate_at(&dedup_key, &frame.kind, &frame.timestamp, now)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Forget every seen key. Resets only; steady-state code never calls this.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
