//! Event bus - semantic publish/subscribe with bounded history.
//!
//! All event traffic inside the core flows through one [`EventBus`] instance,
//! enabling:
//!   - Pattern routing (`module:*:activated`, single-segment wildcard)
//!   - Essence-label filtering on top of type patterns
//!   - A bounded, queryable history (the Akashic Record)
//!   - Congestion throttling driven by the optimizer
//!   - Fault isolation: a failing handler never affects the publisher or the
//!     other handlers of the same event
//!
//! Dispatch is synchronous: `publish` returns after every matching handler
//! was invoked, in registration order. No bus lock is held while handlers run,
//! so handlers may publish, subscribe or unsubscribe re-entrantly. A nested
//! publish is delivered depth-first.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::envelope::{Envelope, EnvelopeDraft, EventPattern};
use crate::events;
use crate::kernel::recovery::with_recovery;
use crate::types::{BusConfig, Error, Result};

mod record;
mod throttle;

pub use record::HistoryQuery;
pub use throttle::ThrottleStatus;

use record::AkashicRecord;
use throttle::PublishThrottle;

/// Handler signature. Errors are isolated and logged by the bus.
pub type HandlerFn = dyn Fn(&Envelope) -> Result<()> + Send + Sync;

// =============================================================================
// Subscriptions
// =============================================================================

struct Subscriber {
    seq: u64,
    subscriber_id: String,
    pattern: EventPattern,
    labels: Option<BTreeSet<String>>,
    handler: Box<HandlerFn>,
    active: AtomicBool,
}

impl Subscriber {
    fn wants(&self, envelope: &Envelope) -> bool {
        self.pattern.matches(envelope.event_type())
            && self
                .labels
                .as_ref()
                .map_or(true, |labels| envelope.has_any_label(labels))
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("seq", &self.seq)
            .field("subscriber_id", &self.subscriber_id)
            .field("pattern", &self.pattern)
            .field("labels", &self.labels)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Receipt returned by `subscribe`; `unsubscribe()` is idempotent.
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    subscriber: Arc<Subscriber>,
    bus: Weak<BusShared>,
}

impl SubscriptionHandle {
    /// Remove the subscription. Returns `true` only for the call that
    /// actually removed it. Safe from inside the handler being removed: the
    /// handler will not be invoked again, including for events already being
    /// dispatched.
    pub fn unsubscribe(&self) -> bool {
        if !self.subscriber.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .write()
                .retain(|s| s.seq != self.subscriber.seq);
        }
        tracing::debug!(
            subscriber = %self.subscriber.subscriber_id,
            pattern = %self.subscriber.pattern,
            "unsubscribed"
        );
        true
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::SeqCst)
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber.subscriber_id
    }

    pub fn pattern(&self) -> &EventPattern {
        &self.subscriber.pattern
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub envelope: Arc<Envelope>,
    /// Handlers invoked, including ones that failed.
    pub delivered: usize,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub handler_invocations: u64,
    pub handler_failures: u64,
    pub events_throttled: u64,
    pub active_subscriptions: usize,
    pub history_len: usize,
    pub history_capacity: usize,
    pub history_evicted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    invocations: AtomicU64,
    failures: AtomicU64,
    throttled: AtomicU64,
}

// =============================================================================
// EventBus
// =============================================================================

#[derive(Debug)]
struct BusShared {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    record: Mutex<AkashicRecord>,
    throttle: Mutex<PublishThrottle>,
    volume: Mutex<VecDeque<Instant>>,
    volume_retention: Duration,
    next_seq: AtomicU64,
    counters: Counters,
}

/// In-process event bus. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Create a new bus from configuration.
    pub fn new(config: &BusConfig) -> Self {
        Self {
            shared: Arc::new(BusShared {
                subscribers: RwLock::new(Vec::new()),
                record: Mutex::new(AkashicRecord::new(config.history_capacity)),
                throttle: Mutex::new(PublishThrottle::new(
                    config.throttle_exempt_roots.iter().cloned(),
                )),
                volume: Mutex::new(VecDeque::new()),
                volume_retention: config.volume_retention,
                next_seq: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Bus with default configuration and the given history capacity.
    pub fn with_capacity(history_capacity: usize) -> Self {
        Self::new(&BusConfig {
            history_capacity,
            ..BusConfig::default()
        })
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Publish an envelope.
    ///
    /// Fills the timestamp, validates the type, records the envelope in
    /// history, then invokes every matching handler in registration order.
    /// Handler failures are logged and counted, never returned.
    pub fn publish(&self, draft: EnvelopeDraft) -> Result<PublishReceipt> {
        let envelope = Arc::new(draft.seal(Utc::now())?);
        let now = Instant::now();

        if let Err(err) = self.shared.throttle.lock().check(envelope.event_type(), now) {
            self.shared.counters.throttled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event_type = %envelope.event_type(), "publish_throttled");
            return Err(err);
        }

        if let Some(evicted) = self.shared.record.lock().append(envelope.clone()) {
            tracing::trace!(evicted = %evicted.id(), "akashic_record_evicted");
        }
        self.note_volume(now);
        self.shared.counters.published.fetch_add(1, Ordering::Relaxed);

        let delivered = self.dispatch(&envelope);

        tracing::debug!(
            event_type = %envelope.event_type(),
            source = %envelope.source_id(),
            delivered,
            "published"
        );

        Ok(PublishReceipt {
            envelope,
            delivered,
        })
    }

    fn dispatch(&self, envelope: &Envelope) -> usize {
        let matching: Vec<Arc<Subscriber>> = self
            .shared
            .subscribers
            .read()
            .iter()
            .filter(|s| s.wants(envelope))
            .cloned()
            .collect();

        let mut delivered = 0;
        for subscriber in matching {
            // Unsubscribed by an earlier handler of this same dispatch.
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            delivered += 1;
            self.shared
                .counters
                .invocations
                .fetch_add(1, Ordering::Relaxed);

            let outcome = with_recovery(
                || (subscriber.handler)(envelope),
                &subscriber.subscriber_id,
            );
            if let Err(err) = outcome {
                self.shared.counters.failures.fetch_add(1, Ordering::Relaxed);
                let isolated = Error::handler(format!(
                    "subscriber '{}' failed on '{}': {}",
                    subscriber.subscriber_id,
                    envelope.event_type(),
                    err
                ));
                tracing::warn!(
                    subscriber = %subscriber.subscriber_id,
                    event_type = %envelope.event_type(),
                    error = %isolated,
                    "handler_failed"
                );
            }
        }
        delivered
    }

    fn note_volume(&self, now: Instant) {
        let mut volume = self.shared.volume.lock();
        volume.push_back(now);
        while let Some(&ts) = volume.front() {
            if now.duration_since(ts) > self.shared.volume_retention {
                volume.pop_front();
            } else {
                break;
            }
        }
    }

    // =========================================================================
    // Subscribe
    // =========================================================================

    /// Subscribe `handler` to every type matching `pattern`.
    ///
    /// The pattern is compiled immediately; malformed patterns fail here.
    pub fn subscribe<F>(
        &self,
        subscriber_id: impl Into<String>,
        pattern: &str,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    {
        self.register(subscriber_id.into(), pattern, None, Box::new(handler))
    }

    /// Like [`subscribe`](Self::subscribe), but the envelope must also carry
    /// at least one of `labels`.
    pub fn subscribe_with_labels<F, I, S>(
        &self,
        subscriber_id: impl Into<String>,
        pattern: &str,
        labels: I,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: BTreeSet<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(Error::validation("label filter cannot be empty"));
        }
        self.register(subscriber_id.into(), pattern, Some(labels), Box::new(handler))
    }

    fn register(
        &self,
        subscriber_id: String,
        pattern: &str,
        labels: Option<BTreeSet<String>>,
        handler: Box<HandlerFn>,
    ) -> Result<SubscriptionHandle> {
        crate::validation::validate_non_empty(&subscriber_id, "subscriber_id")?;
        let pattern = EventPattern::parse(pattern)?;

        let subscriber = Arc::new(Subscriber {
            seq: self.shared.next_seq.fetch_add(1, Ordering::SeqCst),
            subscriber_id,
            pattern,
            labels,
            handler,
            active: AtomicBool::new(true),
        });
        self.shared.subscribers.write().push(subscriber.clone());

        tracing::debug!(
            subscriber = %subscriber.subscriber_id,
            pattern = %subscriber.pattern,
            "subscribed"
        );

        Ok(SubscriptionHandle {
            subscriber,
            bus: Arc::downgrade(&self.shared),
        })
    }

    /// Same as `handle.unsubscribe()`.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        handle.unsubscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().len()
    }

    // =========================================================================
    // History
    // =========================================================================

    /// Time-ordered envelopes from the Akashic Record matching `query`.
    pub fn query(&self, query: &HistoryQuery) -> Vec<Arc<Envelope>> {
        self.shared.record.lock().query(query)
    }

    /// Evict all history and publish an audit envelope with the count.
    pub fn clear(&self, requested_by: &str) -> Result<usize> {
        let removed = self.shared.record.lock().clear();
        tracing::info!(removed, requested_by, "akashic_record_cleared");

        self.publish(
            Envelope::draft(events::AKASHIC_CLEARED, events::CORE_SOURCE)
                .with_label(events::AUDIT_LABEL)
                .with_payload(serde_json::json!({
                    "removed": removed,
                    "requested_by": requested_by,
                })),
        )?;
        Ok(removed)
    }

    pub fn history_len(&self) -> usize {
        self.shared.record.lock().len()
    }

    /// Publishes within `window` (independent of history clears).
    pub fn recent_event_volume(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.shared
            .volume
            .lock()
            .iter()
            .rev()
            .take_while(|&&ts| now.duration_since(ts) <= window)
            .count()
    }

    // =========================================================================
    // Throttle
    // =========================================================================

    /// Engage the publish throttle for `cooldown`.
    pub fn engage_throttle(&self, events_per_second: u32, cooldown: Duration) {
        self.shared
            .throttle
            .lock()
            .engage(events_per_second, cooldown, Instant::now());
        tracing::info!(
            events_per_second,
            cooldown_ms = cooldown.as_millis() as u64,
            "publish_throttle_engaged"
        );
    }

    pub fn disengage_throttle(&self) {
        self.shared.throttle.lock().disengage();
    }

    pub fn throttle_status(&self) -> ThrottleStatus {
        self.shared.throttle.lock().status(Instant::now())
    }

    /// Per-type rejection counts since the last call.
    pub fn take_throttled_counts(&self) -> BTreeMap<String, u64> {
        self.shared.throttle.lock().take_throttled()
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get current bus statistics.
    pub fn stats(&self) -> BusStats {
        let record = self.shared.record.lock();
        let counters = &self.shared.counters;
        BusStats {
            events_published: counters.published.load(Ordering::Relaxed),
            handler_invocations: counters.invocations.load(Ordering::Relaxed),
            handler_failures: counters.failures.load(Ordering::Relaxed),
            events_throttled: counters.throttled.load(Ordering::Relaxed),
            active_subscriptions: self.shared.subscribers.read().len(),
            history_len: record.len(),
            history_capacity: record.capacity(),
            history_evicted: record.evicted_total(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(&BusConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
