//! Akashic Record - bounded in-memory event history.
//!
//! A FIFO ring of the most recent envelopes. Size never exceeds capacity;
//! the oldest entry is evicted first. Not durable across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::envelope::{has_segment_prefix, Envelope};

/// Filter for [`crate::bus::EventBus::query`].
///
/// All set criteria must hold. `limit` keeps the most recent matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Inclusive lower bound on timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
    /// Whole-segment type prefix (`module` matches `module:x:activated`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_prefix: Option<String>,
    /// Label the envelope must carry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, ts: DateTime<Utc>) -> Self {
        self.since = Some(ts);
        self
    }

    pub fn until(mut self, ts: DateTime<Utc>) -> Self {
        self.until = Some(ts);
        self
    }

    pub fn type_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.type_prefix = Some(prefix.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label_contains = Some(label.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn accepts(&self, envelope: &Envelope) -> bool {
        let ts = envelope.timestamp();
        if self.since.is_some_and(|since| ts < since) {
            return false;
        }
        if self.until.is_some_and(|until| ts > until) {
            return false;
        }
        if let Some(prefix) = &self.type_prefix {
            if !has_segment_prefix(envelope.event_type(), prefix) {
                return false;
            }
        }
        if let Some(label) = &self.label_contains {
            if !envelope.has_label(label) {
                return false;
            }
        }
        true
    }
}

/// Bounded FIFO history of published envelopes.
#[derive(Debug)]
pub(crate) struct AkashicRecord {
    capacity: usize,
    entries: VecDeque<Arc<Envelope>>,
    evicted_total: u64,
}

impl AkashicRecord {
    /// `capacity` is validated positive by config; 0 is clamped to 1.
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(4096)),
            evicted_total: 0,
        }
    }

    /// Append, evicting and returning the oldest entry when full.
    pub(crate) fn append(&mut self, envelope: Arc<Envelope>) -> Option<Arc<Envelope>> {
        let evicted = if self.entries.len() >= self.capacity {
            self.evicted_total += 1;
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(envelope);
        evicted
    }

    /// Matching entries in ascending time order (publish order breaks ties).
    pub(crate) fn query(&self, query: &HistoryQuery) -> Vec<Arc<Envelope>> {
        let mut matches: Vec<Arc<Envelope>> = self
            .entries
            .iter()
            .filter(|e| query.accepts(e))
            .cloned()
            .collect();
        // Stable: equal timestamps keep publish order.
        matches.sort_by_key(|e| e.timestamp());

        if let Some(limit) = query.limit {
            if matches.len() > limit {
                matches.drain(..matches.len() - limit);
            }
        }
        matches
    }

    /// Remove everything, returning how many entries were dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}
