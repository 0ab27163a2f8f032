//! Publish throttling.
//!
//! Sliding-window limiter the optimizer engages when the bus is congested.
//! While engaged, non-exempt publishes beyond `events_per_second` are rejected
//! with [`Error::Throttled`]. Every rejection is counted per event type and
//! reported back to the optimizer, so nothing is dropped silently.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::envelope::root_segment;
use crate::events::CORE_ROOTS;
use crate::types::{Error, Result};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Engagement {
    events_per_second: u32,
    until: Instant,
}

/// Snapshot of the throttle for state reporting.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ThrottleStatus {
    pub engaged: bool,
    pub events_per_second: Option<u32>,
    pub remaining_ms: Option<u64>,
    pub throttled_pending_report: u64,
}

#[derive(Debug)]
pub(crate) struct PublishThrottle {
    exempt_roots: HashSet<String>,
    engagement: Option<Engagement>,
    timestamps: VecDeque<Instant>,
    throttled_by_type: BTreeMap<String, u64>,
}

impl PublishThrottle {
    pub(crate) fn new<I, S>(exempt_roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exempt_roots: exempt_roots
                .into_iter()
                .map(Into::into)
                .chain(CORE_ROOTS.iter().map(|r| r.to_string()))
                .collect(),
            engagement: None,
            timestamps: VecDeque::new(),
            throttled_by_type: BTreeMap::new(),
        }
    }

    pub(crate) fn engage(&mut self, events_per_second: u32, cooldown: Duration, now: Instant) {
        self.engagement = Some(Engagement {
            events_per_second,
            until: now + cooldown,
        });
        self.timestamps.clear();
    }

    pub(crate) fn disengage(&mut self) {
        self.engagement = None;
        self.timestamps.clear();
    }

    /// Whether the throttle is engaged, expiring it when the cool-down is over.
    pub(crate) fn is_engaged(&mut self, now: Instant) -> bool {
        match self.engagement {
            Some(e) if now < e.until => true,
            Some(_) => {
                tracing::info!("publish_throttle_disengaged");
                self.disengage();
                false
            }
            None => false,
        }
    }

    /// Admit or reject one publish.
    pub(crate) fn check(&mut self, event_type: &str, now: Instant) -> Result<()> {
        if !self.is_engaged(now) || self.exempt_roots.contains(root_segment(event_type)) {
            return Ok(());
        }
        let limit = self
            .engagement
            .map(|e| e.events_per_second)
            .unwrap_or(u32::MAX);

        while let Some(&ts) = self.timestamps.front() {
            if now.duration_since(ts) >= WINDOW {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.timestamps.len() >= limit as usize {
            *self
                .throttled_by_type
                .entry(event_type.to_string())
                .or_default() += 1;
            return Err(Error::throttled(format!(
                "bus congested: '{}' exceeds {} events per second",
                event_type, limit
            )));
        }

        self.timestamps.push_back(now);
        Ok(())
    }

    /// Drain per-type rejection counts accumulated since the last report.
    pub(crate) fn take_throttled(&mut self) -> BTreeMap<String, u64> {
        std::mem::take(&mut self.throttled_by_type)
    }

    pub(crate) fn status(&mut self, now: Instant) -> ThrottleStatus {
        let engaged = self.is_engaged(now);
        ThrottleStatus {
            engaged,
            events_per_second: self.engagement.map(|e| e.events_per_second),
            remaining_ms: self
                .engagement
                .map(|e| e.until.saturating_duration_since(now).as_millis() as u64),
            throttled_pending_report: self.throttled_by_type.values().sum(),
        }
    }
}
