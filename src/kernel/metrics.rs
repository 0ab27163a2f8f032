//! System metrics sampled by the optimizer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use sysinfo::System;

/// One sample of the signals the optimizer reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Used / total memory, in [0, 1].
    pub memory_pressure: f64,
    /// Publishes within the configured event window.
    pub event_volume: usize,
    /// Active module footprint / budget.
    pub footprint_ratio: f64,
    pub active_footprint_mb: u64,
    pub budget_mb: u64,
    pub history_len: usize,
    pub sampled_at: DateTime<Utc>,
}

/// Source of the memory-pressure ratio.
pub trait MemoryProbe: Send + Sync + fmt::Debug {
    /// Current used / total memory ratio, clamped to [0, 1].
    fn memory_pressure(&self) -> f64;
}

/// Host memory via `sysinfo`.
pub struct SystemMemoryProbe {
    sys: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemMemoryProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemMemoryProbe").finish_non_exhaustive()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn memory_pressure(&self) -> f64 {
        let mut sys = self.sys.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        (sys.used_memory() as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Probe returning a settable value. Useful for embedding hosts that track
/// memory themselves, and for tests.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    pressure: Mutex<f64>,
}

impl FixedMemoryProbe {
    pub fn new(pressure: f64) -> Self {
        Self {
            pressure: Mutex::new(pressure),
        }
    }

    pub fn set(&self, pressure: f64) {
        *self.pressure.lock() = pressure;
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn memory_pressure(&self) -> f64 {
        self.pressure.lock().clamp(0.0, 1.0)
    }
}
