//! Self-optimization loop.
//!
//! `SelfOptimizer` periodically samples system metrics and applies
//! remediation when a threshold is exceeded:
//! - Memory pressure: clear the Akashic Record and signal `system:memory:low`
//!   (the module manager sheds load in response)
//! - Event congestion: hand over to the [`CongestionPolicy`] (default engages
//!   the publish throttle)
//! - Module imbalance: rebalance modules against the current Telos
//!
//! Every remediating pass publishes one `optimizer:pass:completed` audit
//! envelope. A failing step is published as `optimizer:step:failed` and never
//! stops the remaining steps or the next tick.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::metrics::{MemoryProbe, MetricsSnapshot, SystemMemoryProbe};
use super::recovery::with_recovery;
use crate::bus::EventBus;
use crate::envelope::Envelope;
use crate::events;
use crate::modules::ModuleManager;
use crate::types::{Error, OptimizerConfig, Result};

const SOURCE: &str = "self-optimizer";

// =============================================================================
// Congestion policy
// =============================================================================

/// Reaction to event congestion. Returns the actions taken, as
/// human-readable strings for the audit envelope.
pub trait CongestionPolicy: Send + Sync + fmt::Debug {
    fn relieve(&self, bus: &EventBus, snapshot: &MetricsSnapshot) -> Result<Vec<String>>;
}

/// Default policy: engage the bus publish throttle for a cool-down period.
#[derive(Debug, Clone)]
pub struct ThrottlePolicy {
    pub events_per_second: u32,
    pub cooldown: Duration,
}

impl ThrottlePolicy {
    pub fn from_config(config: &OptimizerConfig) -> Self {
        Self {
            events_per_second: config.throttle_events_per_second,
            cooldown: config.throttle_cooldown,
        }
    }
}

impl CongestionPolicy for ThrottlePolicy {
    fn relieve(&self, bus: &EventBus, snapshot: &MetricsSnapshot) -> Result<Vec<String>> {
        bus.engage_throttle(self.events_per_second, self.cooldown);
        Ok(vec![format!(
            "engaged publish throttle at {} events/s for {:?} ({} events in window)",
            self.events_per_second, self.cooldown, snapshot.event_volume
        )])
    }
}

// =============================================================================
// Pass results
// =============================================================================

/// Why a pass remediated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    MemoryPressure,
    EventCongestion,
    ModuleImbalance,
    /// Throttled publishes are waiting to be reported.
    ThrottleReport,
}

/// Outcome of one remediating pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub triggers: Vec<Trigger>,
    pub actions: Vec<String>,
    pub failures: Vec<String>,
    /// Publishes rejected by the throttle since the previous report, per type.
    pub throttled: BTreeMap<String, u64>,
    pub snapshot: MetricsSnapshot,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// Another pass was already running.
    Skipped,
    /// No threshold exceeded.
    Idle(MetricsSnapshot),
    Remediated(PassReport),
}

/// Statistics about optimizer activity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStats {
    pub passes_run: u64,
    pub passes_skipped: u64,
    pub remediation_actions: u64,
    pub step_failures: u64,
    pub last_pass_at: Option<DateTime<Utc>>,
}

/// Clears the pass flag even if a step unwinds.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// SelfOptimizer
// =============================================================================

/// Periodic control loop over the bus and the module manager.
#[derive(Debug)]
pub struct SelfOptimizer {
    bus: EventBus,
    modules: Arc<ModuleManager>,
    config: OptimizerConfig,
    probe: Arc<dyn MemoryProbe>,
    congestion: Arc<dyn CongestionPolicy>,
    in_pass: AtomicBool,
    stats: Mutex<OptimizerStats>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SelfOptimizer {
    /// Optimizer with the `sysinfo` memory probe and the throttle policy.
    pub fn new(bus: EventBus, modules: Arc<ModuleManager>, config: OptimizerConfig) -> Self {
        Self {
            congestion: Arc::new(ThrottlePolicy::from_config(&config)),
            bus,
            modules,
            config,
            probe: Arc::new(SystemMemoryProbe::new()),
            in_pass: AtomicBool::new(false),
            stats: Mutex::new(OptimizerStats::default()),
            cancel: Mutex::new(None),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_congestion_policy(mut self, policy: Arc<dyn CongestionPolicy>) -> Self {
        self.congestion = policy;
        self
    }

    // =========================================================================
    // Loop control
    // =========================================================================

    /// Start the periodic loop in the background.
    ///
    /// Returns immediately. A loop that is already running is stopped first.
    /// Passes run on the blocking pool since module hooks and handler
    /// fan-outs are synchronous. The task only holds a weak reference, so
    /// dropping the last `Arc<SelfOptimizer>` ends the loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().replace(token.clone()) {
            previous.cancel();
        }
        let weak = Arc::downgrade(self);
        let period = self.config.period;
        tracing::info!(period_ms = period.as_millis() as u64, "optimizer_started");

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(optimizer) = weak.upgrade() else {
                            tracing::info!("optimizer_dropped");
                            break;
                        };
                        match tokio::task::spawn_blocking(move || optimizer.tick()).await {
                            Ok(PassOutcome::Skipped) => tracing::debug!("optimizer_tick_skipped"),
                            Ok(PassOutcome::Idle(_)) => tracing::trace!("optimizer_tick_idle"),
                            Ok(PassOutcome::Remediated(report)) => tracing::debug!(
                                actions = report.actions.len(),
                                "optimizer_tick_remediated"
                            ),
                            Err(err) => tracing::error!(error = %err, "optimizer_tick_join_failed"),
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::info!("optimizer_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the periodic loop.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel
            .lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    // =========================================================================
    // Passes
    // =========================================================================

    /// One scheduled pass: remediate only what exceeds its threshold.
    pub fn tick(&self) -> PassOutcome {
        self.run_pass(false)
    }

    /// Manual trigger: apply the full remediation set now.
    pub fn run_now(&self) -> PassOutcome {
        self.run_pass(true)
    }

    pub fn stats(&self) -> OptimizerStats {
        self.stats.lock().clone()
    }

    /// Sample the metrics the thresholds apply to.
    pub fn sample(&self) -> MetricsSnapshot {
        let active_footprint_mb = self.modules.active_footprint_mb();
        let budget_mb = self.modules.budget_mb();
        MetricsSnapshot {
            memory_pressure: self.probe.memory_pressure(),
            event_volume: self.bus.recent_event_volume(self.config.event_window),
            footprint_ratio: if budget_mb == 0 {
                0.0
            } else {
                active_footprint_mb as f64 / budget_mb as f64
            },
            active_footprint_mb,
            budget_mb,
            history_len: self.bus.history_len(),
            sampled_at: Utc::now(),
        }
    }

    fn run_pass(&self, manual: bool) -> PassOutcome {
        if self
            .in_pass
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.lock().passes_skipped += 1;
            tracing::debug!(manual, "optimizer_pass_skipped");
            return PassOutcome::Skipped;
        }
        let _guard = PassGuard(&self.in_pass);
        self.remediate(manual)
    }

    fn remediate(&self, manual: bool) -> PassOutcome {
        let snapshot = self.sample();
        let throttled_pending = self.bus.throttle_status().throttled_pending_report > 0;

        let mut triggers = Vec::new();
        if manual {
            triggers.push(Trigger::Manual);
        }
        if snapshot.memory_pressure > self.config.memory_pressure_threshold {
            triggers.push(Trigger::MemoryPressure);
        }
        if snapshot.event_volume > self.config.event_volume_threshold {
            triggers.push(Trigger::EventCongestion);
        }
        if snapshot.footprint_ratio > self.config.footprint_ratio_threshold {
            triggers.push(Trigger::ModuleImbalance);
        }
        if throttled_pending {
            triggers.push(Trigger::ThrottleReport);
        }

        {
            let mut stats = self.stats.lock();
            stats.passes_run += 1;
            stats.last_pass_at = Some(snapshot.sampled_at);
        }
        if triggers.is_empty() {
            return PassOutcome::Idle(snapshot);
        }

        let wants = |trigger: Trigger| manual || triggers.contains(&trigger);
        let mut actions = Vec::new();
        let mut failures = Vec::new();

        if wants(Trigger::MemoryPressure) {
            self.step(
                "memory_pressure",
                || self.relieve_memory(&snapshot),
                &mut actions,
                &mut failures,
            );
        }
        if wants(Trigger::EventCongestion) {
            self.step(
                "event_congestion",
                || self.congestion.relieve(&self.bus, &snapshot),
                &mut actions,
                &mut failures,
            );
        }
        if wants(Trigger::ModuleImbalance) {
            self.step(
                "module_imbalance",
                || self.rebalance_modules(),
                &mut actions,
                &mut failures,
            );
        }

        let throttled = self.bus.take_throttled_counts();
        if !throttled.is_empty() {
            let total: u64 = throttled.values().sum();
            actions.push(format!(
                "reported {} throttled events across {} types",
                total,
                throttled.len()
            ));
        }

        let report = PassReport {
            triggers,
            actions,
            failures,
            throttled,
            snapshot,
        };
        self.stats.lock().remediation_actions += report.actions.len() as u64;

        tracing::info!(
            triggers = ?report.triggers,
            actions = ?report.actions,
            failures = report.failures.len(),
            "optimizer_pass_completed"
        );
        let published = self.bus.publish(
            Envelope::draft(events::OPTIMIZER_PASS_COMPLETED, SOURCE)
                .with_label(events::AUDIT_LABEL)
                .with_payload(json!({
                    "triggers": report.triggers,
                    "actions": report.actions,
                    "failures": report.failures,
                    "throttled": report.throttled,
                    "snapshot": report.snapshot,
                })),
        );
        if let Err(err) = published {
            tracing::error!(error = %err, "optimizer_audit_not_published");
        }
        PassOutcome::Remediated(report)
    }

    /// Run one remediation step in isolation.
    fn step<F>(&self, name: &str, step: F, actions: &mut Vec<String>, failures: &mut Vec<String>)
    where
        F: FnOnce() -> Result<Vec<String>>,
    {
        match with_recovery(step, &format!("optimizer:{}", name)) {
            Ok(done) => actions.extend(done),
            Err(err) => {
                let err = Error::optimization(format!("{} step failed: {}", name, err));
                tracing::error!(step = name, error = %err, "optimizer_step_failed");
                self.stats.lock().step_failures += 1;

                let published = self.bus.publish(
                    Envelope::draft(events::OPTIMIZER_STEP_FAILED, SOURCE)
                        .with_labels([events::AUDIT_LABEL, events::ERROR_LABEL])
                        .with_payload(json!({
                            "step": name,
                            "code": err.code(),
                            "message": err.to_string(),
                        })),
                );
                if let Err(publish_err) = published {
                    tracing::error!(error = %publish_err, "optimizer_step_failure_not_published");
                }
                failures.push(err.to_string());
            }
        }
    }

    fn relieve_memory(&self, snapshot: &MetricsSnapshot) -> Result<Vec<String>> {
        let removed = self.bus.clear(SOURCE)?;
        let mut actions = vec![format!("cleared {} events", removed)];

        let active_before = self.modules.active_count();
        self.bus.publish(
            Envelope::draft(events::MEMORY_LOW, SOURCE)
                .with_label(events::AUDIT_LABEL)
                .with_payload(json!({ "memory_pressure": snapshot.memory_pressure })),
        )?;
        let shed = active_before.saturating_sub(self.modules.active_count());
        actions.push(format!("signalled low memory; deactivated {} modules", shed));
        Ok(actions)
    }

    fn rebalance_modules(&self) -> Result<Vec<String>> {
        let report = self.modules.rebalance()?;
        Ok(vec![format!(
            "rebalanced modules: {} activated, {} deactivated, {} skipped",
            report.activated.len(),
            report.deactivated.len(),
            report.skipped.len()
        )])
    }
}

impl Drop for SelfOptimizer {
    fn drop(&mut self) {
        self.stop();
    }
}
