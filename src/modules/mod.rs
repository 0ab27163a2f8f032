//! Module lifecycle management.
//!
//! The [`ModuleManager`] owns the registry of pluggable modules and drives
//! each one through its state machine:
//! REGISTERED → INITIALIZING → INITIALIZED → ACTIVATING → ACTIVE →
//! DEACTIVATING → DORMANT → DESTROYING → DESTROYED, with FAILED reachable
//! from INITIALIZING and ACTIVATING.
//!
//! Locking: the registry lock is held only to read or flip entry state.
//! Module hooks, alignment scoring and bus publishes all run with it
//! released. A transitional state on the entry guards against a second
//! transition of the same module while a hook is running.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bus::{EventBus, SubscriptionHandle};
use crate::envelope::Envelope;
use crate::events;
use crate::kernel::recovery::with_recovery;
use crate::types::{Error, ModuleId, ModulesConfig, Result};

mod alignment;
mod budget;
mod capability;
mod types;

pub use crate::types::EvictionOrder;
pub use alignment::{AlignmentStrategy, WeightedOverlap};
pub use capability::{CapabilityKey, ExposedItems};
pub use types::{ModuleManifest, ModuleState, ModuleSummary, Telos, TelosReport};

use budget::{BudgetPlan, Occupant};

/// Eviction rounds attempted before an activation gives up on a contended
/// budget.
const MAX_EVICTION_ROUNDS: usize = 4;

/// Hooks of a pluggable module.
///
/// Hooks run on the caller's thread with no manager lock held. Errors and
/// panics are isolated: a failing `initialize` or `activate` moves the module
/// to FAILED, a failing `deactivate` or `destroy` is logged and the module is
/// moved on regardless. When the optimizer triggers them they run on the
/// Tokio blocking pool, so a slow hook delays the next pass but never a
/// runtime worker.
pub trait Module: Send {
    fn initialize(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    /// Bring the module online and expose its capability handles.
    fn activate(&mut self, ctx: &ModuleContext, exposed: &mut ExposedItems) -> Result<()>;

    fn deactivate(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, _ctx: &ModuleContext) -> Result<()> {
        Ok(())
    }
}

/// What a module sees of the core while a hook runs.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    id: ModuleId,
    bus: EventBus,
}

impl ModuleContext {
    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

/// Builds a fresh module instance. Called on first initialization and again
/// after a failure.
pub type ModuleFactory = dyn Fn() -> Result<Box<dyn Module>> + Send + Sync;

type Instance = Arc<Mutex<Option<Box<dyn Module>>>>;

// =============================================================================
// Registry entries
// =============================================================================

struct ModuleEntry {
    manifest: Arc<ModuleManifest>,
    factory: Arc<ModuleFactory>,
    instance: Instance,
    state: ModuleState,
    alignment: f64,
    failure_count: u32,
    last_error: Option<String>,
    exposed: Option<Arc<ExposedItems>>,
    state_changed_at: DateTime<Utc>,
}

impl ModuleEntry {
    fn set_state(&mut self, state: ModuleState) {
        self.state = state;
        self.state_changed_at = Utc::now();
    }

    /// Whether a FAILED module may be initialized again.
    fn may_retry(&self, default_retries: u32) -> bool {
        self.failure_count <= self.manifest.max_retries.unwrap_or(default_retries)
    }

    fn hook_target(&self) -> HookTarget {
        HookTarget {
            factory: self.factory.clone(),
            instance: self.instance.clone(),
        }
    }

    fn occupant(&self) -> Occupant {
        Occupant {
            id: self.manifest.id.clone(),
            alignment: self.alignment,
            integrity: self.manifest.integrity_score,
            footprint_mb: self.manifest.resource_footprint_mb,
        }
    }

    fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            id: self.manifest.id.clone(),
            state: self.state,
            capabilities: self.manifest.capabilities.clone(),
            essence_labels: self.manifest.essence_labels.clone(),
            integrity_score: self.manifest.integrity_score,
            alignment: self.alignment,
            resource_footprint_mb: self.manifest.resource_footprint_mb,
            failure_count: self.failure_count,
            last_error: self.last_error.clone(),
            exposed: self
                .exposed
                .as_ref()
                .map(|e| e.names().map(str::to_string).collect())
                .unwrap_or_default(),
            state_changed_at: self.state_changed_at,
        }
    }
}

impl fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("id", &self.manifest.id)
            .field("state", &self.state)
            .field("alignment", &self.alignment)
            .field("failure_count", &self.failure_count)
            .finish_non_exhaustive()
    }
}

/// Handles a hook needs once the registry lock is released.
struct HookTarget {
    factory: Arc<ModuleFactory>,
    instance: Instance,
}

/// Ranking row for capability resolution.
struct Candidate {
    id: ModuleId,
    integrity: f64,
    alignment: f64,
    exposed: Option<Arc<ExposedItems>>,
}

fn committed_footprint(registry: &BTreeMap<ModuleId, ModuleEntry>) -> u64 {
    registry
        .values()
        .filter(|e| matches!(e.state, ModuleState::Active | ModuleState::Activating))
        .map(|e| e.manifest.resource_footprint_mb)
        .sum()
}

fn check_transition(id: &ModuleId, from: ModuleState, to: ModuleState) -> Result<()> {
    if from.can_transition_to(to) {
        return Ok(());
    }
    let detail = if from.is_transitional() {
        " (transition already in progress)"
    } else {
        ""
    };
    Err(Error::invalid_transition(format!(
        "module '{}': {} -> {}{}",
        id, from, to, detail
    )))
}

// =============================================================================
// ModuleManager
// =============================================================================

/// Registry and lifecycle driver for pluggable modules.
#[derive(Debug)]
pub struct ModuleManager {
    bus: EventBus,
    config: ModulesConfig,
    strategy: Arc<dyn AlignmentStrategy>,
    registry: RwLock<BTreeMap<ModuleId, ModuleEntry>>,
    telos: RwLock<Telos>,
    low_memory: Mutex<Option<SubscriptionHandle>>,
}

impl ModuleManager {
    /// Manager scoring alignment with [`WeightedOverlap`].
    pub fn new(bus: EventBus, config: ModulesConfig) -> Result<Arc<Self>> {
        Self::with_strategy(bus, config, Arc::new(WeightedOverlap))
    }

    /// Manager with a custom alignment strategy. Subscribes to the
    /// low-memory signal.
    pub fn with_strategy(
        bus: EventBus,
        config: ModulesConfig,
        strategy: Arc<dyn AlignmentStrategy>,
    ) -> Result<Arc<Self>> {
        let manager = Arc::new(Self {
            bus,
            config,
            strategy,
            registry: RwLock::new(BTreeMap::new()),
            telos: RwLock::new(Telos::default()),
            low_memory: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let handle = manager
            .bus
            .subscribe("module-manager", events::MEMORY_LOW, move |envelope| {
                if let Some(manager) = weak.upgrade() {
                    let count = envelope
                        .payload()
                        .get("shed")
                        .and_then(Value::as_u64)
                        .map(|n| n as usize)
                        .unwrap_or(manager.config.low_memory_shed_count);
                    manager.shed_load(count);
                }
                Ok(())
            })?;
        *manager.low_memory.lock() = Some(handle);
        Ok(manager)
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Add a module in REGISTERED state. The factory is not called until the
    /// module is first initialized.
    ///
    /// A DESTROYED entry with the same id is replaced.
    pub fn register_module<F>(&self, manifest: ModuleManifest, factory: F) -> Result<()>
    where
        F: Fn() -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        manifest.validate()?;
        let alignment = self.strategy.score(&manifest, &self.telos.read());
        let id = manifest.id.clone();

        {
            let mut registry = self.registry.write();
            if let Some(existing) = registry.get(&id) {
                if !existing.state.is_terminal() {
                    return Err(Error::duplicate_module(id.to_string()));
                }
            }
            registry.insert(
                id.clone(),
                ModuleEntry {
                    manifest: Arc::new(manifest),
                    factory: Arc::new(factory),
                    instance: Arc::new(Mutex::new(None)),
                    state: ModuleState::Registered,
                    alignment,
                    failure_count: 0,
                    last_error: None,
                    exposed: None,
                    state_changed_at: Utc::now(),
                },
            );
        }

        tracing::info!(module = %id, alignment, "module_registered");
        self.announce(&id, ModuleState::Registered, json!({ "alignment": alignment }));
        Ok(())
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// REGISTERED/FAILED → INITIALIZED. A no-op when already INITIALIZED.
    pub fn initialize(&self, id: &ModuleId) -> Result<()> {
        let target = {
            let mut registry = self.registry.write();
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::module_not_found(id.to_string()))?;
            if entry.state == ModuleState::Initialized {
                return Ok(());
            }
            if entry.state == ModuleState::Failed && !entry.may_retry(self.config.max_retries) {
                return Err(Error::invalid_transition(format!(
                    "module '{}' exhausted its retry budget after {} failures",
                    id, entry.failure_count
                )));
            }
            check_transition(id, entry.state, ModuleState::Initializing)?;
            entry.set_state(ModuleState::Initializing);
            entry.hook_target()
        };
        self.announce(id, ModuleState::Initializing, json!({}));

        let ctx = self.context(id);
        let outcome = with_recovery(
            || {
                let mut slot = target.instance.lock();
                if slot.is_none() {
                    *slot = Some((target.factory)()?);
                }
                match slot.as_mut() {
                    Some(module) => module.initialize(&ctx),
                    None => Err(Error::internal(format!("module '{}' has no instance", id))),
                }
            },
            &format!("module:{}:initialize", id),
        );

        match outcome {
            Ok(()) => {
                self.settle(id, ModuleState::Initialized, |_| {});
                tracing::debug!(module = %id, "module_initialized");
                self.announce(id, ModuleState::Initialized, json!({}));
                Ok(())
            }
            Err(err) => Err(self.fail(id, &target, "initialize", err)),
        }
    }

    /// INITIALIZED/DORMANT → ACTIVE, evicting other modules if the budget
    /// requires it. Returns the exposed items; a no-op when already ACTIVE.
    pub fn activate(&self, id: &ModuleId) -> Result<Arc<ExposedItems>> {
        self.activate_within(id, None)
    }

    /// `evict_below`: only ACTIVE modules aligned strictly below this score
    /// may be evicted to make room.
    fn activate_within(&self, id: &ModuleId, evict_below: Option<f64>) -> Result<Arc<ExposedItems>> {
        let mut rounds = 0;
        let (target, footprint_mb) = loop {
            let victims = {
                let mut registry = self.registry.write();
                let (state, footprint_mb, exposed) = {
                    let entry = registry
                        .get(id)
                        .ok_or_else(|| Error::module_not_found(id.to_string()))?;
                    (
                        entry.state,
                        entry.manifest.resource_footprint_mb,
                        entry.exposed.clone(),
                    )
                };
                if let (ModuleState::Active, Some(exposed)) = (state, exposed) {
                    return Ok(exposed);
                }
                check_transition(id, state, ModuleState::Activating)?;

                let evictable: Vec<Occupant> = registry
                    .values()
                    .filter(|e| e.state == ModuleState::Active)
                    .filter(|e| evict_below.map_or(true, |floor| e.alignment < floor))
                    .map(ModuleEntry::occupant)
                    .collect();
                let plan = budget::plan(
                    self.config.eviction_order,
                    self.config.budget_mb,
                    committed_footprint(&registry),
                    footprint_mb,
                    evictable,
                );
                match plan {
                    BudgetPlan::Fits => {
                        let entry = registry
                            .get_mut(id)
                            .ok_or_else(|| Error::module_not_found(id.to_string()))?;
                        entry.set_state(ModuleState::Activating);
                        break (entry.hook_target(), footprint_mb);
                    }
                    BudgetPlan::Impossible => {
                        return Err(Error::budget_exceeded(format!(
                            "module '{}' needs {}MB; budget is {}MB with {}MB committed",
                            id,
                            footprint_mb,
                            self.config.budget_mb,
                            committed_footprint(&registry)
                        )));
                    }
                    BudgetPlan::Evict(victims) => victims,
                }
            };

            rounds += 1;
            if rounds > MAX_EVICTION_ROUNDS {
                return Err(Error::budget_exceeded(format!(
                    "module '{}': budget still contended after {} eviction rounds",
                    id, MAX_EVICTION_ROUNDS
                )));
            }
            for victim in victims {
                tracing::info!(module = %victim, for_module = %id, "module_evicted");
                if let Err(err) = self.deactivate_for(&victim, "budget") {
                    tracing::debug!(module = %victim, error = %err, "eviction_skipped");
                }
            }
        };
        self.announce(id, ModuleState::Activating, json!({ "footprint_mb": footprint_mb }));

        let ctx = self.context(id);
        let outcome = with_recovery(
            || {
                let mut slot = target.instance.lock();
                let module = slot
                    .as_mut()
                    .ok_or_else(|| Error::internal(format!("module '{}' has no instance", id)))?;
                let mut exposed = ExposedItems::new();
                module.activate(&ctx, &mut exposed)?;
                Ok(exposed)
            },
            &format!("module:{}:activate", id),
        );

        match outcome {
            Ok(exposed) => {
                let exposed = Arc::new(exposed);
                let names: Vec<&str> = exposed.names().collect();
                self.settle(id, ModuleState::Active, |entry| {
                    entry.exposed = Some(exposed.clone());
                });
                let active_footprint_mb = self.active_footprint_mb();
                tracing::info!(module = %id, footprint_mb, active_footprint_mb, "module_activated");
                self.announce(
                    id,
                    ModuleState::Active,
                    json!({
                        "footprint_mb": footprint_mb,
                        "active_footprint_mb": active_footprint_mb,
                        "exposed": names,
                    }),
                );
                Ok(exposed)
            }
            Err(err) => Err(self.fail(id, &target, "activate", err)),
        }
    }

    /// ACTIVE → DORMANT. Always completes once started: a failing
    /// `deactivate` hook is logged and the module ends DORMANT anyway.
    pub fn deactivate(&self, id: &ModuleId) -> Result<()> {
        self.deactivate_for(id, "requested")
    }

    fn deactivate_for(&self, id: &ModuleId, reason: &str) -> Result<()> {
        let target = {
            let mut registry = self.registry.write();
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::module_not_found(id.to_string()))?;
            if entry.state == ModuleState::Dormant {
                return Ok(());
            }
            check_transition(id, entry.state, ModuleState::Deactivating)?;
            entry.set_state(ModuleState::Deactivating);
            entry.exposed = None;
            entry.hook_target()
        };
        self.announce(id, ModuleState::Deactivating, json!({ "reason": reason }));

        let ctx = self.context(id);
        let teardown = with_recovery(
            || match target.instance.lock().as_mut() {
                Some(module) => module.deactivate(&ctx),
                None => Ok(()),
            },
            &format!("module:{}:deactivate", id),
        );
        let error = teardown.err().map(|err| {
            tracing::warn!(module = %id, error = %err, "module_teardown_failed");
            err.to_string()
        });

        self.settle(id, ModuleState::Dormant, |entry| {
            if let Some(message) = &error {
                entry.last_error = Some(message.clone());
            }
        });
        tracing::info!(module = %id, reason, "module_deactivated");
        self.announce(
            id,
            ModuleState::Dormant,
            json!({ "reason": reason, "error": error }),
        );
        Ok(())
    }

    /// Deactivate if needed, run `destroy`, end DESTROYED. A failing
    /// teardown is logged and never blocks the transition. Idempotent.
    pub fn destroy_module(&self, id: &ModuleId) -> Result<()> {
        let state = self
            .registry
            .read()
            .get(id)
            .map(|e| e.state)
            .ok_or_else(|| Error::module_not_found(id.to_string()))?;
        if state == ModuleState::Active {
            self.deactivate_for(id, "destroy")?;
        }

        let target = {
            let mut registry = self.registry.write();
            let entry = registry
                .get_mut(id)
                .ok_or_else(|| Error::module_not_found(id.to_string()))?;
            if entry.state == ModuleState::Destroyed {
                return Ok(());
            }
            check_transition(id, entry.state, ModuleState::Destroying)?;
            entry.set_state(ModuleState::Destroying);
            entry.exposed = None;
            entry.hook_target()
        };
        self.announce(id, ModuleState::Destroying, json!({}));

        let mut error = None;
        let instance = target.instance.lock().take();
        if let Some(mut module) = instance {
            let ctx = self.context(id);
            if let Err(err) = with_recovery(
                move || module.destroy(&ctx),
                &format!("module:{}:destroy", id),
            ) {
                tracing::warn!(module = %id, error = %err, "module_teardown_failed");
                error = Some(err.to_string());
            }
        }

        self.settle(id, ModuleState::Destroyed, |entry| {
            if let Some(message) = &error {
                entry.last_error = Some(message.clone());
            }
        });
        tracing::info!(module = %id, "module_destroyed");
        self.announce(id, ModuleState::Destroyed, json!({ "error": error }));
        Ok(())
    }

    /// Destroy every module, active ones first in eviction order. Returns
    /// how many modules ended DESTROYED.
    pub fn shutdown(&self) -> usize {
        if let Some(handle) = self.low_memory.lock().take() {
            handle.unsubscribe();
        }

        let (mut active, rest): (Vec<Occupant>, Vec<ModuleId>) = {
            let registry = self.registry.read();
            let active = registry
                .values()
                .filter(|e| e.state == ModuleState::Active)
                .map(ModuleEntry::occupant)
                .collect();
            let rest = registry
                .values()
                .filter(|e| e.state != ModuleState::Active)
                .map(|e| e.manifest.id.clone())
                .collect();
            (active, rest)
        };
        budget::rank_for_eviction(self.config.eviction_order, &mut active);

        let mut destroyed = 0;
        for id in active.into_iter().map(|o| o.id).chain(rest) {
            match self.destroy_module(&id) {
                Ok(()) => destroyed += 1,
                Err(err) => tracing::warn!(module = %id, error = %err, "module_shutdown_failed"),
            }
        }
        tracing::info!(destroyed, "module_manager_shutdown");
        destroyed
    }

    // =========================================================================
    // Capability resolution
    // =========================================================================

    /// Make sure some module providing `capability` is ACTIVE and return its
    /// exposed items.
    ///
    /// An already ACTIVE provider is reused. Otherwise candidates are tried
    /// in rank order (integrity desc, alignment desc, id) until one comes up.
    pub fn ensure_module_with_capability(&self, capability: &str) -> Result<Arc<ExposedItems>> {
        crate::validation::validate_non_empty(capability, "capability")?;
        let candidates = self.rank_candidates(capability);
        if candidates.is_empty() {
            return Err(Error::no_capable_module(capability));
        }
        if let Some(exposed) = candidates.iter().find_map(|c| c.exposed.clone()) {
            return Ok(exposed);
        }

        let mut failures = Vec::new();
        for candidate in candidates {
            match self.bring_up(&candidate.id, None) {
                Ok(exposed) => {
                    tracing::info!(capability, module = %candidate.id, "capability_ensured");
                    return Ok(exposed);
                }
                Err(err) => {
                    tracing::warn!(
                        capability,
                        module = %candidate.id,
                        error = %err,
                        "capability_candidate_failed"
                    );
                    failures.push(format!("{}: {}", candidate.id, err));
                }
            }
        }
        Err(Error::capability_unavailable(format!(
            "'{}' ({})",
            capability,
            failures.join("; ")
        )))
    }

    /// Typed variant of [`ensure_module_with_capability`](Self::ensure_module_with_capability).
    pub fn ensure_capability<T>(&self, key: &CapabilityKey<T>) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.ensure_module_with_capability(key.name())?.get(key)
    }

    fn rank_candidates(&self, capability: &str) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .registry
            .read()
            .values()
            .filter(|e| e.state != ModuleState::Destroyed && e.manifest.declares(capability))
            .map(|e| Candidate {
                id: e.manifest.id.clone(),
                integrity: e.manifest.integrity_score,
                alignment: e.alignment,
                exposed: e.exposed.clone(),
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.integrity
                .total_cmp(&a.integrity)
                .then_with(|| b.alignment.total_cmp(&a.alignment))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Drive a module to ACTIVE from wherever it is.
    fn bring_up(&self, id: &ModuleId, evict_below: Option<f64>) -> Result<Arc<ExposedItems>> {
        let (state, footprint_mb) = self
            .registry
            .read()
            .get(id)
            .map(|e| (e.state, e.manifest.resource_footprint_mb))
            .ok_or_else(|| Error::module_not_found(id.to_string()))?;
        if footprint_mb > self.config.budget_mb {
            return Err(Error::budget_exceeded(format!(
                "module '{}' needs {}MB; the whole budget is {}MB",
                id, footprint_mb, self.config.budget_mb
            )));
        }
        if matches!(state, ModuleState::Registered | ModuleState::Failed) {
            self.initialize(id)?;
        }
        self.activate_within(id, evict_below)
    }

    // =========================================================================
    // Telos
    // =========================================================================

    /// Replace the Telos and rebalance the active set around it.
    pub fn set_telos<I, S>(&self, weights: I) -> Result<TelosReport>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let telos = Telos::from_weights(weights)?;
        self.apply_telos(telos)
    }

    /// Rebalance against the current Telos.
    pub fn rebalance(&self) -> Result<TelosReport> {
        let telos = self.telos();
        self.apply_telos(telos)
    }

    fn apply_telos(&self, telos: Telos) -> Result<TelosReport> {
        *self.telos.write() = telos.clone();

        let manifests: Vec<Arc<ModuleManifest>> = self
            .registry
            .read()
            .values()
            .map(|e| e.manifest.clone())
            .collect();
        let scores: BTreeMap<ModuleId, f64> = manifests
            .iter()
            .map(|m| (m.id.clone(), self.strategy.score(m, &telos)))
            .collect();

        struct Row {
            id: ModuleId,
            state: ModuleState,
            alignment: f64,
            integrity: f64,
            may_retry: bool,
        }
        let rows: Vec<Row> = {
            let mut registry = self.registry.write();
            registry
                .values_mut()
                .map(|entry| {
                    if let Some(score) = scores.get(&entry.manifest.id) {
                        entry.alignment = *score;
                    }
                    Row {
                        id: entry.manifest.id.clone(),
                        state: entry.state,
                        alignment: entry.alignment,
                        integrity: entry.manifest.integrity_score,
                        may_retry: entry.may_retry(self.config.max_retries),
                    }
                })
                .collect()
        };

        let threshold = self.config.alignment_threshold;
        let mut report = TelosReport::default();

        for row in rows
            .iter()
            .filter(|r| r.state == ModuleState::Active && r.alignment < threshold)
        {
            match self.deactivate_for(&row.id, "telos") {
                Ok(()) => report.deactivated.push(row.id.clone()),
                Err(err) => report.failed.push((row.id.clone(), err.to_string())),
            }
        }

        let mut wanted: Vec<&Row> = rows
            .iter()
            .filter(|r| r.alignment >= threshold)
            .filter(|r| match r.state {
                ModuleState::Registered | ModuleState::Initialized | ModuleState::Dormant => true,
                ModuleState::Failed => r.may_retry,
                _ => false,
            })
            .collect();
        wanted.sort_by(|a, b| {
            b.alignment
                .total_cmp(&a.alignment)
                .then_with(|| b.integrity.total_cmp(&a.integrity))
                .then_with(|| a.id.cmp(&b.id))
        });
        for row in wanted {
            match self.bring_up(&row.id, Some(row.alignment)) {
                Ok(_) => report.activated.push(row.id.clone()),
                Err(Error::BudgetExceeded(_)) => report.skipped.push(row.id.clone()),
                Err(err) => report.failed.push((row.id.clone(), err.to_string())),
            }
        }

        tracing::info!(
            activated = report.activated.len(),
            deactivated = report.deactivated.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "telos_applied"
        );
        let published = self.bus.publish(
            Envelope::draft(events::TELOS_UPDATED, events::CORE_SOURCE)
                .with_label(events::AUDIT_LABEL)
                .with_payload(json!({ "telos": telos, "report": report })),
        );
        if let Err(err) = published {
            tracing::warn!(error = %err, "telos_update_not_published");
        }
        Ok(report)
    }

    // =========================================================================
    // Load shedding
    // =========================================================================

    /// Deactivate up to `count` ACTIVE modules in eviction order.
    pub fn shed_load(&self, count: usize) -> Vec<ModuleId> {
        let mut occupants: Vec<Occupant> = self
            .registry
            .read()
            .values()
            .filter(|e| e.state == ModuleState::Active)
            .map(ModuleEntry::occupant)
            .collect();
        budget::rank_for_eviction(self.config.eviction_order, &mut occupants);

        let shed: Vec<ModuleId> = occupants
            .into_iter()
            .take(count)
            .filter_map(|o| match self.deactivate_for(&o.id, "low_memory") {
                Ok(()) => Some(o.id),
                Err(err) => {
                    tracing::debug!(module = %o.id, error = %err, "shed_skipped");
                    None
                }
            })
            .collect();
        tracing::info!(requested = count, shed = shed.len(), "low_memory_shed");
        shed
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn module(&self, id: &ModuleId) -> Option<ModuleSummary> {
        self.registry.read().get(id).map(ModuleEntry::summary)
    }

    pub fn modules(&self) -> Vec<ModuleSummary> {
        self.registry.read().values().map(ModuleEntry::summary).collect()
    }

    /// Summed footprint of ACTIVE modules.
    pub fn active_footprint_mb(&self) -> u64 {
        self.registry
            .read()
            .values()
            .filter(|e| e.state == ModuleState::Active)
            .map(|e| e.manifest.resource_footprint_mb)
            .sum()
    }

    pub fn active_count(&self) -> usize {
        self.registry
            .read()
            .values()
            .filter(|e| e.state == ModuleState::Active)
            .count()
    }

    pub fn budget_mb(&self) -> u64 {
        self.config.budget_mb
    }

    pub fn telos(&self) -> Telos {
        self.telos.read().clone()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn context(&self, id: &ModuleId) -> ModuleContext {
        ModuleContext {
            id: id.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Finish a transition started by one of the operations above.
    fn settle(&self, id: &ModuleId, to: ModuleState, update: impl FnOnce(&mut ModuleEntry)) {
        if let Some(entry) = self.registry.write().get_mut(id) {
            entry.set_state(to);
            update(entry);
        }
    }

    /// Record a failed `initialize`/`activate`. The instance is dropped so a
    /// retry starts from a fresh one.
    fn fail(&self, id: &ModuleId, target: &HookTarget, hook: &str, err: Error) -> Error {
        let instance = target.instance.lock().take();
        drop(instance);

        let mut failure_count = 0;
        self.settle(id, ModuleState::Failed, |entry| {
            entry.failure_count += 1;
            entry.last_error = Some(err.to_string());
            entry.exposed = None;
            failure_count = entry.failure_count;
        });
        tracing::warn!(module = %id, hook, failure_count, error = %err, "module_hook_failed");
        self.announce(
            id,
            ModuleState::Failed,
            json!({
                "hook": hook,
                "error": err.to_string(),
                "failure_count": failure_count,
            }),
        );
        Error::module_failure(format!("module '{}' failed to {}: {}", id, hook, err))
    }

    fn announce(&self, id: &ModuleId, state: ModuleState, payload: Value) {
        let mut draft = Envelope::draft(events::module_event(id, state.event_name()), id.as_str())
            .with_label(events::LIFECYCLE_LABEL)
            .with_payload(payload);
        if state == ModuleState::Failed {
            draft = draft.with_label(events::ERROR_LABEL);
        }
        if let Err(err) = self.bus.publish(draft) {
            tracing::warn!(module = %id, state = %state, error = %err, "lifecycle_event_not_published");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::HistoryQuery;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const LABEL: CapabilityKey<String> = CapabilityKey::new("demo:label");

    #[derive(Clone, Default)]
    struct Script {
        fail_init: bool,
        fail_activate: bool,
        panic_deactivate: bool,
        fail_destroy: bool,
        calls: Arc<Mutex<Vec<String>>>,
        built: Arc<AtomicUsize>,
    }

    struct Scripted {
        script: Script,
    }

    impl Module for Scripted {
        fn initialize(&mut self, ctx: &ModuleContext) -> Result<()> {
            self.script.calls.lock().push(format!("{}:init", ctx.id()));
            if self.script.fail_init {
                return Err(Error::internal("init exploded"));
            }
            Ok(())
        }

        fn activate(&mut self, ctx: &ModuleContext, exposed: &mut ExposedItems) -> Result<()> {
            self.script.calls.lock().push(format!("{}:activate", ctx.id()));
            if self.script.fail_activate {
                return Err(Error::internal("activate exploded"));
            }
            exposed.expose(&LABEL, ctx.id().to_string());
            Ok(())
        }

        fn deactivate(&mut self, ctx: &ModuleContext) -> Result<()> {
            self.script.calls.lock().push(format!("{}:deactivate", ctx.id()));
            if self.script.panic_deactivate {
                panic!("deactivate panicked");
            }
            Ok(())
        }

        fn destroy(&mut self, ctx: &ModuleContext) -> Result<()> {
            self.script.calls.lock().push(format!("{}:destroy", ctx.id()));
            if self.script.fail_destroy {
                return Err(Error::internal("destroy exploded"));
            }
            Ok(())
        }
    }

    fn id(s: &str) -> ModuleId {
        ModuleId::try_from(s).unwrap()
    }

    fn manager_with(config: ModulesConfig) -> (EventBus, Arc<ModuleManager>) {
        let bus = EventBus::default();
        let manager = ModuleManager::new(bus.clone(), config).unwrap();
        (bus, manager)
    }

    fn manager() -> (EventBus, Arc<ModuleManager>) {
        manager_with(ModulesConfig::default())
    }

    fn register(manager: &ModuleManager, manifest: ModuleManifest, script: Script) {
        manager
            .register_module(manifest, move || {
                script.built.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Scripted {
                    script: script.clone(),
                }) as Box<dyn Module>)
            })
            .unwrap();
    }

    fn demo(name: &str) -> ModuleManifest {
        ModuleManifest::new(id(name)).with_capability("demo:label")
    }

    fn state(manager: &ModuleManager, name: &str) -> ModuleState {
        manager.module(&id(name)).unwrap().state
    }

    #[test]
    fn test_register_and_duplicate() {
        let (bus, manager) = manager();
        register(&manager, demo("a"), Script::default());
        let err = manager
            .register_module(demo("a"), || Err(Error::internal("unused")))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateModule(_)));
        assert_eq!(state(&manager, "a"), ModuleState::Registered);
        assert_eq!(
            bus.query(&HistoryQuery::new().type_prefix("module:a")).len(),
            1
        );
    }

    #[test]
    fn test_invalid_manifest_rejected() {
        let (_bus, manager) = manager();
        let err = manager
            .register_module(demo("a").with_integrity(2.0), || {
                Err(Error::internal("unused"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(manager.modules().is_empty());
    }

    #[test]
    fn test_ensure_drives_full_lifecycle() {
        let (bus, manager) = manager();
        let script = Script::default();
        register(&manager, demo("a"), script.clone());

        let exposed = manager.ensure_module_with_capability("demo:label").unwrap();
        assert_eq!(*exposed.get(&LABEL).unwrap(), "a");
        assert_eq!(state(&manager, "a"), ModuleState::Active);
        assert_eq!(*script.calls.lock(), vec!["a:init", "a:activate"]);

        let types: Vec<String> = bus
            .query(&HistoryQuery::new().type_prefix("module:a"))
            .iter()
            .map(|e| e.event_type().to_string())
            .collect();
        assert_eq!(
            types,
            vec![
                "module:a:registered",
                "module:a:initializing",
                "module:a:initialized",
                "module:a:activating",
                "module:a:activated",
            ]
        );

        // Already active: no further hooks.
        manager.ensure_module_with_capability("demo:label").unwrap();
        assert_eq!(script.calls.lock().len(), 2);
        assert_eq!(*manager.ensure_capability(&LABEL).unwrap(), "a");
    }

    #[test]
    fn test_no_capable_module() {
        let (_bus, manager) = manager();
        register(&manager, demo("a"), Script::default());
        let err = manager.ensure_module_with_capability("voice:tts").unwrap_err();
        assert!(matches!(err, Error::NoCapableModule(_)));
    }

    #[test]
    fn test_ranks_by_integrity() {
        let (_bus, manager) = manager();
        register(&manager, demo("low").with_integrity(0.4), Script::default());
        register(&manager, demo("high").with_integrity(0.9), Script::default());
        let exposed = manager.ensure_module_with_capability("demo:label").unwrap();
        assert_eq!(*exposed.get(&LABEL).unwrap(), "high");
        assert_eq!(state(&manager, "low"), ModuleState::Registered);
    }

    #[test]
    fn test_falls_back_to_next_candidate() {
        let (_bus, manager) = manager();
        let broken = Script {
            fail_init: true,
            ..Script::default()
        };
        register(&manager, demo("best").with_integrity(0.9), broken);
        register(&manager, demo("backup").with_integrity(0.5), Script::default());

        let exposed = manager.ensure_module_with_capability("demo:label").unwrap();
        assert_eq!(*exposed.get(&LABEL).unwrap(), "backup");

        let best = manager.module(&id("best")).unwrap();
        assert_eq!(best.state, ModuleState::Failed);
        assert_eq!(best.failure_count, 1);
        assert!(best.last_error.unwrap().contains("init exploded"));
    }

    #[test]
    fn test_all_candidates_fail() {
        let (_bus, manager) = manager();
        let broken = Script {
            fail_activate: true,
            ..Script::default()
        };
        register(&manager, demo("a"), broken.clone());
        register(&manager, demo("b"), broken);
        let err = manager.ensure_module_with_capability("demo:label").unwrap_err();
        assert!(matches!(err, Error::CapabilityUnavailable(_)));
        assert_eq!(state(&manager, "a"), ModuleState::Failed);
        assert_eq!(state(&manager, "b"), ModuleState::Failed);
    }

    #[test]
    fn test_hook_panic_is_isolated() {
        let (_bus, manager) = manager();
        register(&manager, demo("a"), Script::default());
        manager
            .register_module(demo("boom"), || panic!("factory panicked"))
            .unwrap();
        let err = manager.initialize(&id("boom")).unwrap_err();
        assert!(matches!(err, Error::ModuleFailure(_)));
        assert_eq!(state(&manager, "boom"), ModuleState::Failed);
        assert!(manager.ensure_module_with_capability("demo:label").is_ok());
    }

    #[test]
    fn test_transition_contract() {
        let (_bus, manager) = manager();
        let script = Script::default();
        register(&manager, demo("a"), script.clone());

        let err = manager.activate(&id("a")).unwrap_err();
        assert!(matches!(err, Error::InvalidLifecycleTransition(_)));

        manager.initialize(&id("a")).unwrap();
        manager.initialize(&id("a")).unwrap();
        assert_eq!(script.built.load(Ordering::SeqCst), 1);
        assert_eq!(*script.calls.lock(), vec!["a:init"]);

        manager.activate(&id("a")).unwrap();
        assert!(matches!(
            manager.initialize(&id("a")).unwrap_err(),
            Error::InvalidLifecycleTransition(_)
        ));

        manager.deactivate(&id("a")).unwrap();
        assert_eq!(state(&manager, "a"), ModuleState::Dormant);
        manager.activate(&id("a")).unwrap();
        assert_eq!(state(&manager, "a"), ModuleState::Active);
        assert_eq!(script.built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_failures_still_complete() {
        let (_bus, manager) = manager();
        let script = Script {
            panic_deactivate: true,
            fail_destroy: true,
            ..Script::default()
        };
        register(&manager, demo("a"), script.clone());
        manager.ensure_module_with_capability("demo:label").unwrap();

        manager.deactivate(&id("a")).unwrap();
        assert_eq!(state(&manager, "a"), ModuleState::Dormant);

        manager.destroy_module(&id("a")).unwrap();
        let summary = manager.module(&id("a")).unwrap();
        assert_eq!(summary.state, ModuleState::Destroyed);
        assert!(summary.last_error.unwrap().contains("destroy exploded"));

        // Destroyed is terminal and idempotent.
        manager.destroy_module(&id("a")).unwrap();
        assert!(manager.activate(&id("a")).is_err());
        assert!(matches!(
            manager.ensure_module_with_capability("demo:label").unwrap_err(),
            Error::NoCapableModule(_)
        ));
    }

    #[test]
    fn test_destroyed_id_can_be_registered_again() {
        let (_bus, manager) = manager();
        register(&manager, demo("a"), Script::default());
        manager.destroy_module(&id("a")).unwrap();
        register(&manager, demo("a"), Script::default());
        assert_eq!(state(&manager, "a"), ModuleState::Registered);
    }

    #[test]
    fn test_retry_budget() {
        let (_bus, manager) = manager();
        let broken = Script {
            fail_init: true,
            ..Script::default()
        };
        register(&manager, demo("a").with_max_retries(1), broken.clone());

        assert!(matches!(
            manager.initialize(&id("a")).unwrap_err(),
            Error::ModuleFailure(_)
        ));
        assert!(matches!(
            manager.initialize(&id("a")).unwrap_err(),
            Error::ModuleFailure(_)
        ));
        assert!(matches!(
            manager.initialize(&id("a")).unwrap_err(),
            Error::InvalidLifecycleTransition(_)
        ));
        // Each attempt built a fresh instance.
        assert_eq!(broken.built.load(Ordering::SeqCst), 2);
        assert_eq!(manager.module(&id("a")).unwrap().failure_count, 2);
    }

    #[test]
    fn test_budget_evicts_lower_alignment() {
        let (_bus, manager) = manager_with(ModulesConfig {
            budget_mb: 500,
            ..ModulesConfig::default()
        });
        manager.set_telos([("focus", 1.0)]).unwrap();
        register(
            &manager,
            ModuleManifest::new(id("a"))
                .with_capability("cap:a")
                .with_alignment("focus", 0.4)
                .with_footprint_mb(300),
            Script::default(),
        );
        register(
            &manager,
            ModuleManifest::new(id("b"))
                .with_capability("cap:b")
                .with_alignment("focus", 0.9)
                .with_footprint_mb(300),
            Script::default(),
        );

        manager.ensure_module_with_capability("cap:a").unwrap();
        assert_eq!(manager.active_footprint_mb(), 300);
        manager.ensure_module_with_capability("cap:b").unwrap();

        assert_eq!(state(&manager, "a"), ModuleState::Dormant);
        assert_eq!(state(&manager, "b"), ModuleState::Active);
        assert_eq!(manager.active_footprint_mb(), 300);
    }

    #[test]
    fn test_candidate_larger_than_budget() {
        let (_bus, manager) = manager_with(ModulesConfig {
            budget_mb: 500,
            ..ModulesConfig::default()
        });
        register(&manager, demo("small").with_footprint_mb(100), Script::default());
        register(
            &manager,
            ModuleManifest::new(id("huge"))
                .with_capability("cap:huge")
                .with_footprint_mb(800),
            Script::default(),
        );
        manager.ensure_module_with_capability("demo:label").unwrap();

        let err = manager.ensure_module_with_capability("cap:huge").unwrap_err();
        assert!(matches!(err, Error::CapabilityUnavailable(_)));
        assert!(err.to_string().contains("budget"));
        assert_eq!(state(&manager, "small"), ModuleState::Active);
        assert_eq!(state(&manager, "huge"), ModuleState::Registered);
    }

    #[test]
    fn test_set_telos_rebalances() {
        let (bus, manager) = manager_with(ModulesConfig {
            alignment_threshold: 0.5,
            ..ModulesConfig::default()
        });
        register(
            &manager,
            ModuleManifest::new(id("music")).with_label("calm"),
            Script::default(),
        );
        register(
            &manager,
            ModuleManifest::new(id("alarm")).with_label("alert"),
            Script::default(),
        );

        let report = manager.set_telos([("alert", 1.0)]).unwrap();
        assert_eq!(report.activated, vec![id("alarm")]);
        assert_eq!(state(&manager, "music"), ModuleState::Registered);

        let report = manager.set_telos([("calm", 1.0)]).unwrap();
        assert_eq!(report.deactivated, vec![id("alarm")]);
        assert_eq!(report.activated, vec![id("music")]);
        assert_eq!(state(&manager, "alarm"), ModuleState::Dormant);
        assert_eq!(manager.telos().weight("calm"), 1.0);
        assert_eq!(manager.module(&id("music")).unwrap().alignment, 1.0);

        let updates = bus.query(&HistoryQuery::new().type_prefix(events::TELOS_UPDATED));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].payload()["telos"]["calm"], 1.0);
    }

    #[test]
    fn test_set_telos_rejects_bad_weights() {
        let (_bus, manager) = manager();
        assert!(matches!(
            manager.set_telos([("calm", 1.5)]).unwrap_err(),
            Error::Validation(_)
        ));
        assert!(manager.telos().is_empty());
    }

    #[test]
    fn test_set_telos_skips_what_does_not_fit() {
        let (_bus, manager) = manager_with(ModulesConfig {
            budget_mb: 500,
            alignment_threshold: 0.5,
            ..ModulesConfig::default()
        });
        register(
            &manager,
            ModuleManifest::new(id("a"))
                .with_alignment("focus", 1.0)
                .with_footprint_mb(300),
            Script::default(),
        );
        register(
            &manager,
            ModuleManifest::new(id("b"))
                .with_alignment("focus", 0.8)
                .with_footprint_mb(300),
            Script::default(),
        );
        let report = manager.set_telos([("focus", 1.0)]).unwrap();
        assert_eq!(report.activated, vec![id("a")]);
        assert_eq!(report.skipped, vec![id("b")]);
        assert!(manager.active_footprint_mb() <= 500);
    }

    #[test]
    fn test_low_memory_signal_sheds_lowest_alignment() {
        let (bus, manager) = manager();
        manager.set_telos([("focus", 1.0)]).unwrap();
        for (name, weight) in [("x", 0.9), ("y", 0.2), ("z", 0.6)] {
            register(
                &manager,
                ModuleManifest::new(id(name))
                    .with_capability(format!("cap:{}", name))
                    .with_alignment("focus", weight),
                Script::default(),
            );
            manager
                .ensure_module_with_capability(&format!("cap:{}", name))
                .unwrap();
        }

        bus.publish(Envelope::draft(events::MEMORY_LOW, "test")).unwrap();
        assert_eq!(state(&manager, "y"), ModuleState::Dormant);
        assert_eq!(manager.active_count(), 2);

        bus.publish(Envelope::draft(events::MEMORY_LOW, "test").with_payload(json!({"shed": 2})))
            .unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_reentrant_transition_is_refused() {
        let (bus, manager) = manager();
        register(&manager, demo("a"), Script::default());

        let seen: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
        let (weak, slot) = (Arc::downgrade(&manager), seen.clone());
        bus.subscribe("meddler", "module:a:initializing", move |_| {
            if let Some(manager) = weak.upgrade() {
                if let Err(err) = manager.initialize(&id("a")) {
                    *slot.lock() = Some(err);
                }
            }
            Ok(())
        })
        .unwrap();

        manager.initialize(&id("a")).unwrap();
        assert!(matches!(
            seen.lock().take(),
            Some(Error::InvalidLifecycleTransition(_))
        ));
        assert_eq!(state(&manager, "a"), ModuleState::Initialized);
    }

    #[test]
    fn test_shutdown_destroys_everything() {
        let (bus, manager) = manager();
        let script = Script::default();
        register(&manager, demo("a"), script.clone());
        register(&manager, ModuleManifest::new(id("b")), script.clone());
        manager.ensure_module_with_capability("demo:label").unwrap();

        assert_eq!(manager.shutdown(), 2);
        assert!(manager
            .modules()
            .iter()
            .all(|m| m.state == ModuleState::Destroyed));
        assert_eq!(
            *script.calls.lock(),
            vec!["a:init", "a:activate", "a:deactivate", "a:destroy"]
        );

        // The low-memory listener is gone.
        let before = bus.stats().handler_invocations;
        bus.publish(Envelope::draft(events::MEMORY_LOW, "test")).unwrap();
        assert_eq!(bus.stats().handler_invocations, before);
    }
}
