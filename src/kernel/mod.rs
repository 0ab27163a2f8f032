//! Kernel - the in-process facade over the core.
//!
//! The Kernel wires one [`EventBus`], one [`RequestBroker`], one
//! [`ModuleManager`] and one [`SelfOptimizer`] together and exposes the
//! operations consumers call. There is no global instance: every
//! `Kernel::new` builds an isolated core.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::bus::{
    BusStats, EventBus, HistoryQuery, PublishReceipt, SubscriptionHandle, ThrottleStatus,
};
use crate::envelope::{Envelope, EnvelopeDraft};
use crate::modules::{
    AlignmentStrategy, CapabilityKey, ExposedItems, Module, ModuleManager, ModuleManifest,
    ModuleSummary, Telos, TelosReport, WeightedOverlap,
};
use crate::request::{PendingRequest, RequestBroker};
use crate::types::{Config, Result};

pub mod metrics;
pub mod optimizer;
pub mod recovery;

pub use metrics::{FixedMemoryProbe, MemoryProbe, MetricsSnapshot, SystemMemoryProbe};
pub use optimizer::{
    CongestionPolicy, OptimizerStats, PassOutcome, PassReport, SelfOptimizer, ThrottlePolicy,
    Trigger,
};
pub use recovery::with_recovery;

/// Aggregate snapshot of the core (`getOSState`).
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub active_modules: usize,
    pub active_footprint_mb: u64,
    pub budget_mb: u64,
    pub telos: Telos,
    pub modules: Vec<ModuleSummary>,
    pub bus: BusStats,
    pub throttle: ThrottleStatus,
    pub optimizer: OptimizerStats,
    pub pending_requests: usize,
}

/// Builder for a [`Kernel`] with non-default strategies.
#[derive(Debug)]
pub struct KernelBuilder {
    config: Config,
    probe: Option<Arc<dyn MemoryProbe>>,
    congestion: Option<Arc<dyn CongestionPolicy>>,
    strategy: Arc<dyn AlignmentStrategy>,
}

impl KernelBuilder {
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn congestion_policy(mut self, policy: Arc<dyn CongestionPolicy>) -> Self {
        self.congestion = Some(policy);
        self
    }

    pub fn alignment_strategy(mut self, strategy: Arc<dyn AlignmentStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn build(self) -> Result<Kernel> {
        self.config.validate()?;
        let bus = EventBus::new(&self.config.bus);
        let requests = RequestBroker::new(bus.clone(), self.config.request.clone());
        let modules =
            ModuleManager::with_strategy(bus.clone(), self.config.modules.clone(), self.strategy)?;

        let mut optimizer =
            SelfOptimizer::new(bus.clone(), modules.clone(), self.config.optimizer.clone());
        if let Some(probe) = self.probe {
            optimizer = optimizer.with_probe(probe);
        }
        if let Some(policy) = self.congestion {
            optimizer = optimizer.with_congestion_policy(policy);
        }

        tracing::info!(
            history_capacity = self.config.bus.history_capacity,
            budget_mb = self.config.modules.budget_mb,
            "kernel_created"
        );
        Ok(Kernel {
            config: self.config,
            bus,
            requests,
            modules,
            optimizer: Arc::new(optimizer),
        })
    }
}

/// The core facade.
#[derive(Debug)]
pub struct Kernel {
    config: Config,
    bus: EventBus,
    requests: RequestBroker,
    modules: Arc<ModuleManager>,
    optimizer: Arc<SelfOptimizer>,
}

impl Kernel {
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> KernelBuilder {
        KernelBuilder {
            config,
            probe: None,
            congestion: None,
            strategy: Arc::new(WeightedOverlap),
        }
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn publish(&self, draft: EnvelopeDraft) -> Result<PublishReceipt> {
        self.bus.publish(draft)
    }

    pub fn subscribe<F>(
        &self,
        subscriber_id: impl Into<String>,
        pattern: &str,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(subscriber_id, pattern, handler)
    }

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
        self.bus
            .subscribe_with_labels(subscriber_id, pattern, labels, handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }

    pub fn query(&self, query: &HistoryQuery) -> Vec<Arc<Envelope>> {
        self.bus.query(query)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn request(&self, draft: EnvelopeDraft, timeout_ms: u64) -> Result<PendingRequest> {
        self.requests.request(draft, timeout_ms)
    }

    pub async fn ask(&self, draft: EnvelopeDraft, timeout_ms: u64) -> Result<Arc<Envelope>> {
        self.requests.ask(draft, timeout_ms).await
    }

    pub fn respond(
        &self,
        request: &Envelope,
        source_id: &str,
        payload: Value,
    ) -> Result<PublishReceipt> {
        self.requests.respond(request, source_id, payload)
    }

    pub fn serve<F>(
        &self,
        source_id: impl Into<String>,
        request_type: &str,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&Envelope) -> Result<Value> + Send + Sync + 'static,
    {
        self.requests.serve(source_id, request_type, handler)
    }

    // =========================================================================
    // Modules
    // =========================================================================

    pub fn register_module<F>(&self, manifest: ModuleManifest, factory: F) -> Result<()>
    where
        F: Fn() -> Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        self.modules.register_module(manifest, factory)
    }

    pub fn ensure_module_with_capability(&self, capability: &str) -> Result<Arc<ExposedItems>> {
        self.modules.ensure_module_with_capability(capability)
    }

    pub fn ensure_capability<T>(&self, key: &CapabilityKey<T>) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        self.modules.ensure_capability(key)
    }

    pub fn set_telos<I, S>(&self, weights: I) -> Result<TelosReport>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.modules.set_telos(weights)
    }

    // =========================================================================
    // State and optimization
    // =========================================================================

    /// Aggregate snapshot of modules, Telos, bus and optimizer.
    pub fn os_state(&self) -> SystemState {
        let modules = self.modules.modules();
        SystemState {
            active_modules: self.modules.active_count(),
            active_footprint_mb: self.modules.active_footprint_mb(),
            budget_mb: self.modules.budget_mb(),
            telos: self.modules.telos(),
            modules,
            bus: self.bus.stats(),
            throttle: self.bus.throttle_status(),
            optimizer: self.optimizer.stats(),
            pending_requests: self.requests.pending_count(),
        }
    }

    /// Run the full remediation set now.
    pub fn run_optimization_now(&self) -> PassOutcome {
        self.optimizer.run_now()
    }

    /// Start the periodic optimizer. Must be called within a Tokio runtime.
    pub fn start_optimizer(&self) -> tokio::task::JoinHandle<()> {
        self.optimizer.start()
    }

    pub fn stop_optimizer(&self) {
        self.optimizer.stop();
    }

    /// Stop the optimizer and destroy every module. Returns how many modules
    /// ended DESTROYED.
    pub fn shutdown(&self) -> usize {
        self.optimizer.stop();
        let destroyed = self.modules.shutdown();
        tracing::info!(destroyed, "kernel_shutdown");
        destroyed
    }

    // =========================================================================
    // Components
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn requests(&self) -> &RequestBroker {
        &self.requests
    }

    pub fn modules(&self) -> &Arc<ModuleManager> {
        &self.modules
    }

    pub fn optimizer(&self) -> &Arc<SelfOptimizer> {
        &self.optimizer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BusConfig, ModuleId};

    #[test]
    fn test_kernels_are_isolated() {
        let a = Kernel::new(Config::default()).unwrap();
        let b = Kernel::new(Config::default()).unwrap();
        a.publish(Envelope::draft("ui:click", "test")).unwrap();
        assert_eq!(a.bus().history_len(), 1);
        assert_eq!(b.bus().history_len(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = Config {
            bus: BusConfig {
                history_capacity: 0,
                ..BusConfig::default()
            },
            ..Config::default()
        };
        assert!(Kernel::new(config).is_err());
    }

    #[test]
    fn test_os_state_reports_modules() {
        let kernel = Kernel::new(Config::default()).unwrap();
        kernel
            .register_module(
                ModuleManifest::new(ModuleId::try_from("clock").unwrap())
                    .with_capability("time:now")
                    .with_footprint_mb(12),
                || Err(crate::types::Error::internal("never built")),
            )
            .unwrap();
        kernel.set_telos([("focus", 0.7)]).unwrap();

        let state = kernel.os_state();
        assert_eq!(state.modules.len(), 1);
        assert_eq!(state.active_modules, 0);
        assert_eq!(state.budget_mb, 1024);
        assert_eq!(state.telos.weight("focus"), 0.7);
        assert!(state.bus.events_published > 0);

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["modules"][0]["id"], "clock");
    }

    #[test]
    fn test_shutdown_without_optimizer_running() {
        let kernel = Kernel::new(Config::default()).unwrap();
        assert_eq!(kernel.shutdown(), 0);
    }
}
