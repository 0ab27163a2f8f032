//! Well-known event types published by the core itself.
//!
//! Everything the core does on its own initiative (lifecycle transitions,
//! history clears, optimizer remediation) is announced with one of these
//! types so consumers can subscribe to a stable vocabulary.

use crate::types::ModuleId;

/// Published by `EventBus::clear` with `{"removed": n}`.
pub const AKASHIC_CLEARED: &str = "akashic:record:cleared";

/// Low-memory signal; the module manager sheds load when it sees this.
pub const MEMORY_LOW: &str = "system:memory:low";

/// Published after `set_telos` with the new weights and the rebalance report.
pub const TELOS_UPDATED: &str = "telos:updated";

/// One per optimizer pass that performed remediation.
pub const OPTIMIZER_PASS_COMPLETED: &str = "optimizer:pass:completed";

/// One per failed remediation step.
pub const OPTIMIZER_STEP_FAILED: &str = "optimizer:step:failed";

/// Label carried by every audit envelope.
pub const AUDIT_LABEL: &str = "audit";

/// Label carried by every module lifecycle envelope.
pub const LIFECYCLE_LABEL: &str = "lifecycle";

/// Label carried by every error envelope.
pub const ERROR_LABEL: &str = "error";

/// Source id used for envelopes the core publishes itself.
pub const CORE_SOURCE: &str = "telos-core";

/// Type roots of the envelopes above. The publish throttle never rejects
/// these, whatever the configured exempt list says.
pub const CORE_ROOTS: &[&str] = &["system", "optimizer", "akashic", "module", "telos"];

/// `module:<id>:<transition>`, e.g. `module:audio:activated`.
pub fn module_event(id: &ModuleId, transition: &str) -> String {
    format!("module:{}:{}", id, transition)
}

/// Conventional reply type for a request type.
pub fn response_type(request_type: &str) -> String {
    format!("{}:response", request_type)
}

/// Conventional error-reply type for a request type.
pub fn error_type(request_type: &str) -> String {
    format!("{}:error", request_type)
}
