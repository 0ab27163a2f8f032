//! Core types for the Telos core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (EnvelopeId, CorrelationId, ModuleId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for bus, requests, modules and optimizer

mod config;
mod errors;
mod ids;

pub use config::{
    BusConfig, Config, EvictionOrder, ModulesConfig, ObservabilityConfig, OptimizerConfig,
    RequestConfig,
};
pub use errors::{Error, Result};
pub use ids::{CorrelationId, EnvelopeId, ModuleId};
