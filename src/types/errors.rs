//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the Telos core.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed envelope, pattern, manifest or configuration.
    #[error("validation error: {0}")]
    Validation(String),

    /// A module with the same id is already registered.
    #[error("duplicate module: {0}")]
    DuplicateModule(String),

    /// Unknown module id.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// No registered module declares the capability.
    #[error("no module declares capability: {0}")]
    NoCapableModule(String),

    /// Every candidate for the capability failed to come up.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// The active module does not expose the requested item.
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    /// The exposed item has a different type than the lookup key.
    #[error("capability type mismatch: {0}")]
    CapabilityTypeMismatch(String),

    /// Illegal lifecycle state change.
    #[error("invalid lifecycle transition: {0}")]
    InvalidLifecycleTransition(String),

    /// A module hook returned an error.
    #[error("module failure: {0}")]
    ModuleFailure(String),

    /// Candidate footprint cannot fit in the resource budget.
    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    /// No reply arrived in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The responder answered with an error.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The caller cancelled the request.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Publish rejected by the engaged throttle.
    #[error("throttled: {0}")]
    Throttled(String),

    /// A subscriber handler failed (isolated, never returned to publishers).
    #[error("handler execution error: {0}")]
    HandlerExecution(String),

    /// A remediation step failed during an optimizer pass.
    #[error("optimization tick error: {0}")]
    OptimizationTick(String),

    /// Internal errors (recovered panics, closed channels).
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code, used in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION",
            Error::DuplicateModule(_) => "DUPLICATE_MODULE",
            Error::ModuleNotFound(_) => "MODULE_NOT_FOUND",
            Error::NoCapableModule(_) => "NO_CAPABLE_MODULE",
            Error::CapabilityUnavailable(_) => "CAPABILITY_UNAVAILABLE",
            Error::CapabilityNotFound(_) => "CAPABILITY_NOT_FOUND",
            Error::CapabilityTypeMismatch(_) => "CAPABILITY_TYPE_MISMATCH",
            Error::InvalidLifecycleTransition(_) => "INVALID_LIFECYCLE_TRANSITION",
            Error::ModuleFailure(_) => "MODULE_FAILURE",
            Error::BudgetExceeded(_) => "BUDGET_EXCEEDED",
            Error::Timeout(_) => "TIMEOUT",
            Error::RequestFailed(_) => "REQUEST_FAILED",
            Error::Cancelled(_) => "CANCELLED",
            Error::Throttled(_) => "THROTTLED",
            Error::HandlerExecution(_) => "HANDLER_EXECUTION",
            Error::OptimizationTick(_) => "OPTIMIZATION_TICK",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Io(_) => "IO",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn duplicate_module(msg: impl Into<String>) -> Self {
        Self::DuplicateModule(msg.into())
    }

    pub fn module_not_found(msg: impl Into<String>) -> Self {
        Self::ModuleNotFound(msg.into())
    }

    pub fn no_capable_module(msg: impl Into<String>) -> Self {
        Self::NoCapableModule(msg.into())
    }

    pub fn capability_unavailable(msg: impl Into<String>) -> Self {
        Self::CapabilityUnavailable(msg.into())
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidLifecycleTransition(msg.into())
    }

    pub fn module_failure(msg: impl Into<String>) -> Self {
        Self::ModuleFailure(msg.into())
    }

    pub fn budget_exceeded(msg: impl Into<String>) -> Self {
        Self::BudgetExceeded(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn throttled(msg: impl Into<String>) -> Self {
        Self::Throttled(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::HandlerExecution(msg.into())
    }

    pub fn optimization(msg: impl Into<String>) -> Self {
        Self::OptimizationTick(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
