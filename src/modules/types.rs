//! Module types: ModuleState, ModuleManifest, Telos, summaries and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Error, ModuleId, Result};
use crate::validation::{validate_non_empty, validate_unit_interval};

/// Module lifecycle state.
///
/// State transitions:
/// ```text
/// REGISTERED → INITIALIZING → INITIALIZED → ACTIVATING → ACTIVE
///                   ↓                           ↓          ↓
///                FAILED ──(retry)──┐         FAILED   DEACTIVATING → DORMANT
///                                  ↓                                    ↓
///                            INITIALIZING              ACTIVATING | DESTROYING → DESTROYED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    Registered,
    Initializing,
    Initialized,
    Activating,
    Active,
    Deactivating,
    Dormant,
    Destroying,
    Destroyed,
    Failed,
}

impl ModuleState {
    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        self == ModuleState::Destroyed
    }

    /// A transition is in progress; other transition requests are refused.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            ModuleState::Initializing
                | ModuleState::Activating
                | ModuleState::Deactivating
                | ModuleState::Destroying
        )
    }

    /// Check if transition is valid.
    ///
    /// The retry budget for `Failed → Initializing` is enforced by the
    /// manager, not here.
    pub fn can_transition_to(self, to: ModuleState) -> bool {
        use ModuleState::*;
        match (self, to) {
            // REGISTERED
            (Registered, Initializing) => true,
            (Registered, Destroying) => true,
            // INITIALIZING
            (Initializing, Initialized) => true,
            (Initializing, Failed) => true,
            // INITIALIZED
            (Initialized, Activating) => true,
            (Initialized, Destroying) => true,
            // ACTIVATING
            (Activating, Active) => true,
            (Activating, Failed) => true,
            // ACTIVE
            (Active, Deactivating) => true,
            // DEACTIVATING always ends dormant
            (Deactivating, Dormant) => true,
            // DORMANT
            (Dormant, Activating) => true, // Reactivation
            (Dormant, Destroying) => true,
            // DESTROYING always ends destroyed
            (Destroying, Destroyed) => true,
            // FAILED
            (Failed, Initializing) => true,
            (Failed, Destroying) => true,
            // DESTROYED is terminal
            (Destroyed, _) => false,
            _ => false,
        }
    }

    /// Suffix used in `module:<id>:<suffix>` lifecycle events.
    pub fn event_name(self) -> &'static str {
        match self {
            ModuleState::Registered => "registered",
            ModuleState::Initializing => "initializing",
            ModuleState::Initialized => "initialized",
            ModuleState::Activating => "activating",
            ModuleState::Active => "activated",
            ModuleState::Deactivating => "deactivating",
            ModuleState::Dormant => "deactivated",
            ModuleState::Destroying => "destroying",
            ModuleState::Destroyed => "destroyed",
            ModuleState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Static description of a module, supplied at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub id: ModuleId,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub essence_labels: BTreeSet<String>,
    /// Per-label affinity in [0, 1]; overrides plain essence-label membership.
    #[serde(default)]
    pub telos_alignment: BTreeMap<String, f64>,
    #[serde(default = "default_integrity")]
    pub integrity_score: f64,
    #[serde(default)]
    pub resource_footprint_mb: u64,
    /// Overrides `modules.max_retries` for this module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_integrity() -> f64 {
    1.0
}

impl ModuleManifest {
    pub fn new(id: ModuleId) -> Self {
        Self {
            id,
            capabilities: BTreeSet::new(),
            essence_labels: BTreeSet::new(),
            telos_alignment: BTreeMap::new(),
            integrity_score: default_integrity(),
            resource_footprint_mb: 0,
            max_retries: None,
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.essence_labels.insert(label.into());
        self
    }

    pub fn with_alignment(mut self, label: impl Into<String>, weight: f64) -> Self {
        self.telos_alignment.insert(label.into(), weight);
        self
    }

    pub fn with_integrity(mut self, score: f64) -> Self {
        self.integrity_score = score;
        self
    }

    pub fn with_footprint_mb(mut self, mb: u64) -> Self {
        self.resource_footprint_mb = mb;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn declares(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Reject manifests that would corrupt ranking or event routing.
    pub fn validate(&self) -> Result<()> {
        validate_non_empty(self.id.as_str(), "module id")?;
        if self.id.as_str().contains([':', '*']) {
            return Err(Error::validation(format!(
                "module id '{}' cannot contain ':' or '*'",
                self.id
            )));
        }
        for capability in &self.capabilities {
            validate_non_empty(capability, "capability")?;
        }
        for label in &self.essence_labels {
            validate_non_empty(label, "essence label")?;
        }
        for (label, weight) in &self.telos_alignment {
            validate_non_empty(label, "telos alignment label")?;
            validate_unit_interval(*weight, &format!("telos_alignment[{}]", label))?;
        }
        validate_unit_interval(self.integrity_score, "integrity_score")?;
        Ok(())
    }
}

/// Current system priorities: essence label → weight in [0, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Telos(BTreeMap<String, f64>);

impl Telos {
    /// Validate and build. Every weight must lie in [0, 1].
    pub fn from_weights<I, S>(weights: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut map = BTreeMap::new();
        for (label, weight) in weights {
            let label = label.into();
            validate_non_empty(&label, "telos label")?;
            validate_unit_interval(weight, &format!("telos[{}]", label))?;
            map.insert(label, weight);
        }
        Ok(Self(map))
    }

    pub fn weight(&self, label: &str) -> f64 {
        self.0.get(label).copied().unwrap_or(0.0)
    }

    pub fn weights(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    pub fn total_weight(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read-only snapshot of one registry entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleSummary {
    pub id: ModuleId,
    pub state: ModuleState,
    pub capabilities: BTreeSet<String>,
    pub essence_labels: BTreeSet<String>,
    pub integrity_score: f64,
    pub alignment: f64,
    pub resource_footprint_mb: u64,
    pub failure_count: u32,
    pub last_error: Option<String>,
    /// Capability names exposed while active.
    pub exposed: Vec<String>,
    pub state_changed_at: DateTime<Utc>,
}

/// Outcome of a Telos rebalance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TelosReport {
    pub activated: Vec<ModuleId>,
    pub deactivated: Vec<ModuleId>,
    /// Modules whose bring-up failed, with the error.
    pub failed: Vec<(ModuleId, String)>,
    /// Aligned modules left inactive because the budget was full.
    pub skipped: Vec<ModuleId>,
}

impl TelosReport {
    pub fn is_noop(&self) -> bool {
        self.activated.is_empty()
            && self.deactivated.is_empty()
            && self.failed.is_empty()
            && self.skipped.is_empty()
    }
}
