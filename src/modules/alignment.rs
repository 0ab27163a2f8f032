//! Telos alignment scoring.

use std::fmt;

use super::types::{ModuleManifest, Telos};

/// Scores how well a module fits the current Telos, in [0, 1].
///
/// Implementations must be deterministic: the same manifest and Telos
/// always produce the same score.
pub trait AlignmentStrategy: Send + Sync + fmt::Debug {
    fn score(&self, manifest: &ModuleManifest, telos: &Telos) -> f64;
}

/// Weighted overlap between the Telos and a module's labels.
///
/// Each Telos label contributes its weight times the module's affinity for
/// it: the explicit `telos_alignment` entry if present, else 1.0 for a
/// plain essence label, else 0. The sum is normalized by the total Telos
/// weight. An empty (or all-zero) Telos expresses no preference and scores
/// every module 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedOverlap;

impl AlignmentStrategy for WeightedOverlap {
    fn score(&self, manifest: &ModuleManifest, telos: &Telos) -> f64 {
        let total = telos.total_weight();
        if total <= 0.0 {
            return 1.0;
        }
        let overlap: f64 = telos
            .weights()
            .iter()
            .map(|(label, weight)| {
                let affinity = match manifest.telos_alignment.get(label) {
                    Some(a) => *a,
                    None if manifest.essence_labels.contains(label) => 1.0,
                    None => 0.0,
                };
                weight * affinity
            })
            .sum();
        (overlap / total).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModuleId;

    fn manifest() -> ModuleManifest {
        ModuleManifest::new(ModuleId::try_from("audio").unwrap())
            .with_label("calm")
            .with_label("music")
            .with_alignment("focus", 0.5)
    }

    #[test]
    fn test_empty_telos_is_neutral() {
        assert_eq!(WeightedOverlap.score(&manifest(), &Telos::default()), 1.0);
        let zero = Telos::from_weights([("calm", 0.0)]).unwrap();
        assert_eq!(WeightedOverlap.score(&manifest(), &zero), 1.0);
    }

    #[test]
    fn test_full_overlap() {
        let telos = Telos::from_weights([("calm", 1.0), ("music", 0.5)]).unwrap();
        assert_eq!(WeightedOverlap.score(&manifest(), &telos), 1.0);
    }

    #[test]
    fn test_partial_overlap_uses_explicit_affinity() {
        // calm: 1.0 * 1.0, focus: 1.0 * 0.5, sleep: 0
        let telos = Telos::from_weights([("calm", 1.0), ("focus", 1.0), ("sleep", 1.0)]).unwrap();
        assert_eq!(WeightedOverlap.score(&manifest(), &telos), 0.5);
    }

    #[test]
    fn test_no_overlap() {
        let telos = Telos::from_weights([("sleep", 0.7)]).unwrap();
        assert_eq!(WeightedOverlap.score(&manifest(), &telos), 0.0);
    }

    #[test]
    fn test_deterministic() {
        let telos = Telos::from_weights([("calm", 0.3), ("focus", 0.9)]).unwrap();
        let a = WeightedOverlap.score(&manifest(), &telos);
        let b = WeightedOverlap.score(&manifest(), &telos);
        assert_eq!(a, b);
    }
}
