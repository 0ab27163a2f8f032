//! Resource budget planning.
//!
//! Pure functions over occupant snapshots: the manager gathers them under the
//! registry lock, plans here, then performs the evictions after releasing it.

use std::cmp::Ordering;

use crate::types::{EvictionOrder, ModuleId};

/// An active module that may be evicted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Occupant {
    pub id: ModuleId,
    pub alignment: f64,
    pub integrity: f64,
    pub footprint_mb: u64,
}

fn compare(order: EvictionOrder, a: &Occupant, b: &Occupant) -> Ordering {
    match order {
        EvictionOrder::LowestAlignment => a
            .alignment
            .total_cmp(&b.alignment)
            .then_with(|| a.integrity.total_cmp(&b.integrity)),
        EvictionOrder::LowestIntegrity => a
            .integrity
            .total_cmp(&b.integrity)
            .then_with(|| a.alignment.total_cmp(&b.alignment)),
        EvictionOrder::LargestFootprint => b
            .footprint_mb
            .cmp(&a.footprint_mb)
            .then_with(|| a.alignment.total_cmp(&b.alignment)),
    }
    .then_with(|| a.id.cmp(&b.id))
}

/// Sort so the first occupant is the first to evict.
pub(crate) fn rank_for_eviction(order: EvictionOrder, occupants: &mut [Occupant]) {
    occupants.sort_by(|a, b| compare(order, a, b));
}

/// Outcome of fitting a candidate into the budget.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BudgetPlan {
    /// Fits as is.
    Fits,
    /// Fits once these occupants are deactivated, in order.
    Evict(Vec<ModuleId>),
    /// Cannot fit even after evicting every evictable occupant.
    Impossible,
}

/// Plan how to fit `candidate_mb` on top of `committed_mb`.
///
/// `committed_mb` includes occupants that cannot be evicted (modules
/// mid-activation); only `evictable` are considered as victims.
pub(crate) fn plan(
    order: EvictionOrder,
    budget_mb: u64,
    committed_mb: u64,
    candidate_mb: u64,
    mut evictable: Vec<Occupant>,
) -> BudgetPlan {
    let needed = committed_mb.saturating_add(candidate_mb);
    if needed <= budget_mb {
        return BudgetPlan::Fits;
    }
    if candidate_mb > budget_mb {
        return BudgetPlan::Impossible;
    }

    rank_for_eviction(order, &mut evictable);
    let mut freed = 0u64;
    let mut victims = Vec::new();
    for occupant in evictable {
        if needed.saturating_sub(freed) <= budget_mb {
            break;
        }
        freed += occupant.footprint_mb;
        victims.push(occupant.id);
    }
    if needed.saturating_sub(freed) <= budget_mb {
        BudgetPlan::Evict(victims)
    } else {
        BudgetPlan::Impossible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn occ(id: &str, alignment: f64, integrity: f64, footprint_mb: u64) -> Occupant {
        Occupant {
            id: ModuleId::try_from(id).unwrap(),
            alignment,
            integrity,
            footprint_mb,
        }
    }

    fn ids(plan: BudgetPlan) -> Vec<String> {
        match plan {
            BudgetPlan::Evict(v) => v.into_iter().map(|id| id.to_string()).collect(),
            other => panic!("expected eviction, got {:?}", other),
        }
    }

    #[test]
    fn test_fits_without_eviction() {
        let plan = plan(EvictionOrder::LowestAlignment, 500, 100, 300, vec![]);
        assert_eq!(plan, BudgetPlan::Fits);
    }

    #[test]
    fn test_candidate_larger_than_budget() {
        let plan = plan(
            EvictionOrder::LowestAlignment,
            500,
            0,
            600,
            vec![occ("a", 0.1, 0.5, 100)],
        );
        assert_eq!(plan, BudgetPlan::Impossible);
    }

    #[test]
    fn test_evicts_lowest_alignment_first() {
        let occupants = vec![
            occ("a", 0.9, 0.5, 200),
            occ("b", 0.2, 0.9, 200),
            occ("c", 0.5, 0.1, 200),
        ];
        let plan = plan(EvictionOrder::LowestAlignment, 600, 600, 200, occupants);
        assert_eq!(ids(plan), vec!["b"]);
    }

    #[test]
    fn test_evicts_until_budget_restored() {
        let occupants = vec![
            occ("a", 0.1, 0.5, 100),
            occ("b", 0.2, 0.5, 100),
            occ("c", 0.3, 0.5, 300),
        ];
        let plan = plan(EvictionOrder::LowestAlignment, 500, 500, 250, occupants);
        assert_eq!(ids(plan), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_other_orders() {
        let occupants = vec![
            occ("a", 0.1, 0.9, 100),
            occ("b", 0.9, 0.1, 100),
            occ("c", 0.5, 0.5, 300),
        ];
        let by_integrity = plan(EvictionOrder::LowestIntegrity, 500, 500, 100, occupants.clone());
        assert_eq!(ids(by_integrity), vec!["b"]);
        let by_size = plan(EvictionOrder::LargestFootprint, 500, 500, 100, occupants);
        assert_eq!(ids(by_size), vec!["c"]);
    }

    #[test]
    fn test_ties_break_by_id() {
        let mut occupants = vec![occ("z", 0.5, 0.5, 10), occ("m", 0.5, 0.5, 10)];
        rank_for_eviction(EvictionOrder::LowestAlignment, &mut occupants);
        assert_eq!(occupants[0].id.as_str(), "m");
    }

    #[test]
    fn test_unevictable_commitment_makes_it_impossible() {
        // 400MB committed by a module mid-activation, nothing evictable.
        let plan = plan(EvictionOrder::LowestAlignment, 500, 400, 200, vec![]);
        assert_eq!(plan, BudgetPlan::Impossible);
    }
}
