//! Kernel statistics: per-predicate fact counts, stratum assignment, and
//! cumulative evaluator counters. Serialisable so hosts and the REPL
//! `.stats` command can render them directly.

use crate::compile::RuleSet;
use crate::eval::{DerivationCache, EvalStats, PredState};
use crate::schema::SchemaRegistry;
use crate::store::FactStore;
use crate::stratify::Stratification;
use serde::Serialize;

/// Snapshot of one predicate's storage and derivation state.
#[derive(Debug, Clone, Serialize)]
pub struct PredicateStats {
    pub name: String,
    pub arity: usize,
    pub external: bool,
    pub stratum: usize,
    pub stored: usize,
    pub derived: usize,
    pub state: PredState,
}

/// Whole-kernel snapshot returned by `Kernel::statistics`.
#[derive(Debug, Clone, Serialize)]
pub struct KernelStatistics {
    pub predicates: usize,
    pub rules: usize,
    pub quarantined_rules: usize,
    pub strata: usize,
    pub stored_facts: usize,
    pub derived_tuples: usize,
    pub eval: EvalStats,
    pub by_predicate: Vec<PredicateStats>,
}

pub fn snapshot(
    registry: &SchemaRegistry,
    rules: &RuleSet,
    strat: &Stratification,
    store: &FactStore,
    cache: &DerivationCache,
    quarantined: usize,
    eval: EvalStats,
) -> KernelStatistics {
    let mut by_predicate = Vec::with_capacity(registry.len());
    let mut stored_facts = 0;
    for decl in registry.iter() {
        let stored = store.len(decl.id);
        stored_facts += stored;
        by_predicate.push(PredicateStats {
            name: decl.name.to_string(),
            arity: decl.arity(),
            external: decl.external,
            stratum: strat.stratum(decl.id),
            stored,
            derived: cache.len(decl.id),
            state: cache.state(decl.id),
        });
    }
    KernelStatistics {
        predicates: registry.len(),
        rules: rules.len(),
        quarantined_rules: quarantined,
        strata: strat.n_strata(),
        stored_facts,
        derived_tuples: cache.total_rows(),
        eval,
        by_predicate,
    }
}
