//! # Change Manager
//!
//! Tracks which predicates changed between queries (asserts, retracts, rule
//! registrations) and invalidates exactly the derivation caches that
//! transitively depend on them. The next query recomputes only the
//! invalidated strata; unaffected caches are reused.
//!
//! Retraction is not differential: downstream derivations are discarded and
//! recomputed from scratch.

use crate::compile::RuleSet;
use crate::eval::DerivationCache;
use crate::schema::PredId;
use crate::store::FactStore;
use crate::stratify::DependencyGraph;
use std::collections::HashSet;
use tracing::debug;

/// Dirty-set bookkeeping between evaluator passes.
#[derive(Debug, Default)]
pub struct ChangeManager {
    dirty: HashSet<PredId>,
}

impl ChangeManager {
    pub fn new() -> Self {
        ChangeManager::default()
    }

    /// Record an out-of-band change (e.g. a newly registered rule head).
    pub fn mark(&mut self, pred: PredId) {
        self.dirty.insert(pred);
    }

    pub fn is_clean(&self) -> bool {
        self.dirty.is_empty()
    }

    /// Merge pending store deltas into the dirty set and invalidate every
    /// IDB cache downstream of a change. Returns the set of invalidated
    /// predicates (empty when nothing changed).
    pub fn apply(
        &mut self,
        graph: &DependencyGraph,
        rules: &RuleSet,
        store: &mut FactStore,
        cache: &mut DerivationCache,
    ) -> HashSet<PredId> {
        for pred in store.changed_predicates() {
            self.dirty.insert(pred);
        }
        store.clear_deltas();

        if self.dirty.is_empty() {
            return HashSet::new();
        }

        let seeds: Vec<PredId> = self.dirty.drain().collect();
        let affected = graph.downstream_of(&seeds);
        let mut invalidated = HashSet::new();
        for &pred in &affected {
            if rules.is_idb(pred) {
                cache.invalidate(pred);
                invalidated.insert(pred);
            }
        }
        debug!(
            changed = seeds.len(),
            invalidated = invalidated.len(),
            "invalidated downstream derivations"
        );
        invalidated
    }
}
