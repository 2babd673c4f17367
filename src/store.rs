//! # Fact Store (EDB)
//!
//! Indexed container of ground tuples per predicate:
//!
//! - an insertion-ordered primary set (asserting an equal tuple is a no-op);
//! - a lazily built secondary index on the leading column for bound-prefix
//!   lookups;
//! - delta buffers (added rows / removed tuples) drained by the change
//!   manager to drive incremental re-derivation.
//!
//! Rows are tombstoned on retraction so tuple ids stay stable within a turn;
//! hosts hold [`TupleId`]s, never references into the store.

use crate::schema::{Declaration, PredId};
use crate::term::{Term, Tuple};
use std::collections::HashMap;

/// Stable handle to a stored or derived tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleId {
    pub pred: PredId,
    pub row: u32,
}

impl TupleId {
    pub fn new(pred: PredId, row: u32) -> Self {
        TupleId { pred, row }
    }
}

#[derive(Debug, Default)]
struct Relation {
    /// Insertion-ordered rows; retracted rows become `None` so row ids keep
    /// meaning for provenance within a turn.
    rows: Vec<Option<Tuple>>,
    dedup: HashMap<Tuple, u32>,
    /// Secondary index keyed by the first column, built on first bound scan
    /// and dropped on any mutation.
    index0: Option<HashMap<Term, Vec<u32>>>,
    delta_added: Vec<u32>,
    delta_removed: Vec<Tuple>,
}

impl Relation {
    fn live(&self) -> usize {
        self.dedup.len()
    }

    fn invalidate_index(&mut self) {
        self.index0 = None;
    }

    fn build_index(&mut self) {
        let mut index: HashMap<Term, Vec<u32>> = HashMap::new();
        for (row, tuple) in self.rows.iter().enumerate() {
            if let Some(tuple) = tuple {
                if let Some(first) = tuple.terms().first() {
                    index.entry(first.clone()).or_default().push(row as u32);
                }
            }
        }
        self.index0 = Some(index);
    }
}

/// Per-predicate storage of ground tuples.
#[derive(Debug, Default)]
pub struct FactStore {
    relations: Vec<Relation>,
}

impl FactStore {
    pub fn new() -> Self {
        FactStore::default()
    }

    fn relation_mut(&mut self, pred: PredId) -> &mut Relation {
        let idx = pred.index();
        if idx >= self.relations.len() {
            self.relations.resize_with(idx + 1, Relation::default);
        }
        &mut self.relations[idx]
    }

    fn relation(&self, pred: PredId) -> Option<&Relation> {
        self.relations.get(pred.index())
    }

    /// Insert a validated tuple. Returns the row and whether it was new.
    ///
    /// Validation (arity, types, ground-ness) happens against the
    /// declaration before anything is stored.
    pub fn insert(
        &mut self,
        decl: &Declaration,
        terms: Vec<Term>,
    ) -> Result<(TupleId, bool), crate::error::KernelError> {
        decl.check_tuple(&terms)?;
        let pred = decl.id;
        let relation = self.relation_mut(pred);
        let tuple = Tuple::new(terms);
        if let Some(&row) = relation.dedup.get(&tuple) {
            return Ok((TupleId::new(pred, row), false));
        }
        let row = relation.rows.len() as u32;
        relation.rows.push(Some(tuple.clone()));
        relation.dedup.insert(tuple, row);
        relation.delta_added.push(row);
        relation.invalidate_index();
        Ok((TupleId::new(pred, row), true))
    }

    /// Remove all tuples matching a pattern; variables are wildcards and a
    /// repeated variable requires the matched columns to be equal.
    pub fn retract(&mut self, pred: PredId, pattern: &[Term]) -> usize {
        let relation = self.relation_mut(pred);
        let mut removed = Vec::new();
        for (row, slot) in relation.rows.iter().enumerate() {
            if let Some(tuple) = slot {
                if pattern_matches(pattern, tuple.terms()) {
                    removed.push(row);
                }
            }
        }
        for &row in &removed {
            if let Some(tuple) = relation.rows[row].take() {
                relation.dedup.remove(&tuple);
                relation.delta_removed.push(tuple);
            }
        }
        if !removed.is_empty() {
            relation.invalidate_index();
        }
        removed.len()
    }

    /// Live tuple count for a predicate.
    pub fn len(&self, pred: PredId) -> usize {
        self.relation(pred).map_or(0, Relation::live)
    }

    pub fn is_empty(&self, pred: PredId) -> bool {
        self.len(pred) == 0
    }

    /// Membership check against the live set.
    pub fn contains(&self, pred: PredId, terms: &[Term]) -> bool {
        self.relation(pred)
            .is_some_and(|r| r.dedup.contains_key(&Tuple(terms.into())))
    }

    /// Insertion-ordered scan of live tuples.
    pub fn scan(&self, pred: PredId) -> impl Iterator<Item = (TupleId, &Tuple)> {
        self.relation(pred).into_iter().flat_map(move |relation| {
            relation.rows.iter().enumerate().filter_map(move |(row, t)| {
                t.as_ref()
                    .map(|tuple| (TupleId::new(pred, row as u32), tuple))
            })
        })
    }

    /// Rows whose first column equals `key`, via the secondary index.
    pub fn scan_bound_first(&mut self, pred: PredId, key: &Term) -> Vec<(TupleId, Tuple)> {
        let relation = self.relation_mut(pred);
        if relation.index0.is_none() {
            relation.build_index();
        }
        let Some(index) = &relation.index0 else {
            return Vec::new();
        };
        index
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|&row| {
                relation.rows[row as usize]
                    .clone()
                    .map(|t| (TupleId::new(pred, row), t))
            })
            .collect()
    }

    /// Resolve a tuple id back to its tuple, if still live.
    pub fn get(&self, id: TupleId) -> Option<&Tuple> {
        self.relation(id.pred)
            .and_then(|r| r.rows.get(id.row as usize))
            .and_then(Option::as_ref)
    }

    /// Predicates with undrained deltas, i.e. changed since the last pass.
    pub fn changed_predicates(&self) -> Vec<PredId> {
        self.relations
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.delta_added.is_empty() || !r.delta_removed.is_empty())
            .map(|(i, _)| PredId(i as u32))
            .collect()
    }

    /// Drop all delta buffers after the change manager has consumed them.
    pub fn clear_deltas(&mut self) {
        for relation in &mut self.relations {
            relation.delta_added.clear();
            relation.delta_removed.clear();
        }
    }

    /// Whether any tuple was removed since the last pass (retraction forces
    /// downstream recomputation from scratch).
    pub fn had_removals(&self, pred: PredId) -> bool {
        self.relation(pred)
            .is_some_and(|r| !r.delta_removed.is_empty())
    }
}

/// Match a tuple against a pattern with variable wildcards. Repeated
/// variables bind on first use and must agree afterwards.
pub fn pattern_matches(pattern: &[Term], tuple: &[Term]) -> bool {
    if pattern.len() != tuple.len() {
        return false;
    }
    let mut bound: Vec<(&str, &Term)> = Vec::new();
    for (pat, value) in pattern.iter().zip(tuple) {
        match pat {
            Term::Var(name) => {
                if let Some((_, prior)) = bound.iter().find(|(n, _)| n == name) {
                    if *prior != value {
                        return false;
                    }
                } else {
                    bound.push((name, value));
                }
            }
            ground => {
                if ground != value {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;
    use crate::schema::SchemaRegistry;

    fn registry() -> SchemaRegistry {
        let program = parse_program(
            "Decl edge(X, Y) bound [/name, /name].\n\
             Decl cost(J, N) bound [/name, /number].",
        )
        .expect("parse");
        let mut registry = SchemaRegistry::new();
        for decl in program.decls() {
            registry.declare(decl).expect("declare");
        }
        registry
    }

    #[test]
    fn test_insert_dedup_and_order() {
        let registry = registry();
        let decl = registry.lookup("edge", 2).expect("decl").clone();
        let mut store = FactStore::new();

        let (_, fresh) = store
            .insert(&decl, vec![Term::name("a"), Term::name("b")])
            .expect("insert");
        assert!(fresh);
        let (_, fresh) = store
            .insert(&decl, vec![Term::name("a"), Term::name("b")])
            .expect("insert dup");
        assert!(!fresh);
        store
            .insert(&decl, vec![Term::name("b"), Term::name("c")])
            .expect("insert");

        assert_eq!(store.len(decl.id), 2);
        let scanned: Vec<String> = store.scan(decl.id).map(|(_, t)| t.to_string()).collect();
        assert_eq!(scanned, vec!["(/a, /b)", "(/b, /c)"]);
    }

    #[test]
    fn test_insert_validates_types() {
        let registry = registry();
        let decl = registry.lookup("cost", 2).expect("decl").clone();
        let mut store = FactStore::new();
        let err = store
            .insert(&decl, vec![Term::Int(1), Term::Int(2)])
            .expect_err("first column must be a name");
        assert_eq!(err.kind(), "TypeMismatch");
        assert_eq!(store.len(decl.id), 0);
    }

    #[test]
    fn test_retract_with_wildcards() {
        let registry = registry();
        let decl = registry.lookup("edge", 2).expect("decl").clone();
        let mut store = FactStore::new();
        for (x, y) in [("a", "b"), ("a", "c"), ("b", "c")] {
            store
                .insert(&decl, vec![Term::name(x), Term::name(y)])
                .expect("insert");
        }

        let removed = store.retract(decl.id, &[Term::name("a"), Term::Var("Y".to_string())]);
        assert_eq!(removed, 2);
        assert_eq!(store.len(decl.id), 1);
        assert!(store.contains(decl.id, &[Term::name("b"), Term::name("c")]));
    }

    #[test]
    fn test_retract_repeated_variable_requires_equality() {
        let registry = registry();
        let decl = registry.lookup("edge", 2).expect("decl").clone();
        let mut store = FactStore::new();
        store
            .insert(&decl, vec![Term::name("a"), Term::name("a")])
            .expect("insert");
        store
            .insert(&decl, vec![Term::name("a"), Term::name("b")])
            .expect("insert");

        let pattern = vec![Term::Var("X".to_string()), Term::Var("X".to_string())];
        let removed = store.retract(decl.id, &pattern);
        assert_eq!(removed, 1);
        assert!(store.contains(decl.id, &[Term::name("a"), Term::name("b")]));
    }

    #[test]
    fn test_assert_then_retract_restores_state() {
        let registry = registry();
        let decl = registry.lookup("edge", 2).expect("decl").clone();
        let mut store = FactStore::new();
        store
            .insert(&decl, vec![Term::name("a"), Term::name("b")])
            .expect("insert");
        store.clear_deltas();

        store
            .insert(&decl, vec![Term::name("x"), Term::name("y")])
            .expect("insert");
        store.retract(decl.id, &[Term::name("x"), Term::name("y")]);

        assert_eq!(store.len(decl.id), 1);
        assert!(store.contains(decl.id, &[Term::name("a"), Term::name("b")]));
        assert!(!store.contains(decl.id, &[Term::name("x"), Term::name("y")]));
    }

    #[test]
    fn test_bound_first_scan_uses_index() {
        let registry = registry();
        let decl = registry.lookup("edge", 2).expect("decl").clone();
        let mut store = FactStore::new();
        for (x, y) in [("a", "b"), ("b", "c"), ("a", "d")] {
            store
                .insert(&decl, vec![Term::name(x), Term::name(y)])
                .expect("insert");
        }
        let hits = store.scan_bound_first(decl.id, &Term::name("a"));
        assert_eq!(hits.len(), 2);
        let hits = store.scan_bound_first(decl.id, &Term::name("z"));
        assert!(hits.is_empty());
    }

    #[test]
    fn test_deltas_track_changes() {
        let registry = registry();
        let decl = registry.lookup("edge", 2).expect("decl").clone();
        let mut store = FactStore::new();
        store
            .insert(&decl, vec![Term::name("a"), Term::name("b")])
            .expect("insert");
        assert_eq!(store.changed_predicates(), vec![decl.id]);

        store.clear_deltas();
        assert!(store.changed_predicates().is_empty());

        store.retract(decl.id, &[Term::name("a"), Term::name("b")]);
        assert_eq!(store.changed_predicates(), vec![decl.id]);
        assert!(store.had_removals(decl.id));
    }
}
