//! # Query Interface
//!
//! A query is a single atom. Evaluation first saturates every stratum the
//! goal transitively depends on, then enumerates answers by unifying the
//! goal against the predicate's tuples in insertion order.
//!
//! With `trace` enabled each answer carries the [`TupleId`] of the matched
//! tuple, and [`ProofTree`]s can be reconstructed from the provenance kept
//! on derived tuples.

use crate::error::{KernelError, KernelResult};
use crate::eval::{DerivationCache, Diagnostic, EvalStats, Provenance};
use crate::schema::SchemaRegistry;
use crate::store::{FactStore, TupleId};
use crate::term::Term;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Options accepted by `Kernel::query`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Capture provenance and return tuple ids with each answer.
    pub trace: bool,
    /// Time budget for the whole operation (saturation included).
    pub deadline: Option<Duration>,
    /// Stop after this many answers.
    pub limit: Option<usize>,
}

impl QueryOptions {
    pub fn traced() -> Self {
        QueryOptions {
            trace: true,
            ..QueryOptions::default()
        }
    }
}

/// One answer: variable bindings plus, in trace mode, the matched tuple.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub bindings: HashMap<String, Term>,
    #[serde(skip)]
    pub tuple: Option<TupleId>,
}

impl Answer {
    pub fn get(&self, var: &str) -> Option<&Term> {
        self.bindings.get(var)
    }
}

/// Result of one query: answers in insertion order plus the diagnostics the
/// evaluation surfaced.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub answers: Vec<Answer>,
    pub diagnostics: Vec<Diagnostic>,
    pub stats: EvalStats,
}

impl QueryResult {
    pub fn iter(&self) -> impl Iterator<Item = &Answer> {
        self.answers.iter()
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    /// Collect the values of one variable across all answers.
    pub fn column(&self, var: &str) -> Vec<Term> {
        self.answers
            .iter()
            .filter_map(|a| a.get(var).cloned())
            .collect()
    }
}

impl IntoIterator for QueryResult {
    type Item = Answer;
    type IntoIter = std::vec::IntoIter<Answer>;

    fn into_iter(self) -> Self::IntoIter {
        self.answers.into_iter()
    }
}

/// Proof tree for one derived tuple: the rule that produced it and the
/// subtrees for each body tuple it consumed.
#[derive(Debug, Clone, Serialize)]
pub struct ProofTree {
    pub pred: String,
    pub tuple: Vec<Term>,
    /// Rule id, `None` for stored facts (leaves).
    pub rule: Option<u32>,
    pub children: Vec<ProofTree>,
}

/// Reconstruct the proof tree for a tuple id against the current caches.
pub fn derivation_trace(
    registry: &SchemaRegistry,
    store: &FactStore,
    cache: &DerivationCache,
    id: TupleId,
) -> KernelResult<ProofTree> {
    build_proof(registry, store, cache, id, 0)
}

const MAX_PROOF_DEPTH: usize = 256;

fn build_proof(
    registry: &SchemaRegistry,
    store: &FactStore,
    cache: &DerivationCache,
    id: TupleId,
    depth: usize,
) -> KernelResult<ProofTree> {
    if depth > MAX_PROOF_DEPTH {
        return Err(KernelError::NotFound(
            "proof tree exceeds maximum depth".to_string(),
        ));
    }
    let name = registry.get(id.pred).name.to_string();

    if let Some(tuple) = cache.get(id) {
        let provenance: Option<&Provenance> = cache.provenance(id);
        let mut children = Vec::new();
        if let Some(provenance) = provenance {
            for &source in &provenance.sources {
                children.push(build_proof(registry, store, cache, source, depth + 1)?);
            }
        }
        return Ok(ProofTree {
            pred: name,
            tuple: tuple.terms().to_vec(),
            rule: provenance.map(|p| p.rule.0),
            children,
        });
    }

    if let Some(tuple) = store.get(id) {
        return Ok(ProofTree {
            pred: name,
            tuple: tuple.terms().to_vec(),
            rule: None,
            children: Vec::new(),
        });
    }

    Err(KernelError::NotFound(format!(
        "no tuple with id {}/{}",
        name, id.row
    )))
}
