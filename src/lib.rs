//! # Stratalog Deductive Kernel
//!
//! A stratified Datalog knowledge kernel for AI agents: declare typed
//! predicates, assert ground facts, register recursive rules, and query
//! everything that logically follows.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Logic Source Text
//!     |
//! [Parser]            -> declarations, facts, rules, queries
//!     |
//! [Schema Registry]   -> (name, arity) -> type/mode vectors, external flag
//!     |
//! [Rule Compiler]     -> safety checks + goal-ordered slot plans
//!     |
//! [Stratifier]        -> SCC condensation, strata, negation-cycle rejection
//!     |
//! [Evaluator]         -> semi-naive fixpoint per stratum
//!     |         \
//! [Fact Store]  [External Bridge] -> host handlers (vector search, git, fs)
//!     |
//! [Query Interface]   -> answers, diagnostics, derivation traces
//! ```
//!
//! The [`Kernel`] serialises queries, asserts, and retracts behind one
//! evaluation lock; between two queries the change manager invalidates only
//! the strata downstream of what actually changed.
//!
//! ## Usage
//!
//! ```rust
//! use stratalog::{Kernel, QueryOptions, Term};
//!
//! let kernel = Kernel::new();
//! kernel
//!     .load_schema(
//!         "Decl edge(X, Y) bound [/name, /name].\n\
//!          Decl path(X, Y) bound [/name, /name].\n\
//!          path(X, Y) :- edge(X, Y).\n\
//!          path(X, Z) :- edge(X, Y), path(Y, Z).\n\
//!          edge(/a, /b). edge(/b, /c).",
//!     )
//!     .expect("schema loads");
//!
//! let result = kernel
//!     .query("path(/a, Z)", QueryOptions::default())
//!     .expect("query runs");
//! assert_eq!(result.len(), 2);
//!
//! kernel
//!     .assert_fact("edge", vec![Term::name("c"), Term::name("d")])
//!     .expect("assert");
//! let result = kernel
//!     .query("path(/a, Z)", QueryOptions::default())
//!     .expect("query runs");
//! assert_eq!(result.len(), 3);
//! ```

pub mod ast;
pub mod changes;
pub mod compile;
pub mod config;
pub mod deadline;
pub mod error;
pub mod eval;
pub mod external;
pub mod interner;
pub mod parser;
pub mod query;
pub mod schema;
pub mod statistics;
pub mod store;
pub mod stratify;
pub mod term;

// Re-export the host-facing surface.
pub use ast::{Atom, Mode};
pub use compile::RuleId;
pub use config::Config;
pub use deadline::{CancelHandle, Deadline};
pub use error::{KernelError, KernelResult, Span};
pub use eval::{Diagnostic, EvalStats, PredState};
pub use external::{ExternalError, ExternalHandler, ExternalRegistry};
pub use query::{Answer, ProofTree, QueryOptions, QueryResult};
pub use schema::{Declaration, PredId};
pub use statistics::{KernelStatistics, PredicateStats};
pub use store::TupleId;
pub use term::{Term, Tuple, TypeTag};

use arc_swap::ArcSwap;
use changes::ChangeManager;
use compile::{compile_rule, lower_goal, RuleSet};
use crossbeam_channel::{Receiver, Sender};
use eval::{DerivationCache, Evaluator};
use parking_lot::Mutex;
use schema::SchemaRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use store::FactStore;
use stratify::{stratify, DependencyGraph, Stratification};
use tracing::{debug, info};

/// A quarantined rule, as listed to hosts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QuarantinedRule {
    pub id: u32,
    pub text: String,
}

struct Inner {
    registry: Arc<SchemaRegistry>,
    rules: RuleSet,
    graph: DependencyGraph,
    strat: Stratification,
    store: FactStore,
    cache: DerivationCache,
    externals: ExternalRegistry,
    quarantined: HashSet<RuleId>,
    rule_errors: HashMap<RuleId, u32>,
    changes: ChangeManager,
    eval_totals: EvalStats,
}

impl Inner {
    fn empty() -> Self {
        Inner {
            registry: Arc::new(SchemaRegistry::new()),
            rules: RuleSet::new(),
            graph: DependencyGraph::default(),
            strat: Stratification::default(),
            store: FactStore::new(),
            cache: DerivationCache::new(0),
            externals: ExternalRegistry::new(),
            quarantined: HashSet::new(),
            rule_errors: HashMap::new(),
            changes: ChangeManager::new(),
            eval_totals: EvalStats::default(),
        }
    }
}

/// The deductive kernel. All operations are serialised by an internal
/// evaluation lock; the kernel itself is `Send + Sync` and can be shared
/// behind an `Arc`.
pub struct Kernel {
    inner: Mutex<Inner>,
    /// Lock-free schema snapshot for dumps and lookups while a query runs.
    schema_view: ArcSwap<SchemaRegistry>,
    config: Config,
    diagnostics_tx: Mutex<Option<Sender<Diagnostic>>>,
}

impl Default for Kernel {
    fn default() -> Self {
        Kernel::new()
    }
}

impl Kernel {
    /// Create a kernel with default configuration.
    pub fn new() -> Self {
        Kernel::with_config(Config::default())
    }

    /// Create a kernel with explicit configuration.
    pub fn with_config(config: Config) -> Self {
        Kernel {
            inner: Mutex::new(Inner::empty()),
            schema_view: ArcSwap::new(Arc::new(SchemaRegistry::new())),
            config,
            diagnostics_tx: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Schema lifecycle
    // ------------------------------------------------------------------

    /// Load a full schema: declarations, rules, and seed facts.
    ///
    /// This is a rebuild: it replaces declarations, rules, stored facts,
    /// external handler registrations, and clears all quarantines. Any
    /// failure (parse, schema, safety, stratification) leaves the prior
    /// state intact.
    pub fn load_schema(&self, text: &str) -> KernelResult<()> {
        let program = parser::parse_program(text)?;

        // Stage the whole new generation before touching live state.
        let mut registry = SchemaRegistry::new();
        for decl in program.decls() {
            registry.declare(decl)?;
        }
        let mut rules = RuleSet::new();
        for clause in program.rules() {
            let id = rules.next_id();
            rules.push(compile_rule(&registry, clause, id)?);
        }
        let graph = DependencyGraph::build(registry.len(), rules.as_slice());
        let strat = stratify(&registry, &graph)?;

        let mut store = FactStore::new();
        for fact in program.facts() {
            let decl = registry.resolve(&fact.head.pred, fact.head.arity())?;
            if decl.external {
                return Err(KernelError::SchemaViolation(format!(
                    "cannot store facts for external predicate {}",
                    decl.name
                )));
            }
            store.insert(decl, fact.head.args.clone())?;
        }
        store.clear_deltas();

        let cache = DerivationCache::new(registry.len());
        let registry = Arc::new(registry);

        let mut inner = self.inner.lock();
        info!(
            predicates = registry.len(),
            rules = rules.len(),
            strata = strat.n_strata(),
            "schema loaded"
        );
        self.schema_view.store(Arc::clone(&registry));
        *inner = Inner {
            registry,
            rules,
            graph,
            strat,
            store,
            cache,
            externals: ExternalRegistry::new(),
            quarantined: HashSet::new(),
            rule_errors: HashMap::new(),
            changes: ChangeManager::new(),
            eval_totals: EvalStats::default(),
        };
        Ok(())
    }

    /// Register additional declarations, rules, and facts at runtime.
    ///
    /// Treated as a schema mutation: the rule set is re-stratified and a
    /// rule introducing a negation (or aggregation) cycle is refused with
    /// the prior state intact. Caches downstream of the new rule heads are
    /// invalidated; everything else is reused.
    pub fn register_rules(&self, text: &str) -> KernelResult<()> {
        let program = parser::parse_program(text)?;
        let mut inner = self.inner.lock();

        let mut registry = (*inner.registry).clone();
        for decl in program.decls() {
            registry.declare(decl)?;
        }
        let mut rules = inner.rules.clone();
        let mut new_heads = Vec::new();
        for clause in program.rules() {
            let id = rules.next_id();
            let compiled = compile_rule(&registry, clause, id)?;
            new_heads.push(compiled.head_pred);
            rules.push(compiled);
        }
        let graph = DependencyGraph::build(registry.len(), rules.as_slice());
        let strat = stratify(&registry, &graph)?;

        // Facts must also validate before anything is committed, so a bad
        // registration leaves the prior generation fully intact.
        for fact in program.facts() {
            let decl = registry.resolve(&fact.head.pred, fact.head.arity())?;
            if decl.external {
                return Err(KernelError::SchemaViolation(format!(
                    "cannot store facts for external predicate {}",
                    decl.name
                )));
            }
            decl.check_tuple(&fact.head.args)?;
        }

        // Validated: commit the staged generation.
        let registry = Arc::new(registry);
        self.schema_view.store(Arc::clone(&registry));
        inner.registry = registry;
        inner.rules = rules;
        inner.graph = graph;
        inner.strat = strat;
        let registry_len = inner.registry.len();
        inner.cache.resize(registry_len);

        for head in new_heads {
            inner.changes.mark(head);
        }
        for fact in program.facts() {
            let decl = inner
                .registry
                .resolve(&fact.head.pred, fact.head.arity())?
                .clone();
            self.insert_checked(&mut inner, &decl, fact.head.args.clone())?;
        }
        debug!(rules = inner.rules.len(), "rules registered");
        Ok(())
    }

    /// Register a handler for a declared external predicate.
    ///
    /// The mode vector must match the declaration exactly.
    pub fn register_external(
        &self,
        name: &str,
        arity: usize,
        modes: &[Mode],
        handler: Arc<dyn ExternalHandler>,
    ) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let decl = inner.registry.resolve(name, arity)?.clone();
        if !decl.external {
            return Err(KernelError::SchemaViolation(format!(
                "{} is not declared external()",
                decl.name
            )));
        }
        if decl.modes.as_deref() != Some(modes) {
            return Err(KernelError::SchemaViolation(format!(
                "{}: handler mode vector disagrees with the declaration",
                decl.name
            )));
        }
        inner.externals.register(&decl, handler)?;
        // Cached derivations may have been computed without this handler.
        inner.changes.mark(decl.id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // EDB mutation
    // ------------------------------------------------------------------

    /// Assert one ground fact. Validates arity and types before insertion.
    pub fn assert_fact(&self, pred: &str, terms: Vec<Term>) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        let decl = inner.registry.resolve(pred, terms.len())?.clone();
        self.insert_checked(&mut inner, &decl, terms)
    }

    fn insert_checked(
        &self,
        inner: &mut Inner,
        decl: &Declaration,
        terms: Vec<Term>,
    ) -> KernelResult<()> {
        if decl.external {
            return Err(KernelError::SchemaViolation(format!(
                "cannot store facts for external predicate {}",
                decl.name
            )));
        }
        if inner.store.len(decl.id) >= self.config.limits.max_tuples_per_predicate {
            return Err(KernelError::Overflow {
                pred: decl.name.to_string(),
                cap: self.config.limits.max_tuples_per_predicate,
            });
        }
        inner.store.insert(decl, terms)?;
        Ok(())
    }

    /// Retract every stored tuple matching the pattern (variables are
    /// wildcards). Returns the number of tuples removed.
    pub fn retract(&self, pred: &str, pattern: Vec<Term>) -> KernelResult<usize> {
        let mut inner = self.inner.lock();
        let decl = inner.registry.resolve(pred, pattern.len())?.clone();
        // Ground pattern columns must at least fit the declared types,
        // otherwise the pattern can never have matched an inserted tuple.
        for (i, (term, tag)) in pattern.iter().zip(&decl.types).enumerate() {
            if term.is_ground() && !tag.admits(term) {
                return Err(KernelError::TypeMismatch(format!(
                    "{}: pattern argument {} is {} but declared {}",
                    decl.name,
                    i + 1,
                    term.tag_name(),
                    tag
                )));
            }
        }
        Ok(inner.store.retract(decl.id, &pattern))
    }

    /// Stored (EDB) tuples of a predicate, in insertion order.
    pub fn facts(&self, pred: &str, arity: usize) -> KernelResult<Vec<Vec<Term>>> {
        let inner = self.inner.lock();
        let decl = inner.registry.resolve(pred, arity)?;
        Ok(inner
            .store
            .scan(decl.id)
            .map(|(_, t)| t.terms().to_vec())
            .collect())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Evaluate a single-atom goal, e.g. `"path(/a, Z)"`.
    ///
    /// Saturates exactly the strata the goal transitively depends on for the
    /// current EDB snapshot, then enumerates answers in the insertion order
    /// of the tuples that produced them.
    pub fn query(&self, goal: &str, opts: QueryOptions) -> KernelResult<QueryResult> {
        let atom = parser::parse_goal(goal)?;
        self.query_atom(&atom, opts)
    }

    /// [`Kernel::query`] with a pre-parsed goal atom.
    pub fn query_atom(&self, atom: &Atom, opts: QueryOptions) -> KernelResult<QueryResult> {
        let mut inner = self.inner.lock();
        let decl = inner.registry.resolve(&atom.pred, atom.arity())?.clone();
        if decl.external {
            return Err(KernelError::SchemaViolation(format!(
                "external predicate {} can only be queried through rules",
                decl.name
            )));
        }

        let deadline = Deadline::new(opts.deadline.or(self.config.default_deadline()));
        let trace =
            opts.trace || self.config.query.trace || cfg!(feature = "always-trace");

        // Fold pending asserts/retracts into the caches before evaluating.
        let Inner {
            registry,
            rules,
            graph,
            strat,
            store,
            cache,
            externals,
            quarantined,
            rule_errors,
            changes,
            eval_totals,
        } = &mut *inner;
        changes.apply(graph, rules, store, cache);

        // Only strata the goal can see need saturating.
        let needed: Vec<usize> = graph
            .upstream_of(decl.id)
            .into_iter()
            .map(|p| strat.stratum(p))
            .collect();

        let sink = self.diagnostics_tx.lock().clone();
        let mut evaluator = Evaluator::new(
            registry,
            rules,
            strat,
            store,
            externals,
            cache,
            quarantined,
            rule_errors,
            self.config.eval_limits(),
            deadline,
            trace,
            sink,
        );
        let outcome = evaluator.saturate(&needed);
        let diagnostics = std::mem::take(&mut evaluator.diagnostics);
        let stats = evaluator.stats;
        drop(evaluator);

        eval_totals.fixpoint_rounds += stats.fixpoint_rounds;
        eval_totals.tuples_derived += stats.tuples_derived;
        eval_totals.external_calls += stats.external_calls;
        eval_totals.bindings_skipped += stats.bindings_skipped;

        if let Err(err) = outcome {
            // Partially computed strata are discarded; saturated strata from
            // earlier passes stay usable.
            cache.discard_unsaturated();
            return Err(err);
        }

        // Enumerate answers against the saturated relation.
        let (args, slot_names) = lower_goal(atom);
        let mut result = QueryResult {
            diagnostics,
            stats,
            ..QueryResult::default()
        };
        let rows: Vec<(TupleId, Tuple)> = if rules.is_idb(decl.id) {
            cache
                .rows(decl.id)
                .iter()
                .enumerate()
                .map(|(row, t)| (TupleId::new(decl.id, row as u32), t.clone()))
                .collect()
        } else {
            store.scan(decl.id).map(|(id, t)| (id, t.clone())).collect()
        };

        let mut frame: Vec<Option<Term>> = vec![None; slot_names.len()];
        for (id, tuple) in rows {
            let mut trail = Vec::new();
            let mut matched = true;
            for (pat, value) in args.iter().zip(tuple.terms()) {
                if !eval::unify(pat, value, &mut frame, &mut trail) {
                    matched = false;
                    break;
                }
            }
            if matched {
                let mut bindings = HashMap::new();
                for (slot, name) in slot_names.iter().enumerate() {
                    if name.starts_with('_') {
                        continue; // wildcards stay anonymous
                    }
                    if let Some(value) = &frame[slot] {
                        bindings.insert(name.clone(), value.clone());
                    }
                }
                result.answers.push(Answer {
                    bindings,
                    tuple: trace.then_some(id),
                });
            }
            for &slot in &trail {
                frame[slot] = None;
            }
            if let Some(limit) = opts.limit {
                if result.answers.len() >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Proof tree for a derived (or stored) tuple id obtained from a traced
    /// query.
    pub fn derivation_trace(&self, id: TupleId) -> KernelResult<ProofTree> {
        let inner = self.inner.lock();
        query::derivation_trace(&inner.registry, &inner.store, &inner.cache, id)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Render the current declarations back to source text.
    pub fn dump_schema(&self) -> String {
        self.schema_view.load().dump()
    }

    /// Rules currently quarantined (cleared by the next schema load).
    pub fn quarantined_rules(&self) -> Vec<QuarantinedRule> {
        let inner = self.inner.lock();
        let mut out: Vec<QuarantinedRule> = inner
            .quarantined
            .iter()
            .map(|id| QuarantinedRule {
                id: id.0,
                text: inner.rules.get(*id).display.clone(),
            })
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Storage and evaluation counters for every declared predicate.
    pub fn statistics(&self) -> KernelStatistics {
        let inner = self.inner.lock();
        statistics::snapshot(
            &inner.registry,
            &inner.rules,
            &inner.strat,
            &inner.store,
            &inner.cache,
            inner.quarantined.len(),
            inner.eval_totals,
        )
    }

    /// Subscribe to the live diagnostics stream. Diagnostics are also
    /// attached to each `QueryResult`; the channel exists for hosts that
    /// want them pushed.
    pub fn subscribe_diagnostics(&self) -> Receiver<Diagnostic> {
        let (tx, rx) = crossbeam_channel::unbounded();
        *self.diagnostics_tx.lock() = Some(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_starts_empty() {
        let kernel = Kernel::new();
        assert_eq!(kernel.statistics().predicates, 0);
        assert!(kernel.dump_schema().is_empty());
    }

    #[test]
    fn test_load_schema_and_query() {
        let kernel = Kernel::new();
        kernel
            .load_schema(
                "Decl edge(X, Y) bound [/name, /name].\n\
                 Decl path(X, Y) bound [/name, /name].\n\
                 path(X, Y) :- edge(X, Y).\n\
                 path(X, Z) :- edge(X, Y), path(Y, Z).\n\
                 edge(/a, /b). edge(/b, /c). edge(/c, /d).",
            )
            .expect("schema loads");

        let result = kernel
            .query("path(/a, Z)", QueryOptions::default())
            .expect("query");
        let mut names: Vec<String> = result
            .column("Z")
            .iter()
            .map(ToString::to_string)
            .collect();
        names.sort();
        assert_eq!(names, vec!["/b", "/c", "/d"]);
    }

    #[test]
    fn test_failed_load_leaves_prior_schema() {
        let kernel = Kernel::new();
        kernel
            .load_schema("Decl item(X).\nitem(/a).")
            .expect("first load");

        let err = kernel
            .load_schema("Decl p(X).\nDecl q(X).\np(X) :- p(X), !q(X).\nq(X) :- p(X), !p(X).")
            .expect_err("negation cycle");
        assert_eq!(err.kind(), "StratificationError");

        // Prior schema still answers.
        let result = kernel
            .query("item(X)", QueryOptions::default())
            .expect("query");
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn test_query_undeclared_predicate_fails() {
        let kernel = Kernel::new();
        kernel.load_schema("Decl item(X).").expect("load");
        let err = kernel
            .query("missing(X)", QueryOptions::default())
            .expect_err("undeclared");
        assert_eq!(err.kind(), "SchemaViolation");
    }

    #[test]
    fn test_assert_validates_against_declaration() {
        let kernel = Kernel::new();
        kernel
            .load_schema("Decl cost(J, N) bound [/name, /number].")
            .expect("load");

        kernel
            .assert_fact("cost", vec![Term::name("j1"), Term::Int(3)])
            .expect("valid");
        let err = kernel
            .assert_fact("cost", vec![Term::Int(1), Term::Int(3)])
            .expect_err("type mismatch");
        assert_eq!(err.kind(), "TypeMismatch");
        let err = kernel
            .assert_fact("cost", vec![Term::name("j1")])
            .expect_err("arity mismatch");
        assert_eq!(err.kind(), "SchemaViolation"); // cost/1 is undeclared
    }
}
