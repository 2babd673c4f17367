//! # Evaluator
//!
//! Semi-naive bottom-up fixpoint, one stratum at a time:
//!
//! - strata run in ascending order; a stratum starts with one naive round,
//!   then iterates delta rounds where at least one same-stratum positive
//!   literal draws from the tuples of the previous round;
//! - negation is a membership check against a completed lower stratum;
//! - aggregation pipelines run in the naive round only (the stratifier puts
//!   their inputs strictly below);
//! - external literals go through the bridge, memoised per distinct
//!   bound-argument tuple for the rest of the fixpoint;
//! - `TypeMismatch`/`ArithmeticError` on one binding skips that binding,
//!   reports a diagnostic, and keeps evaluating; rules past the error
//!   threshold (or tripping the tuple cap) are quarantined;
//! - the deadline is checked at chunk boundaries and before external calls.
//!
//! Within a stratum each predicate moves pending -> saturating -> saturated;
//! the stratum completes when every predicate in it is saturated.

pub mod builtins;

use crate::ast::{CmpOp, Mode};
use crate::compile::{CompiledRule, PlanExpr, PlanTerm, RuleId, RuleSet, Step};
use crate::deadline::Deadline;
use crate::error::{KernelError, KernelResult};
use crate::external::ExternalRegistry;
use crate::schema::{PredId, SchemaRegistry};
use crate::store::{FactStore, TupleId};
use crate::stratify::Stratification;
use crate::term::{Term, Tuple};
use crossbeam_channel::Sender;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// How often the inner join loop polls the deadline.
const DEADLINE_CHECK_INTERVAL: u32 = 256;

// ============================================================================
// Diagnostics
// ============================================================================

/// One evaluation problem surfaced to the host. Local errors never abort the
/// query; they are attributed to the rule and binding that raised them.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Stable error kind identifier (`TypeMismatch`, `ArithmeticError`, ...).
    pub kind: String,
    pub message: String,
    pub rule: Option<u32>,
    pub rule_text: Option<String>,
}

impl Diagnostic {
    fn for_rule(rule: &CompiledRule, err: &KernelError) -> Self {
        Diagnostic {
            kind: err.kind().to_string(),
            message: err.to_string(),
            rule: Some(rule.id.0),
            rule_text: Some(rule.display.clone()),
        }
    }
}

// ============================================================================
// Derivation cache
// ============================================================================

/// Saturation state of one predicate within its stratum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PredState {
    Pending,
    Saturating,
    Saturated,
}

/// Provenance of one derived tuple: the rule and the body tuples that
/// produced it. Captured only when trace mode is on.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub rule: RuleId,
    pub sources: Vec<TupleId>,
}

#[derive(Debug, Default)]
struct DerivedRelation {
    rows: Vec<Tuple>,
    dedup: HashMap<Tuple, u32>,
    provenance: Vec<Option<Provenance>>,
    stratum: usize,
}

/// Per-predicate sets of derived tuples at the current fixpoint, tagged with
/// the stratum that produced them.
#[derive(Debug, Default)]
pub struct DerivationCache {
    relations: Vec<DerivedRelation>,
    states: Vec<PredState>,
}

impl DerivationCache {
    pub fn new(n_preds: usize) -> Self {
        let mut cache = DerivationCache::default();
        cache.resize(n_preds);
        cache
    }

    pub fn resize(&mut self, n_preds: usize) {
        self.relations
            .resize_with(n_preds, DerivedRelation::default);
        self.states.resize(n_preds, PredState::Pending);
    }

    pub fn state(&self, pred: PredId) -> PredState {
        self.states[pred.index()]
    }

    pub fn set_state(&mut self, pred: PredId, state: PredState) {
        self.states[pred.index()] = state;
    }

    pub fn rows(&self, pred: PredId) -> &[Tuple] {
        &self.relations[pred.index()].rows
    }

    pub fn len(&self, pred: PredId) -> usize {
        self.relations[pred.index()].rows.len()
    }

    pub fn is_empty(&self, pred: PredId) -> bool {
        self.len(pred) == 0
    }

    pub fn contains(&self, pred: PredId, terms: &[Term]) -> bool {
        self.relations[pred.index()]
            .dedup
            .contains_key(&Tuple(terms.into()))
    }

    pub fn get(&self, id: TupleId) -> Option<&Tuple> {
        self.relations[id.pred.index()].rows.get(id.row as usize)
    }

    pub fn provenance(&self, id: TupleId) -> Option<&Provenance> {
        self.relations[id.pred.index()]
            .provenance
            .get(id.row as usize)
            .and_then(Option::as_ref)
    }

    /// Insert a derived tuple; `None` when already present.
    fn insert(
        &mut self,
        pred: PredId,
        tuple: Tuple,
        stratum: usize,
        provenance: Option<Provenance>,
    ) -> Option<u32> {
        let relation = &mut self.relations[pred.index()];
        if relation.dedup.contains_key(&tuple) {
            return None;
        }
        let row = relation.rows.len() as u32;
        relation.rows.push(tuple.clone());
        relation.dedup.insert(tuple, row);
        relation.provenance.push(provenance);
        relation.stratum = stratum;
        Some(row)
    }

    /// Forget everything derived for `pred` and mark it pending.
    pub fn invalidate(&mut self, pred: PredId) {
        let relation = &mut self.relations[pred.index()];
        relation.rows.clear();
        relation.dedup.clear();
        relation.provenance.clear();
        self.states[pred.index()] = PredState::Pending;
    }

    /// Drop partially computed predicates after a cancelled pass, keeping
    /// already-saturated strata intact.
    pub fn discard_unsaturated(&mut self) {
        for idx in 0..self.states.len() {
            if self.states[idx] == PredState::Saturating {
                self.invalidate(PredId(idx as u32));
            }
        }
    }

    /// Total derived tuples across all predicates.
    pub fn total_rows(&self) -> usize {
        self.relations.iter().map(|r| r.rows.len()).sum()
    }
}

// ============================================================================
// Evaluation limits and counters
// ============================================================================

/// Resource limits applied during evaluation.
#[derive(Debug, Clone)]
pub struct EvalLimits {
    /// Per-predicate cap on materialised tuples.
    pub max_tuples_per_predicate: usize,
    /// Local errors tolerated per rule before it is quarantined.
    pub rule_error_threshold: u32,
}

impl Default for EvalLimits {
    fn default() -> Self {
        EvalLimits {
            max_tuples_per_predicate: 1_000_000,
            rule_error_threshold: 64,
        }
    }
}

/// Counters exposed through kernel statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EvalStats {
    pub fixpoint_rounds: u64,
    pub tuples_derived: u64,
    pub external_calls: u64,
    pub bindings_skipped: u64,
}

// ============================================================================
// Evaluator
// ============================================================================

type Frame = Vec<Option<Term>>;
type DeltaMap = HashMap<PredId, Vec<(u32, Tuple)>>;

/// One evaluation pass over a set of strata. Borrows every kernel component
/// for the duration of the pass; the EDB is frozen while it runs.
pub struct Evaluator<'a> {
    pub registry: &'a SchemaRegistry,
    pub rules: &'a RuleSet,
    pub strat: &'a Stratification,
    pub store: &'a mut FactStore,
    pub externals: &'a ExternalRegistry,
    pub cache: &'a mut DerivationCache,
    pub quarantined: &'a mut HashSet<RuleId>,
    pub rule_errors: &'a mut HashMap<RuleId, u32>,
    pub limits: EvalLimits,
    pub deadline: Deadline,
    pub trace: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub diagnostics_sink: Option<Sender<Diagnostic>>,
    pub stats: EvalStats,
    memo: HashMap<(PredId, Vec<Term>), Vec<Vec<Term>>>,
    ticks: u32,
}

impl<'a> Evaluator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: &'a SchemaRegistry,
        rules: &'a RuleSet,
        strat: &'a Stratification,
        store: &'a mut FactStore,
        externals: &'a ExternalRegistry,
        cache: &'a mut DerivationCache,
        quarantined: &'a mut HashSet<RuleId>,
        rule_errors: &'a mut HashMap<RuleId, u32>,
        limits: EvalLimits,
        deadline: Deadline,
        trace: bool,
        diagnostics_sink: Option<Sender<Diagnostic>>,
    ) -> Self {
        Evaluator {
            registry,
            rules,
            strat,
            store,
            externals,
            cache,
            quarantined,
            rule_errors,
            limits,
            deadline,
            trace,
            diagnostics: Vec::new(),
            diagnostics_sink,
            stats: EvalStats::default(),
            memo: HashMap::new(),
            ticks: 0,
        }
    }

    /// Saturate every stratum in `needed` (ascending). Already-saturated
    /// predicates are skipped; on `Cancelled` the caller discards
    /// partially-computed strata via [`DerivationCache::discard_unsaturated`].
    pub fn saturate(&mut self, needed: &[usize]) -> KernelResult<()> {
        let mut ordered: Vec<usize> = needed.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        for &stratum in &ordered {
            self.saturate_stratum(stratum)?;
        }
        Ok(())
    }

    fn saturate_stratum(&mut self, stratum: usize) -> KernelResult<()> {
        let preds: Vec<PredId> = self.strat.strata[stratum].clone();

        // Saturated predicates keep their caches; only invalidated (or
        // never-computed) ones are recomputed. Predicates sharing the
        // stratum but untouched by the change behave like lower-stratum
        // inputs.
        let idb: Vec<PredId> = preds
            .iter()
            .copied()
            .filter(|p| self.rules.is_idb(*p) && self.cache.state(*p) != PredState::Saturated)
            .collect();

        if idb.is_empty() {
            for &pred in &preds {
                self.cache.set_state(pred, PredState::Saturated);
            }
            return Ok(());
        }

        // Memo entries live for one fixpoint.
        self.memo.clear();

        debug!(stratum, predicates = idb.len(), "saturating stratum");

        // Seed derived relations with stored facts asserted on IDB
        // predicates, and mark everything saturating.
        let mut delta: DeltaMap = HashMap::new();
        for &pred in &idb {
            self.cache.invalidate(pred);
            self.cache.set_state(pred, PredState::Saturating);
            let seeds: Vec<Tuple> = self.store.scan(pred).map(|(_, t)| t.clone()).collect();
            for tuple in seeds {
                if let Some(row) = self.cache.insert(pred, tuple.clone(), stratum, None) {
                    delta.entry(pred).or_default().push((row, tuple));
                }
            }
        }

        let rule_ids: Vec<RuleId> = idb
            .iter()
            .flat_map(|p| self.rules.rules_for(*p).to_vec())
            .collect();

        // Naive round: every rule once against the full relations.
        self.stats.fixpoint_rounds += 1;
        for &rid in &rule_ids {
            if self.quarantined.contains(&rid) {
                continue;
            }
            let rule = self.rules.get(rid);
            self.run_rule(rule, stratum, None, &HashMap::new(), &mut delta)?;
        }

        // Delta rounds until no rule derives anything new.
        while !delta.is_empty() {
            self.deadline.check()?;
            self.stats.fixpoint_rounds += 1;
            let current = std::mem::take(&mut delta);
            for &rid in &rule_ids {
                if self.quarantined.contains(&rid) {
                    continue;
                }
                let rule = self.rules.get(rid);
                if rule.pipeline.is_some() {
                    // Aggregations have no same-stratum inputs.
                    continue;
                }
                for pos in rule.scan_positions() {
                    let Step::Scan { pred, .. } = &rule.steps[pos] else {
                        continue;
                    };
                    // Only predicates being recomputed this fixpoint have
                    // deltas; everything else is a static input.
                    if !idb.contains(pred) || !current.contains_key(pred) {
                        continue;
                    }
                    self.run_rule(rule, stratum, Some(pos), &current, &mut delta)?;
                }
            }
        }

        for &pred in &preds {
            self.cache.set_state(pred, PredState::Saturated);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rule execution
    // ------------------------------------------------------------------

    fn run_rule(
        &mut self,
        rule: &'a CompiledRule,
        stratum: usize,
        delta_pos: Option<usize>,
        current_delta: &DeltaMap,
        out_delta: &mut DeltaMap,
    ) -> KernelResult<()> {
        let mut frame: Frame = vec![None; rule.n_slots];
        let mut sources: Vec<TupleId> = Vec::new();

        if rule.pipeline.is_some() {
            let mut frames: Vec<Frame> = Vec::new();
            self.walk(
                rule,
                stratum,
                0,
                &mut frame,
                &mut sources,
                delta_pos,
                current_delta,
                &mut Some(&mut frames),
                out_delta,
            )?;
            self.run_pipeline(rule, stratum, frames, out_delta)?;
        } else {
            self.walk(
                rule,
                stratum,
                0,
                &mut frame,
                &mut sources,
                delta_pos,
                current_delta,
                &mut None,
                out_delta,
            )?;
        }
        Ok(())
    }

    /// Execute the plan from `step_idx` with the current frame. Local errors
    /// are recorded and prune the branch; only fatal errors propagate.
    #[allow(clippy::too_many_arguments)]
    fn walk(
        &mut self,
        rule: &'a CompiledRule,
        stratum: usize,
        step_idx: usize,
        frame: &mut Frame,
        sources: &mut Vec<TupleId>,
        delta_pos: Option<usize>,
        current_delta: &DeltaMap,
        frames_out: &mut Option<&mut Vec<Frame>>,
        out_delta: &mut DeltaMap,
    ) -> KernelResult<()> {
        self.tick()?;
        if self.quarantined.contains(&rule.id) {
            return Ok(());
        }

        if step_idx == rule.steps.len() {
            if let Some(frames) = frames_out {
                frames.push(frame.clone());
                return Ok(());
            }
            return self.emit(rule, stratum, frame, sources, out_delta);
        }

        match &rule.steps[step_idx] {
            Step::Scan { pred, args } => {
                let candidates = self.scan_candidates(*pred, args, frame, delta_pos == Some(step_idx), current_delta);
                for (id, tuple) in candidates {
                    let mut trail = Vec::new();
                    if unify_all(args, tuple.terms(), frame, &mut trail) {
                        if self.trace {
                            sources.push(id);
                        }
                        self.walk(
                            rule,
                            stratum,
                            step_idx + 1,
                            frame,
                            sources,
                            delta_pos,
                            current_delta,
                            frames_out,
                            out_delta,
                        )?;
                        if self.trace {
                            sources.pop();
                        }
                    }
                    undo(frame, &trail);
                }
                Ok(())
            }
            Step::Negation { pred, args } => {
                let Some(ground) = resolve_all(args, frame) else {
                    // Safe-negation validation makes this unreachable.
                    self.record_rule_error(
                        rule,
                        KernelError::UnsafeRule(
                            "negated literal reached with unbound variables".to_string(),
                        ),
                    );
                    return Ok(());
                };
                let present = if self.rules.is_idb(*pred) {
                    self.cache.contains(*pred, &ground)
                } else {
                    self.store.contains(*pred, &ground)
                };
                if present {
                    return Ok(());
                }
                self.walk(
                    rule,
                    stratum,
                    step_idx + 1,
                    frame,
                    sources,
                    delta_pos,
                    current_delta,
                    frames_out,
                    out_delta,
                )
            }
            Step::Compare { op, lhs, rhs } => {
                let mut trail = Vec::new();
                let proceed = match (resolve(lhs, frame), resolve(rhs, frame)) {
                    (Some(l), Some(r)) => match builtins::compare(*op, &l, &r) {
                        Ok(pass) => pass,
                        Err(err) => {
                            self.record_rule_error(rule, err);
                            return Ok(());
                        }
                    },
                    // Binding equality: `X = <resolved>` grounds X.
                    (None, Some(r)) if *op == CmpOp::Eq => unify(lhs, &r, frame, &mut trail),
                    (Some(l), None) if *op == CmpOp::Eq => unify(rhs, &l, frame, &mut trail),
                    _ => {
                        self.record_rule_error(
                            rule,
                            KernelError::UnsafeRule(
                                "comparison reached with unbound operands".to_string(),
                            ),
                        );
                        return Ok(());
                    }
                };
                if proceed {
                    self.walk(
                        rule,
                        stratum,
                        step_idx + 1,
                        frame,
                        sources,
                        delta_pos,
                        current_delta,
                        frames_out,
                        out_delta,
                    )?;
                }
                undo(frame, &trail);
                Ok(())
            }
            Step::Let { slot, expr } => {
                let value = match self.eval_expr(expr, frame) {
                    Ok(value) => value,
                    Err(err) if is_local(&err) => {
                        self.record_rule_error(rule, err);
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                };
                match &frame[*slot] {
                    Some(existing) => {
                        // A re-binding acts as an equality filter.
                        if *existing == value {
                            self.walk(
                                rule,
                                stratum,
                                step_idx + 1,
                                frame,
                                sources,
                                delta_pos,
                                current_delta,
                                frames_out,
                                out_delta,
                            )?;
                        }
                        Ok(())
                    }
                    None => {
                        frame[*slot] = Some(value);
                        self.walk(
                            rule,
                            stratum,
                            step_idx + 1,
                            frame,
                            sources,
                            delta_pos,
                            current_delta,
                            frames_out,
                            out_delta,
                        )?;
                        frame[*slot] = None;
                        Ok(())
                    }
                }
            }
            Step::External { pred, args } => {
                let rows = match self.external_rows(rule, *pred, args, frame)? {
                    Some(rows) => rows,
                    None => return Ok(()),
                };
                let decl = self.registry.get(*pred);
                let modes = decl.modes.clone().unwrap_or_default();
                let free_args: Vec<&PlanTerm> = args
                    .iter()
                    .zip(&modes)
                    .filter(|(_, m)| **m == Mode::Free)
                    .map(|(a, _)| a)
                    .collect();
                for row in rows {
                    let mut trail = Vec::new();
                    let mut matched = true;
                    for (pat, value) in free_args.iter().zip(&row) {
                        if !unify(pat, value, frame, &mut trail) {
                            matched = false;
                            break;
                        }
                    }
                    if matched {
                        self.walk(
                            rule,
                            stratum,
                            step_idx + 1,
                            frame,
                            sources,
                            delta_pos,
                            current_delta,
                            frames_out,
                            out_delta,
                        )?;
                    }
                    undo(frame, &trail);
                }
                Ok(())
            }
        }
    }

    /// Candidate tuples for a scan step, narrowed through the first-column
    /// index when the leading argument is already ground.
    fn scan_candidates(
        &mut self,
        pred: PredId,
        args: &[PlanTerm],
        frame: &Frame,
        from_delta: bool,
        current_delta: &DeltaMap,
    ) -> Vec<(TupleId, Tuple)> {
        if from_delta {
            return current_delta
                .get(&pred)
                .map(|rows| {
                    rows.iter()
                        .map(|(row, t)| (TupleId::new(pred, *row), t.clone()))
                        .collect()
                })
                .unwrap_or_default();
        }
        if self.rules.is_idb(pred) {
            return self
                .cache
                .rows(pred)
                .iter()
                .enumerate()
                .map(|(row, t)| (TupleId::new(pred, row as u32), t.clone()))
                .collect();
        }
        if let Some(first) = args.first() {
            if let Some(key) = resolve(first, frame) {
                return self.store.scan_bound_first(pred, &key);
            }
        }
        self.store
            .scan(pred)
            .map(|(id, t)| (id, t.clone()))
            .collect()
    }

    /// Resolve the bound columns of an external literal, consult the memo,
    /// and invoke the bridge on a miss. `None` means the call produced no
    /// usable rows this pass (failure already recorded).
    fn external_rows(
        &mut self,
        rule: &CompiledRule,
        pred: PredId,
        args: &[PlanTerm],
        frame: &Frame,
    ) -> KernelResult<Option<Vec<Vec<Term>>>> {
        let decl = self.registry.get(pred);
        let modes = decl.modes.clone().unwrap_or_default();
        let mut bound = Vec::new();
        for (arg, mode) in args.iter().zip(&modes) {
            if *mode == Mode::Bound {
                match resolve(arg, frame) {
                    Some(value) => bound.push(value),
                    None => {
                        self.record_rule_error(
                            rule,
                            KernelError::SchemaViolation(format!(
                                "external {} reached with an unbound '+' column",
                                decl.name
                            )),
                        );
                        return Ok(None);
                    }
                }
            }
        }

        let key = (pred, bound.clone());
        if let Some(rows) = self.memo.get(&key) {
            return Ok(Some(rows.clone()));
        }

        self.deadline.check()?;
        self.stats.external_calls += 1;
        match self.externals.invoke(decl, &bound, &self.deadline) {
            Ok(outcome) => {
                for err in outcome.rejected {
                    self.record_rule_error(rule, err);
                }
                self.memo.insert(key, outcome.rows.clone());
                Ok(Some(outcome.rows))
            }
            Err(err) if err.is_external() => {
                self.record_rule_error(rule, err);
                // Zero tuples for the rest of this fixpoint.
                self.memo.insert(key, Vec::new());
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn eval_expr(&self, expr: &PlanExpr, frame: &Frame) -> KernelResult<Term> {
        match expr {
            PlanExpr::Term(term) => resolve(term, frame).ok_or_else(|| {
                KernelError::UnsafeRule("expression operand is unbound".to_string())
            }),
            PlanExpr::Apply { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg, frame)?);
                }
                func.apply(&values)
            }
        }
    }

    /// Produce the head tuple for a completed binding.
    fn emit(
        &mut self,
        rule: &CompiledRule,
        stratum: usize,
        frame: &Frame,
        sources: &[TupleId],
        out_delta: &mut DeltaMap,
    ) -> KernelResult<()> {
        let Some(terms) = resolve_all(&rule.head_args, frame) else {
            self.record_rule_error(
                rule,
                KernelError::UnsafeRule("head variable unbound at emit".to_string()),
            );
            return Ok(());
        };
        let decl = self.registry.get(rule.head_pred);
        if let Err(err) = decl.check_tuple(&terms) {
            self.record_rule_error(rule, err);
            return Ok(());
        }
        if self.cache.len(rule.head_pred) >= self.limits.max_tuples_per_predicate {
            let err = KernelError::Overflow {
                pred: decl.name.to_string(),
                cap: self.limits.max_tuples_per_predicate,
            };
            self.quarantine(rule, &err);
            return Ok(());
        }
        let provenance = self.trace.then(|| Provenance {
            rule: rule.id,
            sources: sources.to_vec(),
        });
        let tuple = Tuple::new(terms);
        if let Some(row) = self
            .cache
            .insert(rule.head_pred, tuple.clone(), stratum, provenance)
        {
            self.stats.tuples_derived += 1;
            out_delta
                .entry(rule.head_pred)
                .or_default()
                .push((row, tuple));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pipelines
    // ------------------------------------------------------------------

    fn run_pipeline(
        &mut self,
        rule: &CompiledRule,
        stratum: usize,
        frames: Vec<Frame>,
        out_delta: &mut DeltaMap,
    ) -> KernelResult<()> {
        let Some(pipeline) = &rule.pipeline else {
            return Ok(());
        };

        // Group frames by the grouping columns, first-seen order.
        let mut order: Vec<Vec<Term>> = Vec::new();
        let mut groups: HashMap<Vec<Term>, Vec<Frame>> = HashMap::new();
        for frame in frames {
            let mut key = Vec::with_capacity(pipeline.group_slots.len());
            let mut complete = true;
            for &slot in &pipeline.group_slots {
                match &frame[slot] {
                    Some(value) => key.push(value.clone()),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                self.record_rule_error(
                    rule,
                    KernelError::UnsafeRule("group_by column unbound".to_string()),
                );
                continue;
            }
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(frame);
        }

        for key in order {
            let members = &groups[&key];
            let mut out_frame: Frame = vec![None; rule.n_slots];
            for (slot, value) in pipeline.group_slots.iter().zip(&key) {
                out_frame[*slot] = Some(value.clone());
            }
            let mut ok = true;
            for agg in &pipeline.aggs {
                match aggregate(agg.func, agg.in_slot, members) {
                    Ok(value) => out_frame[agg.out_slot] = Some(value),
                    Err(err) => {
                        self.record_rule_error(rule, err);
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                self.emit(rule, stratum, &out_frame, &[], out_delta)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Failure bookkeeping
    // ------------------------------------------------------------------

    fn record_rule_error(&mut self, rule: &CompiledRule, err: KernelError) {
        self.stats.bindings_skipped += 1;
        self.push_diagnostic(Diagnostic::for_rule(rule, &err));
        let count = self.rule_errors.entry(rule.id).or_insert(0);
        *count += 1;
        if *count > self.limits.rule_error_threshold {
            self.quarantine(rule, &err);
        }
    }

    fn quarantine(&mut self, rule: &CompiledRule, err: &KernelError) {
        if self.quarantined.insert(rule.id) {
            warn!(rule = rule.id.0, error = %err, "quarantining rule");
            self.push_diagnostic(Diagnostic {
                kind: err.kind().to_string(),
                message: format!("rule quarantined: {}", rule.display),
                rule: Some(rule.id.0),
                rule_text: Some(rule.display.clone()),
            });
        }
    }

    fn push_diagnostic(&mut self, diagnostic: Diagnostic) {
        if let Some(sink) = &self.diagnostics_sink {
            let _ = sink.try_send(diagnostic.clone());
        }
        self.diagnostics.push(diagnostic);
    }

    fn tick(&mut self) -> KernelResult<()> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % DEADLINE_CHECK_INTERVAL == 0 {
            self.deadline.check()?;
        }
        Ok(())
    }
}

fn is_local(err: &KernelError) -> bool {
    matches!(
        err,
        KernelError::TypeMismatch(_)
            | KernelError::Arithmetic(_)
            | KernelError::UnsafeRule(_)
            | KernelError::NotFound(_)
    ) || err.is_external()
}

// ============================================================================
// Frame operations
// ============================================================================

/// Bind or check one plan term against a value. Newly bound slots are pushed
/// onto `trail` so the caller can backtrack.
pub fn unify(pat: &PlanTerm, value: &Term, frame: &mut Frame, trail: &mut Vec<usize>) -> bool {
    match pat {
        PlanTerm::Const(c) => c == value,
        PlanTerm::Slot(slot) => match &frame[*slot] {
            Some(bound) => bound == value,
            None => {
                frame[*slot] = Some(value.clone());
                trail.push(*slot);
                true
            }
        },
        PlanTerm::List(pats) => match value {
            Term::List(items) if items.len() == pats.len() => pats
                .iter()
                .zip(items)
                .all(|(p, v)| unify(p, v, frame, trail)),
            _ => false,
        },
        PlanTerm::Struct(fields) => match value {
            Term::Struct(values) if values.len() == fields.len() => {
                fields.iter().zip(values).all(|((pk, pv), (vk, vv))| {
                    pk == vk && unify(pv, vv, frame, trail)
                })
            }
            _ => false,
        },
    }
}

fn unify_all(pats: &[PlanTerm], values: &[Term], frame: &mut Frame, trail: &mut Vec<usize>) -> bool {
    if pats.len() != values.len() {
        return false;
    }
    for (pat, value) in pats.iter().zip(values) {
        if !unify(pat, value, frame, trail) {
            return false;
        }
    }
    true
}

fn undo(frame: &mut Frame, trail: &[usize]) {
    for &slot in trail {
        frame[slot] = None;
    }
}

/// Resolve a plan term to a ground term, `None` if any slot is unbound.
pub fn resolve(pat: &PlanTerm, frame: &Frame) -> Option<Term> {
    match pat {
        PlanTerm::Const(c) => Some(c.clone()),
        PlanTerm::Slot(slot) => frame[*slot].clone(),
        PlanTerm::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(resolve(item, frame)?);
            }
            Some(Term::List(out))
        }
        PlanTerm::Struct(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (key, value) in fields {
                out.push((*key, resolve(value, frame)?));
            }
            Some(Term::Struct(out))
        }
    }
}

/// Resolve a whole argument vector; `None` if anything is unbound.
pub fn resolve_all(pats: &[PlanTerm], frame: &Frame) -> Option<Vec<Term>> {
    let mut out = Vec::with_capacity(pats.len());
    for pat in pats {
        out.push(resolve(pat, frame)?);
    }
    Some(out)
}

// ============================================================================
// Aggregates
// ============================================================================

fn aggregate(
    func: crate::compile::AggFunc,
    in_slot: Option<usize>,
    members: &[Frame],
) -> KernelResult<Term> {
    use crate::compile::AggFunc;

    let values = |slot: usize| -> KernelResult<Vec<Term>> {
        members
            .iter()
            .map(|frame| {
                frame[slot].clone().ok_or_else(|| {
                    KernelError::UnsafeRule("aggregated variable unbound".to_string())
                })
            })
            .collect()
    };

    match func {
        AggFunc::Count => Ok(Term::Int(members.len() as i64)),
        AggFunc::Sum => {
            let slot = in_slot.ok_or_else(|| {
                KernelError::UnsafeRule("fn:Sum requires an argument".to_string())
            })?;
            sum_terms(&values(slot)?)
        }
        AggFunc::Avg => {
            let slot = in_slot.ok_or_else(|| {
                KernelError::UnsafeRule("fn:Avg requires an argument".to_string())
            })?;
            let values = values(slot)?;
            let total = match sum_terms(&values)? {
                Term::Int(v) => v as f64,
                Term::Float(v) => v,
                _ => unreachable!("sum of numbers is a number"),
            };
            Ok(Term::Float(total / values.len() as f64))
        }
        AggFunc::Min | AggFunc::Max => {
            let slot = in_slot.ok_or_else(|| {
                KernelError::UnsafeRule("fn:Min/fn:Max require an argument".to_string())
            })?;
            let values = values(slot)?;
            let op = if func == AggFunc::Min {
                CmpOp::Lt
            } else {
                CmpOp::Gt
            };
            let mut best = values[0].clone();
            for value in &values[1..] {
                if builtins::compare(op, value, &best)? {
                    best = value.clone();
                }
            }
            Ok(best)
        }
    }
}

fn sum_terms(values: &[Term]) -> KernelResult<Term> {
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut any_float = false;
    for value in values {
        match value {
            Term::Int(v) => {
                int_sum = int_sum.checked_add(*v).ok_or_else(|| {
                    KernelError::Arithmetic("integer overflow in fn:Sum".to_string())
                })?;
            }
            Term::Float(v) => {
                any_float = true;
                float_sum += v;
            }
            other => {
                return Err(KernelError::TypeMismatch(format!(
                    "fn:Sum expects numbers, got {}",
                    other.tag_name()
                )));
            }
        }
    }
    if any_float {
        Ok(Term::Float(float_sum + int_sum as f64))
    } else {
        Ok(Term::Int(int_sum))
    }
}
