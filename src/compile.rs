//! # Rule Compiler
//!
//! Validates rules and lowers them into executable plans:
//!
//! 1. every referenced predicate is declared;
//! 2. head variables are range-restricted (bound by a positive literal, a
//!    `let` binding, or an aggregate output);
//! 3. variables inside a negated literal are bound by earlier positive
//!    literals;
//! 4. variables feeding arithmetic or comparisons are bound before use;
//! 5. variable types inferred from predicate positions are consistent;
//! 6. `+`-moded columns of external literals are bound before the call.
//!
//! Goal ordering is a greedy cost heuristic: cheap filters as soon as they
//! are runnable, then the most selective positive goal (most bound
//! arguments), externals after, negations last in their equivalence class.
//! The emitted plan is a sequence of unify/filter/produce steps over a flat
//! slot frame; variables become slot indices here and never reach the
//! evaluator by name.

use crate::ast::{Atom, Clause, CmpOp, Expr, Literal, Mode, Pipeline};
use crate::error::{KernelError, KernelResult, Span};
use crate::eval::builtins::Builtin;
use crate::interner::NameId;
use crate::schema::{PredId, SchemaRegistry};
use crate::term::{Term, TypeTag};
use std::collections::HashMap;

/// Dense rule identifier, stable for one schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

impl RuleId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A term with variables lowered to slot references.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanTerm {
    Const(Term),
    Slot(usize),
    List(Vec<PlanTerm>),
    Struct(Vec<(NameId, PlanTerm)>),
}

impl PlanTerm {
    /// True when no slot occurs inside.
    pub fn is_const(&self) -> bool {
        match self {
            PlanTerm::Const(_) => true,
            PlanTerm::Slot(_) => false,
            PlanTerm::List(items) => items.iter().all(PlanTerm::is_const),
            PlanTerm::Struct(fields) => fields.iter().all(|(_, v)| v.is_const()),
        }
    }

    fn collect_slots(&self, out: &mut Vec<usize>) {
        match self {
            PlanTerm::Const(_) => {}
            PlanTerm::Slot(slot) => {
                if !out.contains(slot) {
                    out.push(*slot);
                }
            }
            PlanTerm::List(items) => {
                for item in items {
                    item.collect_slots(out);
                }
            }
            PlanTerm::Struct(fields) => {
                for (_, v) in fields {
                    v.collect_slots(out);
                }
            }
        }
    }

    pub fn slots(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.collect_slots(&mut out);
        out
    }
}

/// Compiled scalar expression for `let` bindings.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanExpr {
    Term(PlanTerm),
    Apply { func: Builtin, args: Vec<PlanExpr> },
}

impl PlanExpr {
    fn collect_slots(&self, out: &mut Vec<usize>) {
        match self {
            PlanExpr::Term(term) => term.collect_slots(out),
            PlanExpr::Apply { args, .. } => {
                for arg in args {
                    arg.collect_slots(out);
                }
            }
        }
    }
}

/// One executable step of a rule body.
#[derive(Debug, Clone)]
pub enum Step {
    /// Join against a stored or derived relation.
    Scan { pred: PredId, args: Vec<PlanTerm> },
    /// Membership check against a completed lower-stratum relation.
    Negation { pred: PredId, args: Vec<PlanTerm> },
    /// Comparison filter; `Eq` with one unbound side acts as a binding.
    Compare {
        op: CmpOp,
        lhs: PlanTerm,
        rhs: PlanTerm,
    },
    /// `let Slot = expr` over bound operands.
    Let { slot: usize, expr: PlanExpr },
    /// External handler call through the bridge.
    External { pred: PredId, args: Vec<PlanTerm> },
}

/// One aggregate output of a pipeline.
#[derive(Debug, Clone)]
pub struct PlanAgg {
    pub out_slot: usize,
    pub func: AggFunc,
    pub in_slot: Option<usize>,
}

/// Aggregate functions accepted in `|>` pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggFunc {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Count" | "count" => Some(AggFunc::Count),
            "Sum" | "sum" => Some(AggFunc::Sum),
            "Min" | "min" => Some(AggFunc::Min),
            "Max" | "max" => Some(AggFunc::Max),
            "Avg" | "avg" => Some(AggFunc::Avg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Count => "Count",
            AggFunc::Sum => "Sum",
            AggFunc::Min => "Min",
            AggFunc::Max => "Max",
            AggFunc::Avg => "Avg",
        }
    }
}

/// Compiled `|> do fn:group_by(...), let ...` pipeline.
#[derive(Debug, Clone)]
pub struct PlanPipeline {
    pub group_slots: Vec<usize>,
    pub aggs: Vec<PlanAgg>,
}

/// Kind of dependency edge from a rule head to a body predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    Positive,
    Negative,
    /// Body feeds an aggregation pipeline; like negation, the dependency must
    /// be fully computed in a lower stratum.
    Aggregated,
}

/// A fully validated, ordered, slot-lowered rule.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: RuleId,
    pub head_pred: PredId,
    pub head_args: Vec<PlanTerm>,
    pub steps: Vec<Step>,
    pub pipeline: Option<PlanPipeline>,
    pub n_slots: usize,
    /// Dependency edges contributed by this rule.
    pub deps: Vec<(PredId, DepKind)>,
    /// Source text for diagnostics and quarantine listings.
    pub display: String,
    pub span: Span,
}

impl CompiledRule {
    /// Indices of `Scan` steps, used by semi-naive delta rewrites.
    pub fn scan_positions(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s, Step::Scan { .. }))
            .map(|(i, _)| i)
            .collect()
    }
}

/// All compiled rules of one schema generation, grouped by head predicate.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
    by_head: HashMap<PredId, Vec<RuleId>>,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet::default()
    }

    pub fn push(&mut self, rule: CompiledRule) {
        self.by_head.entry(rule.head_pred).or_default().push(rule.id);
        self.rules.push(rule);
    }

    pub fn get(&self, id: RuleId) -> &CompiledRule {
        &self.rules[id.index()]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter()
    }

    pub fn as_slice(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Rule ids whose head is `pred`, in registration order.
    pub fn rules_for(&self, pred: PredId) -> &[RuleId] {
        self.by_head.get(&pred).map_or(&[], Vec::as_slice)
    }

    /// Whether any rule derives `pred` (i.e. `pred` is IDB).
    pub fn is_idb(&self, pred: PredId) -> bool {
        self.by_head.contains_key(&pred)
    }

    pub fn next_id(&self) -> RuleId {
        RuleId(self.rules.len() as u32)
    }
}

// ============================================================================
// Compilation
// ============================================================================

struct SlotMap {
    by_name: HashMap<String, usize>,
    bound: Vec<bool>,
}

impl SlotMap {
    fn new() -> Self {
        SlotMap {
            by_name: HashMap::new(),
            bound: Vec::new(),
        }
    }

    fn slot(&mut self, name: &str) -> usize {
        if let Some(&slot) = self.by_name.get(name) {
            return slot;
        }
        let slot = self.bound.len();
        self.by_name.insert(name.to_string(), slot);
        self.bound.push(false);
        slot
    }

    fn is_bound(&self, name: &str) -> bool {
        self.by_name
            .get(name)
            .is_some_and(|&slot| self.bound[slot])
    }

    fn mark_bound(&mut self, name: &str) {
        let slot = self.slot(name);
        self.bound[slot] = true;
    }
}

/// Per-rule variable type inference table.
struct TypeTable {
    by_var: HashMap<String, TypeTag>,
}

impl TypeTable {
    fn new() -> Self {
        TypeTable {
            by_var: HashMap::new(),
        }
    }

    fn meet(&mut self, var: &str, tag: TypeTag, context: &str) -> KernelResult<()> {
        let entry = self.by_var.entry(var.to_string()).or_insert(TypeTag::Any);
        match entry.meet(tag) {
            Some(narrowed) => {
                *entry = narrowed;
                Ok(())
            }
            None => Err(KernelError::TypeMismatch(format!(
                "variable {} used both as {} and as {} ({})",
                var, entry, tag, context
            ))),
        }
    }
}

/// Compile one clause (with a non-empty body) against the registry.
pub fn compile_rule(
    registry: &SchemaRegistry,
    clause: &Clause,
    id: RuleId,
) -> KernelResult<CompiledRule> {
    debug_assert!(!clause.is_fact());

    let head_decl = registry.resolve(&clause.head.pred, clause.head.arity())?;
    let head_pred = head_decl.id;
    if head_decl.external {
        return Err(KernelError::SchemaViolation(format!(
            "external predicate {} cannot be a rule head",
            head_decl.name
        )));
    }

    // ---- Pass 1: resolve atoms, infer types, classify binders -------------
    let mut types = TypeTable::new();
    infer_atom_types(registry, &clause.head, &mut types)?;
    for literal in &clause.body {
        if let Some(atom) = literal.atom() {
            infer_atom_types(registry, atom, &mut types)?;
        }
    }

    // Variables bound by positive literals or scalar `let` bindings.
    let mut binders: Vec<String> = Vec::new();
    for literal in &clause.body {
        match literal {
            Literal::Pos(atom) => {
                let decl = registry.resolve(&atom.pred, atom.arity())?;
                if decl.external {
                    // External literals bind only their '-' columns.
                    let modes = decl.modes.clone().unwrap_or_default();
                    for (term, mode) in atom.args.iter().zip(&modes) {
                        if *mode == Mode::Free {
                            term.collect_vars(&mut binders);
                        }
                    }
                } else {
                    for var in atom.variables() {
                        if !binders.contains(&var) {
                            binders.push(var);
                        }
                    }
                }
            }
            Literal::Let { var, expr, .. } => {
                infer_let_types(var, expr, &mut types)?;
                if !binders.contains(var) {
                    binders.push(var.clone());
                }
            }
            Literal::Cmp { op, lhs, rhs, .. } => {
                // A binding equality `X = <term>` also grounds X.
                if *op == CmpOp::Eq {
                    if let Term::Var(v) = lhs {
                        if rhs.is_ground() || rhs.as_var().is_some_and(|r| binders.iter().any(|b| b == r)) {
                            if !binders.contains(v) {
                                binders.push(v.clone());
                            }
                        }
                    }
                }
            }
            Literal::Neg(_) => {}
        }
    }
    if let Some(pipeline) = &clause.pipeline {
        for agg in &pipeline.lets {
            if !binders.contains(&agg.var) {
                binders.push(agg.var.clone());
            }
        }
    }

    // ---- Range restriction ------------------------------------------------
    for var in clause.head.variables() {
        if !binders.contains(&var) {
            return Err(KernelError::UnsafeRule(format!(
                "head variable {} of {} is not bound by any positive body literal",
                var, clause.head.pred
            )));
        }
    }

    // ---- Safe negation ----------------------------------------------------
    for literal in &clause.body {
        if let Literal::Neg(atom) = literal {
            for var in atom.variables() {
                if !binders.contains(&var) {
                    return Err(KernelError::UnsafeRule(format!(
                        "variable {} in negated literal !{} is never bound by a positive literal",
                        var, atom.pred
                    )));
                }
            }
        }
    }

    // ---- Pipeline pre-checks ----------------------------------------------
    if let Some(pipeline) = &clause.pipeline {
        validate_pipeline(pipeline, &binders, &mut types)?;
        // After grouping, only grouping columns and aggregate outputs exist;
        // other body variables are no longer addressable from the head.
        for var in clause.head.variables() {
            let grouped = pipeline.group_by.iter().any(|g| *g == var)
                || pipeline.lets.iter().any(|l| l.var == var);
            if !grouped {
                return Err(KernelError::UnsafeRule(format!(
                    "head variable {} is neither a group_by column nor an aggregate output",
                    var
                )));
            }
        }
    }

    // ---- Pass 2: goal ordering and slot lowering --------------------------
    let mut slots = SlotMap::new();
    // Head slots are allocated first so answers project from a stable prefix.
    for var in clause.head.variables() {
        slots.slot(&var);
    }

    let mut remaining: Vec<&Literal> = clause.body.iter().collect();
    let mut steps = Vec::new();

    while !remaining.is_empty() {
        let choice = pick_next_goal(registry, &remaining, &slots)?;
        let literal = remaining.remove(choice);
        let step = lower_literal(registry, literal, &mut slots)?;
        // Everything the step can bind is bound from here on.
        match (&step, literal) {
            (Step::Scan { .. }, Literal::Pos(atom)) => {
                let decl = registry.resolve(&atom.pred, atom.arity())?;
                debug_assert!(!decl.external);
                for var in atom.variables() {
                    slots.mark_bound(&var);
                }
            }
            (Step::External { .. }, Literal::Pos(atom)) => {
                for var in atom.variables() {
                    slots.mark_bound(&var);
                }
            }
            (Step::Let { .. }, Literal::Let { var, .. }) => {
                slots.mark_bound(var);
            }
            (Step::Compare { op: CmpOp::Eq, .. }, Literal::Cmp { lhs, rhs, .. }) => {
                for term in [lhs, rhs] {
                    if let Term::Var(v) = term {
                        slots.mark_bound(v);
                    }
                }
            }
            _ => {}
        }
        steps.push(step);
    }

    // ---- Pipeline lowering ------------------------------------------------
    let pipeline = match &clause.pipeline {
        Some(pipeline) => Some(lower_pipeline(pipeline, &mut slots)?),
        None => None,
    };

    // ---- Head lowering ----------------------------------------------------
    let head_args: Vec<PlanTerm> = clause
        .head
        .args
        .iter()
        .map(|t| lower_term(t, &mut slots))
        .collect();

    // ---- Dependency edges -------------------------------------------------
    let aggregated = clause.pipeline.is_some();
    let mut deps = Vec::new();
    for literal in &clause.body {
        match literal {
            Literal::Pos(atom) => {
                let decl = registry.resolve(&atom.pred, atom.arity())?;
                let kind = if aggregated {
                    DepKind::Aggregated
                } else {
                    DepKind::Positive
                };
                deps.push((decl.id, kind));
            }
            Literal::Neg(atom) => {
                let decl = registry.resolve(&atom.pred, atom.arity())?;
                deps.push((decl.id, DepKind::Negative));
            }
            _ => {}
        }
    }

    Ok(CompiledRule {
        id,
        head_pred,
        head_args,
        steps,
        pipeline,
        n_slots: slots.bound.len(),
        deps,
        display: render_clause(clause),
        span: clause.span,
    })
}

fn infer_atom_types(
    registry: &SchemaRegistry,
    atom: &Atom,
    types: &mut TypeTable,
) -> KernelResult<()> {
    let decl = registry.resolve(&atom.pred, atom.arity())?;
    for (i, (term, tag)) in atom.args.iter().zip(&decl.types).enumerate() {
        match term {
            Term::Var(name) => {
                types.meet(name, *tag, &format!("{} argument {}", atom.pred, i + 1))?;
            }
            ground if ground.is_ground() => {
                if !tag.admits(ground) {
                    return Err(KernelError::TypeMismatch(format!(
                        "{}: argument {} is {} but declared {}",
                        atom.pred,
                        i + 1,
                        ground.tag_name(),
                        tag
                    )));
                }
            }
            compound => {
                // A compound pattern with inner variables only fits /any.
                if *tag != TypeTag::Any {
                    return Err(KernelError::TypeMismatch(format!(
                        "{}: argument {} is a {} pattern but declared {}",
                        atom.pred,
                        i + 1,
                        compound.tag_name(),
                        tag
                    )));
                }
            }
        }
    }
    Ok(())
}

fn infer_let_types(var: &str, expr: &Expr, types: &mut TypeTable) -> KernelResult<()> {
    if let Expr::Apply { func, span, .. } = expr {
        let builtin = Builtin::parse(func)
            .ok_or_else(|| KernelError::parse(*span, format!("unknown function fn:{}", func)))?;
        if let Some(result) = builtin.result_type() {
            types.meet(var, result, &format!("fn:{} result", func))?;
        }
        if let Some(operand) = builtin.operand_type() {
            for v in expr.variables() {
                if v != var {
                    types.meet(&v, operand, &format!("fn:{} operand", func))?;
                }
            }
        }
    }
    Ok(())
}

fn validate_pipeline(
    pipeline: &Pipeline,
    binders: &[String],
    types: &mut TypeTable,
) -> KernelResult<()> {
    for var in &pipeline.group_by {
        if !binders.iter().any(|b| b == var) {
            return Err(KernelError::UnsafeRule(format!(
                "group_by variable {} is not bound by the rule body",
                var
            )));
        }
    }
    for agg in &pipeline.lets {
        let func = AggFunc::parse(&agg.func).ok_or_else(|| {
            KernelError::parse(agg.span, format!("unknown aggregate fn:{}", agg.func))
        })?;
        match (&agg.arg, func) {
            (None, AggFunc::Count) => {}
            (None, other) => {
                return Err(KernelError::UnsafeRule(format!(
                    "fn:{} requires an argument variable",
                    other.as_str()
                )));
            }
            (Some(arg), _) => {
                if !binders.iter().any(|b| b == arg) {
                    return Err(KernelError::UnsafeRule(format!(
                        "aggregated variable {} is not bound by the rule body",
                        arg
                    )));
                }
                if matches!(func, AggFunc::Sum | AggFunc::Avg) {
                    types.meet(arg, TypeTag::Number, &format!("fn:{} input", func.as_str()))?;
                }
            }
        }
        match func {
            AggFunc::Count | AggFunc::Sum | AggFunc::Avg => {
                types.meet(&agg.var, TypeTag::Number, "aggregate result")?;
            }
            AggFunc::Min | AggFunc::Max => {}
        }
    }
    Ok(())
}

/// Greedy goal selection. Returns the index into `remaining`.
fn pick_next_goal(
    registry: &SchemaRegistry,
    remaining: &[&Literal],
    slots: &SlotMap,
) -> KernelResult<usize> {
    #[derive(PartialEq, Eq, PartialOrd, Ord)]
    enum Class {
        Filter,
        Positive,
        External,
        Negation,
    }

    let mut best: Option<(Class, i64, usize)> = None;
    for (i, literal) in remaining.iter().enumerate() {
        let candidate = match literal {
            Literal::Let { expr, .. } => {
                let ready = expr.variables().iter().all(|v| slots.is_bound(v));
                ready.then_some((Class::Filter, 0))
            }
            Literal::Cmp { op, lhs, rhs, .. } => {
                let lhs_ready = term_ready(lhs, slots);
                let rhs_ready = term_ready(rhs, slots);
                if lhs_ready && rhs_ready {
                    Some((Class::Filter, 0))
                } else if *op == CmpOp::Eq
                    && ((lhs_ready && rhs.as_var().is_some())
                        || (rhs_ready && lhs.as_var().is_some()))
                {
                    Some((Class::Filter, 1))
                } else {
                    None
                }
            }
            Literal::Pos(atom) => {
                let decl = registry.resolve(&atom.pred, atom.arity())?;
                if decl.external {
                    let modes = decl.modes.clone().unwrap_or_default();
                    let ready = atom.args.iter().zip(&modes).all(|(term, mode)| {
                        *mode == Mode::Free || term_ready(term, slots)
                    });
                    ready.then_some((Class::External, 0))
                } else {
                    // More bound arguments first; ties keep textual order.
                    let bound_count = atom
                        .args
                        .iter()
                        .filter(|t| term_ready(t, slots))
                        .count() as i64;
                    Some((Class::Positive, -bound_count))
                }
            }
            Literal::Neg(atom) => {
                let ready = atom.variables().iter().all(|v| slots.is_bound(v));
                ready.then_some((Class::Negation, 0))
            }
        };
        if let Some((class, cost)) = candidate {
            let replace = match &best {
                None => true,
                Some((best_class, best_cost, _)) => {
                    (&class, &cost) < (best_class, best_cost)
                }
            };
            if replace {
                best = Some((class, cost, i));
            }
        }
    }

    best.map(|(_, _, i)| i).ok_or_else(|| {
        KernelError::UnsafeRule(
            "no runnable goal order: a literal depends on variables that are never bound"
                .to_string(),
        )
    })
}

fn term_ready(term: &Term, slots: &SlotMap) -> bool {
    let mut vars = Vec::new();
    term.collect_vars(&mut vars);
    vars.iter().all(|v| slots.is_bound(v))
}

fn lower_term(term: &Term, slots: &mut SlotMap) -> PlanTerm {
    match term {
        Term::Var(name) => PlanTerm::Slot(slots.slot(name)),
        Term::List(items) if !term.is_ground() => {
            PlanTerm::List(items.iter().map(|t| lower_term(t, slots)).collect())
        }
        Term::Struct(fields) if !term.is_ground() => PlanTerm::Struct(
            fields
                .iter()
                .map(|(k, v)| (*k, lower_term(v, slots)))
                .collect(),
        ),
        ground => PlanTerm::Const(ground.clone()),
    }
}

fn lower_expr(expr: &Expr, slots: &mut SlotMap) -> KernelResult<PlanExpr> {
    match expr {
        Expr::Term(term) => Ok(PlanExpr::Term(lower_term(term, slots))),
        Expr::Apply { func, args, span } => {
            let builtin = Builtin::parse(func)
                .ok_or_else(|| KernelError::parse(*span, format!("unknown function fn:{}", func)))?;
            if let Some(arity) = builtin.arity() {
                if args.len() != arity {
                    return Err(KernelError::parse(
                        *span,
                        format!(
                            "fn:{} expects {} arguments, got {}",
                            func,
                            arity,
                            args.len()
                        ),
                    ));
                }
            }
            let lowered: KernelResult<Vec<PlanExpr>> =
                args.iter().map(|a| lower_expr(a, slots)).collect();
            Ok(PlanExpr::Apply {
                func: builtin,
                args: lowered?,
            })
        }
    }
}

fn lower_literal(
    registry: &SchemaRegistry,
    literal: &Literal,
    slots: &mut SlotMap,
) -> KernelResult<Step> {
    match literal {
        Literal::Pos(atom) => {
            let decl = registry.resolve(&atom.pred, atom.arity())?;
            let args: Vec<PlanTerm> = atom.args.iter().map(|t| lower_term(t, slots)).collect();
            if decl.external {
                Ok(Step::External {
                    pred: decl.id,
                    args,
                })
            } else {
                Ok(Step::Scan {
                    pred: decl.id,
                    args,
                })
            }
        }
        Literal::Neg(atom) => {
            let decl = registry.resolve(&atom.pred, atom.arity())?;
            if decl.external {
                return Err(KernelError::UnsafeRule(format!(
                    "external predicate {} cannot be negated",
                    decl.name
                )));
            }
            let args: Vec<PlanTerm> = atom.args.iter().map(|t| lower_term(t, slots)).collect();
            Ok(Step::Negation {
                pred: decl.id,
                args,
            })
        }
        Literal::Cmp { op, lhs, rhs, .. } => Ok(Step::Compare {
            op: *op,
            lhs: lower_term(lhs, slots),
            rhs: lower_term(rhs, slots),
        }),
        Literal::Let { var, expr, .. } => {
            let lowered = lower_expr(expr, slots)?;
            Ok(Step::Let {
                slot: slots.slot(var),
                expr: lowered,
            })
        }
    }
}

fn lower_pipeline(pipeline: &Pipeline, slots: &mut SlotMap) -> KernelResult<PlanPipeline> {
    let group_slots = pipeline.group_by.iter().map(|v| slots.slot(v)).collect();
    let mut aggs = Vec::new();
    for agg in &pipeline.lets {
        let func = AggFunc::parse(&agg.func).ok_or_else(|| {
            KernelError::parse(agg.span, format!("unknown aggregate fn:{}", agg.func))
        })?;
        aggs.push(PlanAgg {
            out_slot: slots.slot(&agg.var),
            func,
            in_slot: agg.arg.as_ref().map(|v| slots.slot(v)),
        });
    }
    Ok(PlanPipeline { group_slots, aggs })
}

/// Render a parsed unit back to loadable source text.
pub fn render_unit(unit: &crate::ast::Unit) -> String {
    use crate::ast::Unit;
    match unit {
        Unit::Decl(decl) => render_decl(decl),
        Unit::Clause(clause) => render_clause(clause),
        Unit::Query(atom) => format!("{}?", atom),
    }
}

/// Render a parsed declaration back to source text.
pub fn render_decl(decl: &crate::ast::Decl) -> String {
    use std::fmt::Write as _;
    let mut out = format!("Decl {}({})", decl.name, decl.args.join(", "));
    if let Some(bound) = &decl.bound {
        let tags: Vec<&str> = bound.iter().map(TypeTag::as_str).collect();
        let _ = write!(out, " bound [{}]", tags.join(", "));
    }
    let mut descr_tags: Vec<String> = Vec::new();
    if decl.descr.external {
        descr_tags.push("external()".to_string());
    }
    if let Some(modes) = &decl.descr.modes {
        let parts: Vec<String> = modes.iter().map(|m| format!("'{}'", m.as_str())).collect();
        descr_tags.push(format!("mode({})", parts.join(", ")));
    }
    if let Some(doc) = &decl.descr.doc {
        descr_tags.push(format!("doc({:?})", doc));
    }
    if !descr_tags.is_empty() {
        let _ = write!(out, " descr [{}]", descr_tags.join(", "));
    }
    out.push('.');
    out
}

/// Lower a query goal's arguments to plan terms. Returns the lowered
/// arguments plus the variable name for each slot, in slot order.
pub fn lower_goal(atom: &Atom) -> (Vec<PlanTerm>, Vec<String>) {
    let mut slots = SlotMap::new();
    let args = atom.args.iter().map(|t| lower_term(t, &mut slots)).collect();
    let mut names = vec![String::new(); slots.bound.len()];
    for (name, slot) in &slots.by_name {
        names[*slot] = name.clone();
    }
    (args, names)
}

/// Render a clause back to source-style text for diagnostics.
pub fn render_clause(clause: &Clause) -> String {
    use std::fmt::Write as _;
    let mut out = clause.head.to_string();
    if !clause.body.is_empty() {
        out.push_str(" :- ");
        for (i, literal) in clause.body.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match literal {
                Literal::Pos(atom) => {
                    let _ = write!(out, "{}", atom);
                }
                Literal::Neg(atom) => {
                    let _ = write!(out, "!{}", atom);
                }
                Literal::Cmp { op, lhs, rhs, .. } => {
                    let _ = write!(out, "{} {} {}", lhs, op.as_str(), rhs);
                }
                Literal::Let { var, expr, .. } => {
                    let _ = write!(out, "let {} = {}", var, render_expr(expr));
                }
            }
        }
    }
    if let Some(pipeline) = &clause.pipeline {
        let _ = write!(out, " |> do fn:group_by({})", pipeline.group_by.join(", "));
        for agg in &pipeline.lets {
            let _ = write!(
                out,
                ", let {} = fn:{}({})",
                agg.var,
                agg.func,
                agg.arg.as_deref().unwrap_or("")
            );
        }
    }
    out.push('.');
    out
}

fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Term(term) => term.to_string(),
        Expr::Apply { func, args, .. } => {
            let parts: Vec<String> = args.iter().map(render_expr).collect();
            format!("fn:{}({})", func, parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn compile_first(schema: &str) -> KernelResult<CompiledRule> {
        let program = parse_program(schema).expect("parse");
        let mut registry = SchemaRegistry::new();
        for decl in program.decls() {
            registry.declare(decl).expect("declare");
        }
        let rule = program.rules().next().expect("one rule");
        compile_rule(&registry, rule, RuleId(0))
    }

    #[test]
    fn test_compile_simple_join() {
        let rule = compile_first(
            "Decl edge(X, Y).\nDecl path(X, Y).\n\
             path(X, Z) :- edge(X, Y), path(Y, Z).",
        )
        .expect("compile");
        assert_eq!(rule.steps.len(), 2);
        assert_eq!(rule.deps.len(), 2);
        assert!(rule.deps.iter().all(|(_, k)| *k == DepKind::Positive));
    }

    #[test]
    fn test_undeclared_predicate_rejected() {
        let err = compile_first("Decl p(X).\np(X) :- q(X).").expect_err("undeclared");
        assert_eq!(err.kind(), "SchemaViolation");
    }

    #[test]
    fn test_range_restriction_enforced() {
        let err = compile_first("Decl p(X).\nDecl q(X).\np(Y) :- q(X).").expect_err("unsafe");
        assert_eq!(err.kind(), "UnsafeRule");
    }

    #[test]
    fn test_unsafe_negation_rejected() {
        let err = compile_first(
            "Decl p(X).\nDecl q(X).\nDecl r(X).\n\
             p(X) :- q(X), !r(Y).",
        )
        .expect_err("negated var unbound");
        assert_eq!(err.kind(), "UnsafeRule");
    }

    #[test]
    fn test_negation_ordered_after_binders() {
        let rule = compile_first(
            "Decl item(X).\nDecl excluded(X).\nDecl allowed(X).\n\
             allowed(X) :- !excluded(X), item(X).",
        )
        .expect("compile");
        // The negation is textually first but must run after item(X).
        assert!(matches!(rule.steps[0], Step::Scan { .. }));
        assert!(matches!(rule.steps[1], Step::Negation { .. }));
    }

    #[test]
    fn test_let_requires_bound_operands() {
        let err = compile_first(
            "Decl p(X).\nDecl q(X).\n\
             p(Y) :- let Y = fn:plus(X, 1).",
        )
        .expect_err("X never bound");
        assert_eq!(err.kind(), "UnsafeRule");
    }

    #[test]
    fn test_type_conflict_detected() {
        let err = compile_first(
            "Decl name_of(X) bound [/name].\nDecl count_of(X) bound [/number].\nDecl out(X).\n\
             out(X) :- name_of(X), count_of(X).",
        )
        .expect_err("conflicting var types");
        assert_eq!(err.kind(), "TypeMismatch");
    }

    #[test]
    fn test_external_mode_satisfaction() {
        // Limit is bound by a constant, so mode '+' is satisfiable.
        let rule = compile_first(
            "Decl hot(H).\n\
             Decl recent_commits(L, H) bound [/number, /string] descr [external(), mode('+', '-')].\n\
             hot(H) :- recent_commits(3, H).",
        )
        .expect("compile");
        assert!(matches!(rule.steps[0], Step::External { .. }));

        // Limit never bound anywhere: the call can never run.
        let err = compile_first(
            "Decl hot(H).\n\
             Decl recent_commits(L, H) bound [/number, /string] descr [external(), mode('+', '-')].\n\
             hot(H) :- recent_commits(L, H).",
        )
        .expect_err("unsatisfiable mode");
        assert_eq!(err.kind(), "UnsafeRule");
    }

    #[test]
    fn test_aggregation_marks_deps_aggregated() {
        let rule = compile_first(
            "Decl cost(J, N) bound [/name, /number].\nDecl total(S) bound [/number].\n\
             total(Sum) :- cost(_, N) |> do fn:group_by(), let Sum = fn:Sum(N).",
        )
        .expect("compile");
        assert!(rule.pipeline.is_some());
        assert_eq!(rule.deps, vec![(PredId(0), DepKind::Aggregated)]);
    }

    #[test]
    fn test_goal_order_prefers_selective_goals() {
        let rule = compile_first(
            "Decl big(X, Y).\nDecl tiny(X).\nDecl out(X, Y).\n\
             out(X, Y) :- big(X, Y), tiny(X).",
        )
        .expect("compile");
        // Neither goal has bound args at the start, so textual order holds;
        // after big binds X, tiny joins on a bound column.
        assert!(matches!(rule.steps[0], Step::Scan { pred, .. } if pred == PredId(0)));
    }

    #[test]
    fn test_binding_equality_grounds_head_var() {
        let rule = compile_first(
            "Decl q(X).\nDecl p(X, Y).\n\
             p(X, Y) :- q(X), Y = /fixed.",
        )
        .expect("compile");
        assert!(rule
            .steps
            .iter()
            .any(|s| matches!(s, Step::Compare { op: CmpOp::Eq, .. })));
    }
}
