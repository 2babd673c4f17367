//! # Logic Language AST
//!
//! Parsed representation of the textual dialect: declarations, facts, rules,
//! and queries. Produced by [`crate::parser`] and consumed by the schema
//! registry and the rule compiler.
//!
//! Facts are clauses with an empty body; the parser does not distinguish
//! them syntactically beyond that.

use crate::error::Span;
use crate::term::{Term, TypeTag};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Declarations
// ============================================================================

/// Argument mode for external predicates: `+` must be bound at call time,
/// `-` may be produced by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// `'+'` - argument must be bound before the literal runs.
    Bound,
    /// `'-'` - argument is produced.
    Free,
}

impl Mode {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "+" => Some(Mode::Bound),
            "-" => Some(Mode::Free),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Bound => "+",
            Mode::Free => "-",
        }
    }
}

/// `descr [...]` annotations on a declaration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescrBlock {
    /// `external()` - tuples come from a registered handler, not storage.
    pub external: bool,
    /// `mode('+', '-', ...)` - per-argument call modes.
    pub modes: Option<Vec<Mode>>,
    /// `doc("...")` - free-text description.
    pub doc: Option<String>,
}

/// A predicate declaration:
/// `Decl name(A1, ..., An) bound [/t1, ..., /tn] descr [external(), mode('+','-')].`
#[derive(Debug, Clone, PartialEq)]
pub struct Decl {
    pub name: String,
    /// Argument placeholder names as written (`X`, `Y`, ...).
    pub args: Vec<String>,
    /// Declared type vector; `None` means every column is `/any`.
    pub bound: Option<Vec<TypeTag>>,
    pub descr: DescrBlock,
    pub span: Span,
}

impl Decl {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// The effective type vector (defaults to `/any` per column).
    pub fn type_vector(&self) -> Vec<TypeTag> {
        self.bound
            .clone()
            .unwrap_or_else(|| vec![TypeTag::Any; self.args.len()])
    }
}

// ============================================================================
// Atoms and literals
// ============================================================================

/// A predicate applied to argument terms: `edge(X, /a)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub pred: String,
    pub args: Vec<Term>,
    pub span: Span,
}

impl Atom {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Variable names in argument order, first occurrence only.
    pub fn variables(&self) -> Vec<String> {
        let mut vars = Vec::new();
        for arg in &self.args {
            arg.collect_vars(&mut vars);
        }
        vars
    }

    /// True when every argument is ground.
    pub fn is_ground(&self) -> bool {
        self.args.iter().all(Term::is_ground)
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.pred)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}

/// Comparison operators usable in rule bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// A built-in function application: `fn:plus(X, 1)`, `fn:list:length(L)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Term(Term),
    Apply {
        /// Function name without the `fn:` prefix, e.g. `plus`, `list:length`.
        func: String,
        args: Vec<Expr>,
        span: Span,
    },
}

impl Expr {
    /// Variable names referenced anywhere inside the expression.
    pub fn variables(&self) -> Vec<String> {
        let mut vars = Vec::new();
        self.collect_vars(&mut vars);
        vars
    }

    fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            Expr::Term(term) => term.collect_vars(out),
            Expr::Apply { args, .. } => {
                for arg in args {
                    arg.collect_vars(out);
                }
            }
        }
    }
}

/// One body literal of a rule.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Positive atom.
    Pos(Atom),
    /// Negated atom: `!excluded(X)`.
    Neg(Atom),
    /// Comparison: `X < 10`, `Y != /done`.
    Cmp {
        op: CmpOp,
        lhs: Term,
        rhs: Term,
        span: Span,
    },
    /// Binding built-in application: `let X = fn:plus(A, 1)`.
    Let {
        var: String,
        expr: Expr,
        span: Span,
    },
}

impl Literal {
    pub fn span(&self) -> Span {
        match self {
            Literal::Pos(atom) | Literal::Neg(atom) => atom.span,
            Literal::Cmp { span, .. } | Literal::Let { span, .. } => *span,
        }
    }

    pub fn is_positive_atom(&self) -> bool {
        matches!(self, Literal::Pos(_))
    }

    pub fn atom(&self) -> Option<&Atom> {
        match self {
            Literal::Pos(atom) | Literal::Neg(atom) => Some(atom),
            _ => None,
        }
    }

    /// All variables mentioned by this literal.
    pub fn variables(&self) -> Vec<String> {
        match self {
            Literal::Pos(atom) | Literal::Neg(atom) => atom.variables(),
            Literal::Cmp { lhs, rhs, .. } => {
                let mut vars = Vec::new();
                lhs.collect_vars(&mut vars);
                rhs.collect_vars(&mut vars);
                vars
            }
            Literal::Let { var, expr, .. } => {
                let mut vars = expr.variables();
                if !vars.iter().any(|v| v == var) {
                    vars.push(var.clone());
                }
                vars
            }
        }
    }
}

// ============================================================================
// Pipelines
// ============================================================================

/// One aggregate binding inside a pipeline: `let Sum = fn:Sum(N)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AggLet {
    pub var: String,
    /// Aggregate function name without the `fn:` prefix (`Sum`, `Count`, ...).
    pub func: String,
    /// The aggregated variable; `None` for zero-argument `fn:Count()`.
    pub arg: Option<String>,
    pub span: Span,
}

/// A transform pipeline attached to a rule body:
/// `|> do fn:group_by(X), let S = fn:Sum(N)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    /// Grouping variables; empty means one global group.
    pub group_by: Vec<String>,
    pub lets: Vec<AggLet>,
    pub span: Span,
}

// ============================================================================
// Clauses and programs
// ============================================================================

/// A fact or rule. Facts have an empty body (and ground head arguments,
/// enforced at load time, not parse time).
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub head: Atom,
    pub body: Vec<Literal>,
    pub pipeline: Option<Pipeline>,
    pub span: Span,
}

impl Clause {
    pub fn is_fact(&self) -> bool {
        self.body.is_empty() && self.pipeline.is_none()
    }
}

/// One parsed top-level unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Unit {
    Decl(Decl),
    Clause(Clause),
    /// A goal terminated by `?`.
    Query(Atom),
}

/// A parsed source file or snippet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub units: Vec<Unit>,
}

impl Program {
    pub fn decls(&self) -> impl Iterator<Item = &Decl> {
        self.units.iter().filter_map(|u| match u {
            Unit::Decl(d) => Some(d),
            _ => None,
        })
    }

    pub fn clauses(&self) -> impl Iterator<Item = &Clause> {
        self.units.iter().filter_map(|u| match u {
            Unit::Clause(c) => Some(c),
            _ => None,
        })
    }

    pub fn facts(&self) -> impl Iterator<Item = &Clause> {
        self.clauses().filter(|c| c.is_fact())
    }

    pub fn rules(&self) -> impl Iterator<Item = &Clause> {
        self.clauses().filter(|c| !c.is_fact())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(pred: &str, args: Vec<Term>) -> Atom {
        Atom {
            pred: pred.to_string(),
            args,
            span: Span::new(1, 1),
        }
    }

    #[test]
    fn test_atom_variables_in_order() {
        let a = atom(
            "edge",
            vec![
                Term::Var("X".to_string()),
                Term::Var("Y".to_string()),
                Term::Var("X".to_string()),
            ],
        );
        assert_eq!(a.variables(), vec!["X".to_string(), "Y".to_string()]);
    }

    #[test]
    fn test_clause_fact_detection() {
        let fact = Clause {
            head: atom("item", vec![Term::name("a")]),
            body: vec![],
            pipeline: None,
            span: Span::new(1, 1),
        };
        assert!(fact.is_fact());

        let rule = Clause {
            head: atom("p", vec![Term::Var("X".to_string())]),
            body: vec![Literal::Pos(atom("q", vec![Term::Var("X".to_string())]))],
            pipeline: None,
            span: Span::new(1, 1),
        };
        assert!(!rule.is_fact());
    }

    #[test]
    fn test_decl_type_vector_defaults_to_any() {
        let decl = Decl {
            name: "edge".to_string(),
            args: vec!["X".to_string(), "Y".to_string()],
            bound: None,
            descr: DescrBlock::default(),
            span: Span::new(1, 1),
        };
        assert_eq!(decl.type_vector(), vec![TypeTag::Any, TypeTag::Any]);
    }
}
