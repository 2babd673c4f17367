//! # Term Type System
//!
//! Core term types for facts, rules, and queries: name-constants, strings,
//! integers, floats, lists, structs, and (inside rules and queries only)
//! variables.
//!
//! Name-constant equality is integer comparison on the interned id; all other
//! terms compare structurally. Floats order and hash by their bit pattern via
//! `total_cmp`, so terms are usable as deduplication keys.

use crate::interner::{Interner, NameId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

// ============================================================================
// Type tags
// ============================================================================

/// Declared argument type for a predicate column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// `/string` - string values
    String,
    /// `/number` - integers and floats
    Number,
    /// `/name` - name-constants
    Name,
    /// `/any` - untyped legacy predicates
    Any,
}

impl TypeTag {
    /// Parse a type tag from its name-constant spelling (without the `/`).
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "string" => Some(TypeTag::String),
            "number" => Some(TypeTag::Number),
            "name" => Some(TypeTag::Name),
            "any" => Some(TypeTag::Any),
            _ => None,
        }
    }

    /// The `/tag` spelling used in declarations.
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::String => "/string",
            TypeTag::Number => "/number",
            TypeTag::Name => "/name",
            TypeTag::Any => "/any",
        }
    }

    /// Whether a ground term conforms to this tag.
    ///
    /// Lists and structs conform only to `/any`; no coercion happens here.
    pub fn admits(&self, term: &Term) -> bool {
        match (self, term) {
            (TypeTag::Any, t) => !t.is_var(),
            (TypeTag::String, Term::Str(_)) => true,
            (TypeTag::Number, Term::Int(_) | Term::Float(_)) => true,
            (TypeTag::Name, Term::Name(_)) => true,
            _ => false,
        }
    }

    /// The strictest tag admitting both, if the pair is compatible at all.
    pub fn meet(self, other: TypeTag) -> Option<TypeTag> {
        match (self, other) {
            (TypeTag::Any, t) | (t, TypeTag::Any) => Some(t),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Terms
// ============================================================================

/// A tagged logic value.
///
/// `Var` appears only inside rules and queries; the fact store and the
/// external bridge reject terms containing variables.
#[derive(Debug, Clone)]
pub enum Term {
    /// Interned symbolic constant, written `/word`.
    Name(NameId),
    /// String value.
    Str(Arc<str>),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Ordered list of terms.
    List(Vec<Term>),
    /// Struct: ordered mapping from name-constant key to term.
    Struct(Vec<(NameId, Term)>),
    /// Variable (rules and queries only).
    Var(String),
}

impl Term {
    /// Intern and wrap a name-constant (text without the leading `/`).
    pub fn name(text: &str) -> Self {
        Term::Name(Interner::global().name(text))
    }

    /// Wrap a string value, sharing the allocation for long strings.
    pub fn string(text: &str) -> Self {
        Term::Str(Interner::global().string(text))
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Term::Var(_))
    }

    pub fn as_var(&self) -> Option<&str> {
        if let Term::Var(name) = self {
            Some(name)
        } else {
            None
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        if let Term::Int(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Term::Int(v) => Some(*v as f64),
            Term::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// True when no variable occurs anywhere inside this term.
    pub fn is_ground(&self) -> bool {
        match self {
            Term::Var(_) => false,
            Term::List(items) => items.iter().all(Term::is_ground),
            Term::Struct(fields) => fields.iter().all(|(_, v)| v.is_ground()),
            _ => true,
        }
    }

    /// Collect variable names occurring in this term, in first-seen order.
    pub fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            Term::Var(name) => {
                if !out.iter().any(|v| v == name) {
                    out.push(name.clone());
                }
            }
            Term::List(items) => {
                for item in items {
                    item.collect_vars(out);
                }
            }
            Term::Struct(fields) => {
                for (_, v) in fields {
                    v.collect_vars(out);
                }
            }
            _ => {}
        }
    }

    /// A short tag for error messages (`/name`, `/string`, ...).
    pub fn tag_name(&self) -> &'static str {
        match self {
            Term::Name(_) => "/name",
            Term::Str(_) => "/string",
            Term::Int(_) | Term::Float(_) => "/number",
            Term::List(_) => "list",
            Term::Struct(_) => "struct",
            Term::Var(_) => "variable",
        }
    }

    fn discriminant_rank(&self) -> u8 {
        match self {
            Term::Name(_) => 0,
            Term::Str(_) => 1,
            Term::Int(_) => 2,
            Term::Float(_) => 3,
            Term::List(_) => 4,
            Term::Struct(_) => 5,
            Term::Var(_) => 6,
        }
    }
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Term::Name(a), Term::Name(b)) => a == b,
            (Term::Str(a), Term::Str(b)) => a == b,
            (Term::Int(a), Term::Int(b)) => a == b,
            // Bit equality: floats are dedup keys, not arithmetic here.
            (Term::Float(a), Term::Float(b)) => a.to_bits() == b.to_bits(),
            (Term::List(a), Term::List(b)) => a == b,
            (Term::Struct(a), Term::Struct(b)) => a == b,
            (Term::Var(a), Term::Var(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Term {}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.discriminant_rank());
        match self {
            Term::Name(id) => id.hash(state),
            Term::Str(s) => s.hash(state),
            Term::Int(v) => v.hash(state),
            Term::Float(v) => v.to_bits().hash(state),
            Term::List(items) => items.hash(state),
            Term::Struct(fields) => fields.hash(state),
            Term::Var(name) => name.hash(state),
        }
    }
}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Term::Name(a), Term::Name(b)) => a.cmp(b),
            (Term::Str(a), Term::Str(b)) => a.cmp(b),
            (Term::Int(a), Term::Int(b)) => a.cmp(b),
            (Term::Float(a), Term::Float(b)) => a.total_cmp(b),
            (Term::List(a), Term::List(b)) => a.cmp(b),
            (Term::Struct(a), Term::Struct(b)) => a.cmp(b),
            (Term::Var(a), Term::Var(b)) => a.cmp(b),
            (a, b) => a.discriminant_rank().cmp(&b.discriminant_rank()),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Name(id) => write!(f, "/{}", Interner::global().name_text(*id)),
            Term::Str(s) => write!(f, "{:?}", s),
            Term::Int(v) => write!(f, "{}", v),
            Term::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{}", v)
                }
            }
            Term::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Term::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "/{}: {}", Interner::global().name_text(*key), value)?;
                }
                write!(f, "}}")
            }
            Term::Var(name) => f.write_str(name),
        }
    }
}

// ============================================================================
// Serde boundary
// ============================================================================

/// Wire representation: name-constants travel as text, not interner ids.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TermRepr {
    Name(String),
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<TermRepr>),
    Struct(Vec<(String, TermRepr)>),
    Var(String),
}

impl From<&Term> for TermRepr {
    fn from(term: &Term) -> Self {
        let interner = Interner::global();
        match term {
            Term::Name(id) => TermRepr::Name(interner.name_text(*id).to_string()),
            Term::Str(s) => TermRepr::Str(s.to_string()),
            Term::Int(v) => TermRepr::Int(*v),
            Term::Float(v) => TermRepr::Float(*v),
            Term::List(items) => TermRepr::List(items.iter().map(TermRepr::from).collect()),
            Term::Struct(fields) => TermRepr::Struct(
                fields
                    .iter()
                    .map(|(k, v)| (interner.name_text(*k).to_string(), TermRepr::from(v)))
                    .collect(),
            ),
            Term::Var(name) => TermRepr::Var(name.clone()),
        }
    }
}

impl From<TermRepr> for Term {
    fn from(repr: TermRepr) -> Self {
        let interner = Interner::global();
        match repr {
            TermRepr::Name(text) => Term::Name(interner.name(&text)),
            TermRepr::Str(text) => Term::Str(interner.string(&text)),
            TermRepr::Int(v) => Term::Int(v),
            TermRepr::Float(v) => Term::Float(v),
            TermRepr::List(items) => Term::List(items.into_iter().map(Term::from).collect()),
            TermRepr::Struct(fields) => Term::Struct(
                fields
                    .into_iter()
                    .map(|(k, v)| (interner.name(&k), Term::from(v)))
                    .collect(),
            ),
            TermRepr::Var(name) => Term::Var(name),
        }
    }
}

impl Serialize for Term {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TermRepr::from(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Term {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        TermRepr::deserialize(deserializer).map(Term::from)
    }
}

// ============================================================================
// Ground tuples
// ============================================================================

/// An immutable ground tuple as stored per predicate. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tuple(pub Arc<[Term]>);

impl Tuple {
    pub fn new(terms: Vec<Term>) -> Self {
        Tuple(terms.into())
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn terms(&self) -> &[Term] {
        &self.0
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, term) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", term)?;
        }
        write!(f, ")")
    }
}
