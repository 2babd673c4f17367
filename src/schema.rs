//! # Schema Registry
//!
//! Holds predicate declarations keyed by `(name, arity)`. The registry
//! answers: is a predicate declared, what is its type vector, is it external,
//! what is its mode vector.
//!
//! The registry is append-only within a load cycle. Conflicting
//! redeclarations narrow to the strictest compatible type vector; truly
//! incompatible redeclarations fail the load. Predicates with the same name
//! but different arities are distinct.

use crate::ast::{Decl, Mode};
use crate::error::{KernelError, KernelResult};
use crate::interner::{Interner, PredName};
use crate::term::{Term, TypeTag};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Dense id assigned per declared `(name, arity)` pair, in declaration order.
///
/// All kernel components (fact store, compiler, stratifier, evaluator) key
/// relations by `PredId`; the textual name appears only at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredId(pub u32);

impl PredId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A resolved predicate declaration.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub id: PredId,
    pub name: Arc<str>,
    /// Argument placeholder names, kept for schema dumps.
    pub arg_names: Vec<String>,
    pub types: Vec<TypeTag>,
    pub modes: Option<Vec<Mode>>,
    pub external: bool,
    pub doc: Option<String>,
}

impl Declaration {
    pub fn arity(&self) -> usize {
        self.types.len()
    }

    /// Validate a ground tuple against this declaration.
    pub fn check_tuple(&self, terms: &[Term]) -> KernelResult<()> {
        if terms.len() != self.arity() {
            return Err(KernelError::ArityMismatch {
                pred: self.name.to_string(),
                expected: self.arity(),
                actual: terms.len(),
            });
        }
        for (i, (term, tag)) in terms.iter().zip(&self.types).enumerate() {
            if term.is_var() || !term.is_ground() {
                return Err(KernelError::TypeMismatch(format!(
                    "{}: argument {} is not ground",
                    self.name,
                    i + 1
                )));
            }
            if !tag.admits(term) {
                return Err(KernelError::TypeMismatch(format!(
                    "{}: argument {} is {} but declared {}",
                    self.name,
                    i + 1,
                    term.tag_name(),
                    tag
                )));
            }
        }
        Ok(())
    }

    /// Render back to declaration syntax.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "Decl {}(", self.name);
        for (i, arg) in self.arg_names.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(arg);
        }
        out.push(')');
        if self.types.iter().any(|t| *t != TypeTag::Any) {
            out.push_str(" bound [");
            for (i, tag) in self.types.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(tag.as_str());
            }
            out.push(']');
        }
        let mut descr_tags: Vec<String> = Vec::new();
        if self.external {
            descr_tags.push("external()".to_string());
        }
        if let Some(modes) = &self.modes {
            let parts: Vec<String> = modes.iter().map(|m| format!("'{}'", m.as_str())).collect();
            descr_tags.push(format!("mode({})", parts.join(", ")));
        }
        if let Some(doc) = &self.doc {
            descr_tags.push(format!("doc({:?})", doc));
        }
        if !descr_tags.is_empty() {
            let _ = write!(out, " descr [{}]", descr_tags.join(", "));
        }
        out.push('.');
        out
    }
}

/// Append-only declaration table for one load cycle.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    by_key: HashMap<(PredName, usize), PredId>,
    decls: Vec<Declaration>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry::default()
    }

    /// Register a parsed declaration.
    ///
    /// A redeclaration narrows column types to the strictest compatible tag;
    /// incompatible types, mode disagreement, or an external flag flip are
    /// schema violations.
    pub fn declare(&mut self, decl: &Decl) -> KernelResult<PredId> {
        let types = decl.type_vector();
        let modes = decl.descr.modes.clone();
        if let Some(modes) = &modes {
            if modes.len() != decl.arity() {
                return Err(KernelError::SchemaViolation(format!(
                    "{}: mode vector has {} entries for {} arguments",
                    decl.name,
                    modes.len(),
                    decl.arity()
                )));
            }
        }
        if decl.descr.external && modes.is_none() {
            return Err(KernelError::SchemaViolation(format!(
                "{}: external predicates must declare a mode vector",
                decl.name
            )));
        }

        let key = (Interner::global().predicate(&decl.name), decl.arity());
        if let Some(&id) = self.by_key.get(&key) {
            let existing = &mut self.decls[id.index()];
            if existing.external != decl.descr.external {
                return Err(KernelError::SchemaViolation(format!(
                    "{}: conflicting external() annotation across declarations",
                    decl.name
                )));
            }
            if let (Some(old), Some(new)) = (&existing.modes, &modes) {
                if old != new {
                    return Err(KernelError::SchemaViolation(format!(
                        "{}: conflicting mode vectors across declarations",
                        decl.name
                    )));
                }
            }
            // Strictest declaration wins; a widening redeclaration is an error.
            let mut narrowed = Vec::with_capacity(types.len());
            for (i, (old, new)) in existing.types.iter().zip(&types).enumerate() {
                match old.meet(*new) {
                    Some(tag) => narrowed.push(tag),
                    None => {
                        return Err(KernelError::SchemaViolation(format!(
                            "{}: argument {} declared both {} and {}",
                            decl.name,
                            i + 1,
                            old,
                            new
                        )));
                    }
                }
            }
            if narrowed != existing.types {
                debug!(pred = %decl.name, "narrowing redeclaration to strictest types");
                existing.types = narrowed;
            }
            if existing.modes.is_none() {
                existing.modes = modes;
            }
            if existing.doc.is_none() {
                existing.doc = decl.descr.doc.clone();
            }
            return Ok(id);
        }

        let id = PredId(self.decls.len() as u32);
        self.decls.push(Declaration {
            id,
            name: Arc::from(decl.name.as_str()),
            arg_names: decl.args.clone(),
            types,
            modes,
            external: decl.descr.external,
            doc: decl.descr.doc.clone(),
        });
        self.by_key.insert(key, id);
        Ok(id)
    }

    /// Look up by textual name and arity.
    pub fn lookup(&self, name: &str, arity: usize) -> Option<&Declaration> {
        let key = (Interner::global().predicate(name), arity);
        self.by_key.get(&key).map(|id| &self.decls[id.index()])
    }

    /// Resolve an atom reference or fail with `SchemaViolation`.
    pub fn resolve(&self, name: &str, arity: usize) -> KernelResult<&Declaration> {
        self.lookup(name, arity).ok_or_else(|| {
            KernelError::SchemaViolation(format!("undeclared predicate {}/{}", name, arity))
        })
    }

    pub fn get(&self, id: PredId) -> &Declaration {
        &self.decls[id.index()]
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    /// All declarations in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter()
    }

    /// Render the whole registry back to source text, one declaration per
    /// line, in declaration order.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for decl in &self.decls {
            out.push_str(&decl.render());
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn decl_of(source: &str) -> Decl {
        let program = parse_program(source).expect("parse");
        let decl = program.decls().next().expect("decl").clone();
        decl
    }

    #[test]
    fn test_declare_and_lookup() {
        let mut registry = SchemaRegistry::new();
        registry
            .declare(&decl_of("Decl edge(X, Y) bound [/name, /name]."))
            .expect("declare");
        let decl = registry.lookup("edge", 2).expect("declared");
        assert_eq!(decl.types, vec![TypeTag::Name, TypeTag::Name]);
        assert!(registry.lookup("edge", 3).is_none());
    }

    #[test]
    fn test_same_name_different_arity_is_distinct() {
        let mut registry = SchemaRegistry::new();
        let a = registry
            .declare(&decl_of("Decl task(X, Y, Z)."))
            .expect("declare 3-ary");
        let b = registry
            .declare(&decl_of("Decl task(A, B, C, D, E)."))
            .expect("declare 5-ary");
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_redeclaration_narrows_to_strictest() {
        let mut registry = SchemaRegistry::new();
        registry
            .declare(&decl_of("Decl cost(J, N)."))
            .expect("any decl");
        registry
            .declare(&decl_of("Decl cost(J, N) bound [/name, /number]."))
            .expect("narrowing is allowed");
        let decl = registry.lookup("cost", 2).expect("declared");
        assert_eq!(decl.types, vec![TypeTag::Name, TypeTag::Number]);
    }

    #[test]
    fn test_conflicting_redeclaration_rejected() {
        let mut registry = SchemaRegistry::new();
        registry
            .declare(&decl_of("Decl cost(J, N) bound [/name, /number]."))
            .expect("declare");
        let err = registry
            .declare(&decl_of("Decl cost(J, N) bound [/name, /string]."))
            .expect_err("conflict");
        assert_eq!(err.kind(), "SchemaViolation");
    }

    #[test]
    fn test_external_requires_modes() {
        let mut registry = SchemaRegistry::new();
        let err = registry
            .declare(&decl_of("Decl clock(T) descr [external()]."))
            .expect_err("missing modes");
        assert_eq!(err.kind(), "SchemaViolation");
    }

    #[test]
    fn test_tuple_validation() {
        let mut registry = SchemaRegistry::new();
        registry
            .declare(&decl_of("Decl cost(J, N) bound [/name, /number]."))
            .expect("declare");
        let decl = registry.lookup("cost", 2).expect("declared");

        assert!(decl.check_tuple(&[Term::name("j1"), Term::Int(3)]).is_ok());
        assert!(decl
            .check_tuple(&[Term::name("j1"), Term::Float(0.5)])
            .is_ok());

        let err = decl
            .check_tuple(&[Term::string("j1"), Term::Int(3)])
            .expect_err("type mismatch");
        assert_eq!(err.kind(), "TypeMismatch");

        let err = decl.check_tuple(&[Term::name("j1")]).expect_err("arity");
        assert_eq!(err.kind(), "ArityMismatch");
    }

    #[test]
    fn test_dump_renders_decl_syntax() {
        let mut registry = SchemaRegistry::new();
        registry
            .declare(&decl_of(
                "Decl recent_commits(Limit, Hash) bound [/number, /string] \
                 descr [external(), mode('+', '-')].",
            ))
            .expect("declare");
        let dump = registry.dump();
        assert!(dump.contains("Decl recent_commits(Limit, Hash)"));
        assert!(dump.contains("bound [/number, /string]"));
        assert!(dump.contains("external()"));
        assert!(dump.contains("mode('+', '-')"));

        // The dump reparses to an equivalent registry.
        let program = parse_program(&dump).expect("reparse");
        let mut again = SchemaRegistry::new();
        for decl in program.decls() {
            again.declare(decl).expect("redeclare");
        }
        assert_eq!(again.len(), registry.len());
    }
}
