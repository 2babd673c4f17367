//! # External Predicate Bridge
//!
//! Registry of host handlers that materialise tuples on demand (vector
//! search, git history, filesystem scans). The bridge:
//!
//! - enforces the declared mode vector: every `+` column arrives bound;
//! - validates returned tuples against the declared type vector and rejects
//!   tuples that would violate the schema;
//! - discards everything a failing handler produced before its error.
//!
//! Handlers are invoked synchronously from the evaluator with the remaining
//! time budget. Hosts that must not block register a cached variant that
//! returns immediately with last-known results.

use crate::ast::Mode;
use crate::deadline::Deadline;
use crate::error::{KernelError, KernelResult};
use crate::schema::{Declaration, PredId};
use crate::term::Term;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Handler-side failure outcomes.
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Backend cannot currently answer; the call yields zero tuples but the
    /// failure is reported on the diagnostics channel.
    Unavailable(String),
    /// The handler exceeded its budget.
    Timeout,
}

/// A host-registered resolver for one external predicate.
///
/// `bound` carries the values of the `+` columns in declaration order. Each
/// emitted row carries values for the `-` columns, also in declaration
/// order. Returning closes the stream.
pub trait ExternalHandler: Send + Sync {
    fn resolve(
        &self,
        bound: &[Term],
        budget: Option<Duration>,
        emit: &mut dyn FnMut(Vec<Term>),
    ) -> Result<(), ExternalError>;
}

impl<F> ExternalHandler for F
where
    F: Fn(&[Term], Option<Duration>, &mut dyn FnMut(Vec<Term>)) -> Result<(), ExternalError>
        + Send
        + Sync,
{
    fn resolve(
        &self,
        bound: &[Term],
        budget: Option<Duration>,
        emit: &mut dyn FnMut(Vec<Term>),
    ) -> Result<(), ExternalError> {
        self(bound, budget, emit)
    }
}

/// Result of one bridge invocation: the valid output rows plus per-tuple
/// schema rejections (surfaced as diagnostics, never stored).
#[derive(Debug, Default)]
pub struct ExternalOutcome {
    pub rows: Vec<Vec<Term>>,
    pub rejected: Vec<KernelError>,
}

/// Handler registry keyed by predicate.
#[derive(Clone, Default)]
pub struct ExternalRegistry {
    handlers: HashMap<PredId, Arc<dyn ExternalHandler>>,
}

impl ExternalRegistry {
    pub fn new() -> Self {
        ExternalRegistry::default()
    }

    /// Register a handler for a declared external predicate.
    pub fn register(
        &mut self,
        decl: &Declaration,
        handler: Arc<dyn ExternalHandler>,
    ) -> KernelResult<()> {
        if !decl.external {
            return Err(KernelError::SchemaViolation(format!(
                "{} is not declared external()",
                decl.name
            )));
        }
        self.handlers.insert(decl.id, handler);
        Ok(())
    }

    pub fn is_registered(&self, pred: PredId) -> bool {
        self.handlers.contains_key(&pred)
    }

    /// Invoke the handler for `decl` with the bound `+` column values.
    ///
    /// Outer errors (`ExternalUnavailable`, `ExternalTimeout`, `Cancelled`)
    /// mean zero rows; everything the handler emitted before failing is
    /// discarded.
    pub fn invoke(
        &self,
        decl: &Declaration,
        bound: &[Term],
        deadline: &Deadline,
    ) -> KernelResult<ExternalOutcome> {
        deadline.check()?;
        let handler = self.handlers.get(&decl.id).ok_or_else(|| {
            KernelError::ExternalUnavailable(
                decl.name.to_string(),
                "no handler registered".to_string(),
            )
        })?;

        let modes = decl.modes.clone().unwrap_or_default();
        let free_types: Vec<_> = decl
            .types
            .iter()
            .zip(&modes)
            .filter(|(_, m)| **m == Mode::Free)
            .map(|(t, _)| *t)
            .collect();

        let mut emitted: Vec<Vec<Term>> = Vec::new();
        let result = handler.resolve(bound, deadline.remaining(), &mut |row| {
            emitted.push(row);
        });

        match result {
            Ok(()) => {}
            Err(ExternalError::Unavailable(reason)) => {
                warn!(pred = %decl.name, %reason, "external handler unavailable");
                return Err(KernelError::ExternalUnavailable(
                    decl.name.to_string(),
                    reason,
                ));
            }
            Err(ExternalError::Timeout) => {
                warn!(pred = %decl.name, "external handler timed out");
                return Err(KernelError::ExternalTimeout(decl.name.to_string()));
            }
        }
        deadline.check()?;

        let mut outcome = ExternalOutcome::default();
        for row in emitted {
            match validate_row(decl, &free_types, &row) {
                Ok(()) => outcome.rows.push(row),
                Err(err) => outcome.rejected.push(err),
            }
        }
        Ok(outcome)
    }
}

fn validate_row(decl: &Declaration, free_types: &[crate::term::TypeTag], row: &[Term]) -> KernelResult<()> {
    if row.len() != free_types.len() {
        return Err(KernelError::ExternalInvalid(
            decl.name.to_string(),
            format!(
                "handler returned {} values for {} output columns",
                row.len(),
                free_types.len()
            ),
        ));
    }
    for (i, (term, tag)) in row.iter().zip(free_types).enumerate() {
        if !term.is_ground() {
            return Err(KernelError::ExternalInvalid(
                decl.name.to_string(),
                format!("output column {} is not ground", i + 1),
            ));
        }
        if !tag.admits(term) {
            return Err(KernelError::ExternalInvalid(
                decl.name.to_string(),
                format!(
                    "output column {} is {} but declared {}",
                    i + 1,
                    term.tag_name(),
                    tag
                ),
            ));
        }
    }
    Ok(())
}
