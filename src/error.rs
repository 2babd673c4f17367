//! # Kernel Error Types
//!
//! Every fallible host-facing operation returns [`KernelError`]. The variants
//! map one-to-one onto the stable error identifiers surfaced to hosts and in
//! diagnostics (`Parse`, `SchemaViolation`, `TypeMismatch`, ...), so matching
//! on [`KernelError::kind`] is stable across releases even if display text
//! changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A source position (1-based line and column) attached to parse errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
}

impl Span {
    pub fn new(line: u32, col: u32) -> Self {
        Span { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Unified error type for all kernel operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KernelError {
    /// Source text ill-formed; carries the offending position.
    #[error("parse error at {span}: {message}")]
    Parse { span: Span, message: String },

    /// Arity/type/mode disagreement between declaration, fact, rule, or handler.
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// A term's tag disagrees with its declared type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Tuple length disagrees with the declared arity.
    #[error("arity mismatch for {pred}: expected {expected} arguments, got {actual}")]
    ArityMismatch {
        pred: String,
        expected: usize,
        actual: usize,
    },

    /// Negation or aggregation inside a recursive component.
    #[error("stratification error: {0}")]
    Stratification(String),

    /// Range-restriction or safe-negation violation at rule compile time.
    #[error("unsafe rule: {0}")]
    UnsafeRule(String),

    /// Division by zero or overflow inside a built-in function.
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    /// An external handler reported it cannot currently produce tuples.
    #[error("external predicate '{0}' unavailable: {1}")]
    ExternalUnavailable(String, String),

    /// An external handler exceeded its time budget.
    #[error("external predicate '{0}' timed out")]
    ExternalTimeout(String),

    /// An external handler returned a tuple violating its declaration.
    #[error("external predicate '{0}' returned an invalid tuple: {1}")]
    ExternalInvalid(String, String),

    /// The operation deadline was reached.
    #[error("cancelled after {elapsed:?} (budget {budget:?})")]
    Cancelled { budget: Duration, elapsed: Duration },

    /// Per-predicate materialised tuple cap exceeded.
    #[error("tuple cap exceeded for {pred}: limit {cap}")]
    Overflow { pred: String, cap: usize },

    /// Trace id or retraction pattern matched nothing.
    #[error("not found: {0}")]
    NotFound(String),
}

impl KernelError {
    /// Stable identifier for this error kind.
    ///
    /// Hosts and diagnostics key off these strings rather than the Rust
    /// variant names.
    pub fn kind(&self) -> &'static str {
        match self {
            KernelError::Parse { .. } => "Parse",
            KernelError::SchemaViolation(_) => "SchemaViolation",
            KernelError::TypeMismatch(_) => "TypeMismatch",
            KernelError::ArityMismatch { .. } => "ArityMismatch",
            KernelError::Stratification(_) => "StratificationError",
            KernelError::UnsafeRule(_) => "UnsafeRule",
            KernelError::Arithmetic(_) => "ArithmeticError",
            KernelError::ExternalUnavailable(_, _) => "ExternalUnavailable",
            KernelError::ExternalTimeout(_) => "ExternalTimeout",
            KernelError::ExternalInvalid(_, _) => "ExternalInvalid",
            KernelError::Cancelled { .. } => "Cancelled",
            KernelError::Overflow { .. } => "Overflow",
            KernelError::NotFound(_) => "NotFound",
        }
    }

    /// Construct a parse error at a position.
    pub fn parse(span: Span, message: impl Into<String>) -> Self {
        KernelError::Parse {
            span,
            message: message.into(),
        }
    }

    /// True for handler-side failures that evaluation treats as local.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            KernelError::ExternalUnavailable(_, _)
                | KernelError::ExternalTimeout(_)
                | KernelError::ExternalInvalid(_, _)
        )
    }
}

/// Convenience alias used throughout the kernel.
pub type KernelResult<T> = Result<T, KernelError>;
