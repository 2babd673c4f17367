//! Built-in functions and comparisons.
//!
//! Pure functions over bound arguments. Numeric semantics: integers and
//! floats propagate through arithmetic; ordered comparisons on mixed numeric
//! tags fail with `TypeMismatch` rather than coercing. Division by zero and
//! integer overflow yield `ArithmeticError`.

use crate::ast::CmpOp;
use crate::error::{KernelError, KernelResult};
use crate::term::{Term, TypeTag};
use std::cmp::Ordering;

/// Scalar built-ins usable in `let` bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Plus,
    Minus,
    Mult,
    Div,
    StringConcat,
    /// `fn:list(...)` - list constructor.
    List,
    /// `fn:list:get(L, I)` - zero-based accessor.
    ListGet,
    /// `fn:list:length(L)`.
    ListLength,
}

impl Builtin {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "plus" => Some(Builtin::Plus),
            "minus" => Some(Builtin::Minus),
            "mult" => Some(Builtin::Mult),
            "div" => Some(Builtin::Div),
            "string_concat" => Some(Builtin::StringConcat),
            "list" => Some(Builtin::List),
            "list:get" => Some(Builtin::ListGet),
            "list:length" => Some(Builtin::ListLength),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Builtin::Plus => "plus",
            Builtin::Minus => "minus",
            Builtin::Mult => "mult",
            Builtin::Div => "div",
            Builtin::StringConcat => "string_concat",
            Builtin::List => "list",
            Builtin::ListGet => "list:get",
            Builtin::ListLength => "list:length",
        }
    }

    /// Fixed arity, or `None` for variadic functions.
    pub fn arity(&self) -> Option<usize> {
        match self {
            Builtin::Plus | Builtin::Minus | Builtin::Mult | Builtin::Div | Builtin::ListGet => {
                Some(2)
            }
            Builtin::ListLength => Some(1),
            Builtin::StringConcat | Builtin::List => None,
        }
    }

    /// Declared result type, used by rule-compile type inference.
    pub fn result_type(&self) -> Option<TypeTag> {
        match self {
            Builtin::Plus | Builtin::Minus | Builtin::Mult | Builtin::Div | Builtin::ListLength => {
                Some(TypeTag::Number)
            }
            Builtin::StringConcat => Some(TypeTag::String),
            Builtin::List | Builtin::ListGet => None,
        }
    }

    /// Required operand type, when uniform.
    pub fn operand_type(&self) -> Option<TypeTag> {
        match self {
            Builtin::Plus | Builtin::Minus | Builtin::Mult | Builtin::Div => Some(TypeTag::Number),
            Builtin::StringConcat => Some(TypeTag::String),
            Builtin::List | Builtin::ListGet | Builtin::ListLength => None,
        }
    }

    /// Apply to ground arguments.
    pub fn apply(&self, args: &[Term]) -> KernelResult<Term> {
        match self {
            Builtin::Plus => arith(self, &args[0], &args[1]),
            Builtin::Minus => arith(self, &args[0], &args[1]),
            Builtin::Mult => arith(self, &args[0], &args[1]),
            Builtin::Div => arith(self, &args[0], &args[1]),
            Builtin::StringConcat => {
                let mut out = String::new();
                for arg in args {
                    match arg {
                        Term::Str(s) => out.push_str(s),
                        other => {
                            return Err(KernelError::TypeMismatch(format!(
                                "fn:string_concat expects strings, got {}",
                                other.tag_name()
                            )));
                        }
                    }
                }
                Ok(Term::string(&out))
            }
            Builtin::List => Ok(Term::List(args.to_vec())),
            Builtin::ListGet => {
                let items = as_list(&args[0], "fn:list:get")?;
                let idx = as_index(&args[1], "fn:list:get")?;
                items.get(idx).cloned().ok_or_else(|| {
                    KernelError::Arithmetic(format!(
                        "fn:list:get index {} out of range for list of length {}",
                        idx,
                        items.len()
                    ))
                })
            }
            Builtin::ListLength => {
                let items = as_list(&args[0], "fn:list:length")?;
                Ok(Term::Int(items.len() as i64))
            }
        }
    }
}

fn as_list<'a>(term: &'a Term, context: &str) -> KernelResult<&'a [Term]> {
    match term {
        Term::List(items) => Ok(items),
        other => Err(KernelError::TypeMismatch(format!(
            "{} expects a list, got {}",
            context,
            other.tag_name()
        ))),
    }
}

fn as_index(term: &Term, context: &str) -> KernelResult<usize> {
    match term {
        Term::Int(v) if *v >= 0 => Ok(*v as usize),
        Term::Int(v) => Err(KernelError::Arithmetic(format!(
            "{} index {} is negative",
            context, v
        ))),
        other => Err(KernelError::TypeMismatch(format!(
            "{} expects an integer index, got {}",
            context,
            other.tag_name()
        ))),
    }
}

/// Arithmetic on two numbers. Integers stay integral; a float operand
/// floats the result.
fn arith(op: &Builtin, lhs: &Term, rhs: &Term) -> KernelResult<Term> {
    match (lhs, rhs) {
        (Term::Int(a), Term::Int(b)) => {
            let result = match op {
                Builtin::Plus => a.checked_add(*b),
                Builtin::Minus => a.checked_sub(*b),
                Builtin::Mult => a.checked_mul(*b),
                Builtin::Div => {
                    if *b == 0 {
                        return Err(KernelError::Arithmetic("division by zero".to_string()));
                    }
                    a.checked_div(*b)
                }
                _ => unreachable!("non-arithmetic builtin"),
            };
            result.map(Term::Int).ok_or_else(|| {
                KernelError::Arithmetic(format!("integer overflow in fn:{}", op.as_str()))
            })
        }
        (a, b) => {
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return Err(KernelError::TypeMismatch(format!(
                    "fn:{} expects numbers, got {} and {}",
                    op.as_str(),
                    a.tag_name(),
                    b.tag_name()
                )));
            };
            match op {
                Builtin::Plus => Ok(Term::Float(x + y)),
                Builtin::Minus => Ok(Term::Float(x - y)),
                Builtin::Mult => Ok(Term::Float(x * y)),
                Builtin::Div => {
                    if y == 0.0 {
                        return Err(KernelError::Arithmetic("division by zero".to_string()));
                    }
                    Ok(Term::Float(x / y))
                }
                _ => unreachable!("non-arithmetic builtin"),
            }
        }
    }
}

/// Evaluate a comparison literal over ground terms.
///
/// Equality is structural and works on any tags; ordered comparisons require
/// both sides to share a tag (`TypeMismatch` on mixed int/float included).
pub fn compare(op: CmpOp, lhs: &Term, rhs: &Term) -> KernelResult<bool> {
    match op {
        CmpOp::Eq => Ok(lhs == rhs),
        CmpOp::Ne => Ok(lhs != rhs),
        _ => {
            let ordering = ordered(lhs, rhs)?;
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Ge => ordering != Ordering::Less,
                CmpOp::Eq | CmpOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

fn ordered(lhs: &Term, rhs: &Term) -> KernelResult<Ordering> {
    match (lhs, rhs) {
        (Term::Int(a), Term::Int(b)) => Ok(a.cmp(b)),
        (Term::Float(a), Term::Float(b)) => Ok(a.total_cmp(b)),
        (Term::Str(a), Term::Str(b)) => Ok(a.cmp(b)),
        (Term::Name(a), Term::Name(b)) => {
            let interner = crate::interner::Interner::global();
            Ok(interner.name_text(*a).cmp(&interner.name_text(*b)))
        }
        (a, b) => Err(KernelError::TypeMismatch(format!(
            "cannot order {} against {}",
            a.tag_name(),
            b.tag_name()
        ))),
    }
}
