//! Interpretation errors
//!
//! Every error is fatal: the interpreter never retries or falls back. The
//! comparator distinguishes solver verdicts separately; anything surfacing
//! here aborts the run with a nonzero exit.

use p4v_smt::SmtError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// Variable lookup failure
    #[error("variable {0} not found in scope")]
    UndefinedVar(String),

    /// Type lookup failure
    #[error("type {0} not found in scope")]
    UndefinedType(String),

    /// Static declaration lookup failure
    #[error("declaration {0} not found in scope")]
    UndefinedDecl(String),

    /// Re-declaration in the same scope
    #[error("{0} already declared in this scope")]
    Redeclared(String),

    /// No callable overload matches the argument count
    #[error("no overload of {name} accepts {arity} arguments")]
    NoOverload { name: String, arity: usize },

    /// Construct the interpreter does not model
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    /// A parser state was revisited beyond the unrolling bound
    #[error("parser loop detected in state {0}")]
    ParserLoop(String),

    /// Constant stack index outside the stack bounds
    #[error("stack index {index} out of bounds for size {size}")]
    StackBounds { index: u64, size: u64 },

    /// A generic type parameter that no argument determines
    #[error("type variable {0} could not be solved")]
    UnsolvedTypeVar(String),

    /// Semantic problem in the input program
    #[error("program error: {0}")]
    Program(String),

    /// Broken internal contract (a bug in the interpreter)
    #[error("internal error: {0}")]
    Internal(String),

    /// Error raised by the expression algebra
    #[error(transparent)]
    Smt(#[from] SmtError),
}

pub type EvalResult<T> = Result<T, EvalError>;
