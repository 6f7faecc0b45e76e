//! Errors of the expression algebra and the equivalence checker

use thiserror::Error;

/// Algebra/solver error. Every variant is fatal for the interpretation.
#[derive(Debug, Clone, Error)]
pub enum SmtError {
    /// Operand combination the algebra does not define
    #[error("operator {op} not supported between {left} and {right}")]
    UnsupportedOp {
        op: &'static str,
        left: String,
        right: String,
    },

    /// A value that had to be a compile-time constant was symbolic
    #[error("{what} must be a compile-time constant")]
    NonConstant { what: &'static str },

    /// Merge of two expressions with incompatible sorts
    #[error("cannot merge {left} with {right}")]
    MergeMismatch { left: String, right: String },

    /// Cast without a defined rule
    #[error("cannot cast {from} to {to}")]
    UnsupportedCast { from: String, to: String },

    /// Slice bounds outside the operand width
    #[error("slice [{hi}:{lo}] out of range for width {width}")]
    SliceBounds { hi: u64, lo: u64, width: u32 },

    /// The solver reported sat but returned no model
    #[error("solver produced no model")]
    ModelUnavailable,
}

pub type SmtResult<T> = Result<T, SmtError>;
