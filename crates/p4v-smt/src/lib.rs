//! p4v-smt - expression algebra and equivalence checking over Z3
//!
//! This crate wraps the solver for the rest of the workspace:
//!
//! - [`Scalar`] is the scalar symbolic value (bitvector + signedness, bool,
//!   unbounded int) with the full P4 operator set: alignment, signed and
//!   unsigned arithmetic, saturating arithmetic, shifts, slices, casts, and
//!   path merging.
//! - [`EquivChecker`] decides whether two flattened program states are
//!   indistinguishable, which is the comparator's whole job.
//!
//! One `z3::Context` is created by the caller and outlives every expression;
//! all values borrow it through the `'ctx` lifetime.

mod algebra;
mod compare;
mod error;

pub use algebra::{align_to_width, Scalar, INVALID_LABEL, UNDEFINED_LABEL};
pub use compare::{CheckOutcome, EquivChecker};
pub use error::{SmtError, SmtResult};
