//! p4v-interp - symbolic interpretation of P4_16 programs
//!
//! The interpreter reduces a typed P4 program to logical formulas: it walks
//! the AST with a scoped symbolic state, models control flow as path merging
//! under solver conditions, and returns per-pipeline symbolic state as
//! `(dotted path, expression)` pairs.
//!
//! Two passes do the work. The type-fill pass ([`fill`]) registers types and
//! binds constants, instances, tables, actions, and functions into the root
//! scope. The interpreter pass ([`interp`]) then enters `main`, dispatches
//! into its package arguments, and executes controls and parsers under the
//! copy-in/copy-out call discipline.
//!
//! The entry point for both consumer tools is [`run_program`].

pub mod error;
pub mod fill;
pub mod instantiate;
pub mod interp;
pub mod resolver;
pub mod scope;
pub mod value;

pub use error::{EvalError, EvalResult};
pub use interp::{run_program, Flow, Interpreter};
pub use resolver::{set_var, MemberPath, Selector};
pub use scope::{ProgState, Scope};
pub use value::{
    Callable, ControlVal, EnumVal, ExternVal, HeaderVal, MemberMap, OverloadSet, PipelineRef,
    StackVal, StaticDecl, StructVal, UnionVal, Value,
};
