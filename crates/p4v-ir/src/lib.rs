//! p4v-ir - typed P4_16 intermediate representation
//!
//! This crate defines the AST produced by an external P4 front-end and
//! consumed by the symbolic interpreter. Parsing and typechecking happen
//! outside this workspace; programs arrive as JSON dumps in declaration
//! order, with one dump per compiler pass when validating translations.

pub mod ast;
pub mod load;
pub mod types;

pub use ast::{
    ActionRef, Argument, BinOp, BlockStatement, CallableDecl, ControlDecl, Declaration, Direction,
    Expr, InstanceDecl, KeySetExpr, MethodSig, Parameter, ParserDecl, ParserState, Program,
    SelectCase, Statement, SwitchCase, SwitchLabel, TableDecl, TableKey, Transition, UnOp, VarDecl,
};
pub use load::{load_program, LoadError};
pub use types::{
    EnumType, ExternType, PackageType, PipelineType, SerEnumType, StructField, StructType, Type,
};
