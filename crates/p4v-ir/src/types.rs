//! P4_16 type representation
//!
//! Types arrive from the front-end exporter fully elaborated except for two
//! things the interpreter resolves itself: `Type::Name` references (followed
//! lazily through the scope's alias table, which also breaks cyclic type
//! graphs) and `Type::BitsExpr` widths, which the type-fill pass folds to
//! literal widths.

use crate::ast::{Expr, MethodSig, Parameter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A P4 type as seen by the interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    /// `bool`
    Bool,
    /// `bit<N>` or `int<N>`
    Bits { width: u32, signed: bool },
    /// `varbit<N>`; modeled as a bitvector of its maximum width
    Varbits { width: u32 },
    /// `bit<(expr)>` with a width that is not yet a literal
    BitsExpr { expr: Box<Expr>, signed: bool },
    /// The unbounded integer type `int`
    Int,
    /// `void`
    Void,
    /// A reference to a declared type, resolved through the alias table
    Name(String),
    /// A struct declaration
    Struct(Arc<StructType>),
    /// A header declaration
    Header(Arc<StructType>),
    /// A header union declaration
    HeaderUnion(Arc<StructType>),
    /// A header stack `T[N]`
    Stack { element: Box<Type>, size: u32 },
    /// An enum declaration
    Enum(Arc<EnumType>),
    /// A serializable enum declaration
    SerEnum(Arc<SerEnumType>),
    /// The `error` namespace
    Error(Arc<EnumType>),
    /// An extern object declaration
    Extern(Arc<ExternType>),
    /// A package declaration
    Package(Arc<PackageType>),
    /// A `parser` type signature
    ParserType(Arc<PipelineType>),
    /// A `control` type signature
    ControlType(Arc<PipelineType>),
    /// A tuple/list type
    List(Vec<Type>),
}

impl Type {
    /// Shorthand for `bit<N>`.
    pub fn bits(width: u32) -> Type {
        Type::Bits {
            width,
            signed: false,
        }
    }

    /// Shorthand for `int<N>`.
    pub fn signed_bits(width: u32) -> Type {
        Type::Bits {
            width,
            signed: true,
        }
    }

    /// A short label used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Type::Bool => "bool".to_string(),
            Type::Bits { width, signed } => {
                if *signed {
                    format!("int<{}>", width)
                } else {
                    format!("bit<{}>", width)
                }
            }
            Type::Varbits { width } => format!("varbit<{}>", width),
            Type::BitsExpr { .. } => "bit<(expr)>".to_string(),
            Type::Int => "int".to_string(),
            Type::Void => "void".to_string(),
            Type::Name(n) => n.clone(),
            Type::Struct(s) => format!("struct {}", s.name),
            Type::Header(h) => format!("header {}", h.name),
            Type::HeaderUnion(u) => format!("header_union {}", u.name),
            Type::Stack { element, size } => format!("{}[{}]", element.describe(), size),
            Type::Enum(e) => format!("enum {}", e.name),
            Type::SerEnum(e) => format!("enum {}", e.name),
            Type::Error(_) => "error".to_string(),
            Type::Extern(e) => format!("extern {}", e.name),
            Type::Package(p) => format!("package {}", p.name),
            Type::ParserType(p) => format!("parser {}", p.name),
            Type::ControlType(c) => format!("control {}", c.name),
            Type::List(_) => "tuple".to_string(),
        }
    }
}

/// Fields of a struct-like type (struct, header, header union).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    pub ty: Type,
}

/// A plain enum or the `error` namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumType {
    pub name: String,
    pub members: Vec<String>,
}

/// A serializable enum with explicit member values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerEnumType {
    pub name: String,
    pub underlying: Type,
    pub members: Vec<(String, Expr)>,
}

/// An extern object: opaque state plus a method table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternType {
    pub name: String,
    pub type_params: Vec<String>,
    pub methods: Vec<MethodSig>,
}

/// A package signature; `main` instantiates one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageType {
    pub name: String,
    pub type_params: Vec<String>,
    pub params: Vec<Parameter>,
}

/// The signature of a `parser` or `control` type declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineType {
    pub name: String,
    pub type_params: Vec<String>,
    pub params: Vec<Parameter>,
}
