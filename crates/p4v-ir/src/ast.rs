//! Abstract syntax tree for typed P4_16 programs
//!
//! This is the fixed input the interpreter visits. It mirrors the shape of a
//! front-end dump after parsing and typechecking: declarations appear in
//! source order, overloads are left unresolved, and expressions carry the
//! literal widths the typechecker assigned. The tree is immutable; shared
//! declarations are held behind `Arc` so values produced by the interpreter
//! can reference them without cloning bodies.

use crate::types::{EnumType, ExternType, PackageType, PipelineType, SerEnumType, StructType, Type};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A complete P4 program: top-level declarations in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub declarations: Vec<Declaration>,
}

/// A top-level or local declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Declaration {
    Struct(Arc<StructType>),
    Header(Arc<StructType>),
    HeaderUnion(Arc<StructType>),
    Enum(Arc<EnumType>),
    SerEnum(Arc<SerEnumType>),
    Error(Arc<EnumType>),
    Extern(Arc<ExternType>),
    Typedef { name: String, ty: Type },
    Newtype { name: String, ty: Type },
    Package(Arc<PackageType>),
    ParserType(Arc<PipelineType>),
    ControlType(Arc<PipelineType>),
    Parser(Arc<ParserDecl>),
    Control(Arc<ControlDecl>),
    Constant(Arc<VarDecl>),
    Variable(Arc<VarDecl>),
    Instance(Arc<InstanceDecl>),
    Action(Arc<CallableDecl>),
    Function(Arc<CallableDecl>),
    /// A top-level extern function (e.g. `verify`)
    Method(Arc<MethodSig>),
    Table(Arc<TableDecl>),
    ValueSet { name: String, element: Type },
    MatchKind(Vec<String>),
}

/// A constant or variable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarDecl {
    pub name: String,
    pub ty: Type,
    pub init: Option<Expr>,
}

/// An instantiation: `Type(args) name;`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDecl {
    pub name: String,
    pub ty: Type,
    pub args: Vec<Argument>,
}

/// An action or function; actions have a `void` return type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableDecl {
    pub name: String,
    pub return_type: Type,
    pub params: Vec<Parameter>,
    pub body: BlockStatement,
}

/// An extern method signature (no body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSig {
    pub name: String,
    pub return_type: Type,
    pub type_params: Vec<String>,
    pub params: Vec<Parameter>,
}

/// A `parser` declaration with its state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserDecl {
    pub name: String,
    pub type_params: Vec<String>,
    pub params: Vec<Parameter>,
    pub constructor_params: Vec<Parameter>,
    pub locals: Vec<Declaration>,
    pub states: Vec<ParserState>,
}

impl ParserDecl {
    pub fn state(&self, name: &str) -> Option<&ParserState> {
        self.states.iter().find(|s| s.name == name)
    }
}

/// One parser state: statements followed by a transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParserState {
    pub name: String,
    pub body: Vec<Statement>,
    pub transition: Transition,
}

/// The transition out of a parser state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    /// `transition next_state;`
    Direct(String),
    /// `transition select(selectors) { keyset: next; ... }`
    Select {
        selectors: Vec<Expr>,
        cases: Vec<SelectCase>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectCase {
    pub keyset: Vec<KeySetExpr>,
    pub next: String,
}

/// One component of a select keyset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeySetExpr {
    Expr(Expr),
    Mask { value: Expr, mask: Expr },
    Range { lo: Expr, hi: Expr },
    Default,
}

/// A `control` declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDecl {
    pub name: String,
    pub type_params: Vec<String>,
    pub params: Vec<Parameter>,
    pub constructor_params: Vec<Parameter>,
    pub locals: Vec<Declaration>,
    pub body: BlockStatement,
}

/// A match-action table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDecl {
    pub name: String,
    pub keys: Vec<TableKey>,
    pub actions: Vec<ActionRef>,
    pub default_action: Option<ActionRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableKey {
    pub expr: Expr,
    pub match_kind: String,
}

/// A reference to an action from a table property, with bound arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRef {
    pub name: String,
    pub args: Vec<Argument>,
}

/// A parameter of a callable, parser, control, or package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub direction: Direction,
    pub ty: Type,
    #[serde(default)]
    pub default_value: Option<Expr>,
    #[serde(default)]
    pub is_optional: bool,
}

impl Parameter {
    pub fn new(name: &str, direction: Direction, ty: Type) -> Parameter {
        Parameter {
            name: name.to_string(),
            direction,
            ty,
            default_value: None,
            is_optional: false,
        }
    }

    /// A parameter that call resolution may leave unbound.
    pub fn is_omittable(&self) -> bool {
        self.is_optional || self.default_value.is_some()
    }
}

/// Parameter direction; `None` is a directionless (compile-time) parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    None,
    In,
    Out,
    InOut,
}

/// An argument at a call or instantiation site, optionally named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Expr,
}

impl Argument {
    pub fn positional(value: Expr) -> Argument {
        Argument { name: None, value }
    }

    pub fn named(name: &str, value: Expr) -> Argument {
        Argument {
            name: Some(name.to_string()),
            value,
        }
    }
}

/// A statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Block(BlockStatement),
    Assign {
        target: Expr,
        value: Expr,
    },
    /// An expression statement; the expression must be a call.
    MethodCall(Expr),
    If {
        condition: Expr,
        then_branch: Box<Statement>,
        else_branch: Option<Box<Statement>>,
    },
    Switch {
        scrutinee: Expr,
        cases: Vec<SwitchCase>,
    },
    /// A local declaration inside a block or parser state.
    Declaration(Box<Declaration>),
    Return(Option<Expr>),
    Exit,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStatement {
    pub statements: Vec<Statement>,
}

impl BlockStatement {
    pub fn new(statements: Vec<Statement>) -> BlockStatement {
        BlockStatement { statements }
    }
}

/// One switch case; a case without a body falls through to the next one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    pub label: SwitchLabel,
    pub body: Option<BlockStatement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SwitchLabel {
    Name(String),
    Default,
}

/// An expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Bool(bool),
    /// An integer literal; `width: None` is an unbounded `int` literal.
    Int {
        value: BigInt,
        width: Option<u32>,
        signed: bool,
    },
    /// A reference to a variable, instance, action, or table by name.
    Path(String),
    /// A type used in expression position (`MyEnum.MEMBER`, `error.NoMatch`).
    TypeName(String),
    Member {
        base: Box<Expr>,
        member: String,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        base: Box<Expr>,
        hi: Box<Expr>,
        lo: Box<Expr>,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// The ternary conditional `cond ? a : b`.
    Mux {
        condition: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },
    Cast {
        ty: Type,
        expr: Box<Expr>,
    },
    /// `{ e1, e2, ... }`
    List(Vec<Expr>),
    /// `{ f1 = e1, f2 = e2, ... }`
    StructInit(Vec<(String, Expr)>),
    /// A method, function, or action call.
    Call {
        target: Box<Expr>,
        type_args: Vec<Type>,
        args: Vec<Argument>,
    },
    /// A constructor call `Type(args)`.
    Construct {
        ty: Type,
        args: Vec<Argument>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    /// Arithmetic negation `-`
    Neg,
    /// Bitwise complement `~`
    Cmpl,
    /// Logical not `!`
    LNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Mul,
    Div,
    Mod,
    Add,
    AddSat,
    Sub,
    SubSat,
    Shl,
    Shr,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    BAnd,
    BOr,
    BXor,
    LAnd,
    LOr,
    Concat,
}

impl Expr {
    pub fn path(name: &str) -> Expr {
        Expr::Path(name.to_string())
    }

    pub fn type_name(name: &str) -> Expr {
        Expr::TypeName(name.to_string())
    }

    pub fn member(base: Expr, member: &str) -> Expr {
        Expr::Member {
            base: Box::new(base),
            member: member.to_string(),
        }
    }

    pub fn index(base: Expr, index: Expr) -> Expr {
        Expr::Index {
            base: Box::new(base),
            index: Box::new(index),
        }
    }

    /// An unsigned `bit<width>` literal.
    pub fn uint(value: u64, width: u32) -> Expr {
        Expr::Int {
            value: BigInt::from(value),
            width: Some(width),
            signed: false,
        }
    }

    /// An unbounded `int` literal.
    pub fn int(value: i64) -> Expr {
        Expr::Int {
            value: BigInt::from(value),
            width: None,
            signed: false,
        }
    }

    pub fn unary(op: UnOp, operand: Expr) -> Expr {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn cast(ty: Type, expr: Expr) -> Expr {
        Expr::Cast {
            ty,
            expr: Box::new(expr),
        }
    }

    pub fn slice(base: Expr, hi: Expr, lo: Expr) -> Expr {
        Expr::Slice {
            base: Box::new(base),
            hi: Box::new(hi),
            lo: Box::new(lo),
        }
    }

    pub fn call(target: Expr, args: Vec<Argument>) -> Expr {
        Expr::Call {
            target: Box::new(target),
            type_args: Vec::new(),
            args,
        }
    }

    pub fn construct(ty: Type, args: Vec<Argument>) -> Expr {
        Expr::Construct { ty, args }
    }
}
