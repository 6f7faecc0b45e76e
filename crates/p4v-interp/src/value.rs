//! The symbolic value universe
//!
//! Every P4 runtime entity the interpreter manipulates is a [`Value`]: scalar
//! symbolic expressions, composite instances (structs, headers, unions,
//! stacks), enum-likes, opaque extern handles, bound control/parser
//! instances, and references to declarations that are re-entered at call
//! sites.
//!
//! Three operations form the contract of every variant: deep cloning (plain
//! `Clone`; solver nodes are shared handles underneath), `merge` (the path
//! join `self := ite(cond, other, self)` applied at every leaf), and casting,
//! which lives on `ProgState` because composite casts allocate fresh
//! instances. Merging requires both sides to have the same tag and layout;
//! the one sanctioned exception is an unbounded integer meeting a bitvector,
//! which takes the bitvector's sort.

use indexmap::IndexMap;
use std::sync::Arc;
use z3::ast::{Ast, Bool, Dynamic, Int, BV};
use z3::Context;

use p4v_ir::{
    CallableDecl, ControlDecl, Direction, ExternType, InstanceDecl, MethodSig, Parameter,
    ParserDecl, PipelineType, TableDecl, Type,
};
use p4v_smt::{Scalar, INVALID_LABEL, UNDEFINED_LABEL};

use crate::error::{EvalError, EvalResult};

/// A symbolic P4 value.
#[derive(Debug, Clone)]
pub enum Value<'ctx> {
    /// Bitvector, bool, or unbounded integer
    Scalar(Scalar<'ctx>),
    Struct(StructVal<'ctx>),
    Header(HeaderVal<'ctx>),
    Union(UnionVal<'ctx>),
    Stack(StackVal<'ctx>),
    Enum(EnumVal<'ctx>),
    SerEnum(EnumVal<'ctx>),
    Error(EnumVal<'ctx>),
    Extern(ExternVal),
    Control(Box<ControlVal<'ctx>>),
    /// A deferred declaration re-entered at its use site
    Decl(StaticDecl),
    Table(Arc<TableDecl>),
    /// Unit result of a statement-yielding call
    Void,
}

/// Declaration-ordered member storage shared by all composite variants.
#[derive(Debug, Clone)]
pub struct MemberMap<'ctx> {
    /// Name stamped on generated constants (`{instance}_valid` and friends)
    pub instance: String,
    entries: IndexMap<String, (Value<'ctx>, Type)>,
}

impl<'ctx> MemberMap<'ctx> {
    pub fn new(instance: &str) -> Self {
        MemberMap {
            instance: instance.to_string(),
            entries: IndexMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, value: Value<'ctx>, ty: Type) {
        self.entries.insert(name.to_string(), (value, ty));
    }

    pub fn get(&self, name: &str) -> Option<&Value<'ctx>> {
        self.entries.get(name).map(|(v, _)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value<'ctx>> {
        self.entries.get_mut(name).map(|(v, _)| v)
    }

    pub fn member_type(&self, name: &str) -> Option<&Type> {
        self.entries.get(name).map(|(_, t)| t)
    }

    /// Rebind an existing member; the declared type is kept.
    pub fn update(&mut self, name: &str, value: Value<'ctx>) -> EvalResult<()> {
        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.0 = value;
                Ok(())
            }
            None => Err(EvalError::Internal(format!(
                "member {name} missing from {}",
                self.instance
            ))),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value<'ctx>, &Type)> {
        self.entries.iter().map(|(n, (v, t))| (n, v, t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Value<'ctx>, &Type)> {
        self.entries.iter_mut().map(|(n, (v, t))| (n, &mut *v, &*t))
    }
}

#[derive(Debug, Clone)]
pub struct StructVal<'ctx> {
    pub members: MemberMap<'ctx>,
    /// The declared type this instance was generated from
    pub ty: Type,
}

#[derive(Debug, Clone)]
pub struct HeaderVal<'ctx> {
    pub members: MemberMap<'ctx>,
    pub ty: Type,
    pub valid: Bool<'ctx>,
}

/// A header union; every member is a `Value::Header` and at most one of them
/// is valid at a time.
#[derive(Debug, Clone)]
pub struct UnionVal<'ctx> {
    pub members: MemberMap<'ctx>,
    pub ty: Type,
}

/// A header stack: members are keyed `"0".."size-1"`, `next_index` always
/// stays within `[0, size]`.
#[derive(Debug, Clone)]
pub struct StackVal<'ctx> {
    pub members: MemberMap<'ctx>,
    pub element: Type,
    pub size: u64,
    pub next_index: Int<'ctx>,
}

/// An enum, serializable enum, or the `error` namespace: a member table of
/// bitvector constants and the current value expression.
#[derive(Debug, Clone)]
pub struct EnumVal<'ctx> {
    pub ty_name: String,
    pub members: IndexMap<String, BV<'ctx>>,
    pub val: BV<'ctx>,
    pub width: u32,
    pub signed: bool,
}

/// Width of plain enums and the error namespace.
pub const ENUM_WIDTH: u32 = 32;

impl<'ctx> EnumVal<'ctx> {
    /// A plain enum/error instance with members numbered in declaration order.
    pub fn new(ctx: &'ctx Context, ty_name: &str, member_names: &[String]) -> Self {
        let mut members = IndexMap::new();
        for (idx, name) in member_names.iter().enumerate() {
            members.insert(name.clone(), BV::from_u64(ctx, idx as u64, ENUM_WIDTH));
        }
        EnumVal {
            ty_name: ty_name.to_string(),
            members,
            val: BV::fresh_const(ctx, UNDEFINED_LABEL, ENUM_WIDTH),
            width: ENUM_WIDTH,
            signed: false,
        }
    }

    /// Union a new member into an existing namespace (the `error` case).
    pub fn add_member(&mut self, ctx: &'ctx Context, name: &str) {
        if !self.members.contains_key(name) {
            let idx = self.members.len() as u64;
            self.members
                .insert(name.to_string(), BV::from_u64(ctx, idx, self.width));
        }
    }

    pub fn member(&self, name: &str) -> EvalResult<Scalar<'ctx>> {
        match self.members.get(name) {
            Some(bv) => Ok(Scalar::bv(bv.clone(), self.signed)),
            None => Err(EvalError::Program(format!(
                "{} has no member {name}",
                self.ty_name
            ))),
        }
    }
}

/// Opaque extern instance; methods are dispatched by name and argument count.
#[derive(Debug, Clone)]
pub struct ExternVal {
    pub ty: Arc<ExternType>,
}

impl ExternVal {
    pub fn resolve_method(&self, name: &str, arity: usize) -> EvalResult<&MethodSig> {
        self.ty
            .methods
            .iter()
            .find(|m| {
                let required = m.params.iter().filter(|p| !p.is_omittable()).count();
                m.name == name && required <= arity && arity <= m.params.len()
            })
            .ok_or_else(|| EvalError::NoOverload {
                name: format!("{}.{}", self.ty.name, name),
                arity,
            })
    }
}

/// A control or parser bound with its constructor arguments and the type
/// bindings solved at instantiation time.
#[derive(Debug, Clone)]
pub struct ControlVal<'ctx> {
    pub decl: PipelineRef,
    pub const_args: IndexMap<String, (Value<'ctx>, Type)>,
    pub type_bindings: IndexMap<String, Type>,
}

#[derive(Debug, Clone)]
pub enum PipelineRef {
    Parser(Arc<ParserDecl>),
    Control(Arc<ControlDecl>),
}

impl PipelineRef {
    pub fn name(&self) -> &str {
        match self {
            PipelineRef::Parser(p) => &p.name,
            PipelineRef::Control(c) => &c.name,
        }
    }

    pub fn params(&self) -> &[Parameter] {
        match self {
            PipelineRef::Parser(p) => &p.params,
            PipelineRef::Control(c) => &c.params,
        }
    }

    pub fn constructor_params(&self) -> &[Parameter] {
        match self {
            PipelineRef::Parser(p) => &p.constructor_params,
            PipelineRef::Control(c) => &c.constructor_params,
        }
    }

    pub fn type_params(&self) -> &[String] {
        match self {
            PipelineRef::Parser(p) => &p.type_params,
            PipelineRef::Control(c) => &c.type_params,
        }
    }

    /// The signature of this declaration as a type, used when a pipeline
    /// instance flows into a generic parameter.
    pub fn signature(&self) -> Type {
        match self {
            PipelineRef::Parser(p) => Type::ParserType(Arc::new(PipelineType {
                name: p.name.clone(),
                type_params: p.type_params.clone(),
                params: p.params.clone(),
            })),
            PipelineRef::Control(c) => Type::ControlType(Arc::new(PipelineType {
                name: c.name.clone(),
                type_params: c.type_params.clone(),
                params: c.params.clone(),
            })),
        }
    }
}

/// A declaration stored in a scope's static-declaration table.
#[derive(Debug, Clone)]
pub enum StaticDecl {
    /// Actions, functions, and extern functions sharing one name
    Callables(OverloadSet),
    /// `main` or another package-typed instance, deferred until dispatch
    Instance(Arc<InstanceDecl>),
    Table(Arc<TableDecl>),
}

/// All callables declared under one name; resolution picks the candidate
/// whose parameter list accepts the call-site argument count.
#[derive(Debug, Clone)]
pub struct OverloadSet {
    pub name: String,
    pub candidates: Vec<Callable>,
}

impl OverloadSet {
    pub fn single(name: &str, callable: Callable) -> Self {
        OverloadSet {
            name: name.to_string(),
            candidates: vec![callable],
        }
    }

    pub fn resolve(&self, arity: usize) -> EvalResult<&Callable> {
        self.candidates
            .iter()
            .find(|c| c.required_arity() <= arity && arity <= c.params().len())
            .ok_or_else(|| EvalError::NoOverload {
                name: self.name.clone(),
                arity,
            })
    }
}

#[derive(Debug, Clone)]
pub enum Callable {
    Action(Arc<CallableDecl>),
    Function(Arc<CallableDecl>),
    /// An extern function; has no body and havocs its outputs
    Method(Arc<MethodSig>),
}

impl Callable {
    pub fn name(&self) -> &str {
        match self {
            Callable::Action(d) | Callable::Function(d) => &d.name,
            Callable::Method(m) => &m.name,
        }
    }

    pub fn params(&self) -> &[Parameter] {
        match self {
            Callable::Action(d) | Callable::Function(d) => &d.params,
            Callable::Method(m) => &m.params,
        }
    }

    pub fn return_type(&self) -> &Type {
        match self {
            Callable::Action(d) | Callable::Function(d) => &d.return_type,
            Callable::Method(m) => &m.return_type,
        }
    }

    /// Arguments the call site must supply. Directionless action parameters
    /// are control-plane values the call site may omit.
    pub fn required_arity(&self) -> usize {
        match self {
            Callable::Action(d) => d
                .params
                .iter()
                .filter(|p| p.direction != Direction::None && !p.is_omittable())
                .count(),
            Callable::Function(d) => d.params.iter().filter(|p| !p.is_omittable()).count(),
            Callable::Method(m) => m.params.iter().filter(|p| !p.is_omittable()).count(),
        }
    }
}

impl<'ctx> Value<'ctx> {
    /// Short tag name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Scalar(Scalar::Bv { .. }) => "bitvector",
            Value::Scalar(Scalar::Bool(_)) => "bool",
            Value::Scalar(Scalar::Int(_)) => "int",
            Value::Struct(_) => "struct",
            Value::Header(_) => "header",
            Value::Union(_) => "header_union",
            Value::Stack(_) => "header stack",
            Value::Enum(_) => "enum",
            Value::SerEnum(_) => "serializable enum",
            Value::Error(_) => "error",
            Value::Extern(_) => "extern",
            Value::Control(_) => "control instance",
            Value::Decl(_) => "declaration",
            Value::Table(_) => "table",
            Value::Void => "void",
        }
    }

    /// The runtime P4 type of this value, used to solve generic parameters.
    pub fn p4_type(&self) -> Type {
        match self {
            Value::Scalar(Scalar::Bv { expr, signed }) => Type::Bits {
                width: expr.get_size(),
                signed: *signed,
            },
            Value::Scalar(Scalar::Bool(_)) => Type::Bool,
            Value::Scalar(Scalar::Int(_)) => Type::Int,
            Value::Struct(s) => s.ty.clone(),
            Value::Header(h) => h.ty.clone(),
            Value::Union(u) => u.ty.clone(),
            Value::Stack(s) => Type::Stack {
                element: Box::new(s.element.clone()),
                size: s.size as u32,
            },
            Value::Enum(e) | Value::SerEnum(e) | Value::Error(e) => Type::Name(e.ty_name.clone()),
            Value::Extern(e) => Type::Extern(e.ty.clone()),
            Value::Control(c) => c.decl.signature(),
            Value::Decl(_) | Value::Table(_) | Value::Void => Type::Void,
        }
    }

    pub fn as_scalar(&self) -> EvalResult<&Scalar<'ctx>> {
        match self {
            Value::Scalar(s) => Ok(s),
            other => Err(EvalError::Internal(format!(
                "expected a scalar, got {}",
                other.type_name()
            ))),
        }
    }

    /// Read a member. Headers hand out the stored field unchanged; validity
    /// gating happens when the state is flattened. Stacks expose the computed
    /// members `size`, `nextIndex`, and `lastIndex`.
    pub fn get_member(&self, name: &str, ctx: &'ctx Context) -> EvalResult<Value<'ctx>> {
        match self {
            Value::Struct(s) => member_or_err(&s.members, name),
            Value::Header(h) => member_or_err(&h.members, name),
            Value::Union(u) => member_or_err(&u.members, name),
            Value::Stack(s) => match name {
                "size" => Ok(Value::Scalar(Scalar::Int(Int::from_u64(ctx, s.size)))),
                "nextIndex" | "lastIndex" => {
                    Ok(Value::Scalar(Scalar::Int(s.next_index.clone())))
                }
                _ => member_or_err(&s.members, name),
            },
            Value::Enum(e) | Value::SerEnum(e) | Value::Error(e) => {
                Ok(Value::Scalar(e.member(name)?))
            }
            other => Err(EvalError::Unsupported(format!(
                "member access on {}",
                other.type_name()
            ))),
        }
    }

    pub fn member_mut(&mut self, name: &str) -> EvalResult<&mut Value<'ctx>> {
        let members = self.members_mut()?;
        let instance = members.instance.clone();
        members
            .get_mut(name)
            .ok_or_else(|| EvalError::Internal(format!("member {name} missing from {instance}")))
    }

    pub fn member_type(&self, name: &str) -> EvalResult<Type> {
        let members = self.members()?;
        members
            .member_type(name)
            .cloned()
            .ok_or_else(|| EvalError::Internal(format!("member {name} has no declared type")))
    }

    pub fn members(&self) -> EvalResult<&MemberMap<'ctx>> {
        match self {
            Value::Struct(s) => Ok(&s.members),
            Value::Header(h) => Ok(&h.members),
            Value::Union(u) => Ok(&u.members),
            Value::Stack(s) => Ok(&s.members),
            other => Err(EvalError::Internal(format!(
                "{} has no members",
                other.type_name()
            ))),
        }
    }

    pub fn members_mut(&mut self) -> EvalResult<&mut MemberMap<'ctx>> {
        match self {
            Value::Struct(s) => Ok(&mut s.members),
            Value::Header(h) => Ok(&mut h.members),
            Value::Union(u) => Ok(&mut u.members),
            Value::Stack(s) => Ok(&mut s.members),
            other => Err(EvalError::Internal(format!(
                "{} has no members",
                other.type_name()
            ))),
        }
    }

    /****** merge ******/

    /// In-place path join under `cond`: keeps `self` where `cond` is false.
    /// Both sides must have the same tag and layout; scalars follow the
    /// algebra's InfInt/bitvector coercion rules.
    pub fn merge(&mut self, cond: &Bool<'ctx>, other: &Value<'ctx>) -> EvalResult<()> {
        match (&mut *self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(a.merge(cond, b)?),
            (Value::Struct(a), Value::Struct(b)) => merge_members(&mut a.members, &b.members, cond),
            (Value::Header(a), Value::Header(b)) => {
                merge_members(&mut a.members, &b.members, cond)?;
                a.valid = cond.ite(&b.valid, &a.valid);
                Ok(())
            }
            (Value::Union(a), Value::Union(b)) => merge_members(&mut a.members, &b.members, cond),
            (Value::Stack(a), Value::Stack(b)) => {
                merge_members(&mut a.members, &b.members, cond)?;
                a.next_index = cond.ite(&b.next_index, &a.next_index);
                Ok(())
            }
            (Value::Enum(a), Value::Enum(b))
            | (Value::SerEnum(a), Value::SerEnum(b))
            | (Value::Error(a), Value::Error(b)) => {
                if a.width != b.width {
                    return Err(EvalError::Internal(format!(
                        "enum width mismatch in merge: {} vs {}",
                        a.width, b.width
                    )));
                }
                a.val = cond.ite(&b.val, &a.val);
                Ok(())
            }
            // Instances and references are not data; a same-tag merge is a no-op.
            (Value::Extern(_), Value::Extern(_))
            | (Value::Control(_), Value::Control(_))
            | (Value::Decl(_), Value::Decl(_))
            | (Value::Table(_), Value::Table(_))
            | (Value::Void, Value::Void) => Ok(()),
            (a, b) => Err(EvalError::Internal(format!(
                "cannot merge {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /****** symbolic equality ******/

    /// Structural equality as a solver expression. Headers are equal when
    /// both are invalid or both are valid with equal fields; enum-likes
    /// compare their value expressions after width alignment.
    pub fn eq_expr(&self, other: &Value<'ctx>, ctx: &'ctx Context) -> EvalResult<Bool<'ctx>> {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => Ok(a.eq_expr(b)?),
            (Value::Scalar(a), Value::Enum(e))
            | (Value::Scalar(a), Value::SerEnum(e))
            | (Value::Scalar(a), Value::Error(e)) => {
                Scalar::bv(e.val.clone(), e.signed).eq_expr(a).map_err(Into::into)
            }
            (Value::Enum(e), Value::Scalar(b))
            | (Value::SerEnum(e), Value::Scalar(b))
            | (Value::Error(e), Value::Scalar(b)) => {
                Scalar::bv(e.val.clone(), e.signed).eq_expr(b).map_err(Into::into)
            }
            (Value::Enum(a), Value::Enum(b))
            | (Value::SerEnum(a), Value::SerEnum(b))
            | (Value::Error(a), Value::Error(b)) => Ok(a.val._eq(&b.val)),
            (Value::Header(a), Value::Header(b)) => {
                let fields_eq = members_eq(&a.members, &b.members, ctx)?;
                let both_invalid = Bool::or(ctx, &[&a.valid, &b.valid]).not();
                let both_valid_and_eq = Bool::and(ctx, &[&fields_eq, &a.valid, &b.valid]);
                Ok(Bool::or(ctx, &[&both_invalid, &both_valid_and_eq]))
            }
            (Value::Struct(a), Value::Struct(b)) => members_eq(&a.members, &b.members, ctx),
            (Value::Union(a), Value::Union(b)) => members_eq(&a.members, &b.members, ctx),
            (Value::Stack(a), Value::Stack(b)) => members_eq(&a.members, &b.members, ctx),
            // A list literal compares positionally against any struct-like.
            (Value::Struct(a), _) if other.members().is_ok() => {
                members_eq_positional(&a.members, other.members()?, ctx)
            }
            (_, Value::Struct(b)) if self.members().is_ok() => {
                members_eq_positional(self.members()?, &b.members, ctx)
            }
            (a, b) => Err(EvalError::Unsupported(format!(
                "comparing {} with {}",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /****** havoc ******/

    /// Replace every scalar leaf with a fresh unconstrained constant.
    pub fn set_undefined(&mut self, ctx: &'ctx Context) {
        match self {
            Value::Scalar(s) => *s = s.havoc(UNDEFINED_LABEL),
            Value::Struct(s) => havoc_members(&mut s.members, ctx),
            Value::Header(h) => havoc_members(&mut h.members, ctx),
            Value::Union(u) => havoc_members(&mut u.members, ctx),
            Value::Stack(s) => havoc_members(&mut s.members, ctx),
            Value::Enum(e) | Value::SerEnum(e) | Value::Error(e) => {
                e.val = BV::fresh_const(ctx, UNDEFINED_LABEL, e.width);
            }
            _ => {}
        }
    }

    /****** header validity ******/

    /// The validity expression: a header's `valid`, a union's disjunction of
    /// member validity.
    pub fn is_valid(&self, ctx: &'ctx Context) -> EvalResult<Bool<'ctx>> {
        match self {
            Value::Header(h) => Ok(h.valid.clone()),
            Value::Union(u) => {
                let mut valid = Bool::from_bool(ctx, false);
                for (_, member, _) in u.members.iter() {
                    if let Value::Header(h) = member {
                        valid = Bool::or(ctx, &[&valid, &h.valid]);
                    }
                }
                Ok(valid)
            }
            other => Err(EvalError::Unsupported(format!(
                "isValid on {}",
                other.type_name()
            ))),
        }
    }

    pub fn header_set_valid(&mut self, ctx: &'ctx Context) -> EvalResult<()> {
        match self {
            Value::Header(_) => {
                let valid = Bool::from_bool(ctx, true);
                self.propagate_validity(Some(&valid), ctx);
                Ok(())
            }
            other => Err(EvalError::Unsupported(format!(
                "setValid on {}",
                other.type_name()
            ))),
        }
    }

    /// Invalidating a header also havocs its fields: nothing can be read
    /// back from an invalid header.
    pub fn header_set_invalid(&mut self, ctx: &'ctx Context) -> EvalResult<()> {
        match self {
            Value::Header(_) => {
                let valid = Bool::from_bool(ctx, false);
                self.propagate_validity(Some(&valid), ctx);
                self.set_undefined(ctx);
                Ok(())
            }
            other => Err(EvalError::Unsupported(format!(
                "setInvalid on {}",
                other.type_name()
            ))),
        }
    }

    /// Set validity through nested headers. With no expression given, each
    /// header gets a fresh boolean named after its instance and passes it
    /// down, so nested validity tracks the outer header symbolically.
    pub fn propagate_validity(&mut self, valid: Option<&Bool<'ctx>>, ctx: &'ctx Context) {
        match self {
            Value::Header(h) => {
                let own = match valid {
                    Some(v) => v.clone(),
                    None => Bool::new_const(ctx, format!("{}_valid", h.members.instance)),
                };
                h.valid = own.clone();
                for (_, member, _) in h.members.iter_mut() {
                    member.propagate_validity(Some(&own), ctx);
                }
            }
            Value::Struct(s) => {
                for (_, member, _) in s.members.iter_mut() {
                    member.propagate_validity(valid, ctx);
                }
            }
            Value::Union(u) => {
                for (_, member, _) in u.members.iter_mut() {
                    member.propagate_validity(valid, ctx);
                }
            }
            Value::Stack(s) => {
                for (_, member, _) in s.members.iter_mut() {
                    member.propagate_validity(valid, ctx);
                }
            }
            _ => {}
        }
    }

    /****** input binding ******/

    /// Rename every scalar leaf to a named input constant `{prefix}{id}`,
    /// advancing `id` by the leaf width. Used when a pipeline parameter
    /// becomes symbolic input.
    pub fn bind(&mut self, prefix: &str, id: &mut u64, ctx: &'ctx Context) {
        match self {
            Value::Scalar(s) => {
                let name = format!("{prefix}{id}");
                match s {
                    Scalar::Bv { expr, signed } => {
                        let width = expr.get_size();
                        let signed = *signed;
                        *s = Scalar::bv(BV::new_const(ctx, name, width), signed);
                        *id += u64::from(width);
                    }
                    Scalar::Bool(_) => {
                        *s = Scalar::Bool(Bool::new_const(ctx, name));
                        *id += 1;
                    }
                    Scalar::Int(_) => {
                        *s = Scalar::Int(Int::new_const(ctx, name));
                        *id += 1;
                    }
                }
            }
            Value::Enum(e) | Value::SerEnum(e) | Value::Error(e) => {
                e.val = BV::new_const(ctx, format!("{prefix}{id}"), e.width);
                *id += u64::from(e.width);
            }
            Value::Struct(s) => bind_members(&mut s.members, prefix, id, ctx),
            Value::Header(h) => bind_members(&mut h.members, prefix, id, ctx),
            Value::Union(u) => bind_members(&mut u.members, prefix, id, ctx),
            Value::Stack(s) => bind_members(&mut s.members, prefix, id, ctx),
            _ => {}
        }
    }

    /****** flattening ******/

    /// Flatten to `(dotted.path, expression)` leaves for the consumer tools.
    /// Header leaves read as `ite(valid, stored, havoc)`; an enclosing
    /// validity expression overrides the header's own. Unbounded-integer
    /// leaves are narrowed to their declared member width first.
    pub fn flatten(
        &self,
        prefix: &str,
        declared: &Type,
        valid: Option<&Bool<'ctx>>,
        ctx: &'ctx Context,
    ) -> EvalResult<Vec<(String, Dynamic<'ctx>)>> {
        let mut leaves = Vec::new();
        match self {
            Value::Scalar(scalar) => {
                let expr = match scalar {
                    Scalar::Int(_) => match declared {
                        Type::Bits { width, .. } | Type::Varbits { width } => {
                            Dynamic::from_ast(&p4v_smt::align_to_width(scalar, *width)?)
                        }
                        other => {
                            return Err(EvalError::Internal(format!(
                                "unbounded integer leaf declared as {}",
                                other.describe()
                            )))
                        }
                    },
                    other => other.as_dynamic(),
                };
                leaves.push((prefix.to_string(), gate_leaf(&expr, valid, ctx)));
            }
            Value::Enum(e) | Value::SerEnum(e) | Value::Error(e) => {
                let expr = Dynamic::from_ast(&e.val);
                leaves.push((prefix.to_string(), gate_leaf(&expr, valid, ctx)));
            }
            Value::Struct(s) => {
                flatten_members(&s.members, prefix, valid, ctx, &mut leaves)?;
            }
            Value::Header(h) => {
                let own = valid.unwrap_or(&h.valid).clone();
                flatten_members(&h.members, prefix, Some(&own), ctx, &mut leaves)?;
            }
            Value::Union(u) => {
                let own = match valid {
                    Some(v) => v.clone(),
                    None => self.is_valid(ctx)?,
                };
                flatten_members(&u.members, prefix, Some(&own), ctx, &mut leaves)?;
            }
            Value::Stack(s) => {
                flatten_members(&s.members, prefix, valid, ctx, &mut leaves)?;
            }
            // Instances and references carry no symbolic state.
            _ => {}
        }
        Ok(leaves)
    }
}

fn member_or_err<'ctx>(members: &MemberMap<'ctx>, name: &str) -> EvalResult<Value<'ctx>> {
    members.get(name).cloned().ok_or_else(|| {
        EvalError::Program(format!("{} has no member {name}", members.instance))
    })
}

fn merge_members<'ctx>(
    target: &mut MemberMap<'ctx>,
    other: &MemberMap<'ctx>,
    cond: &Bool<'ctx>,
) -> EvalResult<()> {
    for (name, value, _) in target.iter_mut() {
        let peer = other.get(name).ok_or_else(|| {
            EvalError::Internal(format!("merge peer missing member {name}"))
        })?;
        value.merge(cond, peer)?;
    }
    Ok(())
}

fn members_eq<'ctx>(
    a: &MemberMap<'ctx>,
    b: &MemberMap<'ctx>,
    ctx: &'ctx Context,
) -> EvalResult<Bool<'ctx>> {
    let mut eq = Bool::from_bool(ctx, true);
    for (name, value, _) in a.iter() {
        let peer = b
            .get(name)
            .ok_or_else(|| EvalError::Program(format!("comparison peer lacks member {name}")))?;
        let member_eq = value.eq_expr(peer, ctx)?;
        eq = Bool::and(ctx, &[&eq, &member_eq]);
    }
    Ok(eq)
}

/// Positional comparison used when a list literal meets a struct-like.
fn members_eq_positional<'ctx>(
    a: &MemberMap<'ctx>,
    b: &MemberMap<'ctx>,
    ctx: &'ctx Context,
) -> EvalResult<Bool<'ctx>> {
    if a.len() != b.len() {
        return Ok(Bool::from_bool(ctx, false));
    }
    let mut eq = Bool::from_bool(ctx, true);
    for ((_, va, _), (_, vb, _)) in a.iter().zip(b.iter()) {
        let member_eq = va.eq_expr(vb, ctx)?;
        eq = Bool::and(ctx, &[&eq, &member_eq]);
    }
    Ok(eq)
}

fn havoc_members<'ctx>(members: &mut MemberMap<'ctx>, ctx: &'ctx Context) {
    for (_, value, _) in members.iter_mut() {
        value.set_undefined(ctx);
    }
}

fn bind_members<'ctx>(
    members: &mut MemberMap<'ctx>,
    prefix: &str,
    id: &mut u64,
    ctx: &'ctx Context,
) {
    members.instance = format!("{prefix}{id}");
    for (_, value, _) in members.iter_mut() {
        value.bind(prefix, id, ctx);
    }
}

fn flatten_members<'ctx>(
    members: &MemberMap<'ctx>,
    prefix: &str,
    valid: Option<&Bool<'ctx>>,
    ctx: &'ctx Context,
    leaves: &mut Vec<(String, Dynamic<'ctx>)>,
) -> EvalResult<()> {
    for (name, value, ty) in members.iter() {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        leaves.extend(value.flatten(&path, ty, valid, ctx)?);
    }
    Ok(())
}

/// Wrap a leaf in its validity gate: `ite(valid, stored, havoc)` with a fresh
/// havoc constant of the leaf's sort.
fn gate_leaf<'ctx>(
    expr: &Dynamic<'ctx>,
    valid: Option<&Bool<'ctx>>,
    ctx: &'ctx Context,
) -> Dynamic<'ctx> {
    match valid {
        None => expr.clone(),
        Some(v) => {
            if let Some(bv) = expr.as_bv() {
                let havoc = BV::fresh_const(ctx, INVALID_LABEL, bv.get_size());
                Dynamic::from_ast(&v.ite(&bv, &havoc))
            } else if let Some(b) = expr.as_bool() {
                let havoc = Bool::fresh_const(ctx, INVALID_LABEL);
                Dynamic::from_ast(&v.ite(&b, &havoc))
            } else if let Some(i) = expr.as_int() {
                let havoc = Int::fresh_const(ctx, INVALID_LABEL);
                Dynamic::from_ast(&v.ite(&i, &havoc))
            } else {
                expr.clone()
            }
        }
    }
}

impl<'ctx> StackVal<'ctx> {
    /// Invalidate the first `count` slots and advance `next_index`, clamped
    /// to the stack size.
    pub fn push_front(&mut self, count: u64, ctx: &'ctx Context) -> EvalResult<()> {
        for idx in 0..count.min(self.size) {
            let name = idx.to_string();
            if let Some(slot) = self.members.get_mut(&name) {
                slot.header_set_invalid(ctx)?;
            }
        }
        let size = Int::from_u64(ctx, self.size);
        let bumped = Int::add(ctx, &[&self.next_index, &Int::from_u64(ctx, count)]);
        self.next_index = bumped.gt(&size).ite(&size, &bumped).simplify();
        Ok(())
    }

    /// Invalidate the last `count` slots and retreat `next_index`, clamped
    /// to zero.
    pub fn pop_front(&mut self, count: u64, ctx: &'ctx Context) -> EvalResult<()> {
        let first = self.size.saturating_sub(count);
        for idx in first..self.size {
            let name = idx.to_string();
            if let Some(slot) = self.members.get_mut(&name) {
                slot.header_set_invalid(ctx)?;
            }
        }
        let zero = Int::from_u64(ctx, 0);
        let lowered = Int::sub(ctx, &[&self.next_index, &Int::from_u64(ctx, count)]);
        self.next_index = lowered.lt(&zero).ite(&zero, &lowered).simplify();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::{Config, SatResult, Solver};

    fn assert_valid(ctx: &Context, expr: &Bool) {
        let solver = Solver::new(ctx);
        solver.assert(&expr.not());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    fn bv_value(ctx: &Context, value: u64, width: u32) -> Value<'_> {
        Value::Scalar(Scalar::unsigned(BV::from_u64(ctx, value, width)))
    }

    fn sample_header(ctx: &Context) -> Value<'_> {
        let mut members = MemberMap::new("h");
        members.insert("a", bv_value(ctx, 0xAA, 8), Type::bits(8));
        Value::Header(HeaderVal {
            members,
            ty: Type::Name("H".to_string()),
            valid: Bool::from_bool(ctx, false),
        })
    }

    #[test]
    fn merge_true_replaces_merge_false_keeps() {
        let ctx = Context::new(&Config::new());
        let mut a = bv_value(&ctx, 1, 8);
        let b = bv_value(&ctx, 2, 8);

        let mut replaced = a.clone();
        replaced.merge(&Bool::from_bool(&ctx, true), &b).unwrap();
        let expr = replaced.as_scalar().unwrap().eq_expr(b.as_scalar().unwrap()).unwrap();
        assert_valid(&ctx, &expr);

        a.merge(&Bool::from_bool(&ctx, false), &b).unwrap();
        let expr = a
            .as_scalar()
            .unwrap()
            .eq_expr(&Scalar::unsigned(BV::from_u64(&ctx, 1, 8)))
            .unwrap();
        assert_valid(&ctx, &expr);
    }

    #[test]
    fn struct_merge_is_field_wise() {
        let ctx = Context::new(&Config::new());
        let mut members_a = MemberMap::new("s");
        members_a.insert("x", bv_value(&ctx, 1, 8), Type::bits(8));
        let mut members_b = MemberMap::new("s");
        members_b.insert("x", bv_value(&ctx, 2, 8), Type::bits(8));
        let mut a = Value::Struct(StructVal {
            members: members_a,
            ty: Type::Name("S".to_string()),
        });
        let b = Value::Struct(StructVal {
            members: members_b,
            ty: Type::Name("S".to_string()),
        });

        let cond = Bool::new_const(&ctx, "c");
        a.merge(&cond, &b).unwrap();
        let x = a.get_member("x", &ctx).unwrap();
        let expected = cond.ite(&BV::from_u64(&ctx, 2, 8), &BV::from_u64(&ctx, 1, 8));
        let expr = x
            .as_scalar()
            .unwrap()
            .eq_expr(&Scalar::unsigned(expected))
            .unwrap();
        assert_valid(&ctx, &expr);
    }

    #[test]
    fn merge_rejects_tag_mismatch() {
        let ctx = Context::new(&Config::new());
        let mut a = sample_header(&ctx);
        let b = bv_value(&ctx, 1, 8);
        assert!(a.merge(&Bool::from_bool(&ctx, true), &b).is_err());
    }

    #[test]
    fn invalid_header_flattens_to_havoc() {
        let ctx = Context::new(&Config::new());
        let mut header = sample_header(&ctx);
        header.header_set_valid(&ctx).unwrap();
        header.header_set_invalid(&ctx).unwrap();

        let leaves = header
            .flatten("h", &Type::Name("H".to_string()), None, &ctx)
            .unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, "h.a");

        // Nothing forces the leaf to its old contents: h.a == 0xAA must be
        // falsifiable.
        let leaf = leaves[0].1.as_bv().unwrap();
        let solver = Solver::new(&ctx);
        solver.assert(&leaf._eq(&BV::from_u64(&ctx, 0xAA, 8)).not());
        assert_eq!(solver.check(), SatResult::Sat);
    }

    #[test]
    fn valid_header_flattens_to_contents() {
        let ctx = Context::new(&Config::new());
        let mut header = sample_header(&ctx);
        header.header_set_valid(&ctx).unwrap();
        header
            .members_mut()
            .unwrap()
            .update("a", bv_value(&ctx, 0x42, 8))
            .unwrap();

        let leaves = header
            .flatten("h", &Type::Name("H".to_string()), None, &ctx)
            .unwrap();
        let leaf = leaves[0].1.as_bv().unwrap();
        assert_valid(&ctx, &leaf._eq(&BV::from_u64(&ctx, 0x42, 8)));
    }

    #[test]
    fn header_equality_tracks_validity() {
        let ctx = Context::new(&Config::new());
        let mut a = sample_header(&ctx);
        let mut b = sample_header(&ctx);
        // Both invalid: equal regardless of contents.
        let eq = a.eq_expr(&b, &ctx).unwrap();
        assert_valid(&ctx, &eq);
        // One valid, one invalid: not equal.
        a.header_set_valid(&ctx).unwrap();
        b.header_set_invalid(&ctx).unwrap();
        let eq = a.eq_expr(&b, &ctx).unwrap();
        assert_valid(&ctx, &eq.not());
    }

    #[test]
    fn error_namespace_union_keeps_existing_members() {
        let ctx = Context::new(&Config::new());
        let mut errors = EnumVal::new(
            &ctx,
            "error",
            &["NoError".to_string(), "PacketTooShort".to_string()],
        );
        errors.add_member(&ctx, "BadChecksum");
        errors.add_member(&ctx, "NoError");
        assert_eq!(errors.members.len(), 3);
        let no_error = errors.member("NoError").unwrap();
        let expr = no_error
            .eq_expr(&Scalar::unsigned(BV::from_u64(&ctx, 0, ENUM_WIDTH)))
            .unwrap();
        assert_valid(&ctx, &expr);
    }

    #[test]
    fn push_front_clamps_next_index_to_size() {
        let ctx = Context::new(&Config::new());
        let mut members = MemberMap::new("stk");
        for idx in 0..2u64 {
            members.insert(&idx.to_string(), sample_header(&ctx), Type::Name("H".into()));
        }
        let mut stack = StackVal {
            members,
            element: Type::Name("H".to_string()),
            size: 2,
            next_index: Int::from_u64(&ctx, 0),
        };
        stack.push_front(5, &ctx).unwrap();
        let clamped = stack.next_index._eq(&Int::from_u64(&ctx, 2));
        assert_valid(&ctx, &clamped);
        stack.pop_front(5, &ctx).unwrap();
        let floored = stack.next_index._eq(&Int::from_u64(&ctx, 0));
        assert_valid(&ctx, &floored);
    }

    #[test]
    fn overload_resolution_by_argument_count() {
        let decl = |nparams: usize| {
            Arc::new(CallableDecl {
                name: "f".to_string(),
                return_type: Type::Void,
                params: (0..nparams)
                    .map(|i| Parameter::new(&format!("p{i}"), Direction::In, Type::bits(8)))
                    .collect(),
                body: p4v_ir::BlockStatement::new(vec![]),
            })
        };
        let set = OverloadSet {
            name: "f".to_string(),
            candidates: vec![
                Callable::Function(decl(1)),
                Callable::Function(decl(3)),
            ],
        };
        assert_eq!(set.resolve(1).unwrap().params().len(), 1);
        assert_eq!(set.resolve(3).unwrap().params().len(), 3);
        assert!(matches!(
            set.resolve(2),
            Err(EvalError::NoOverload { arity: 2, .. })
        ));
    }

    #[test]
    fn optional_parameters_widen_the_accepted_arity() {
        let mut optional = Parameter::new("opt", Direction::In, Type::bits(8));
        optional.is_optional = true;
        let decl = Arc::new(CallableDecl {
            name: "g".to_string(),
            return_type: Type::Void,
            params: vec![
                Parameter::new("a", Direction::In, Type::bits(8)),
                optional,
            ],
            body: p4v_ir::BlockStatement::new(vec![]),
        });
        let set = OverloadSet::single("g", Callable::Function(decl));
        assert!(set.resolve(1).is_ok());
        assert!(set.resolve(2).is_ok());
        assert!(set.resolve(0).is_err());
    }
}
