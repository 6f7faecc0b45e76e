//! Scoped program state
//!
//! One [`ProgState`] exists per interpretation: an ordered stack of scopes
//! plus a distinguished main scope that is always searched last. Lookup walks
//! from the top of the stack down; enumeration follows declaration order, so
//! two runs over the same program produce identical expressions.
//!
//! Branch execution snapshots the whole stack (`fork_state`), runs one side
//! on the clone, and joins the two stacks value by value under the branch
//! condition (`merge_state`).

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::warn;
use z3::ast::{Ast, Bool, Int, BV};
use z3::Context;

use p4v_ir::{EnumType, Type};
use p4v_smt::{Scalar, UNDEFINED_LABEL};

use crate::error::{EvalError, EvalResult};
use crate::value::{
    EnumVal, ExternVal, HeaderVal, MemberMap, StackVal, StaticDecl, StructVal, UnionVal, Value,
};

/// Members of the prebuilt `error` namespace every program starts with.
const CORE_ERRORS: &[&str] = &[
    "NoError",
    "PacketTooShort",
    "NoMatch",
    "StackOutOfBounds",
    "HeaderTooShort",
    "ParserTimeout",
    "ParserInvalidArgument",
];

/// One lexical scope: typed variables, type aliases, static declarations.
#[derive(Debug, Clone, Default)]
pub struct Scope<'ctx> {
    vars: IndexMap<String, (Value<'ctx>, Type)>,
    types: IndexMap<String, Type>,
    decls: IndexMap<String, StaticDecl>,
}

impl<'ctx> Scope<'ctx> {
    pub fn new() -> Self {
        Scope {
            vars: IndexMap::new(),
            types: IndexMap::new(),
            decls: IndexMap::new(),
        }
    }

    pub fn var(&self, name: &str) -> Option<&(Value<'ctx>, Type)> {
        self.vars.get(name)
    }

    pub fn var_mut(&mut self, name: &str) -> Option<&mut (Value<'ctx>, Type)> {
        self.vars.get_mut(name)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&String, &(Value<'ctx>, Type))> {
        self.vars.iter()
    }

    pub fn vars_mut(&mut self) -> impl Iterator<Item = (&String, &mut (Value<'ctx>, Type))> {
        self.vars.iter_mut()
    }
}

/// Where a variable binding lives, for take/restore round trips.
#[derive(Debug, Clone, Copy)]
pub enum VarHandle {
    Stack(usize),
    Main,
}

/// The interpreter's scoped state.
pub struct ProgState<'ctx> {
    ctx: &'ctx Context,
    scopes: Vec<Scope<'ctx>>,
    main_scope: Scope<'ctx>,
}

impl<'ctx> ProgState<'ctx> {
    /// A fresh state seeded with the core-library `error` namespace.
    pub fn new(ctx: &'ctx Context) -> Self {
        let mut state = ProgState {
            ctx,
            scopes: Vec::new(),
            main_scope: Scope::new(),
        };
        let members: Vec<String> = CORE_ERRORS.iter().map(|s| s.to_string()).collect();
        let error_type = Type::Error(Arc::new(EnumType {
            name: "error".to_string(),
            members: members.clone(),
        }));
        state.main_scope.types.insert("error".to_string(), error_type.clone());
        state.main_scope.vars.insert(
            "error".to_string(),
            (Value::Error(EnumVal::new(ctx, "error", &members)), error_type),
        );
        state
    }

    pub fn ctx(&self) -> &'ctx Context {
        self.ctx
    }

    /****** scope stack ******/

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    pub fn pop_scope(&mut self) {
        debug_assert!(!self.scopes.is_empty(), "pop on empty scope stack");
        self.scopes.pop();
    }

    fn current_scope_mut(&mut self) -> &mut Scope<'ctx> {
        match self.scopes.last_mut() {
            Some(scope) => scope,
            None => &mut self.main_scope,
        }
    }

    /****** variables ******/

    /// Declare into the current scope; re-declaration there is an error.
    pub fn declare_var(&mut self, name: &str, value: Value<'ctx>, ty: Type) -> EvalResult<()> {
        let scope = self.current_scope_mut();
        if scope.vars.contains_key(name) {
            return Err(EvalError::Redeclared(name.to_string()));
        }
        scope.vars.insert(name.to_string(), (value, ty));
        Ok(())
    }

    pub fn get_var(&self, name: &str) -> EvalResult<&Value<'ctx>> {
        for scope in self.scopes.iter().rev() {
            if let Some((value, _)) = scope.var(name) {
                return Ok(value);
            }
        }
        self.main_scope
            .var(name)
            .map(|(value, _)| value)
            .ok_or_else(|| EvalError::UndefinedVar(name.to_string()))
    }

    pub fn get_var_type(&self, name: &str) -> EvalResult<&Type> {
        for scope in self.scopes.iter().rev() {
            if let Some((_, ty)) = scope.var(name) {
                return Ok(ty);
            }
        }
        self.main_scope
            .var(name)
            .map(|(_, ty)| ty)
            .ok_or_else(|| EvalError::UndefinedVar(name.to_string()))
    }

    pub fn find_var_mut(&mut self, name: &str) -> Option<&mut (Value<'ctx>, Type)> {
        for scope in self.scopes.iter_mut().rev() {
            if scope.vars.contains_key(name) {
                return scope.var_mut(name);
            }
        }
        self.main_scope.var_mut(name)
    }

    /// Rebind an existing variable in its owning scope.
    pub fn update_var(&mut self, name: &str, value: Value<'ctx>) -> EvalResult<()> {
        match self.find_var_mut(name) {
            Some(entry) => {
                entry.0 = value;
                Ok(())
            }
            None => Err(EvalError::UndefinedVar(name.to_string())),
        }
    }

    /// Detach a binding's value so it can be rewritten while the state stays
    /// borrowable; pair with [`ProgState::restore_var`].
    pub fn take_var(&mut self, name: &str) -> EvalResult<(VarHandle, Value<'ctx>)> {
        for (idx, scope) in self.scopes.iter_mut().enumerate().rev() {
            if let Some(entry) = scope.var_mut(name) {
                let value = std::mem::replace(&mut entry.0, Value::Void);
                return Ok((VarHandle::Stack(idx), value));
            }
        }
        if let Some(entry) = self.main_scope.var_mut(name) {
            let value = std::mem::replace(&mut entry.0, Value::Void);
            return Ok((VarHandle::Main, value));
        }
        Err(EvalError::UndefinedVar(name.to_string()))
    }

    pub fn restore_var(&mut self, handle: VarHandle, name: &str, value: Value<'ctx>) {
        let scope = match handle {
            VarHandle::Stack(idx) => &mut self.scopes[idx],
            VarHandle::Main => &mut self.main_scope,
        };
        if let Some(entry) = scope.var_mut(name) {
            entry.0 = value;
        }
    }

    /****** types ******/

    /// Register a type alias in the current scope. Shadowing an outer scope
    /// is allowed (generic instantiations rebind their type variables per
    /// application); a duplicate in the same scope is an error.
    pub fn add_type(&mut self, name: &str, ty: Type) -> EvalResult<()> {
        let scope = self.current_scope_mut();
        if scope.types.contains_key(name) {
            return Err(EvalError::Redeclared(name.to_string()));
        }
        scope.types.insert(name.to_string(), ty);
        Ok(())
    }

    pub fn get_type(&self, name: &str) -> EvalResult<&Type> {
        for scope in self.scopes.iter().rev() {
            if let Some(ty) = scope.types.get(name) {
                return Ok(ty);
            }
        }
        self.main_scope
            .types
            .get(name)
            .ok_or_else(|| EvalError::UndefinedType(name.to_string()))
    }

    /// Follow `Type::Name` aliases to a concrete type. The alias table is
    /// also what keeps cyclic type graphs finite: nested references stay
    /// names until they are looked at.
    pub fn resolve_type(&self, ty: &Type) -> EvalResult<Type> {
        let mut current = ty.clone();
        for _ in 0..64 {
            match current {
                Type::Name(ref name) => {
                    current = self.get_type(name)?.clone();
                }
                other => return Ok(other),
            }
        }
        Err(EvalError::Internal(format!(
            "type alias cycle while resolving {}",
            ty.describe()
        )))
    }

    /****** static declarations ******/

    /// Insert a static declaration. Shadowing is allowed but warned;
    /// callables declared under an existing name extend its overload set.
    pub fn declare_static_decl(&mut self, name: &str, decl: StaticDecl) {
        let scope = self.current_scope_mut();
        match (scope.decls.get_mut(name), decl) {
            (Some(StaticDecl::Callables(existing)), StaticDecl::Callables(new)) => {
                existing.candidates.extend(new.candidates);
            }
            (Some(slot), decl) => {
                warn!(name, "shadowing static declaration");
                *slot = decl;
            }
            (None, decl) => {
                scope.decls.insert(name.to_string(), decl);
            }
        }
    }

    pub fn get_static_decl(&self, name: &str) -> EvalResult<&StaticDecl> {
        for scope in self.scopes.iter().rev() {
            if let Some(decl) = scope.decls.get(name) {
                return Ok(decl);
            }
        }
        self.main_scope
            .decls
            .get(name)
            .ok_or_else(|| EvalError::UndefinedDecl(name.to_string()))
    }

    /****** fork and merge ******/

    /// Deep clone of the whole scope stack.
    pub fn clone_state(&self) -> Vec<Scope<'ctx>> {
        self.scopes.clone()
    }

    /// Replace the scope stack with a deep clone of itself and return the
    /// original, so a branch can execute without disturbing its sibling.
    pub fn fork_state(&mut self) -> Vec<Scope<'ctx>> {
        let clone = self.scopes.clone();
        std::mem::replace(&mut self.scopes, clone)
    }

    pub fn swap_scopes(&mut self, scopes: Vec<Scope<'ctx>>) -> Vec<Scope<'ctx>> {
        std::mem::replace(&mut self.scopes, scopes)
    }

    /// Join `other` into the live state: every value present in both becomes
    /// `ite(cond, other, self)` at its leaves.
    pub fn merge_state(&mut self, cond: &Bool<'ctx>, other: &[Scope<'ctx>]) -> EvalResult<()> {
        for (idx, scope) in self.scopes.iter_mut().enumerate() {
            let Some(other_scope) = other.get(idx) else {
                continue;
            };
            for (name, (value, _)) in scope.vars_mut() {
                if let Some((other_value, _)) = other_scope.var(name) {
                    value.merge(cond, other_value)?;
                }
            }
        }
        Ok(())
    }

    /// Snapshot every visible binding, innermost first. Shadowed outer
    /// bindings are skipped so the flat map reflects what lookup would see.
    pub fn snapshot_vars(&self) -> Vec<(String, Value<'ctx>)> {
        let mut seen = std::collections::HashSet::new();
        let mut snapshot = Vec::new();
        for scope in self.scopes.iter().rev().chain(std::iter::once(&self.main_scope)) {
            for (name, (value, _)) in scope.vars() {
                if seen.insert(name.clone()) {
                    snapshot.push((name.clone(), value.clone()));
                }
            }
        }
        snapshot
    }

    /// Scope-oblivious merge against a flat snapshot, used at return points.
    /// Names whose scope has since been popped are skipped.
    pub fn merge_vars(
        &mut self,
        cond: &Bool<'ctx>,
        snapshot: &[(String, Value<'ctx>)],
    ) -> EvalResult<()> {
        for (name, other) in snapshot {
            if let Some((value, _)) = self.find_var_mut(name) {
                value.merge(cond, other)?;
            }
        }
        Ok(())
    }

    /****** instance generation ******/

    /// Create a fresh instance of a type. Scalar leaves become unconstrained
    /// constants; composite members are generated recursively with their
    /// field types resolved. Headers start invalid.
    pub fn gen_instance(&self, name: &str, ty: &Type) -> EvalResult<Value<'ctx>> {
        let resolved = self.resolve_type(ty)?;
        match &resolved {
            Type::Bool => Ok(Value::Scalar(Scalar::Bool(self.gen_bool(name)))),
            Type::Bits { width, signed } => {
                Ok(Value::Scalar(Scalar::bv(self.gen_bv(name, *width), *signed)))
            }
            Type::Varbits { width } => {
                Ok(Value::Scalar(Scalar::unsigned(self.gen_bv(name, *width))))
            }
            Type::Int => {
                let int = if name == UNDEFINED_LABEL {
                    Int::fresh_const(self.ctx, UNDEFINED_LABEL)
                } else {
                    Int::new_const(self.ctx, name)
                };
                Ok(Value::Scalar(Scalar::Int(int)))
            }
            Type::Struct(decl) => Ok(Value::Struct(StructVal {
                members: self.gen_members(name, &decl.fields)?,
                ty: resolved.clone(),
            })),
            Type::Header(decl) => Ok(Value::Header(HeaderVal {
                members: self.gen_members(name, &decl.fields)?,
                ty: resolved.clone(),
                valid: Bool::from_bool(self.ctx, false),
            })),
            Type::HeaderUnion(decl) => Ok(Value::Union(UnionVal {
                members: self.gen_members(name, &decl.fields)?,
                ty: resolved.clone(),
            })),
            Type::Stack { element, size } => {
                let mut members = MemberMap::new(name);
                let elem_ty = self.resolve_type(element)?;
                for idx in 0..*size {
                    let slot = self.gen_instance(UNDEFINED_LABEL, &elem_ty)?;
                    members.insert(&idx.to_string(), slot, elem_ty.clone());
                }
                Ok(Value::Stack(StackVal {
                    members,
                    element: elem_ty,
                    size: u64::from(*size),
                    next_index: Int::from_u64(self.ctx, 0),
                }))
            }
            Type::Enum(decl) => Ok(Value::Enum(EnumVal::new(
                self.ctx,
                &decl.name,
                &decl.members,
            ))),
            Type::Error(decl) => Ok(Value::Error(EnumVal::new(
                self.ctx,
                &decl.name,
                &decl.members,
            ))),
            // A serializable-enum variable is its underlying bits.
            Type::SerEnum(decl) => {
                let underlying = self.resolve_type(&decl.underlying)?;
                self.gen_instance(name, &underlying)
            }
            Type::Extern(decl) => Ok(Value::Extern(ExternVal { ty: decl.clone() })),
            Type::Void => Ok(Value::Void),
            Type::List(items) => {
                let mut members = MemberMap::new(name);
                for (idx, item_ty) in items.iter().enumerate() {
                    let resolved_item = self.resolve_type(item_ty)?;
                    let value = self.gen_instance(UNDEFINED_LABEL, &resolved_item)?;
                    members.insert(&idx.to_string(), value, resolved_item);
                }
                Ok(Value::Struct(StructVal {
                    members,
                    ty: resolved.clone(),
                }))
            }
            other => Err(EvalError::Unsupported(format!(
                "cannot instantiate a value of type {}",
                other.describe()
            ))),
        }
    }

    fn gen_members(
        &self,
        name: &str,
        fields: &[p4v_ir::StructField],
    ) -> EvalResult<MemberMap<'ctx>> {
        let mut members = MemberMap::new(name);
        for field in fields {
            let field_ty = self.resolve_type(&field.ty)?;
            let value = self.gen_instance(UNDEFINED_LABEL, &field_ty)?;
            members.insert(&field.name, value, field_ty);
        }
        Ok(members)
    }

    fn gen_bv(&self, name: &str, width: u32) -> BV<'ctx> {
        if name == UNDEFINED_LABEL {
            BV::fresh_const(self.ctx, UNDEFINED_LABEL, width)
        } else {
            BV::new_const(self.ctx, name, width)
        }
    }

    fn gen_bool(&self, name: &str) -> Bool<'ctx> {
        if name == UNDEFINED_LABEL {
            Bool::fresh_const(self.ctx, UNDEFINED_LABEL)
        } else {
            Bool::new_const(self.ctx, name)
        }
    }

    /****** casts ******/

    /// Cast a value to a target type, following the cast matrix: width
    /// alignment between bitvectors, nonzero test to bool, integer
    /// round-trips, and structural field-by-field casts between composites.
    pub fn cast_value(&self, value: &Value<'ctx>, dest: &Type) -> EvalResult<Value<'ctx>> {
        let dest = self.resolve_type(dest)?;
        match (&dest, value) {
            (Type::Bits { width, signed }, Value::Scalar(s)) => {
                Ok(Value::Scalar(s.cast_to_width(*width, *signed)?))
            }
            (Type::Varbits { width }, Value::Scalar(s)) => {
                Ok(Value::Scalar(s.cast_to_width(*width, false)?))
            }
            (Type::Bool, Value::Scalar(s)) => Ok(Value::Scalar(Scalar::Bool(s.cast_to_bool()?))),
            (Type::Int, Value::Scalar(s)) => Ok(Value::Scalar(Scalar::Int(s.cast_to_int()?))),
            // Enum-likes narrow to their value expression.
            (Type::Bits { width, signed }, Value::Enum(e))
            | (Type::Bits { width, signed }, Value::SerEnum(e))
            | (Type::Bits { width, signed }, Value::Error(e)) => Ok(Value::Scalar(
                Scalar::bv(e.val.clone(), e.signed).cast_to_width(*width, *signed)?,
            )),
            // A scalar flowing into an enum type adopts the member table.
            (Type::Enum(decl), Value::Scalar(s)) => {
                let mut instance = EnumVal::new(self.ctx, &decl.name, &decl.members);
                instance.val = p4v_smt::align_to_width(s, instance.width)?;
                Ok(Value::Enum(instance))
            }
            (Type::Error(decl), Value::Scalar(s)) => {
                let mut instance = EnumVal::new(self.ctx, &decl.name, &decl.members);
                instance.val = p4v_smt::align_to_width(s, instance.width)?;
                Ok(Value::Error(instance))
            }
            // A serializable-enum target behaves as its underlying bits.
            (Type::SerEnum(decl), Value::Scalar(s)) => {
                let underlying = self.resolve_type(&decl.underlying)?;
                self.cast_value(&Value::Scalar(s.clone()), &underlying)
            }
            (Type::Enum(decl), Value::Enum(e)) if decl.name == e.ty_name => Ok(value.clone()),
            (Type::Error(_), Value::Error(_)) => Ok(value.clone()),
            // Structural cast into a struct-like: generate the target and
            // fill it positionally or by name.
            (Type::Struct(_), _) | (Type::Header(_), _) | (Type::HeaderUnion(_), _)
                if value.members().is_ok() =>
            {
                if value.p4_type() == dest {
                    return Ok(value.clone());
                }
                let mut instance = self.gen_instance(UNDEFINED_LABEL, &dest)?;
                let items: Vec<Value<'ctx>> = value
                    .members()?
                    .iter()
                    .map(|(_, v, _)| v.clone())
                    .collect();
                self.set_list(&mut instance, &items)?;
                // A cast from a header keeps the source validity.
                if let (Value::Header(target), Value::Header(source)) = (&mut instance, value) {
                    target.valid = source.valid.clone();
                }
                Ok(instance)
            }
            (Type::Stack { .. }, Value::Stack(_)) => Ok(value.clone()),
            // Instances have only rudimentary casting: identity.
            (_, Value::Extern(_)) | (_, Value::Control(_)) => Ok(value.clone()),
            (dest, value) => Err(EvalError::Unsupported(format!(
                "cast from {} to {}",
                value.type_name(),
                dest.describe()
            ))),
        }
    }

    /// Positional initialization of a struct-like from a list of values,
    /// recursing into nested composites. Filling a header validates it.
    pub fn set_list(&self, target: &mut Value<'ctx>, items: &[Value<'ctx>]) -> EvalResult<()> {
        {
            let members = target.members_mut()?;
            if members.len() != items.len() {
                return Err(EvalError::Program(format!(
                    "initializer has {} elements, {} expects {}",
                    items.len(),
                    members.instance,
                    members.len()
                )));
            }
            let types: Vec<Type> = members.iter().map(|(_, _, t)| t.clone()).collect();
            let names: Vec<String> = members.iter().map(|(n, _, _)| n.clone()).collect();
            for ((name, ty), item) in names.iter().zip(types.iter()).zip(items.iter()) {
                let slot = members
                    .get_mut(name)
                    .ok_or_else(|| EvalError::Internal(format!("member {name} vanished")))?;
                if slot.members().is_ok() && item.members().is_ok() {
                    let sub_items: Vec<Value<'ctx>> =
                        item.members()?.iter().map(|(_, v, _)| v.clone()).collect();
                    self.set_list(slot, &sub_items)?;
                } else {
                    *slot = self.cast_value(item, ty)?;
                }
            }
        }
        if let Value::Header(h) = target {
            let valid = Bool::from_bool(self.ctx, true);
            h.valid = valid.clone();
            for (_, member, _) in h.members.iter_mut() {
                member.propagate_validity(Some(&valid), self.ctx);
            }
        }
        Ok(())
    }

    /// Read `stack[index]`. A constant index selects its slot; a symbolic
    /// one produces the guarded merge of every slot.
    pub fn stack_read(&self, stack: &StackVal<'ctx>, index: &Scalar<'ctx>) -> EvalResult<Value<'ctx>> {
        if let Some(idx) = index.as_const_u64() {
            if idx >= stack.size {
                return Err(EvalError::StackBounds {
                    index: idx,
                    size: stack.size,
                });
            }
            return stack
                .members
                .get(&idx.to_string())
                .cloned()
                .ok_or_else(|| EvalError::Internal(format!("stack slot {idx} missing")));
        }
        let mut merged = self.gen_instance(UNDEFINED_LABEL, &stack.element)?;
        for idx in 0..stack.size {
            let slot = stack
                .members
                .get(&idx.to_string())
                .ok_or_else(|| EvalError::Internal(format!("stack slot {idx} missing")))?;
            let cond = index_matches(index, idx)?;
            merged.merge(&cond, slot)?;
        }
        Ok(merged)
    }
}

/// The condition `index == idx`, in the index expression's own sort.
pub fn index_matches<'ctx>(index: &Scalar<'ctx>, idx: u64) -> EvalResult<Bool<'ctx>> {
    let literal = match index {
        Scalar::Bv { expr, .. } => {
            Scalar::unsigned(BV::from_u64(expr.get_ctx(), idx, expr.get_size()))
        }
        Scalar::Int(i) => Scalar::Int(Int::from_u64(i.get_ctx(), idx)),
        Scalar::Bool(_) => {
            return Err(EvalError::Unsupported(
                "boolean used as a stack index".to_string(),
            ))
        }
    };
    Ok(index.eq_expr(&literal)?)
}
