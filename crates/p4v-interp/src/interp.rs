//! The interpreter pass
//!
//! Walks statements and expressions, producing values functionally: every
//! evaluation returns its result, and the only state flowing through
//! statement execution is the scope stack.
//!
//! Control flow is path merging, not branching: an `if` forks the state,
//! runs both sides, and joins them under the condition; a `select` does the
//! same per matching case; a table apply forks once per action under the
//! solver constant that says the table chose it. `return` and `exit` record
//! `(predicate, snapshot)` pairs that `copy_out` folds back into the live
//! state, innermost conditions first.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use z3::ast::{Ast, Bool, Dynamic, Int, BV};
use z3::Context;

use p4v_ir::{
    Argument, BinOp, BlockStatement, Direction, EnumType, Expr, KeySetExpr, MethodSig, Parameter,
    ParserDecl, Program, SelectCase, Statement, SwitchCase, SwitchLabel, TableDecl, Transition,
    Type, UnOp,
};
use p4v_smt::{Scalar, UNDEFINED_LABEL};

use crate::error::{EvalError, EvalResult};
use crate::fill;
use crate::instantiate::{solve_type_bindings, substitute_type};
use crate::resolver::{set_var, MemberPath, Selector};
use crate::scope::ProgState;
use crate::value::{
    Callable, ControlVal, EnumVal, MemberMap, PipelineRef, StaticDecl, StructVal, Value,
    ENUM_WIDTH,
};

/// How often one parser state may be entered along a single path before the
/// interpretation is declared divergent.
const PARSER_LOOP_BOUND: usize = 4;

/// Whether execution after a statement continues on this path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The path returned or exited; the rest of the block is unreachable
    Interrupt,
}

/// Per-call bookkeeping for the copy-in/copy-out discipline.
struct CallFrame<'ctx> {
    /// L-values to write `out`/`inout` parameters back to
    copy_out: Vec<(MemberPath<'ctx>, String)>,
    /// States recorded at `return`/`exit` points with their path predicates
    return_states: Vec<(Bool<'ctx>, Vec<(String, Value<'ctx>)>)>,
    /// Return values with their path predicates
    return_values: Vec<(Bool<'ctx>, Value<'ctx>)>,
    /// Depth of the enclosing-condition stack at call entry
    cond_base: usize,
    return_type: Type,
}

/// The AST walker producing symbolic values.
pub struct Interpreter<'s, 'ctx> {
    pub state: &'s mut ProgState<'ctx>,
    frames: Vec<CallFrame<'ctx>>,
    forward_conds: Vec<Bool<'ctx>>,
}

impl<'s, 'ctx> Interpreter<'s, 'ctx> {
    pub fn new(state: &'s mut ProgState<'ctx>) -> Self {
        Interpreter {
            state,
            frames: Vec::new(),
            forward_conds: Vec::new(),
        }
    }

    fn ctx(&self) -> &'ctx Context {
        self.state.ctx()
    }

    /// Conjunction of the branch conditions entered since `base`.
    fn path_cond(&self, base: usize) -> Bool<'ctx> {
        let ctx = self.ctx();
        let conds = &self.forward_conds[base.min(self.forward_conds.len())..];
        match conds.len() {
            0 => Bool::from_bool(ctx, true),
            1 => conds[0].clone(),
            _ => {
                let refs: Vec<&Bool> = conds.iter().collect();
                Bool::and(ctx, &refs)
            }
        }
    }

    /****** expressions ******/

    pub fn eval_expr(&mut self, expr: &Expr) -> EvalResult<Value<'ctx>> {
        let ctx = self.ctx();
        match expr {
            Expr::Bool(b) => Ok(Value::Scalar(Scalar::Bool(Bool::from_bool(ctx, *b)))),
            Expr::Int {
                value,
                width,
                signed,
            } => Ok(Value::Scalar(match width {
                Some(w) => Scalar::bv(BV::from_big_int(ctx, value, *w), *signed),
                None => Scalar::Int(Int::from_big_int(ctx, value)),
            })),
            Expr::Path(name) => self.eval_path(name),
            Expr::TypeName(name) => Ok(self.state.get_var(name)?.clone()),
            Expr::Member { base, member } => {
                let value = self.eval_expr(base)?;
                value.get_member(member, ctx)
            }
            Expr::Index { base, index } => {
                let value = self.eval_expr(base)?;
                let idx = self.eval_scalar(index)?;
                match &value {
                    Value::Stack(stack) => self.state.stack_read(stack, &idx),
                    Value::Struct(_) => {
                        // tuples index by constant position
                        let position = idx.as_const_u64().ok_or(p4v_smt::SmtError::NonConstant {
                            what: "tuple index",
                        })?;
                        value.get_member(&position.to_string(), ctx)
                    }
                    other => Err(EvalError::Unsupported(format!(
                        "indexing into {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Slice { base, hi, lo } => {
                let value = self.eval_scalar(base)?;
                let hi = self.eval_scalar(hi)?;
                let lo = self.eval_scalar(lo)?;
                Ok(Value::Scalar(value.slice(&hi, &lo)?))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval_expr(operand)?;
                let scalar = scalar_operand(&value)?;
                let result = match op {
                    UnOp::Neg => scalar.neg()?,
                    UnOp::Cmpl => scalar.cmpl()?,
                    UnOp::LNot => scalar.lnot()?,
                };
                Ok(Value::Scalar(result))
            }
            Expr::Binary { op, left, right } => {
                let lhs = self.eval_expr(left)?;
                let rhs = self.eval_expr(right)?;
                self.eval_binary(*op, &lhs, &rhs)
            }
            Expr::Mux {
                condition,
                then_value,
                else_value,
            } => {
                let cond = self.eval_bool(condition)?;
                let then_v = self.eval_expr(then_value)?;
                let mut result = self.eval_expr(else_value)?;
                result.merge(&cond, &then_v)?;
                Ok(result)
            }
            Expr::Cast { ty, expr } => {
                let value = self.eval_expr(expr)?;
                let folded = fill::fold_type(self.state, ty)?;
                self.state.cast_value(&value, &folded)
            }
            Expr::List(items) => {
                let mut members = MemberMap::new("list");
                let mut item_types = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    let value = self.eval_expr(item)?;
                    let ty = value.p4_type();
                    item_types.push(ty.clone());
                    members.insert(&idx.to_string(), value, ty);
                }
                Ok(Value::Struct(StructVal {
                    members,
                    ty: Type::List(item_types),
                }))
            }
            Expr::StructInit(fields) => {
                let mut members = MemberMap::new("list");
                let mut item_types = Vec::with_capacity(fields.len());
                for (name, field) in fields {
                    let value = self.eval_expr(field)?;
                    let ty = value.p4_type();
                    item_types.push(ty.clone());
                    members.insert(name, value, ty);
                }
                Ok(Value::Struct(StructVal {
                    members,
                    ty: Type::List(item_types),
                }))
            }
            Expr::Call {
                target,
                type_args,
                args,
            } => self.eval_call(target, type_args, args),
            Expr::Construct { ty, args } => self.eval_construct(ty, args),
        }
    }

    fn eval_path(&mut self, name: &str) -> EvalResult<Value<'ctx>> {
        match self.state.get_var(name) {
            Ok(value) => Ok(value.clone()),
            Err(EvalError::UndefinedVar(_)) => match self.state.get_static_decl(name) {
                Ok(StaticDecl::Table(table)) => Ok(Value::Table(table.clone())),
                Ok(decl) => Ok(Value::Decl(decl.clone())),
                Err(_) => Err(EvalError::UndefinedVar(name.to_string())),
            },
            Err(other) => Err(other),
        }
    }

    fn eval_scalar(&mut self, expr: &Expr) -> EvalResult<Scalar<'ctx>> {
        let value = self.eval_expr(expr)?;
        scalar_operand(&value)
    }

    fn eval_bool(&mut self, expr: &Expr) -> EvalResult<Bool<'ctx>> {
        Ok(self.eval_scalar(expr)?.cast_to_bool()?)
    }

    fn eval_binary(
        &mut self,
        op: BinOp,
        lhs: &Value<'ctx>,
        rhs: &Value<'ctx>,
    ) -> EvalResult<Value<'ctx>> {
        let ctx = self.ctx();
        // Equality is defined on whole values, composites included.
        match op {
            BinOp::Eq => return Ok(Value::Scalar(Scalar::Bool(lhs.eq_expr(rhs, ctx)?))),
            BinOp::Neq => {
                return Ok(Value::Scalar(Scalar::Bool(lhs.eq_expr(rhs, ctx)?.not())))
            }
            _ => {}
        }
        let a = scalar_operand(lhs)?;
        let b = scalar_operand(rhs)?;
        let result = match op {
            BinOp::Mul => a.mul(&b)?,
            BinOp::Div => a.div(&b)?,
            BinOp::Mod => a.rem(&b)?,
            BinOp::Add => a.add(&b)?,
            BinOp::AddSat => a.add_sat(&b)?,
            BinOp::Sub => a.sub(&b)?,
            BinOp::SubSat => a.sub_sat(&b)?,
            BinOp::Shl => a.shl(&b)?,
            BinOp::Shr => a.shr(&b)?,
            BinOp::Lt => Scalar::Bool(a.lt(&b)?),
            BinOp::Leq => Scalar::Bool(a.le(&b)?),
            BinOp::Gt => Scalar::Bool(a.gt(&b)?),
            BinOp::Geq => Scalar::Bool(a.ge(&b)?),
            BinOp::BAnd => a.bit_and(&b)?,
            BinOp::BOr => a.bit_or(&b)?,
            BinOp::BXor => a.bit_xor(&b)?,
            BinOp::LAnd => Scalar::Bool(a.land(&b)?),
            BinOp::LOr => Scalar::Bool(a.lor(&b)?),
            BinOp::Concat => a.concat(&b)?,
            BinOp::Eq | BinOp::Neq => unreachable!("handled above"),
        };
        Ok(Value::Scalar(result))
    }

    /****** l-values ******/

    /// Decompose an l-value into its member path, outermost access first.
    pub fn resolve_lvalue(&mut self, expr: &Expr) -> EvalResult<MemberPath<'ctx>> {
        let mut mids = Vec::new();
        let mut target = None;
        let mut has_stack = false;
        let mut first = true;
        let mut cur = expr;
        loop {
            match cur {
                Expr::Member { base, member } => {
                    let sel = Selector::Field(member.clone());
                    if first {
                        target = Some(sel);
                        first = false;
                    } else {
                        mids.push(sel);
                    }
                    cur = base;
                }
                Expr::Index { base, index } => {
                    has_stack = true;
                    let sel = Selector::Index(self.eval_scalar(index)?);
                    if first {
                        target = Some(sel);
                        first = false;
                    } else {
                        mids.push(sel);
                    }
                    cur = base;
                }
                Expr::Path(name) => {
                    return Ok(MemberPath {
                        root: name.clone(),
                        mids,
                        target,
                        has_stack,
                    });
                }
                other => {
                    return Err(EvalError::Unsupported(format!(
                        "expression {:?} is not an l-value",
                        std::mem::discriminant(other)
                    )))
                }
            }
        }
    }

    /****** statements ******/

    pub fn run_block(&mut self, block: &BlockStatement) -> EvalResult<Flow> {
        for stmt in &block.statements {
            if self.run_stmt(stmt)? == Flow::Interrupt {
                return Ok(Flow::Interrupt);
            }
        }
        Ok(Flow::Continue)
    }

    pub fn run_stmt(&mut self, stmt: &Statement) -> EvalResult<Flow> {
        match stmt {
            Statement::Block(block) => {
                self.state.push_scope();
                let flow = self.run_block(block);
                self.state.pop_scope();
                flow
            }
            Statement::Assign { target, value } => {
                self.run_assign(target, value)?;
                Ok(Flow::Continue)
            }
            Statement::MethodCall(expr) => {
                self.eval_expr(expr)?;
                Ok(Flow::Continue)
            }
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => self.run_if(condition, then_branch, else_branch.as_deref()),
            Statement::Switch { scrutinee, cases } => self.run_switch(scrutinee, cases),
            Statement::Declaration(decl) => {
                fill::fill_declaration(self.state, decl)?;
                Ok(Flow::Continue)
            }
            Statement::Return(expr) => self.run_return(expr.as_ref()),
            Statement::Exit => self.run_exit(),
            Statement::Empty => Ok(Flow::Continue),
        }
    }

    fn run_assign(&mut self, target: &Expr, value: &Expr) -> EvalResult<()> {
        if let Expr::Slice { base, hi, lo } = target {
            // x[hi:lo] = v assembles the unchanged bits around v.
            let path = self.resolve_lvalue(base)?;
            let hi = self
                .eval_scalar(hi)?
                .as_const_u64()
                .ok_or(p4v_smt::SmtError::NonConstant { what: "slice bound" })?;
            let lo = self
                .eval_scalar(lo)?
                .as_const_u64()
                .ok_or(p4v_smt::SmtError::NonConstant { what: "slice bound" })?;
            let current = self.eval_scalar(base)?;
            let rval = self.eval_scalar(value)?;
            let assembled = current.assemble_slice(hi, lo, &rval)?;
            return set_var(self.state, &path, Value::Scalar(assembled));
        }
        let path = self.resolve_lvalue(target)?;
        let rval = self.eval_expr(value)?;
        set_var(self.state, &path, rval)
    }

    fn run_if(
        &mut self,
        condition: &Expr,
        then_branch: &Statement,
        else_branch: Option<&Statement>,
    ) -> EvalResult<Flow> {
        let cond = self.eval_bool(condition)?;

        let original = self.state.fork_state();
        self.forward_conds.push(cond.clone());
        let then_flow = self.run_stmt(then_branch);
        self.forward_conds.pop();
        let then_scopes = self.state.swap_scopes(original);
        let then_flow = then_flow?;

        let else_flow = match else_branch {
            Some(else_branch) => {
                self.forward_conds.push(cond.not());
                let flow = self.run_stmt(else_branch);
                self.forward_conds.pop();
                flow?
            }
            None => Flow::Continue,
        };

        self.state.merge_state(&cond, &then_scopes)?;
        Ok(
            if then_flow == Flow::Interrupt && else_flow == Flow::Interrupt {
                Flow::Interrupt
            } else {
                Flow::Continue
            },
        )
    }

    fn run_switch(&mut self, scrutinee: &Expr, cases: &[SwitchCase]) -> EvalResult<Flow> {
        let ctx = self.ctx();
        let value = self.eval_expr(scrutinee)?;

        // Labels without a body fall through into the next case's body.
        let mut groups: Vec<(Vec<&SwitchLabel>, &BlockStatement)> = Vec::new();
        let mut pending: Vec<&SwitchLabel> = Vec::new();
        for case in cases {
            pending.push(&case.label);
            if let Some(body) = &case.body {
                groups.push((std::mem::take(&mut pending), body));
            }
        }

        // The default label matches whatever no named label does.
        let mut named_conds: Vec<Bool<'ctx>> = Vec::new();
        for case in cases {
            if let SwitchLabel::Name(name) = &case.label {
                named_conds.push(self.switch_label_cond(&value, name)?);
            }
        }
        let named_refs: Vec<&Bool> = named_conds.iter().collect();
        let default_cond = Bool::or(ctx, &named_refs).not();

        let mut all_interrupt = !groups.is_empty();
        let mut has_default = false;
        let mut named_idx = 0;
        for (labels, body) in groups {
            let mut conds: Vec<Bool<'ctx>> = Vec::new();
            for label in labels {
                match label {
                    SwitchLabel::Name(_) => {
                        conds.push(named_conds[named_idx].clone());
                        named_idx += 1;
                    }
                    SwitchLabel::Default => {
                        has_default = true;
                        conds.push(default_cond.clone());
                    }
                }
            }
            let refs: Vec<&Bool> = conds.iter().collect();
            let cond = Bool::or(ctx, &refs);

            let original = self.state.fork_state();
            self.forward_conds.push(cond.clone());
            let flow = self.run_block(body);
            self.forward_conds.pop();
            let case_scopes = self.state.swap_scopes(original);
            if flow? == Flow::Continue {
                all_interrupt = false;
            }
            self.state.merge_state(&cond, &case_scopes)?;
        }

        Ok(if all_interrupt && has_default {
            Flow::Interrupt
        } else {
            Flow::Continue
        })
    }

    fn switch_label_cond(&self, value: &Value<'ctx>, label: &str) -> EvalResult<Bool<'ctx>> {
        match value {
            Value::Enum(e) | Value::SerEnum(e) | Value::Error(e) => {
                let member = e.member(label)?;
                Ok(Scalar::bv(e.val.clone(), e.signed).eq_expr(&member)?)
            }
            other => Err(EvalError::Unsupported(format!(
                "switch label {label} against {}",
                other.type_name()
            ))),
        }
    }

    fn run_return(&mut self, expr: Option<&Expr>) -> EvalResult<Flow> {
        let (cond_base, return_type) = match self.frames.last() {
            Some(frame) => (frame.cond_base, frame.return_type.clone()),
            None => {
                return Err(EvalError::Internal(
                    "return outside of a call frame".to_string(),
                ))
            }
        };
        let value = match expr {
            Some(expr) => {
                let evaluated = self.eval_expr(expr)?;
                if return_type == Type::Void {
                    evaluated
                } else {
                    self.state.cast_value(&evaluated, &return_type)?
                }
            }
            None => Value::Void,
        };
        let cond = self.path_cond(cond_base);
        let snapshot = self.state.snapshot_vars();
        if let Some(frame) = self.frames.last_mut() {
            frame.return_values.push((cond.clone(), value));
            frame.return_states.push((cond, snapshot));
        }
        Ok(Flow::Interrupt)
    }

    fn run_exit(&mut self) -> EvalResult<Flow> {
        let cond_base = match self.frames.last() {
            Some(frame) => frame.cond_base,
            None => {
                return Err(EvalError::Internal(
                    "exit outside of a call frame".to_string(),
                ))
            }
        };
        let cond = self.path_cond(cond_base);
        let snapshot = self.state.snapshot_vars();
        if let Some(frame) = self.frames.last_mut() {
            frame.return_states.push((cond, snapshot));
        }
        Ok(Flow::Interrupt)
    }

    /****** calls ******/

    fn eval_call(
        &mut self,
        target: &Expr,
        type_args: &[Type],
        args: &[Argument],
    ) -> EvalResult<Value<'ctx>> {
        match target {
            Expr::Member { base, member } => {
                let receiver = self.eval_expr(base)?;
                match (&receiver, member.as_str()) {
                    (Value::Header(_), "isValid") | (Value::Union(_), "isValid") => Ok(
                        Value::Scalar(Scalar::Bool(receiver.is_valid(self.ctx())?)),
                    ),
                    (Value::Header(_), "setValid") | (Value::Header(_), "setInvalid") => {
                        let path = self.resolve_lvalue(base)?;
                        let mut header = receiver;
                        if member == "setValid" {
                            header.header_set_valid(self.ctx())?;
                        } else {
                            header.header_set_invalid(self.ctx())?;
                        }
                        set_var(self.state, &path, header)?;
                        Ok(Value::Void)
                    }
                    (Value::Stack(_), "push_front") | (Value::Stack(_), "pop_front") => {
                        let count = match args.first() {
                            Some(arg) => self
                                .eval_scalar(&arg.value)?
                                .as_const_u64()
                                .ok_or(p4v_smt::SmtError::NonConstant {
                                    what: "stack shift count",
                                })?,
                            None => {
                                return Err(EvalError::Program(format!(
                                    "{member} expects one argument"
                                )))
                            }
                        };
                        let path = self.resolve_lvalue(base)?;
                        let mut stack = receiver;
                        match &mut stack {
                            Value::Stack(s) => {
                                if member == "push_front" {
                                    s.push_front(count, self.ctx())?;
                                } else {
                                    s.pop_front(count, self.ctx())?;
                                }
                            }
                            _ => unreachable!("matched a stack above"),
                        }
                        set_var(self.state, &path, stack)?;
                        Ok(Value::Void)
                    }
                    (Value::Extern(ext), _) => {
                        let ext = ext.clone();
                        self.extern_method_call(&ext, member, type_args, args)
                    }
                    (Value::Table(table), "apply") => {
                        let table = table.clone();
                        self.table_apply(&table)
                    }
                    (Value::Control(cv), "apply") => {
                        let cv = cv.clone();
                        self.apply_control(&cv, args)
                    }
                    (other, _) => Err(EvalError::Unsupported(format!(
                        "method {member} on {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Path(name) => {
                let decl = self.state.get_static_decl(name)?.clone();
                match decl {
                    StaticDecl::Callables(set) => {
                        let callable = set.resolve(args.len())?.clone();
                        self.run_callable(&callable, args, false)
                    }
                    StaticDecl::Table(_) => Err(EvalError::Unsupported(format!(
                        "table {name} called as a function"
                    ))),
                    StaticDecl::Instance(_) => Err(EvalError::Unsupported(format!(
                        "package instance {name} called as a function"
                    ))),
                }
            }
            other => Err(EvalError::Unsupported(format!(
                "call target {:?}",
                std::mem::discriminant(other)
            ))),
        }
    }

    fn eval_construct(&mut self, ty: &Type, args: &[Argument]) -> EvalResult<Value<'ctx>> {
        let resolved = self.state.resolve_type(ty)?;
        match &resolved {
            Type::Extern(e) => Ok(Value::Extern(crate::value::ExternVal { ty: e.clone() })),
            Type::ParserType(_) | Type::ControlType(_) => {
                let pipeline = match ty {
                    Type::Name(name) => match self.state.get_var(name)? {
                        Value::Control(cv) => cv.decl.clone(),
                        other => {
                            return Err(EvalError::Program(format!(
                                "{name} names a {}, not a parser or control",
                                other.type_name()
                            )))
                        }
                    },
                    _ => {
                        return Err(EvalError::Unsupported(
                            "anonymous pipeline construction".to_string(),
                        ))
                    }
                };
                let instance = self.instantiate_pipeline(pipeline, args)?;
                Ok(Value::Control(Box::new(instance)))
            }
            other => Err(EvalError::Unsupported(format!(
                "construction of {}",
                other.describe()
            ))),
        }
    }

    /// Bind constructor arguments and solve the declaration's type variables
    /// from their runtime types.
    pub fn instantiate_pipeline(
        &mut self,
        decl: PipelineRef,
        args: &[Argument],
    ) -> EvalResult<ControlVal<'ctx>> {
        let ctor_params = decl.constructor_params().to_vec();
        let matched = match_args(&ctor_params, args);
        let mut const_args: IndexMap<String, (Value<'ctx>, Type)> = IndexMap::new();
        let mut arg_types = Vec::new();
        for (idx, (param, arg)) in ctor_params.iter().zip(matched).enumerate() {
            let value = match arg {
                Some(arg) => self.eval_expr(&arg.value)?,
                None => match &param.default_value {
                    Some(default) => self.eval_expr(default)?,
                    None => {
                        return Err(EvalError::Program(format!(
                            "missing constructor argument for {}",
                            param.name
                        )))
                    }
                },
            };
            arg_types.push((idx, value.p4_type()));
            const_args.insert(param.name.clone(), (value, param.ty.clone()));
        }
        let bindings = solve_type_bindings(self.state, decl.type_params(), &ctor_params, &arg_types)?;
        for (_, (value, ty)) in const_args.iter_mut() {
            *ty = substitute_type(ty, &bindings);
            if let Ok(resolved) = self.state.resolve_type(ty) {
                if let Ok(cast) = self.state.cast_value(value, &resolved) {
                    *value = cast;
                    *ty = resolved;
                }
            }
        }
        Ok(ControlVal {
            decl,
            const_args,
            type_bindings: bindings,
        })
    }

    /// Evaluate call arguments against a parameter list.
    ///
    /// `out` parameters get fresh undefined instances; everything else is
    /// evaluated and cast to the parameter type. Returns the parameter
    /// bindings and the copy-out plan of `out`/`inout` argument l-values.
    /// `fill_missing` havocs absent directionless parameters, which is how a
    /// table invokes an action without its control-plane arguments.
    #[allow(clippy::type_complexity)]
    fn evaluate_args(
        &mut self,
        params: &[Parameter],
        args: &[Argument],
        fill_missing: bool,
        bindings: Option<&IndexMap<String, Type>>,
    ) -> EvalResult<(
        Vec<(String, Value<'ctx>, Type)>,
        Vec<(MemberPath<'ctx>, String)>,
    )> {
        let matched = match_args(params, args);
        let mut declared = Vec::with_capacity(params.len());
        let mut plan = Vec::new();
        for (param, arg) in params.iter().zip(matched) {
            let param_ty = match bindings {
                Some(bindings) => substitute_type(&param.ty, bindings),
                None => param.ty.clone(),
            };
            let resolved = self.state.resolve_type(&param_ty)?;
            let value = if param.direction == Direction::Out {
                self.state.gen_instance(UNDEFINED_LABEL, &resolved)?
            } else if let Some(arg) = arg {
                let evaluated = self.eval_expr(&arg.value)?;
                self.state.cast_value(&evaluated, &resolved)?
            } else if let Some(default) = &param.default_value {
                let evaluated = self.eval_expr(default)?;
                self.state.cast_value(&evaluated, &resolved)?
            } else if fill_missing || param.is_optional {
                self.state.gen_instance(UNDEFINED_LABEL, &resolved)?
            } else {
                return Err(EvalError::Program(format!(
                    "missing argument for parameter {}",
                    param.name
                )));
            };
            if let Some(arg) = arg {
                if matches!(param.direction, Direction::Out | Direction::InOut) {
                    plan.push((self.resolve_lvalue(&arg.value)?, param.name.clone()));
                }
            }
            declared.push((param.name.clone(), value, resolved));
        }
        Ok((declared, plan))
    }

    fn enter_frame(
        &mut self,
        declared: Vec<(String, Value<'ctx>, Type)>,
        plan: Vec<(MemberPath<'ctx>, String)>,
        return_type: Type,
    ) -> EvalResult<()> {
        self.state.push_scope();
        for (name, value, ty) in declared {
            self.state.declare_var(&name, value, ty)?;
        }
        self.frames.push(CallFrame {
            copy_out: plan,
            return_states: Vec::new(),
            return_values: Vec::new(),
            cond_base: self.forward_conds.len(),
            return_type,
        });
        Ok(())
    }

    /// Leave the current call frame: fold recorded return/exit states into
    /// the live state (reverse order, so early returns win at the leaves),
    /// write `out`/`inout` parameters back, and fold the return value.
    fn copy_out(&mut self) -> EvalResult<Value<'ctx>> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| EvalError::Internal("copy_out without a frame".to_string()))?;

        for (cond, snapshot) in frame.return_states.iter().rev() {
            self.state.merge_vars(cond, snapshot)?;
        }

        let mut writebacks = Vec::with_capacity(frame.copy_out.len());
        for (path, param_name) in &frame.copy_out {
            writebacks.push((path.clone(), self.state.get_var(param_name)?.clone()));
        }
        self.state.pop_scope();
        for (path, value) in writebacks {
            set_var(self.state, &path, value)?;
        }

        let mut values = frame.return_values;
        let Some((_, mut result)) = values.pop() else {
            return Ok(Value::Void);
        };
        for (cond, value) in values.iter().rev() {
            result.merge(cond, value)?;
        }
        Ok(result)
    }

    fn run_callable(
        &mut self,
        callable: &Callable,
        args: &[Argument],
        fill_missing: bool,
    ) -> EvalResult<Value<'ctx>> {
        let decl = match callable {
            Callable::Action(decl) | Callable::Function(decl) => decl.clone(),
            Callable::Method(sig) => {
                let sig = sig.clone();
                return self.extern_function_call(&sig, args);
            }
        };
        let (declared, plan) = self.evaluate_args(&decl.params, args, fill_missing, None)?;
        self.enter_frame(declared, plan, decl.return_type.clone())?;
        let _ = self.run_block(&decl.body)?;
        self.copy_out()
    }

    /// Apply a control or parser instance: push a scope carrying the type
    /// bindings and constructor arguments, copy in, fill the locals, execute
    /// the body or state machine, copy out.
    pub fn apply_control(
        &mut self,
        cv: &ControlVal<'ctx>,
        args: &[Argument],
    ) -> EvalResult<Value<'ctx>> {
        let decl = cv.decl.clone();
        let params = decl.params().to_vec();
        let (declared, plan) = self.evaluate_args(
            &params,
            args,
            false,
            Some(&cv.type_bindings),
        )?;

        self.state.push_scope();
        for (name, ty) in &cv.type_bindings {
            self.state.add_type(name, ty.clone())?;
        }
        for (name, (value, ty)) in &cv.const_args {
            self.state.declare_var(name, value.clone(), ty.clone())?;
        }
        for (name, value, ty) in declared {
            self.state.declare_var(&name, value, ty)?;
        }
        self.frames.push(CallFrame {
            copy_out: plan,
            return_states: Vec::new(),
            return_values: Vec::new(),
            cond_base: self.forward_conds.len(),
            return_type: Type::Void,
        });

        let result = match &decl {
            PipelineRef::Control(control) => {
                for local in &control.locals {
                    fill::fill_declaration(self.state, local)?;
                }
                self.run_block(&control.body).map(|_| ())
            }
            PipelineRef::Parser(parser) => {
                for local in &parser.locals {
                    fill::fill_declaration(self.state, local)?;
                }
                self.run_parser(parser)
            }
        };
        result?;
        self.copy_out()
    }

    /****** externs ******/

    /// Opaque extern dispatch: `out`/`inout` arguments are havocked, the
    /// return value is a havoc of the return type. `extract` additionally
    /// validates the header it fills, which is the one core-library behavior
    /// header gating cannot do without.
    fn extern_method_call(
        &mut self,
        ext: &crate::value::ExternVal,
        method: &str,
        type_args: &[Type],
        args: &[Argument],
    ) -> EvalResult<Value<'ctx>> {
        let sig = ext.resolve_method(method, args.len())?.clone();
        self.opaque_call(&sig, type_args, args)
    }

    /// An extern function declared at the top level (e.g. `verify`).
    fn extern_function_call(
        &mut self,
        sig: &MethodSig,
        args: &[Argument],
    ) -> EvalResult<Value<'ctx>> {
        self.opaque_call(sig, &[], args)
    }

    fn opaque_call(
        &mut self,
        sig: &MethodSig,
        type_args: &[Type],
        args: &[Argument],
    ) -> EvalResult<Value<'ctx>> {
        let ctx = self.ctx();
        let mut bindings = IndexMap::new();
        for (var, ty) in sig.type_params.iter().zip(type_args) {
            bindings.insert(var.clone(), ty.clone());
        }
        let matched = match_args(&sig.params, args);
        for (param, arg) in sig.params.iter().zip(matched) {
            let Some(arg) = arg else { continue };
            if matches!(param.direction, Direction::Out | Direction::InOut) {
                let path = self.resolve_lvalue(&arg.value)?;
                let declared = substitute_type(&param.ty, &bindings);
                let mut fresh = match self
                    .state
                    .resolve_type(&declared)
                    .and_then(|ty| self.state.gen_instance(UNDEFINED_LABEL, &ty))
                {
                    Ok(value) => value,
                    Err(_) => {
                        // Unsolved method generic: havoc the argument's own shape.
                        let mut value = self.eval_expr(&arg.value)?;
                        value.set_undefined(ctx);
                        value
                    }
                };
                if sig.name == "extract" {
                    if let Value::Header(_) = &fresh {
                        fresh.header_set_valid(ctx)?;
                    }
                }
                set_var(self.state, &path, fresh)?;
            } else {
                self.eval_expr(&arg.value)?;
            }
        }
        let ret = substitute_type(&sig.return_type, &bindings);
        match self.state.resolve_type(&ret) {
            Ok(Type::Void) => Ok(Value::Void),
            Ok(resolved) => self.state.gen_instance(UNDEFINED_LABEL, &resolved),
            Err(_) => {
                warn!(method = %sig.name, "extern return type unresolved, yielding void");
                Ok(Value::Void)
            }
        }
    }

    /****** tables ******/

    /// Apply a table: the lookup outcome is a pair of solver constants (one
    /// boolean `hit`, one action selector), each action runs in its own fork
    /// merged under "the table chose it", and the caller receives the
    /// synthetic `{hit, miss, action_run}` result.
    fn table_apply(&mut self, table: &TableDecl) -> EvalResult<Value<'ctx>> {
        let ctx = self.ctx();
        for key in &table.keys {
            self.eval_expr(&key.expr)?;
        }

        let hit = Bool::new_const(ctx, format!("{}_hit", table.name));
        let action_var = BV::new_const(ctx, format!("{}_action", table.name), ENUM_WIDTH);
        let action_names: Vec<String> = table.actions.iter().map(|a| a.name.clone()).collect();
        let mut action_run = EnumVal::new(ctx, &format!("{}_action_run", table.name), &action_names);
        action_run.val = action_var.clone();

        for (idx, action) in table.actions.iter().enumerate() {
            let selected = action_var._eq(&BV::from_u64(ctx, idx as u64, ENUM_WIDTH));
            let cond = Bool::and(ctx, &[&hit, &selected]);
            self.run_guarded_action(&action.name, &action.args, &cond)?;
        }
        if let Some(default) = &table.default_action {
            let cond = hit.not();
            self.run_guarded_action(&default.name, &default.args, &cond)?;
        }

        let mut members = MemberMap::new(&table.name);
        members.insert("hit", Value::Scalar(Scalar::Bool(hit.clone())), Type::Bool);
        members.insert("miss", Value::Scalar(Scalar::Bool(hit.not())), Type::Bool);
        let enum_ty = Type::Enum(Arc::new(EnumType {
            name: format!("{}_action_run", table.name),
            members: action_names,
        }));
        members.insert("action_run", Value::Enum(action_run), enum_ty);
        Ok(Value::Struct(StructVal {
            members,
            ty: Type::Name(format!("{}_apply_result", table.name)),
        }))
    }

    fn run_guarded_action(
        &mut self,
        name: &str,
        args: &[Argument],
        cond: &Bool<'ctx>,
    ) -> EvalResult<()> {
        debug!(action = name, "running table action under guard");
        let decl = self.state.get_static_decl(name)?.clone();
        let StaticDecl::Callables(set) = decl else {
            return Err(EvalError::Program(format!("{name} is not an action")));
        };
        let callable = set.resolve(args.len())?.clone();

        let original = self.state.fork_state();
        self.forward_conds.push(cond.clone());
        let result = self.run_callable(&callable, args, true);
        self.forward_conds.pop();
        let action_scopes = self.state.swap_scopes(original);
        result?;
        self.state.merge_state(cond, &action_scopes)
    }

    /****** parsers ******/

    fn run_parser(&mut self, parser: &ParserDecl) -> EvalResult<()> {
        let mut visits = HashMap::new();
        self.run_parser_state(parser, "start", &mut visits)
            .map(|_| ())
    }

    fn run_parser_state(
        &mut self,
        parser: &ParserDecl,
        name: &str,
        visits: &mut HashMap<String, usize>,
    ) -> EvalResult<Flow> {
        if name == "accept" || name == "reject" {
            return Ok(Flow::Continue);
        }
        let count = visits.entry(name.to_string()).or_insert(0);
        *count += 1;
        if *count > PARSER_LOOP_BOUND {
            return Err(EvalError::ParserLoop(name.to_string()));
        }
        let result = self.run_parser_state_body(parser, name, visits);
        if let Some(count) = visits.get_mut(name) {
            *count -= 1;
        }
        result
    }

    fn run_parser_state_body(
        &mut self,
        parser: &ParserDecl,
        name: &str,
        visits: &mut HashMap<String, usize>,
    ) -> EvalResult<Flow> {
        let state_decl = parser
            .state(name)
            .ok_or_else(|| EvalError::UndefinedDecl(name.to_string()))?
            .clone();
        for stmt in &state_decl.body {
            if self.run_stmt(stmt)? == Flow::Interrupt {
                return Ok(Flow::Interrupt);
            }
        }
        match &state_decl.transition {
            Transition::Direct(next) => self.run_parser_state(parser, next, visits),
            Transition::Select { selectors, cases } => {
                let mut selector_values = Vec::with_capacity(selectors.len());
                for selector in selectors {
                    selector_values.push(self.eval_expr(selector)?);
                }
                self.run_select(parser, &selector_values, cases, visits)
            }
        }
    }

    /// Execute the select cases: each matching branch runs in a fork of the
    /// state and is merged back under its match condition. An unmatched
    /// selector falls through to an implicit reject.
    fn run_select(
        &mut self,
        parser: &ParserDecl,
        selectors: &[Value<'ctx>],
        cases: &[SelectCase],
        visits: &mut HashMap<String, usize>,
    ) -> EvalResult<Flow> {
        let Some((case, rest)) = cases.split_first() else {
            return Ok(Flow::Continue);
        };
        if case
            .keyset
            .iter()
            .all(|k| matches!(k, KeySetExpr::Default))
        {
            return self.run_parser_state(parser, &case.next, visits);
        }

        let cond = self.keyset_cond(selectors, &case.keyset)?;
        let original = self.state.fork_state();
        self.forward_conds.push(cond.clone());
        let case_flow = self.run_parser_state(parser, &case.next, visits);
        self.forward_conds.pop();
        let case_scopes = self.state.swap_scopes(original);
        let case_flow = case_flow?;
        let rest_flow = self.run_select(parser, selectors, rest, visits)?;
        self.state.merge_state(&cond, &case_scopes)?;
        Ok(
            if case_flow == Flow::Interrupt && rest_flow == Flow::Interrupt {
                Flow::Interrupt
            } else {
                Flow::Continue
            },
        )
    }

    fn keyset_cond(
        &mut self,
        selectors: &[Value<'ctx>],
        keyset: &[KeySetExpr],
    ) -> EvalResult<Bool<'ctx>> {
        let ctx = self.ctx();
        let mut cond = Bool::from_bool(ctx, true);
        for (selector, key) in selectors.iter().zip(keyset.iter()) {
            let component = match key {
                KeySetExpr::Default => Bool::from_bool(ctx, true),
                KeySetExpr::Expr(expr) => {
                    let key_value = self.eval_expr(expr)?;
                    selector.eq_expr(&key_value, ctx)?
                }
                KeySetExpr::Mask { value, mask } => {
                    let sel = scalar_operand(selector)?;
                    let value = self.eval_scalar(value)?;
                    let mask = self.eval_scalar(mask)?;
                    sel.bit_and(&mask)?.eq_expr(&value.bit_and(&mask)?)?
                }
                KeySetExpr::Range { lo, hi } => {
                    let sel = scalar_operand(selector)?;
                    let lo = self.eval_scalar(lo)?;
                    let hi = self.eval_scalar(hi)?;
                    Bool::and(ctx, &[&lo.le(&sel)?, &sel.le(&hi)?])
                }
            };
            cond = Bool::and(ctx, &[&cond, &component]);
        }
        Ok(cond)
    }
}

/// A scalar view of a value: enum-likes read as their value expression.
fn scalar_operand<'ctx>(value: &Value<'ctx>) -> EvalResult<Scalar<'ctx>> {
    match value {
        Value::Scalar(s) => Ok(s.clone()),
        Value::Enum(e) | Value::SerEnum(e) | Value::Error(e) => {
            Ok(Scalar::bv(e.val.clone(), e.signed))
        }
        other => Err(EvalError::Internal(format!(
            "expected a scalar operand, got {}",
            other.type_name()
        ))),
    }
}

/// Match arguments to parameters: named arguments bind their parameter,
/// positional ones fill the remaining parameters in order.
fn match_args<'a>(params: &[Parameter], args: &'a [Argument]) -> Vec<Option<&'a Argument>> {
    let mut matched: Vec<Option<&Argument>> = vec![None; params.len()];
    for (idx, param) in params.iter().enumerate() {
        if let Some(named) = args
            .iter()
            .find(|a| a.name.as_deref() == Some(param.name.as_str()))
        {
            matched[idx] = Some(named);
        }
    }
    let mut positional = args.iter().filter(|a| a.name.is_none());
    for slot in matched.iter_mut() {
        if slot.is_none() {
            match positional.next() {
                Some(arg) => *slot = Some(arg),
                None => break,
            }
        }
    }
    matched
}

/// Interpret a whole program: fill the root scope, find `main`, dispatch
/// into its package arguments, and return each pipeline's final symbolic
/// state as `(dotted path, expression)` pairs.
pub fn run_program<'ctx>(
    ctx: &'ctx Context,
    program: &Program,
) -> EvalResult<IndexMap<String, Vec<(String, Dynamic<'ctx>)>>> {
    let mut state = ProgState::new(ctx);
    fill::run(&mut state, program)?;

    let main = match state.get_static_decl("main")? {
        StaticDecl::Instance(decl) => decl.clone(),
        _ => return Err(EvalError::Program("main is not a package instance".to_string())),
    };
    let package_ty = state.resolve_type(&main.ty)?;
    let params = match &package_ty {
        Type::Package(p) => p.params.clone(),
        other => {
            return Err(EvalError::Program(format!(
                "main must instantiate a package, found {}",
                other.describe()
            )))
        }
    };

    let matched = match_args(&params, &main.args);
    let mut pipelines = IndexMap::new();
    for (param, arg) in params.iter().zip(matched) {
        let Some(arg) = arg else { continue };
        let value = {
            let mut interp = Interpreter::new(&mut state);
            interp.eval_expr(&arg.value)?
        };
        match value {
            Value::Control(cv) => {
                debug!(pipeline = %param.name, decl = cv.decl.name(), "running pipeline");
                let leaves = run_pipeline(&mut state, &param.name, &cv)?;
                pipelines.insert(param.name.clone(), leaves);
            }
            other => {
                warn!(
                    pipeline = %param.name,
                    kind = other.type_name(),
                    "skipping non-executable package argument"
                );
            }
        }
    }
    Ok(pipelines)
}

/// Run one pipeline with fresh named inputs per apply parameter and flatten
/// its `out`/`inout` parameters afterwards.
fn run_pipeline<'ctx>(
    state: &mut ProgState<'ctx>,
    pipe_name: &str,
    cv: &ControlVal<'ctx>,
) -> EvalResult<Vec<(String, Dynamic<'ctx>)>> {
    let ctx = state.ctx();
    let params = cv.decl.params().to_vec();

    state.push_scope();
    for (name, ty) in &cv.type_bindings {
        state.add_type(name, ty.clone())?;
    }
    for param in &params {
        let declared = substitute_type(&param.ty, &cv.type_bindings);
        let resolved = state.resolve_type(&declared)?;
        let mut value = state.gen_instance(&param.name, &resolved)?;
        let mut id = 0;
        value.bind(&param.name, &mut id, ctx);
        value.propagate_validity(None, ctx);
        state.declare_var(&param.name, value, resolved)?;
    }

    let args: Vec<Argument> = params
        .iter()
        .map(|p| Argument::positional(Expr::path(&p.name)))
        .collect();
    {
        let mut interp = Interpreter::new(state);
        interp.apply_control(cv, &args)?;
    }

    let mut leaves = Vec::new();
    for param in &params {
        if matches!(param.direction, Direction::Out | Direction::InOut) {
            let value = state.get_var(&param.name)?;
            let ty = state.get_var_type(&param.name)?;
            leaves.extend(value.flatten(&param.name, ty, None, ctx)?);
        }
    }
    state.pop_scope();
    debug!(pipeline = pipe_name, leaves = leaves.len(), "pipeline flattened");
    Ok(leaves)
}
