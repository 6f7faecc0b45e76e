//! L-value resolution and symbolic write-back
//!
//! Assignments decompose their left-hand side into a [`MemberPath`]: the root
//! variable name, a chain of mid selectors replayed from the root outward,
//! and a terminal selector. A selector is either a field name or an index
//! expression; a symbolic index over a stack of size N turns the single
//! assignment into N guarded writes `field := ite(guard, cast(rval), field)`,
//! leaving every slot the index does not select untouched.

use z3::ast::{Ast, Bool};

use p4v_smt::Scalar;

use crate::error::{EvalError, EvalResult};
use crate::scope::{index_matches, ProgState};
use crate::value::Value;

/// One access step of an l-value.
#[derive(Debug, Clone)]
pub enum Selector<'ctx> {
    Field(String),
    Index(Scalar<'ctx>),
}

/// A decomposed l-value.
#[derive(Debug, Clone)]
pub struct MemberPath<'ctx> {
    /// The root variable
    pub root: String,
    /// Selectors between the root and the terminal access, stored outermost
    /// first; replayed in reverse to walk from the root outward
    pub mids: Vec<Selector<'ctx>>,
    /// The final access written to; absent for a bare variable
    pub target: Option<Selector<'ctx>>,
    /// Whether any selector indexes into a header stack
    pub has_stack: bool,
}

impl<'ctx> MemberPath<'ctx> {
    pub fn flat(root: &str) -> Self {
        MemberPath {
            root: root.to_string(),
            mids: Vec::new(),
            target: None,
            has_stack: false,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.target.is_none()
    }
}

/// Write `rval` to the location described by `path`.
///
/// A flat path rebinds the variable. Otherwise the root value is detached,
/// rewritten along the selector chain (casting to the declared field type at
/// the terminal), and restored. Guards accumulate only where a symbolic index
/// fans the write out across stack slots.
pub fn set_var<'ctx>(
    state: &mut ProgState<'ctx>,
    path: &MemberPath<'ctx>,
    rval: Value<'ctx>,
) -> EvalResult<()> {
    if path.is_flat() {
        return state.update_var(&path.root, rval);
    }
    let (handle, mut root) = state.take_var(&path.root)?;
    let target = path
        .target
        .as_ref()
        .ok_or_else(|| EvalError::Internal("member path without target".to_string()))?;
    let mids: Vec<&Selector<'ctx>> = path.mids.iter().rev().collect();
    let result = write_member(state, &mut root, &mids, target, None, &rval);
    state.restore_var(handle, &path.root, root);
    result
}

/// Recursive descent along the mid selectors, then the terminal write.
fn write_member<'ctx>(
    state: &ProgState<'ctx>,
    parent: &mut Value<'ctx>,
    mids: &[&Selector<'ctx>],
    target: &Selector<'ctx>,
    guard: Option<Bool<'ctx>>,
    rval: &Value<'ctx>,
) -> EvalResult<()> {
    match mids.split_first() {
        None => write_terminal(state, parent, target, guard, rval),
        Some((Selector::Field(name), rest)) => {
            let child = parent.member_mut(name)?;
            write_member(state, child, rest, target, guard, rval)
        }
        Some((Selector::Index(index), rest)) => {
            if let Some(idx) = index.as_const_u64() {
                let child = parent.member_mut(&idx.to_string())?;
                return write_member(state, child, rest, target, guard, rval);
            }
            let size = stack_size(parent)?;
            for idx in 0..size {
                let cond = index_matches(index, idx)?;
                let slot_guard = conjoin(&guard, &cond);
                let child = parent.member_mut(&idx.to_string())?;
                write_member(state, child, rest, target, Some(slot_guard), rval)?;
            }
            Ok(())
        }
    }
}

/// The terminal access: cast to the declared member type, and when a guard
/// is present keep the old value where the guard fails.
fn write_terminal<'ctx>(
    state: &ProgState<'ctx>,
    parent: &mut Value<'ctx>,
    target: &Selector<'ctx>,
    guard: Option<Bool<'ctx>>,
    rval: &Value<'ctx>,
) -> EvalResult<()> {
    match target {
        Selector::Field(name) => write_field(state, parent, name, guard, rval),
        Selector::Index(index) => {
            if let Some(idx) = index.as_const_u64() {
                return write_field(state, parent, &idx.to_string(), guard, rval);
            }
            let size = stack_size(parent)?;
            for idx in 0..size {
                let cond = index_matches(index, idx)?;
                let slot_guard = conjoin(&guard, &cond);
                write_field(state, parent, &idx.to_string(), Some(slot_guard), rval)?;
            }
            Ok(())
        }
    }
}

fn write_field<'ctx>(
    state: &ProgState<'ctx>,
    parent: &mut Value<'ctx>,
    name: &str,
    guard: Option<Bool<'ctx>>,
    rval: &Value<'ctx>,
) -> EvalResult<()> {
    let field_ty = parent.member_type(name)?;
    let mut cast = state.cast_value(rval, &field_ty)?;
    let slot = parent.member_mut(name)?;
    if let Some(guard) = guard {
        // Where the guard fails the field keeps its current value.
        cast.merge(&guard.not(), slot)?;
    }
    *slot = cast;
    Ok(())
}

fn stack_size(parent: &Value) -> EvalResult<u64> {
    match parent {
        Value::Stack(s) => Ok(s.size),
        other => Err(EvalError::Unsupported(format!(
            "symbolic index into {}",
            other.type_name()
        ))),
    }
}

fn conjoin<'ctx>(guard: &Option<Bool<'ctx>>, cond: &Bool<'ctx>) -> Bool<'ctx> {
    match guard {
        Some(g) => Bool::and(cond.get_ctx(), &[g, cond]),
        None => cond.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p4v_ir::{StructField, StructType, Type};
    use p4v_smt::Scalar;
    use std::sync::Arc;
    use z3::ast::{Ast, BV};
    use z3::{Config, Context, SatResult, Solver};

    fn assert_valid(ctx: &Context, expr: &Bool) {
        let solver = Solver::new(ctx);
        solver.assert(&expr.not());
        assert_eq!(solver.check(), SatResult::Unsat);
    }

    fn header_ty() -> Type {
        Type::Header(Arc::new(StructType {
            name: "H".to_string(),
            fields: vec![StructField {
                name: "a".to_string(),
                ty: Type::bits(8),
            }],
        }))
    }

    #[test]
    fn flat_write_rebinds_the_variable() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        state.push_scope();
        state
            .declare_var(
                "x",
                Value::Scalar(Scalar::unsigned(BV::from_u64(&ctx, 0, 8))),
                Type::bits(8),
            )
            .unwrap();

        let path = MemberPath::flat("x");
        set_var(
            &mut state,
            &path,
            Value::Scalar(Scalar::unsigned(BV::from_u64(&ctx, 9, 8))),
        )
        .unwrap();

        let x = state.get_var("x").unwrap().clone();
        let eq = x
            .as_scalar()
            .unwrap()
            .eq_expr(&Scalar::unsigned(BV::from_u64(&ctx, 9, 8)))
            .unwrap();
        assert_valid(&ctx, &eq);
    }

    #[test]
    fn nested_write_casts_to_the_field_type() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        state.push_scope();
        let h = state.gen_instance("h", &header_ty()).unwrap();
        state.declare_var("h", h, header_ty()).unwrap();

        // h.a = 16w0x1FF  -- must narrow to 8 bits
        let path = MemberPath {
            root: "h".to_string(),
            mids: vec![],
            target: Some(Selector::Field("a".to_string())),
            has_stack: false,
        };
        set_var(
            &mut state,
            &path,
            Value::Scalar(Scalar::unsigned(BV::from_u64(&ctx, 0x1FF, 16))),
        )
        .unwrap();

        let a = state
            .get_var("h")
            .unwrap()
            .get_member("a", &ctx)
            .unwrap();
        let eq = a
            .as_scalar()
            .unwrap()
            .eq_expr(&Scalar::unsigned(BV::from_u64(&ctx, 0xFF, 8)))
            .unwrap();
        assert_valid(&ctx, &eq);
    }

    #[test]
    fn symbolic_stack_write_fans_out_guarded() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        state.add_type("H", header_ty()).unwrap();
        state.push_scope();
        let stack_ty = Type::Stack {
            element: Box::new(Type::Name("H".to_string())),
            size: 2,
        };
        let stk = state.gen_instance("stk", &stack_ty).unwrap();
        state.declare_var("stk", stk, stack_ty).unwrap();

        // stk[i].a = 7 with a symbolic one-bit index
        let index = Scalar::unsigned(BV::new_const(&ctx, "i", 1));
        let path = MemberPath {
            root: "stk".to_string(),
            mids: vec![Selector::Index(index.clone())],
            target: Some(Selector::Field("a".to_string())),
            has_stack: true,
        };
        set_var(
            &mut state,
            &path,
            Value::Scalar(Scalar::unsigned(BV::from_u64(&ctx, 7, 8))),
        )
        .unwrap();

        let stk = state.get_var("stk").unwrap().clone();
        for slot in 0..2u64 {
            let field = stk
                .get_member(&slot.to_string(), &ctx)
                .unwrap()
                .get_member("a", &ctx)
                .unwrap();
            let selected = index
                .eq_expr(&Scalar::unsigned(BV::from_u64(&ctx, slot, 1)))
                .unwrap();
            let is_seven = field
                .as_scalar()
                .unwrap()
                .eq_expr(&Scalar::unsigned(BV::from_u64(&ctx, 7, 8)))
                .unwrap();
            // Each slot j reads ite(i == j, 7, old): selection forces 7.
            assert_valid(&ctx, &selected.implies(&is_seven));
        }
    }

    #[test]
    fn constant_index_writes_one_slot() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        state.add_type("H", header_ty()).unwrap();
        state.push_scope();
        let stack_ty = Type::Stack {
            element: Box::new(Type::Name("H".to_string())),
            size: 2,
        };
        let stk = state.gen_instance("stk", &stack_ty).unwrap();
        state.declare_var("stk", stk, stack_ty).unwrap();

        let path = MemberPath {
            root: "stk".to_string(),
            mids: vec![Selector::Index(Scalar::unsigned(BV::from_u64(&ctx, 1, 1)))],
            target: Some(Selector::Field("a".to_string())),
            has_stack: true,
        };
        set_var(
            &mut state,
            &path,
            Value::Scalar(Scalar::unsigned(BV::from_u64(&ctx, 5, 8))),
        )
        .unwrap();

        let stk = state.get_var("stk").unwrap().clone();
        let written = stk
            .get_member("1", &ctx)
            .unwrap()
            .get_member("a", &ctx)
            .unwrap();
        let eq = written
            .as_scalar()
            .unwrap()
            .eq_expr(&Scalar::unsigned(BV::from_u64(&ctx, 5, 8)))
            .unwrap();
        assert_valid(&ctx, &eq);
    }
}
