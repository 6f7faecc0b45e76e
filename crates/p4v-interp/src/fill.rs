//! Type-fill pass
//!
//! The first walk over the program: registers type declarations, binds
//! constants, variables, instances, tables, actions, and functions into the
//! current scope, and canonicalizes bitwidths whose width is an expression.
//! Canonicalization evaluates the width under a read-only interpreter and
//! registers a rewritten copy; the input AST is never mutated.
//!
//! Enum-like declarations union into an existing instance of the same name
//! instead of redeclaring, which is how user `error` declarations extend the
//! prebuilt namespace.

use indexmap::IndexMap;
use std::sync::Arc;
use tracing::debug;

use p4v_ir::{Declaration, PipelineType, Program, StructType, Type};
use p4v_smt::{SmtError, UNDEFINED_LABEL};

use crate::error::{EvalError, EvalResult};
use crate::interp::Interpreter;
use crate::scope::ProgState;
use crate::value::{
    Callable, ControlVal, EnumVal, ExternVal, OverloadSet, PipelineRef, StaticDecl, Value,
};

/// Populate the root scope from a program's top-level declarations.
pub fn run<'ctx>(state: &mut ProgState<'ctx>, program: &Program) -> EvalResult<()> {
    for decl in &program.declarations {
        fill_declaration(state, decl)?;
    }
    Ok(())
}

/// Process one declaration; also used for control/parser locals.
pub fn fill_declaration<'ctx>(state: &mut ProgState<'ctx>, decl: &Declaration) -> EvalResult<()> {
    match decl {
        Declaration::Struct(s) => {
            let folded = fold_struct(state, s)?;
            state.add_type(&s.name, Type::Struct(folded))
        }
        Declaration::Header(h) => {
            let folded = fold_struct(state, h)?;
            state.add_type(&h.name, Type::Header(folded))
        }
        Declaration::HeaderUnion(u) => {
            let folded = fold_struct(state, u)?;
            state.add_type(&u.name, Type::HeaderUnion(folded))
        }
        Declaration::Enum(e) => {
            if union_into_existing(state, &e.name, &e.members)? {
                return Ok(());
            }
            state.add_type(&e.name, Type::Enum(e.clone()))?;
            let value = Value::Enum(EnumVal::new(state.ctx(), &e.name, &e.members));
            state.declare_var(&e.name, value, Type::Enum(e.clone()))
        }
        Declaration::Error(e) => {
            if union_into_existing(state, &e.name, &e.members)? {
                return Ok(());
            }
            state.add_type(&e.name, Type::Error(e.clone()))?;
            let value = Value::Error(EnumVal::new(state.ctx(), &e.name, &e.members));
            state.declare_var(&e.name, value, Type::Error(e.clone()))
        }
        Declaration::SerEnum(se) => {
            let member_names: Vec<String> =
                se.members.iter().map(|(name, _)| name.clone()).collect();
            if union_into_existing(state, &se.name, &member_names)? {
                return Ok(());
            }
            let folded_underlying = fold_type(state, &se.underlying)?;
            let underlying = state.resolve_type(&folded_underlying)?;
            let (width, signed) = match underlying {
                Type::Bits { width, signed } => (width, signed),
                other => {
                    return Err(EvalError::Unsupported(format!(
                        "serializable enum over {}",
                        other.describe()
                    )))
                }
            };
            let ctx = state.ctx();
            let mut instance = EnumVal::new(ctx, &se.name, &[]);
            instance.width = width;
            instance.signed = signed;
            instance.val = z3::ast::BV::fresh_const(ctx, UNDEFINED_LABEL, width);
            for (name, expr) in &se.members {
                let value = {
                    let mut interp = Interpreter::new(state);
                    interp.eval_expr(expr)?
                };
                let scalar = value.as_scalar()?;
                let bv = p4v_smt::align_to_width(scalar, width)?;
                instance.members.insert(name.clone(), bv);
            }
            state.add_type(&se.name, Type::SerEnum(se.clone()))?;
            state.declare_var(&se.name, Value::SerEnum(instance), Type::SerEnum(se.clone()))
        }
        Declaration::Extern(e) => state.add_type(&e.name, Type::Extern(e.clone())),
        Declaration::Typedef { name, ty } | Declaration::Newtype { name, ty } => {
            let folded = fold_type(state, ty)?;
            let resolved = state.resolve_type(&folded)?;
            state.add_type(name, resolved)
        }
        Declaration::Package(p) => state.add_type(&p.name, Type::Package(p.clone())),
        Declaration::ParserType(p) => state.add_type(&p.name, Type::ParserType(p.clone())),
        Declaration::ControlType(c) => state.add_type(&c.name, Type::ControlType(c.clone())),
        Declaration::Parser(p) => {
            // A parser declaration is both a type and an instantiable value.
            let signature = Type::ParserType(Arc::new(PipelineType {
                name: p.name.clone(),
                type_params: p.type_params.clone(),
                params: p.params.clone(),
            }));
            state.add_type(&p.name, signature.clone())?;
            let instance = ControlVal {
                decl: PipelineRef::Parser(p.clone()),
                const_args: IndexMap::new(),
                type_bindings: IndexMap::new(),
            };
            state.declare_var(&p.name, Value::Control(Box::new(instance)), signature)
        }
        Declaration::Control(c) => {
            let signature = Type::ControlType(Arc::new(PipelineType {
                name: c.name.clone(),
                type_params: c.type_params.clone(),
                params: c.params.clone(),
            }));
            state.add_type(&c.name, signature.clone())?;
            let instance = ControlVal {
                decl: PipelineRef::Control(c.clone()),
                const_args: IndexMap::new(),
                type_bindings: IndexMap::new(),
            };
            state.declare_var(&c.name, Value::Control(Box::new(instance)), signature)
        }
        Declaration::Constant(v) | Declaration::Variable(v) => {
            let folded = fold_type(state, &v.ty)?;
            let resolved = state.resolve_type(&folded)?;
            let value = match &v.init {
                Some(init) => {
                    let evaluated = {
                        let mut interp = Interpreter::new(state);
                        interp.eval_expr(init)?
                    };
                    state.cast_value(&evaluated, &resolved)?
                }
                None => state.gen_instance(UNDEFINED_LABEL, &resolved)?,
            };
            state.declare_var(&v.name, value, resolved)
        }
        Declaration::Instance(decl) => {
            let resolved = state.resolve_type(&decl.ty)?;
            if decl.name == "main" || matches!(resolved, Type::Package(_)) {
                // Packages are dispatched later, not executed here.
                state.declare_static_decl(&decl.name, StaticDecl::Instance(decl.clone()));
                Ok(())
            } else if let Type::Extern(e) = &resolved {
                state.declare_var(
                    &decl.name,
                    Value::Extern(ExternVal { ty: e.clone() }),
                    resolved.clone(),
                )
            } else if matches!(resolved, Type::ParserType(_) | Type::ControlType(_)) {
                let pipeline = pipeline_ref_from_type(state, &decl.ty)?;
                let instance = {
                    let mut interp = Interpreter::new(state);
                    interp.instantiate_pipeline(pipeline, &decl.args)?
                };
                state.declare_var(&decl.name, Value::Control(Box::new(instance)), resolved)
            } else {
                Err(EvalError::Unsupported(format!(
                    "instantiation of {}",
                    resolved.describe()
                )))
            }
        }
        Declaration::Action(a) => {
            state.declare_static_decl(
                &a.name,
                StaticDecl::Callables(OverloadSet::single(&a.name, Callable::Action(a.clone()))),
            );
            Ok(())
        }
        Declaration::Function(f) => {
            state.declare_static_decl(
                &f.name,
                StaticDecl::Callables(OverloadSet::single(&f.name, Callable::Function(f.clone()))),
            );
            Ok(())
        }
        Declaration::Method(m) => {
            state.declare_static_decl(
                &m.name,
                StaticDecl::Callables(OverloadSet::single(&m.name, Callable::Method(m.clone()))),
            );
            Ok(())
        }
        Declaration::Table(t) => {
            state.declare_static_decl(&t.name, StaticDecl::Table(t.clone()));
            Ok(())
        }
        Declaration::ValueSet { name, element } => {
            let folded = fold_type(state, element)?;
            let resolved = state.resolve_type(&folded)?;
            let value = state.gen_instance(name, &resolved)?;
            state.declare_var(name, value, resolved)
        }
        Declaration::MatchKind(kinds) => {
            debug!(?kinds, "ignoring match_kind declaration");
            Ok(())
        }
    }
}

/// Union new members into an existing enum-like instance of the same name.
/// Returns false when no instance exists yet.
fn union_into_existing<'ctx>(
    state: &mut ProgState<'ctx>,
    name: &str,
    members: &[String],
) -> EvalResult<bool> {
    let ctx = state.ctx();
    match state.find_var_mut(name) {
        Some((Value::Enum(e), _)) | Some((Value::Error(e), _)) | Some((Value::SerEnum(e), _)) => {
            for member in members {
                e.add_member(ctx, member);
            }
            Ok(true)
        }
        Some(_) => Err(EvalError::Program(format!(
            "{name} is already declared and is not an enum"
        ))),
        None => Ok(false),
    }
}

/// Resolve a named parser/control to its declaration.
fn pipeline_ref_from_type(state: &ProgState, ty: &Type) -> EvalResult<PipelineRef> {
    match ty {
        Type::Name(name) => match state.get_var(name)? {
            Value::Control(cv) => Ok(cv.decl.clone()),
            other => Err(EvalError::Program(format!(
                "{name} names a {}, not a parser or control",
                other.type_name()
            ))),
        },
        other => Err(EvalError::Unsupported(format!(
            "anonymous pipeline type {}",
            other.describe()
        ))),
    }
}

/// Canonicalize expression-valued bitwidths to literal widths, recursively.
/// The rewritten type is a copy; the AST keeps its original form.
pub fn fold_type<'ctx>(state: &mut ProgState<'ctx>, ty: &Type) -> EvalResult<Type> {
    match ty {
        Type::BitsExpr { expr, signed } => {
            let value = {
                let mut interp = Interpreter::new(state);
                interp.eval_expr(expr)?
            };
            let width = value
                .as_scalar()?
                .as_const_u64()
                .ok_or(SmtError::NonConstant { what: "bit width" })?;
            Ok(Type::Bits {
                width: width as u32,
                signed: *signed,
            })
        }
        Type::Stack { element, size } => Ok(Type::Stack {
            element: Box::new(fold_type(state, element)?),
            size: *size,
        }),
        Type::List(items) => Ok(Type::List(
            items
                .iter()
                .map(|item| fold_type(state, item))
                .collect::<EvalResult<Vec<_>>>()?,
        )),
        Type::Struct(s) => Ok(Type::Struct(fold_struct(state, s)?)),
        Type::Header(h) => Ok(Type::Header(fold_struct(state, h)?)),
        Type::HeaderUnion(u) => Ok(Type::HeaderUnion(fold_struct(state, u)?)),
        other => Ok(other.clone()),
    }
}

fn fold_struct<'ctx>(
    state: &mut ProgState<'ctx>,
    decl: &Arc<StructType>,
) -> EvalResult<Arc<StructType>> {
    let mut changed = false;
    let mut fields = Vec::with_capacity(decl.fields.len());
    for field in &decl.fields {
        let folded = fold_type(state, &field.ty)?;
        if folded != field.ty {
            changed = true;
        }
        fields.push(p4v_ir::StructField {
            name: field.name.clone(),
            ty: folded,
        });
    }
    if changed {
        Ok(Arc::new(StructType {
            name: decl.name.clone(),
            fields,
        }))
    } else {
        Ok(decl.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p4v_ir::{CallableDecl, EnumType, Expr, Parameter, StructField, VarDecl};
    use z3::{Config, Context};

    fn program(declarations: Vec<Declaration>) -> Program {
        Program { declarations }
    }

    #[test]
    fn expression_widths_fold_to_literals() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        // const int W = 4; header H { bit<(W + W)> a; }
        run(
            &mut state,
            &program(vec![
                Declaration::Constant(Arc::new(VarDecl {
                    name: "W".to_string(),
                    ty: Type::Int,
                    init: Some(Expr::int(4)),
                })),
                Declaration::Header(Arc::new(StructType {
                    name: "H".to_string(),
                    fields: vec![StructField {
                        name: "a".to_string(),
                        ty: Type::BitsExpr {
                            expr: Box::new(Expr::binary(
                                p4v_ir::BinOp::Add,
                                Expr::path("W"),
                                Expr::path("W"),
                            )),
                            signed: false,
                        },
                    }],
                })),
            ]),
        )
        .unwrap();

        let folded = state.get_type("H").unwrap().clone();
        let Type::Header(decl) = folded else {
            panic!("expected header type");
        };
        assert_eq!(decl.fields[0].ty, Type::bits(8));
    }

    #[test]
    fn user_errors_union_into_the_prebuilt_namespace() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        run(
            &mut state,
            &program(vec![Declaration::Error(Arc::new(EnumType {
                name: "error".to_string(),
                members: vec!["BadChecksum".to_string()],
            }))]),
        )
        .unwrap();

        let Value::Error(errors) = state.get_var("error").unwrap() else {
            panic!("expected error namespace");
        };
        assert!(errors.members.contains_key("NoError"));
        assert!(errors.members.contains_key("BadChecksum"));
    }

    #[test]
    fn repeated_declaration_extends_the_overload_set() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        let f = |params: Vec<Parameter>| {
            Declaration::Function(Arc::new(CallableDecl {
                name: "min".to_string(),
                return_type: Type::bits(8),
                params,
                body: p4v_ir::BlockStatement::new(vec![]),
            }))
        };
        run(
            &mut state,
            &program(vec![
                f(vec![Parameter::new(
                    "a",
                    p4v_ir::Direction::In,
                    Type::bits(8),
                )]),
                f(vec![
                    Parameter::new("a", p4v_ir::Direction::In, Type::bits(8)),
                    Parameter::new("b", p4v_ir::Direction::In, Type::bits(8)),
                ]),
            ]),
        )
        .unwrap();

        let StaticDecl::Callables(set) = state.get_static_decl("min").unwrap() else {
            panic!("expected callables");
        };
        assert_eq!(set.candidates.len(), 2);
        assert!(set.resolve(1).is_ok());
        assert!(set.resolve(2).is_ok());
    }

    #[test]
    fn constants_cast_to_their_declared_type() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let mut state = ProgState::new(&ctx);
        run(
            &mut state,
            &program(vec![Declaration::Constant(Arc::new(VarDecl {
                name: "PORT".to_string(),
                ty: Type::bits(9),
                init: Some(Expr::int(511)),
            }))]),
        )
        .unwrap();

        let value = state.get_var("PORT").unwrap();
        assert!(matches!(
            value,
            Value::Scalar(p4v_smt::Scalar::Bv { .. })
        ));
    }
}
