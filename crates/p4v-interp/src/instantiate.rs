//! Generic instantiation
//!
//! Controls, parsers, and packages may be declared over type variables.
//! Instantiation zips the parameter list with the supplied arguments and
//! solves each type variable from the runtime type of its argument, looking
//! through name aliases. The resulting substitution travels with the
//! instance and is installed as scope aliases when it is applied, so body
//! types resolve lazily through the alias table. A variable no argument
//! determines is a fatal error.

use indexmap::IndexMap;

use p4v_ir::{Parameter, Type};

use crate::error::{EvalError, EvalResult};
use crate::scope::ProgState;

/// Solve the type variables of a declaration from the runtime types of its
/// arguments. `args` pairs each parameter index with the resolved type of
/// the argument bound to it.
pub fn solve_type_bindings(
    state: &ProgState,
    type_params: &[String],
    params: &[Parameter],
    args: &[(usize, Type)],
) -> EvalResult<IndexMap<String, Type>> {
    let mut bindings = IndexMap::new();
    if type_params.is_empty() {
        return Ok(bindings);
    }
    for (param_idx, arg_ty) in args {
        let Some(param) = params.get(*param_idx) else {
            continue;
        };
        if let Type::Name(var) = &param.ty {
            if type_params.contains(var) && !bindings.contains_key(var) {
                let concrete = state.resolve_type(arg_ty).unwrap_or_else(|_| arg_ty.clone());
                bindings.insert(var.clone(), concrete);
            }
        }
    }
    for var in type_params {
        if !bindings.contains_key(var) {
            return Err(EvalError::UnsolvedTypeVar(var.clone()));
        }
    }
    Ok(bindings)
}

/// Rewrite type-variable references in a type through a substitution map.
/// Named references to anything else pass through untouched; they resolve
/// later via the scope's alias table.
pub fn substitute_type(ty: &Type, bindings: &IndexMap<String, Type>) -> Type {
    if bindings.is_empty() {
        return ty.clone();
    }
    match ty {
        Type::Name(name) => match bindings.get(name) {
            Some(concrete) => concrete.clone(),
            None => ty.clone(),
        },
        Type::Stack { element, size } => Type::Stack {
            element: Box::new(substitute_type(element, bindings)),
            size: *size,
        },
        Type::List(items) => Type::List(
            items
                .iter()
                .map(|item| substitute_type(item, bindings))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p4v_ir::Direction;
    use z3::{Config, Context};

    #[test]
    fn type_variables_solve_from_argument_types() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let state = ProgState::new(&ctx);
        let params = vec![
            Parameter::new("hdr", Direction::InOut, Type::Name("H".to_string())),
            Parameter::new("port", Direction::In, Type::bits(9)),
        ];
        let args = vec![(0usize, Type::bits(32)), (1usize, Type::bits(9))];
        let bindings =
            solve_type_bindings(&state, &["H".to_string()], &params, &args).unwrap();
        assert_eq!(bindings.get("H"), Some(&Type::bits(32)));
    }

    #[test]
    fn unsolved_type_variable_is_fatal() {
        let cfg = Config::new();
        let ctx = Context::new(&cfg);
        let state = ProgState::new(&ctx);
        let params = vec![Parameter::new("port", Direction::In, Type::bits(9))];
        let args = vec![(0usize, Type::bits(9))];
        let err =
            solve_type_bindings(&state, &["M".to_string()], &params, &args).unwrap_err();
        assert!(matches!(err, EvalError::UnsolvedTypeVar(v) if v == "M"));
    }

    #[test]
    fn substitution_rewrites_nested_stacks() {
        let mut bindings = IndexMap::new();
        bindings.insert("T".to_string(), Type::bits(16));
        let stack = Type::Stack {
            element: Box::new(Type::Name("T".to_string())),
            size: 4,
        };
        let rewritten = substitute_type(&stack, &bindings);
        assert_eq!(
            rewritten,
            Type::Stack {
                element: Box::new(Type::bits(16)),
                size: 4
            }
        );
        // Unrelated names pass through.
        let other = substitute_type(&Type::Name("U".to_string()), &bindings);
        assert_eq!(other, Type::Name("U".to_string()));
    }
}
