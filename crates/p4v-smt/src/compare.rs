//! Program-state equivalence checking
//!
//! The comparator flattens two interpretations of (supposedly) the same
//! program into parallel expression vectors and asks the solver whether any
//! input can tell them apart. `Equal` means the disequality was unsat over
//! all free constants; a model witnesses a translation bug.

use std::time::Duration;
use tracing::debug;
use z3::ast::{Ast, Bool, Dynamic};
use z3::{Context, Params, SatResult, Solver};

use crate::error::{SmtError, SmtResult};

/// Outcome of one pairwise equivalence check.
#[derive(Debug)]
pub enum CheckOutcome {
    /// The two states are equal for every input
    Equal,
    /// A model separates the states; the string renders the witness
    NotEqual { witness: String },
    /// The solver gave up
    Unknown { reason: String },
}

impl CheckOutcome {
    pub fn is_equal(&self) -> bool {
        matches!(self, CheckOutcome::Equal)
    }
}

/// Equivalence checker with optional solver timeout.
#[derive(Debug, Default)]
pub struct EquivChecker {
    timeout_ms: Option<u64>,
}

impl EquivChecker {
    pub fn new() -> Self {
        Self { timeout_ms: None }
    }

    /// Set the per-query solver timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Check whether two flattened symbolic states are equivalent.
    ///
    /// Leaves are compared positionally, the way successive dumps of the same
    /// program line up. A shape mismatch (different leaf count or sort) is a
    /// translation difference in itself and is reported as `NotEqual`.
    pub fn check<'ctx>(
        &self,
        ctx: &'ctx Context,
        before: &[(String, Dynamic<'ctx>)],
        after: &[(String, Dynamic<'ctx>)],
    ) -> SmtResult<CheckOutcome> {
        if before.len() != after.len() {
            return Ok(CheckOutcome::NotEqual {
                witness: format!(
                    "state shapes differ: {} leaves before, {} after",
                    before.len(),
                    after.len()
                ),
            });
        }

        let mut disequalities = Vec::with_capacity(before.len());
        for ((name_b, expr_b), (name_a, expr_a)) in before.iter().zip(after.iter()) {
            if expr_b.get_sort() != expr_a.get_sort() {
                return Ok(CheckOutcome::NotEqual {
                    witness: format!(
                        "sorts differ at {name_b}/{name_a}: {} vs {}",
                        expr_b.get_sort(),
                        expr_a.get_sort()
                    ),
                });
            }
            disequalities.push(expr_b._eq(expr_a).not());
        }

        if disequalities.is_empty() {
            return Ok(CheckOutcome::Equal);
        }

        let solver = Solver::new(ctx);
        if let Some(ms) = self.timeout_ms {
            let mut params = Params::new(ctx);
            params.set_u32("timeout", ms as u32);
            solver.set_params(&params);
        }

        let refs: Vec<&Bool> = disequalities.iter().collect();
        solver.assert(&Bool::or(ctx, &refs));
        debug!(leaves = before.len(), "checking state equivalence");

        match solver.check() {
            SatResult::Unsat => Ok(CheckOutcome::Equal),
            SatResult::Sat => {
                let model = solver.get_model().ok_or(SmtError::ModelUnavailable)?;
                Ok(CheckOutcome::NotEqual {
                    witness: model.to_string(),
                })
            }
            SatResult::Unknown => {
                let reason = solver
                    .get_reason_unknown()
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(CheckOutcome::Unknown { reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use z3::ast::BV;
    use z3::Config;

    fn leaf<'ctx>(name: &str, expr: BV<'ctx>) -> (String, Dynamic<'ctx>) {
        (name.to_string(), Dynamic::from_ast(&expr))
    }

    #[test]
    fn identical_states_are_equal() {
        let ctx = Context::new(&Config::new());
        let x = BV::new_const(&ctx, "x", 8);
        let before = vec![leaf("p.x", x.bvadd(&BV::from_u64(&ctx, 1, 8)))];
        let after = vec![leaf("p.x", BV::from_u64(&ctx, 1, 8).bvadd(&x))];
        let outcome = EquivChecker::new().check(&ctx, &before, &after).unwrap();
        assert!(outcome.is_equal());
    }

    #[test]
    fn differing_states_produce_a_witness() {
        let ctx = Context::new(&Config::new());
        let x = BV::new_const(&ctx, "x", 8);
        let before = vec![leaf("p.x", x.clone())];
        let after = vec![leaf("p.x", x.bvadd(&BV::from_u64(&ctx, 1, 8)))];
        let outcome = EquivChecker::new().check(&ctx, &before, &after).unwrap();
        assert!(matches!(outcome, CheckOutcome::NotEqual { .. }));
    }

    #[test]
    fn shape_mismatch_is_not_equal() {
        let ctx = Context::new(&Config::new());
        let x = BV::new_const(&ctx, "x", 8);
        let before = vec![leaf("p.x", x.clone()), leaf("p.y", x.clone())];
        let after = vec![leaf("p.x", x)];
        let outcome = EquivChecker::new().check(&ctx, &before, &after).unwrap();
        assert!(matches!(outcome, CheckOutcome::NotEqual { .. }));
    }

    #[test]
    fn sort_mismatch_is_not_equal() {
        let ctx = Context::new(&Config::new());
        let before = vec![leaf("p.x", BV::new_const(&ctx, "x", 8))];
        let after = vec![leaf("p.x", BV::new_const(&ctx, "x16", 16))];
        let outcome = EquivChecker::new().check(&ctx, &before, &after).unwrap();
        assert!(matches!(outcome, CheckOutcome::NotEqual { .. }));
    }

    #[test]
    fn empty_states_are_equal() {
        let ctx = Context::new(&Config::new());
        let outcome = EquivChecker::new().check(&ctx, &[], &[]).unwrap();
        assert!(outcome.is_equal());
    }
}
