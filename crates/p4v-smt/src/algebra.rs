//! Scalar expression algebra over Z3
//!
//! This module is the semantic layer between P4 operators and the solver: a
//! [`Scalar`] is a bitvector with a signedness flag, a boolean, or an
//! unbounded integer, and every P4 scalar operator is a pure function on
//! scalars returning a new expression.
//!
//! Alignment rules: in a binary operation the unbounded-integer operand is
//! narrowed to its bitvector partner's sort; two bitvectors are aligned to the
//! left operand's sort (zero-extend shorter, truncate longer). Shifts align to
//! the wider sort and truncate the result back to the left operand's sort.

use num_bigint::BigInt;
use num_traits::One;
use z3::ast::{Ast, Bool, Dynamic, Int, BV};
use z3::Context;

use crate::error::{SmtError, SmtResult};

/// Fresh-constant prefix for values that were never assigned.
pub const UNDEFINED_LABEL: &str = "undefined";
/// Fresh-constant prefix for reads gated by a false header validity.
pub const INVALID_LABEL: &str = "invalid";

/// A scalar symbolic value.
#[derive(Debug, Clone)]
pub enum Scalar<'ctx> {
    /// A fixed-width bitvector with P4 signedness
    Bv { expr: BV<'ctx>, signed: bool },
    /// A boolean
    Bool(Bool<'ctx>),
    /// A mathematically unbounded integer; has no width until cast
    Int(Int<'ctx>),
}

/// Coerce an expression onto a bitvector sort of `width` bits: integers go
/// through `int2bv`, shorter vectors are zero-extended, longer ones keep
/// their low bits.
pub fn align_to_width<'ctx>(scalar: &Scalar<'ctx>, width: u32) -> SmtResult<BV<'ctx>> {
    match scalar {
        Scalar::Int(i) => Ok(BV::from_int(i, width).simplify()),
        Scalar::Bv { expr, .. } => {
            let size = expr.get_size();
            if size < width {
                Ok(expr.zero_ext(width - size))
            } else if size > width {
                Ok(expr.extract(width - 1, 0))
            } else {
                Ok(expr.clone())
            }
        }
        Scalar::Bool(_) => Err(SmtError::UnsupportedCast {
            from: "bool".to_string(),
            to: format!("bit<{}>", width),
        }),
    }
}

/// The all-ones value of a `width`-bit vector, `2^width - 1`.
fn max_bv<'ctx>(ctx: &'ctx Context, width: u32) -> BV<'ctx> {
    let bound = (BigInt::one() << width) - 1;
    BV::from_big_int(ctx, &bound, width)
}

impl<'ctx> Scalar<'ctx> {
    pub fn bv(expr: BV<'ctx>, signed: bool) -> Scalar<'ctx> {
        Scalar::Bv { expr, signed }
    }

    pub fn unsigned(expr: BV<'ctx>) -> Scalar<'ctx> {
        Scalar::Bv {
            expr,
            signed: false,
        }
    }

    /// A fresh unconstrained value of the same sort, used for havocking.
    pub fn havoc(&self, prefix: &str) -> Scalar<'ctx> {
        match self {
            Scalar::Bv { expr, signed } => Scalar::Bv {
                expr: BV::fresh_const(expr.get_ctx(), prefix, expr.get_size()),
                signed: *signed,
            },
            Scalar::Bool(b) => Scalar::Bool(Bool::fresh_const(b.get_ctx(), prefix)),
            Scalar::Int(i) => Scalar::Int(Int::fresh_const(i.get_ctx(), prefix)),
        }
    }

    /// Sort label used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Scalar::Bv { expr, signed } => {
                if *signed {
                    format!("int<{}>", expr.get_size())
                } else {
                    format!("bit<{}>", expr.get_size())
                }
            }
            Scalar::Bool(_) => "bool".to_string(),
            Scalar::Int(_) => "int".to_string(),
        }
    }

    pub fn as_dynamic(&self) -> Dynamic<'ctx> {
        match self {
            Scalar::Bv { expr, .. } => Dynamic::from_ast(expr),
            Scalar::Bool(b) => Dynamic::from_ast(b),
            Scalar::Int(i) => Dynamic::from_ast(i),
        }
    }

    /// The constant value of this scalar, if the simplifier can produce one.
    pub fn as_const_u64(&self) -> Option<u64> {
        match self {
            Scalar::Bv { expr, .. } => expr.simplify().as_u64(),
            Scalar::Int(i) => i.simplify().as_u64(),
            Scalar::Bool(_) => None,
        }
    }

    fn unsupported(&self, op: &'static str, other: &Scalar<'ctx>) -> SmtError {
        SmtError::UnsupportedOp {
            op,
            left: self.describe(),
            right: other.describe(),
        }
    }

    /****** unary operators ******/

    pub fn neg(&self) -> SmtResult<Scalar<'ctx>> {
        match self {
            Scalar::Bv { expr, signed } => Ok(Scalar::bv(expr.bvneg(), *signed)),
            Scalar::Int(i) => Ok(Scalar::Int(i.unary_minus())),
            Scalar::Bool(_) => Err(self.unsupported("-", self)),
        }
    }

    pub fn cmpl(&self) -> SmtResult<Scalar<'ctx>> {
        match self {
            Scalar::Bv { expr, signed } => Ok(Scalar::bv(expr.bvnot(), *signed)),
            _ => Err(self.unsupported("~", self)),
        }
    }

    pub fn lnot(&self) -> SmtResult<Scalar<'ctx>> {
        match self {
            Scalar::Bool(b) => Ok(Scalar::Bool(b.not())),
            _ => Err(self.unsupported("!", self)),
        }
    }

    /****** arithmetic ******/

    pub fn mul(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.arith("*", other, |a, b, _| a.bvmul(b), |ctx, a, b| {
            Int::mul(ctx, &[a, b])
        })
    }

    pub fn div(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.arith(
            "/",
            other,
            |a, b, signed| if signed { a.bvsdiv(b) } else { a.bvudiv(b) },
            |_, a, b| a.div(b),
        )
    }

    pub fn rem(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.arith(
            "%",
            other,
            |a, b, signed| if signed { a.bvsrem(b) } else { a.bvurem(b) },
            |_, a, b| a.modulo(b),
        )
    }

    pub fn add(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.arith("+", other, |a, b, _| a.bvadd(b), |ctx, a, b| {
            Int::add(ctx, &[a, b])
        })
    }

    pub fn sub(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.arith("-", other, |a, b, _| a.bvsub(b), |ctx, a, b| {
            Int::sub(ctx, &[a, b])
        })
    }

    /// Saturating addition: clamps to `2^w - 1` on overflow. The bounds
    /// checks and the clamp are unsigned regardless of operand signedness.
    pub fn add_sat(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        let (a, b, signed) = self.saturation_operands("|+|", other)?;
        let no_overflow = a.bvadd_no_overflow(&b, false);
        let no_underflow = a.bvadd_no_underflow(&b);
        let ctx = a.get_ctx();
        let ok = Bool::and(ctx, &[&no_overflow, &no_underflow]);
        let clamped = ok.ite(&a.bvadd(&b), &max_bv(ctx, a.get_size()));
        Ok(Scalar::bv(clamped, signed))
    }

    /// Saturating subtraction: clamps to zero on underflow. The bounds
    /// checks and the clamp are unsigned regardless of operand signedness.
    pub fn sub_sat(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        let (a, b, signed) = self.saturation_operands("|-|", other)?;
        let no_overflow = a.bvsub_no_overflow(&b);
        let no_underflow = a.bvsub_no_underflow(&b, false);
        let ctx = a.get_ctx();
        let ok = Bool::and(ctx, &[&no_overflow, &no_underflow]);
        let zero = BV::from_u64(ctx, 0, a.get_size());
        let clamped = ok.ite(&a.bvsub(&b), &zero);
        Ok(Scalar::bv(clamped, signed))
    }

    pub fn shl(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.shift("<<", other, |a, b, _| a.bvshl(b))
    }

    pub fn shr(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.shift(">>", other, |a, b, signed| {
            if signed {
                a.bvashr(b)
            } else {
                a.bvlshr(b)
            }
        })
    }

    /****** bitwise and logical ******/

    pub fn bit_and(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.bitwise("&", other, |a, b| a.bvand(b))
    }

    pub fn bit_or(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.bitwise("|", other, |a, b| a.bvor(b))
    }

    pub fn bit_xor(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        self.bitwise("^", other, |a, b| a.bvxor(b))
    }

    pub fn land(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Ok(Bool::and(a.get_ctx(), &[a, b])),
            _ => Err(self.unsupported("&&", other)),
        }
    }

    pub fn lor(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => Ok(Bool::or(a.get_ctx(), &[a, b])),
            _ => Err(self.unsupported("||", other)),
        }
    }

    pub fn concat(&self, other: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        match (self, other) {
            (Scalar::Bv { expr: a, signed }, Scalar::Bv { expr: b, .. }) => {
                Ok(Scalar::bv(a.concat(b), *signed))
            }
            _ => Err(self.unsupported("++", other)),
        }
    }

    /****** relational ******/

    pub fn eq_expr(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        match (self, other) {
            (Scalar::Bv { expr, .. }, _) => {
                let rhs = align_to_width(other, expr.get_size())?;
                Ok(expr._eq(&rhs))
            }
            (Scalar::Int(_), Scalar::Bv { expr, .. }) => {
                let lhs = align_to_width(self, expr.get_size())?;
                Ok(lhs._eq(expr))
            }
            (Scalar::Int(a), Scalar::Int(b)) => Ok(a._eq(b)),
            (Scalar::Bool(a), Scalar::Bool(b)) => Ok(a._eq(b)),
            _ => Err(self.unsupported("==", other)),
        }
    }

    pub fn ne_expr(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        Ok(self.eq_expr(other)?.not())
    }

    pub fn lt(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        self.relational("<", other, |a, b, s| if s { a.bvslt(b) } else { a.bvult(b) }, |a, b| a.lt(b))
    }

    pub fn le(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        self.relational("<=", other, |a, b, s| if s { a.bvsle(b) } else { a.bvule(b) }, |a, b| a.le(b))
    }

    pub fn gt(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        self.relational(">", other, |a, b, s| if s { a.bvsgt(b) } else { a.bvugt(b) }, |a, b| a.gt(b))
    }

    pub fn ge(&self, other: &Scalar<'ctx>) -> SmtResult<Bool<'ctx>> {
        self.relational(">=", other, |a, b, s| if s { a.bvsge(b) } else { a.bvuge(b) }, |a, b| a.ge(b))
    }

    /****** slices ******/

    /// `self[hi:lo]`; both bounds must be compile-time constants.
    pub fn slice(&self, hi: &Scalar<'ctx>, lo: &Scalar<'ctx>) -> SmtResult<Scalar<'ctx>> {
        let (expr, _) = self.expect_bv("slice", self)?;
        let hi = hi
            .as_const_u64()
            .ok_or(SmtError::NonConstant { what: "slice bound" })?;
        let lo = lo
            .as_const_u64()
            .ok_or(SmtError::NonConstant { what: "slice bound" })?;
        let width = expr.get_size();
        if hi < lo || hi >= u64::from(width) {
            return Err(SmtError::SliceBounds { hi, lo, width });
        }
        Ok(Scalar::unsigned(
            expr.extract(hi as u32, lo as u32).simplify(),
        ))
    }

    /// Assignment into `self[hi:lo]`: assembles the unchanged high and low
    /// bits around `rval`. A slice covering the whole width reduces to a full
    /// replacement.
    pub fn assemble_slice(
        &self,
        hi: u64,
        lo: u64,
        rval: &Scalar<'ctx>,
    ) -> SmtResult<Scalar<'ctx>> {
        let (expr, signed) = self.expect_bv("slice assignment", self)?;
        let width = expr.get_size();
        if hi < lo || hi >= u64::from(width) {
            return Err(SmtError::SliceBounds { hi, lo, width });
        }
        let slice_width = (hi - lo + 1) as u32;
        let mid = align_to_width(rval, slice_width)?;
        if slice_width == width {
            return Ok(Scalar::bv(mid, signed));
        }
        let mut assembled = if (hi as u32) < width - 1 {
            expr.extract(width - 1, hi as u32 + 1).concat(&mid)
        } else {
            mid
        };
        if lo > 0 {
            assembled = assembled.concat(&expr.extract(lo as u32 - 1, 0));
        }
        Ok(Scalar::bv(assembled, signed))
    }

    /****** casts ******/

    /// Cast to a `width`-bit vector with the given signedness.
    pub fn cast_to_width(&self, width: u32, signed: bool) -> SmtResult<Scalar<'ctx>> {
        match self {
            Scalar::Bool(_) => Err(SmtError::UnsupportedCast {
                from: "bool".to_string(),
                to: format!("bit<{}>", width),
            }),
            _ => Ok(Scalar::bv(align_to_width(self, width)?, signed)),
        }
    }

    /// Cast to bool: a bitvector becomes its nonzero test.
    pub fn cast_to_bool(&self) -> SmtResult<Bool<'ctx>> {
        match self {
            Scalar::Bool(b) => Ok(b.clone()),
            Scalar::Bv { expr, .. } => {
                let zero = BV::from_u64(expr.get_ctx(), 0, expr.get_size());
                Ok(expr._eq(&zero).not())
            }
            Scalar::Int(_) => Err(SmtError::UnsupportedCast {
                from: "int".to_string(),
                to: "bool".to_string(),
            }),
        }
    }

    /// Cast to the unbounded integer sort.
    pub fn cast_to_int(&self) -> SmtResult<Int<'ctx>> {
        match self {
            Scalar::Int(i) => Ok(i.clone()),
            Scalar::Bv { expr, .. } => Ok(expr.to_int(false)),
            Scalar::Bool(_) => Err(SmtError::UnsupportedCast {
                from: "bool".to_string(),
                to: "int".to_string(),
            }),
        }
    }

    /****** merge ******/

    /// In-place path merge: `self := ite(cond, other, self)`. An unbounded
    /// integer meeting a bitvector is narrowed to the bitvector's sort (the
    /// bitvector wins the sort, even when that truncates).
    pub fn merge(&mut self, cond: &Bool<'ctx>, other: &Scalar<'ctx>) -> SmtResult<()> {
        let merged = match (&*self, other) {
            (Scalar::Bv { expr, signed }, _) => {
                let rhs = align_to_width(other, expr.get_size())?;
                Scalar::bv(cond.ite(&rhs, expr), *signed)
            }
            (Scalar::Int(_), Scalar::Bv { expr, signed }) => {
                let lhs = align_to_width(self, expr.get_size())?;
                Scalar::bv(cond.ite(expr, &lhs), *signed)
            }
            (Scalar::Int(a), Scalar::Int(b)) => Scalar::Int(cond.ite(b, a)),
            (Scalar::Bool(a), Scalar::Bool(b)) => Scalar::Bool(cond.ite(b, a)),
            _ => {
                return Err(SmtError::MergeMismatch {
                    left: self.describe(),
                    right: other.describe(),
                })
            }
        };
        *self = merged;
        Ok(())
    }

    /****** dispatch helpers ******/

    fn expect_bv(
        &self,
        op: &'static str,
        operand: &Scalar<'ctx>,
    ) -> SmtResult<(BV<'ctx>, bool)> {
        match operand {
            Scalar::Bv { expr, signed } => Ok((expr.clone(), *signed)),
            _ => Err(self.unsupported(op, operand)),
        }
    }

    fn arith(
        &self,
        op: &'static str,
        other: &Scalar<'ctx>,
        bv_op: impl Fn(&BV<'ctx>, &BV<'ctx>, bool) -> BV<'ctx>,
        int_op: impl Fn(&'ctx Context, &Int<'ctx>, &Int<'ctx>) -> Int<'ctx>,
    ) -> SmtResult<Scalar<'ctx>> {
        match (self, other) {
            (Scalar::Bv { expr, signed }, _) => {
                let rhs = align_to_width(other, expr.get_size())?;
                Ok(Scalar::bv(bv_op(expr, &rhs, *signed), *signed))
            }
            (Scalar::Int(_), Scalar::Bv { expr, signed }) => {
                let lhs = align_to_width(self, expr.get_size())?;
                Ok(Scalar::bv(bv_op(&lhs, expr, *signed), *signed))
            }
            (Scalar::Int(a), Scalar::Int(b)) => Ok(Scalar::Int(int_op(a.get_ctx(), a, b))),
            _ => Err(self.unsupported(op, other)),
        }
    }

    fn bitwise(
        &self,
        op: &'static str,
        other: &Scalar<'ctx>,
        bv_op: impl Fn(&BV<'ctx>, &BV<'ctx>) -> BV<'ctx>,
    ) -> SmtResult<Scalar<'ctx>> {
        match (self, other) {
            (Scalar::Bv { expr, signed }, _) => {
                let rhs = align_to_width(other, expr.get_size())?;
                Ok(Scalar::bv(bv_op(expr, &rhs), *signed))
            }
            (Scalar::Int(_), Scalar::Bv { expr, signed }) => {
                let lhs = align_to_width(self, expr.get_size())?;
                Ok(Scalar::bv(bv_op(&lhs, expr), *signed))
            }
            _ => Err(self.unsupported(op, other)),
        }
    }

    fn relational(
        &self,
        op: &'static str,
        other: &Scalar<'ctx>,
        bv_op: impl Fn(&BV<'ctx>, &BV<'ctx>, bool) -> Bool<'ctx>,
        int_op: impl Fn(&Int<'ctx>, &Int<'ctx>) -> Bool<'ctx>,
    ) -> SmtResult<Bool<'ctx>> {
        match (self, other) {
            (Scalar::Bv { expr, signed }, _) => {
                let rhs = align_to_width(other, expr.get_size())?;
                Ok(bv_op(expr, &rhs, *signed))
            }
            (Scalar::Int(_), Scalar::Bv { expr, signed }) => {
                let lhs = align_to_width(self, expr.get_size())?;
                Ok(bv_op(&lhs, expr, *signed))
            }
            (Scalar::Int(a), Scalar::Int(b)) => Ok(int_op(a, b)),
            _ => Err(self.unsupported(op, other)),
        }
    }

    /// Both saturating operands on the sort of whichever side is a bitvector.
    fn saturation_operands(
        &self,
        op: &'static str,
        other: &Scalar<'ctx>,
    ) -> SmtResult<(BV<'ctx>, BV<'ctx>, bool)> {
        match (self, other) {
            (Scalar::Bv { expr, signed }, _) => {
                let rhs = align_to_width(other, expr.get_size())?;
                Ok((expr.clone(), rhs, *signed))
            }
            (Scalar::Int(_), Scalar::Bv { expr, signed }) => {
                let lhs = align_to_width(self, expr.get_size())?;
                Ok((lhs, expr.clone(), *signed))
            }
            _ => Err(self.unsupported(op, other)),
        }
    }

    /// Shift dispatch. An unbounded right operand larger than the left width
    /// produces the zero vector; otherwise both sides align to the wider sort
    /// and the result is truncated back to the left operand's sort.
    fn shift(
        &self,
        op: &'static str,
        other: &Scalar<'ctx>,
        bv_op: impl Fn(&BV<'ctx>, &BV<'ctx>, bool) -> BV<'ctx>,
    ) -> SmtResult<Scalar<'ctx>> {
        let (expr, signed) = match self {
            Scalar::Bv { expr, signed } => (expr, *signed),
            _ => return Err(self.unsupported(op, other)),
        };
        let width = expr.get_size();
        match other {
            Scalar::Int(shift) => {
                if let Some(n) = shift.simplify().as_u64() {
                    if n >= u64::from(width) {
                        let zero = BV::from_u64(expr.get_ctx(), 0, width);
                        return Ok(Scalar::bv(zero, signed));
                    }
                }
                let rhs = align_to_width(other, width)?;
                Ok(Scalar::bv(bv_op(expr, &rhs, signed), signed))
            }
            Scalar::Bv { expr: rhs, .. } => {
                let rhs_width = rhs.get_size();
                let result = if rhs_width < width {
                    let rhs = rhs.zero_ext(width - rhs_width);
                    bv_op(expr, &rhs, signed)
                } else {
                    let lhs = if rhs_width > width {
                        expr.zero_ext(rhs_width - width)
                    } else {
                        expr.clone()
                    };
                    bv_op(&lhs, rhs, signed)
                };
                Ok(Scalar::bv(
                    align_to_width(&Scalar::unsigned(result), width)?,
                    signed,
                ))
            }
            Scalar::Bool(_) => Err(self.unsupported(op, other)),
        }
    }
}
