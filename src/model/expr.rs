//! Expression trees for model logic.
//!
//! Expressions are written against [Symbol]s (names, positional etas and time)
//! and resolved once, when the model is built, into [Slot]s that index straight
//! into the evaluation environment. Evaluating a resolved expression never looks
//! a name up.
//!
//! ```
//! use pharmsim::model::expr::*;
//!
//! // CL * exp(ETA(1)) * (WT / 70)^0.75
//! let icl = var("CL") * iiv(0).exp() * power_law(var("WT"), 70.0, 0.75);
//! # let _ = icl;
//! ```
use serde::{Deserialize, Serialize};
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::PharmsimError;

/// A reference as written by the model author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Symbol {
    /// A parameter, covariate, compartment, assignment or define
    Name(String),
    /// Zero-indexed between-subject random effect
    Iiv(usize),
    /// Zero-indexed between-occasion random effect of the active occasion
    Iov(usize),
    /// The integration time
    Time,
}

/// A reference after name resolution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    Param(usize),
    Covariate(usize),
    Iiv(usize),
    Iov(usize),
    Local(usize),
    State(usize),
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Func {
    Exp,
    Ln,
    Sqrt,
    Abs,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

/// What `0^x` evaluates to when `x < 0`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZeroPowerPolicy {
    /// The factor is 1, as if the covariate effect were absent
    #[default]
    Identity,
    /// IEEE result (`+inf`)
    Propagate,
}

impl ZeroPowerPolicy {
    pub(crate) fn pow(&self, base: f64, exponent: f64) -> f64 {
        if base == 0.0 && exponent < 0.0 && *self == ZeroPowerPolicy::Identity {
            1.0
        } else {
            base.powf(exponent)
        }
    }
}

/// An arithmetic expression over references of type `R`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr<R = Symbol> {
    Const(f64),
    Ref(R),
    Neg(Box<Expr<R>>),
    Binary(BinaryOp, Box<Expr<R>>, Box<Expr<R>>),
    Pow(Box<Expr<R>>, Box<Expr<R>>),
    Call(Func, Box<Expr<R>>),
    Piecewise(Piecewise<R>),
}

/// Ordered rule table: the first arm whose condition holds gives the value,
/// otherwise the default does
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piecewise<R = Symbol> {
    arms: Vec<Arm<R>>,
    default: Box<Expr<R>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm<R = Symbol> {
    pub condition: Condition<R>,
    pub value: Expr<R>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition<R = Symbol> {
    pub lhs: Expr<R>,
    pub op: CmpOp,
    pub rhs: Expr<R>,
}

/// Values an expression over [Slot]s is evaluated against
#[derive(Debug, Clone, Copy)]
pub(crate) struct Env<'a> {
    pub params: &'a [f64],
    pub covariates: &'a [f64],
    pub iiv: &'a [f64],
    pub iov: &'a [f64],
    pub locals: &'a [f64],
    pub state: &'a [f64],
    pub time: f64,
    pub zero_power: ZeroPowerPolicy,
}

fn lookup(values: &[f64], index: usize) -> f64 {
    values.get(index).copied().unwrap_or(f64::NAN)
}

impl Expr<Slot> {
    /// Evaluate the expression. Non-finite inputs propagate to the result.
    pub(crate) fn eval(&self, env: &Env) -> f64 {
        match self {
            Expr::Const(value) => *value,
            Expr::Ref(slot) => match *slot {
                Slot::Param(i) => lookup(env.params, i),
                Slot::Covariate(i) => lookup(env.covariates, i),
                Slot::Iiv(i) => lookup(env.iiv, i),
                Slot::Iov(i) => lookup(env.iov, i),
                Slot::Local(i) => lookup(env.locals, i),
                Slot::State(i) => lookup(env.state, i),
                Slot::Time => env.time,
            },
            Expr::Neg(inner) => -inner.eval(env),
            Expr::Binary(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(env), rhs.eval(env));
                match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                }
            }
            Expr::Pow(base, exponent) => env.zero_power.pow(base.eval(env), exponent.eval(env)),
            Expr::Call(func, arg) => {
                let x = arg.eval(env);
                match func {
                    Func::Exp => x.exp(),
                    Func::Ln => x.ln(),
                    Func::Sqrt => x.sqrt(),
                    Func::Abs => x.abs(),
                }
            }
            Expr::Piecewise(table) => {
                for arm in &table.arms {
                    let lhs = arm.condition.lhs.eval(env);
                    let rhs = arm.condition.rhs.eval(env);
                    if lhs.is_nan() || rhs.is_nan() {
                        return f64::NAN;
                    }
                    if arm.condition.op.holds(lhs, rhs) {
                        return arm.value.eval(env);
                    }
                }
                table.default.eval(env)
            }
        }
    }
}

impl<R> Expr<R> {
    /// Rewrite every reference with `f`, which may replace it by a whole
    /// expression (used to inline defines)
    pub fn try_map_refs<S, F>(&self, f: &mut F) -> Result<Expr<S>, PharmsimError>
    where
        F: FnMut(&R) -> Result<Expr<S>, PharmsimError>,
    {
        Ok(match self {
            Expr::Const(value) => Expr::Const(*value),
            Expr::Ref(r) => f(r)?,
            Expr::Neg(inner) => Expr::Neg(Box::new(inner.try_map_refs(f)?)),
            Expr::Binary(op, lhs, rhs) => Expr::Binary(
                *op,
                Box::new(lhs.try_map_refs(f)?),
                Box::new(rhs.try_map_refs(f)?),
            ),
            Expr::Pow(base, exponent) => Expr::Pow(
                Box::new(base.try_map_refs(f)?),
                Box::new(exponent.try_map_refs(f)?),
            ),
            Expr::Call(func, arg) => Expr::Call(*func, Box::new(arg.try_map_refs(f)?)),
            Expr::Piecewise(table) => {
                let arms = table
                    .arms
                    .iter()
                    .map(|arm| {
                        Ok(Arm {
                            condition: Condition {
                                lhs: arm.condition.lhs.try_map_refs(f)?,
                                op: arm.condition.op,
                                rhs: arm.condition.rhs.try_map_refs(f)?,
                            },
                            value: arm.value.try_map_refs(f)?,
                        })
                    })
                    .collect::<Result<Vec<_>, PharmsimError>>()?;
                Expr::Piecewise(Piecewise {
                    arms,
                    default: Box::new(table.default.try_map_refs(f)?),
                })
            }
        })
    }

    /// Visit every reference in evaluation order
    pub fn for_each_ref<F: FnMut(&R)>(&self, f: &mut F) {
        match self {
            Expr::Const(_) => {}
            Expr::Ref(r) => f(r),
            Expr::Neg(inner) | Expr::Call(_, inner) => inner.for_each_ref(f),
            Expr::Binary(_, lhs, rhs) | Expr::Pow(lhs, rhs) => {
                lhs.for_each_ref(f);
                rhs.for_each_ref(f);
            }
            Expr::Piecewise(table) => {
                for arm in &table.arms {
                    arm.condition.lhs.for_each_ref(f);
                    arm.condition.rhs.for_each_ref(f);
                    arm.value.for_each_ref(f);
                }
                table.default.for_each_ref(f);
            }
        }
    }
}

// Constructors

pub fn num(value: f64) -> Expr {
    Expr::Const(value)
}

/// Reference a parameter, covariate, compartment, assignment or define by name
pub fn var(name: &str) -> Expr {
    Expr::Ref(Symbol::Name(name.to_string()))
}

pub fn iiv(index: usize) -> Expr {
    Expr::Ref(Symbol::Iiv(index))
}

pub fn iov(index: usize) -> Expr {
    Expr::Ref(Symbol::Iov(index))
}

pub fn time() -> Expr {
    Expr::Ref(Symbol::Time)
}

impl Expr {
    pub fn pow(self, exponent: impl Into<Expr>) -> Expr {
        Expr::Pow(Box::new(self), Box::new(exponent.into()))
    }
    pub fn exp(self) -> Expr {
        Expr::Call(Func::Exp, Box::new(self))
    }
    pub fn ln(self) -> Expr {
        Expr::Call(Func::Ln, Box::new(self))
    }
    pub fn sqrt(self) -> Expr {
        Expr::Call(Func::Sqrt, Box::new(self))
    }
    pub fn abs(self) -> Expr {
        Expr::Call(Func::Abs, Box::new(self))
    }
    fn compare(self, op: CmpOp, rhs: impl Into<Expr>) -> Condition {
        Condition {
            lhs: self,
            op,
            rhs: rhs.into(),
        }
    }
    pub fn lt(self, rhs: impl Into<Expr>) -> Condition {
        self.compare(CmpOp::Lt, rhs)
    }
    pub fn le(self, rhs: impl Into<Expr>) -> Condition {
        self.compare(CmpOp::Le, rhs)
    }
    pub fn gt(self, rhs: impl Into<Expr>) -> Condition {
        self.compare(CmpOp::Gt, rhs)
    }
    pub fn ge(self, rhs: impl Into<Expr>) -> Condition {
        self.compare(CmpOp::Ge, rhs)
    }
    pub fn equals(self, rhs: impl Into<Expr>) -> Condition {
        self.compare(CmpOp::Eq, rhs)
    }
}

/// Ordered rule table with a mandatory default
pub fn piecewise(arms: Vec<(Condition, Expr)>, default: impl Into<Expr>) -> Expr {
    Expr::Piecewise(Piecewise {
        arms: arms
            .into_iter()
            .map(|(condition, value)| Arm { condition, value })
            .collect(),
        default: Box::new(default.into()),
    })
}

/// Pick an expression by the exact value of `on`
pub fn select(on: Expr, levels: Vec<(f64, Expr)>, default: impl Into<Expr>) -> Expr {
    let arms = levels
        .into_iter()
        .map(|(level, value)| (on.clone().equals(level), value))
        .collect();
    piecewise(arms, default)
}

/// Pick a constant by the exact value of a categorical covariate
pub fn categorical(on: Expr, levels: &[(f64, f64)], default: f64) -> Expr {
    select(
        on,
        levels.iter().map(|&(level, value)| (level, num(value))).collect(),
        default,
    )
}

/// `below` when `on < cut`, `at_or_above` otherwise
pub fn threshold(on: Expr, cut: f64, below: f64, at_or_above: f64) -> Expr {
    piecewise(vec![(on.lt(cut), num(below))], at_or_above)
}

/// `(x / reference)^exponent`
pub fn power_law(x: Expr, reference: f64, exponent: f64) -> Expr {
    (x / reference).pow(exponent)
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Const(value)
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::Neg(Box::new(self))
    }
}

macro_rules! impl_binary {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<T: Into<Expr>> $trait<T> for Expr {
            type Output = Expr;
            fn $method(self, rhs: T) -> Expr {
                Expr::Binary($op, Box::new(self), Box::new(rhs.into()))
            }
        }
        impl $trait<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                Expr::Binary($op, Box::new(Expr::Const(self)), Box::new(rhs))
            }
        }
    };
}

impl_binary!(Add, add, BinaryOp::Add);
impl_binary!(Sub, sub, BinaryOp::Sub);
impl_binary!(Mul, mul, BinaryOp::Mul);
impl_binary!(Div, div, BinaryOp::Div);

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(params: &'a [f64], covariates: &'a [f64], policy: ZeroPowerPolicy) -> Env<'a> {
        Env {
            params,
            covariates,
            iiv: &[],
            iov: &[],
            locals: &[],
            state: &[],
            time: 0.0,
            zero_power: policy,
        }
    }

    fn resolve(expr: &Expr) -> Expr<Slot> {
        expr.try_map_refs(&mut |symbol: &Symbol| match symbol {
            Symbol::Name(name) if name == "CL" => Ok(Expr::Ref(Slot::Param(0))),
            Symbol::Name(name) if name == "X" => Ok(Expr::Ref(Slot::Covariate(0))),
            Symbol::Name(name) => Err(PharmsimError::undeclared(name.clone(), "test")),
            _ => Ok(Expr::Ref(Slot::Time)),
        })
        .unwrap()
    }

    #[test]
    fn arithmetic_follows_operator_overloads() {
        let expr = resolve(&(var("CL") * 2.0 + 1.0 - var("X") / 4.0));
        let value = expr.eval(&env(&[3.0], &[8.0], ZeroPowerPolicy::Identity));
        assert_eq!(value, 5.0);
    }

    #[test]
    fn categorical_uses_first_matching_level_then_default() {
        let expr = resolve(&categorical(var("X"), &[(1.0, 1.186), (2.0, 1.13), (3.0, 1.0)], 0.5));
        let at = |x: f64| expr.eval(&env(&[], &[x], ZeroPowerPolicy::Identity));
        assert_eq!(at(1.0), 1.186);
        assert_eq!(at(2.0), 1.13);
        assert_eq!(at(3.0), 1.0);
        assert_eq!(at(9.0), 0.5);
        assert!(at(f64::NAN).is_nan());
    }

    #[test]
    fn threshold_splits_at_cut() {
        let expr = resolve(&threshold(var("X"), 33.0, 1.3458, 1.124));
        let at = |x: f64| expr.eval(&env(&[], &[x], ZeroPowerPolicy::Identity));
        assert_eq!(at(30.0), 1.3458);
        assert_eq!(at(33.0), 1.124);
    }

    #[test]
    fn zero_to_negative_power_follows_policy() {
        let expr = resolve(&var("X").pow(-0.00762));
        let identity = expr.eval(&env(&[], &[0.0], ZeroPowerPolicy::Identity));
        let propagate = expr.eval(&env(&[], &[0.0], ZeroPowerPolicy::Propagate));
        assert_eq!(identity, 1.0);
        assert!(propagate.is_infinite());
        let positive = expr.eval(&env(&[], &[2.0], ZeroPowerPolicy::Identity));
        assert_eq!(positive, 2.0_f64.powf(-0.00762));
    }

    #[test]
    fn unknown_names_fail_resolution() {
        let err = var("CL")
            .exp()
            .try_map_refs(&mut |symbol: &Symbol| match symbol {
                Symbol::Name(name) => Err::<Expr<Slot>, _>(PharmsimError::undeclared(
                    name.clone(),
                    "main(iCL)",
                )),
                _ => unreachable!(),
            })
            .unwrap_err();
        assert_eq!(err, PharmsimError::undeclared("CL", "main(iCL)"));
    }

    #[test]
    fn for_each_ref_visits_all_references() {
        let expr = select(var("OCC"), vec![(1.0, iov(0)), (2.0, iov(1))], num(0.0)) + iiv(3);
        let mut seen = Vec::new();
        expr.for_each_ref(&mut |r: &Symbol| seen.push(r.clone()));
        assert_eq!(seen.len(), 5);
        assert!(seen.contains(&Symbol::Iiv(3)));
    }
}
