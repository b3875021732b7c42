//! Symbolic expressions for right-hand sides.
//!
//! `Expr` is a small computer-algebra tree: numbers, named symbols, n-ary sums
//! and products, powers and elementary functions. Arithmetic operators build
//! trees with only trivial folding; [`Expr::simplify`] brings a tree into a
//! canonical form (flattened, like terms and powers collected, operands
//! sorted) and [`Expr::expand`] additionally distributes products over sums.
//! Two expressions are [`Expr::equivalent`] when their expanded difference
//! vanishes.
//!
//! An undefined value (NaN) absorbs everything it touches during
//! simplification, so a missing parameter shows up as an undefined
//! right-hand side instead of silently disappearing.

use crate::error::{NetworkError, Result};
use crate::traits::Scalar;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

/// A named placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Elementary functions of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Func {
    Sin,
    Cos,
    Tan,
    Exp,
    Ln,
    Tanh,
}

impl Func {
    pub fn name(self) -> &'static str {
        match self {
            Func::Sin => "sin",
            Func::Cos => "cos",
            Func::Tan => "tan",
            Func::Exp => "exp",
            Func::Ln => "ln",
            Func::Tanh => "tanh",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sin" => Some(Func::Sin),
            "cos" => Some(Func::Cos),
            "tan" => Some(Func::Tan),
            "exp" => Some(Func::Exp),
            "ln" | "log" => Some(Func::Ln),
            "tanh" => Some(Func::Tanh),
            _ => None,
        }
    }

    pub fn apply<T: Scalar>(self, value: T) -> T {
        match self {
            Func::Sin => value.sin(),
            Func::Cos => value.cos(),
            Func::Tan => value.tan(),
            Func::Exp => value.exp(),
            Func::Ln => value.ln(),
            Func::Tanh => value.tanh(),
        }
    }

    /// d f(u) / du, expressed in terms of `arg`.
    fn derivative(self, arg: &Expr) -> Expr {
        match self {
            Func::Sin => arg.clone().cos(),
            Func::Cos => -arg.clone().sin(),
            Func::Tan => 1.0 + arg.clone().tan().powi(2),
            Func::Exp => arg.clone().exp(),
            Func::Ln => arg.clone().recip(),
            Func::Tanh => 1.0 - arg.clone().tanh().powi(2),
        }
    }
}

/// A symbolic expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Num(f64),
    Sym(Symbol),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>),
}

impl Default for Expr {
    fn default() -> Self {
        Expr::Num(0.0)
    }
}

impl Expr {
    pub fn num(value: f64) -> Self {
        Expr::Num(value)
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Expr::Sym(Symbol::new(name))
    }

    pub fn zero() -> Self {
        Expr::Num(0.0)
    }

    pub fn one() -> Self {
        Expr::Num(1.0)
    }

    /// The undefined value.
    pub fn undefined() -> Self {
        Expr::Num(f64::NAN)
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Expr::Num(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Expr::Sym(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Expr::Num(v) if *v == 0.0)
    }

    pub fn pow(self, exponent: impl Into<Expr>) -> Expr {
        let exponent = exponent.into();
        match (self.as_num(), exponent.as_num()) {
            (Some(b), Some(e)) => Expr::Num(b.powf(e)),
            (_, Some(e)) if e == 1.0 => self,
            _ => Expr::Pow(Box::new(self), Box::new(exponent)),
        }
    }

    pub fn powi(self, n: i32) -> Expr {
        self.pow(n as f64)
    }

    pub fn sqrt(self) -> Expr {
        self.pow(0.5)
    }

    pub fn recip(self) -> Expr {
        self.pow(-1.0)
    }

    fn call(func: Func, arg: Expr) -> Expr {
        match arg.as_num() {
            Some(v) => Expr::Num(func.apply(v)),
            None => Expr::Call(func, Box::new(arg)),
        }
    }

    pub fn sin(self) -> Expr {
        Expr::call(Func::Sin, self)
    }

    pub fn cos(self) -> Expr {
        Expr::call(Func::Cos, self)
    }

    pub fn tan(self) -> Expr {
        Expr::call(Func::Tan, self)
    }

    pub fn exp(self) -> Expr {
        Expr::call(Func::Exp, self)
    }

    pub fn ln(self) -> Expr {
        Expr::call(Func::Ln, self)
    }

    pub fn tanh(self) -> Expr {
        Expr::call(Func::Tanh, self)
    }

    fn rank(&self) -> u8 {
        match self {
            Expr::Num(_) => 0,
            Expr::Sym(_) => 1,
            Expr::Call(..) => 2,
            Expr::Pow(..) => 3,
            Expr::Mul(_) => 4,
            Expr::Add(_) => 5,
        }
    }

    // --- inspection ---

    /// True if the expression contains the undefined value anywhere.
    pub fn is_undefined(&self) -> bool {
        match self {
            Expr::Num(v) => v.is_nan(),
            Expr::Sym(_) => false,
            Expr::Add(items) | Expr::Mul(items) => items.iter().any(Expr::is_undefined),
            Expr::Pow(b, e) => b.is_undefined() || e.is_undefined(),
            Expr::Call(_, arg) => arg.is_undefined(),
        }
    }

    pub fn free_symbols(&self) -> BTreeSet<Symbol> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<Symbol>) {
        match self {
            Expr::Num(_) => {}
            Expr::Sym(s) => {
                out.insert(s.clone());
            }
            Expr::Add(items) | Expr::Mul(items) => {
                for item in items {
                    item.collect_symbols(out);
                }
            }
            Expr::Pow(b, e) => {
                b.collect_symbols(out);
                e.collect_symbols(out);
            }
            Expr::Call(_, arg) => arg.collect_symbols(out),
        }
    }

    pub fn contains(&self, symbol: &Symbol) -> bool {
        match self {
            Expr::Num(_) => false,
            Expr::Sym(s) => s == symbol,
            Expr::Add(items) | Expr::Mul(items) => items.iter().any(|i| i.contains(symbol)),
            Expr::Pow(b, e) => b.contains(symbol) || e.contains(symbol),
            Expr::Call(_, arg) => arg.contains(symbol),
        }
    }

    // --- rewriting ---

    /// Replaces every occurrence of `symbol` with `value`.
    pub fn subs(&self, symbol: &Symbol, value: &Expr) -> Expr {
        match self {
            Expr::Num(_) => self.clone(),
            Expr::Sym(s) if s == symbol => value.clone(),
            Expr::Sym(_) => self.clone(),
            Expr::Add(items) => items.iter().map(|i| i.subs(symbol, value)).sum(),
            Expr::Mul(items) => items
                .iter()
                .map(|i| i.subs(symbol, value))
                .fold(Expr::one(), product),
            Expr::Pow(b, e) => b.subs(symbol, value).pow(e.subs(symbol, value)),
            Expr::Call(func, arg) => Expr::call(*func, arg.subs(symbol, value)),
        }
    }

    /// Canonical form: sums and products flattened, numbers folded, like
    /// terms and like powers collected, operands sorted.
    pub fn simplify(&self) -> Expr {
        match self {
            Expr::Num(v) => Expr::Num(*v + 0.0),
            Expr::Sym(_) => self.clone(),
            Expr::Call(func, arg) => Expr::call(*func, arg.simplify()),
            Expr::Pow(b, e) => simplify_pow(b.simplify(), e.simplify()),
            Expr::Mul(items) => simplify_mul(items.iter().map(Expr::simplify).collect()),
            Expr::Add(items) => simplify_add(items.iter().map(Expr::simplify).collect()),
        }
    }

    /// Canonical form with products distributed over sums and small integer
    /// powers of sums multiplied out.
    pub fn expand(&self) -> Expr {
        match self {
            Expr::Num(_) | Expr::Sym(_) => self.simplify(),
            Expr::Call(func, arg) => Expr::call(*func, arg.expand()),
            Expr::Add(items) => simplify_add(items.iter().map(Expr::expand).collect()),
            Expr::Mul(items) => {
                let mut terms = vec![Expr::one()];
                for factor in items.iter().map(Expr::expand) {
                    terms = match factor {
                        Expr::Add(addends) => terms
                            .iter()
                            .flat_map(|t| {
                                addends
                                    .iter()
                                    .map(move |a| simplify_mul(vec![t.clone(), a.clone()]))
                            })
                            .collect(),
                        other => terms
                            .into_iter()
                            .map(|t| simplify_mul(vec![t, other.clone()]))
                            .collect(),
                    };
                }
                simplify_add(terms)
            }
            Expr::Pow(b, e) => {
                let base = b.expand();
                let exponent = e.expand();
                let is_sum = matches!(base, Expr::Add(_));
                if let (true, Some(n)) = (is_sum, exponent.as_num()) {
                    if n.fract() == 0.0 && (2.0..=MAX_EXPANDED_POWER).contains(&n) {
                        return Expr::Mul(vec![base; n as usize]).expand();
                    }
                }
                simplify_pow(base, exponent)
            }
        }
    }

    /// Symbolic derivative with respect to `symbol`, simplified.
    pub fn diff(&self, symbol: &Symbol) -> Expr {
        self.derivative(symbol).simplify()
    }

    fn derivative(&self, symbol: &Symbol) -> Expr {
        if !self.contains(symbol) {
            return Expr::zero();
        }
        match self {
            Expr::Num(_) => Expr::zero(),
            Expr::Sym(_) => Expr::one(),
            Expr::Add(items) => items.iter().map(|i| i.derivative(symbol)).sum(),
            Expr::Mul(items) => (0..items.len())
                .map(|i| {
                    items
                        .iter()
                        .enumerate()
                        .map(|(j, f)| if i == j { f.derivative(symbol) } else { f.clone() })
                        .fold(Expr::one(), product)
                })
                .sum(),
            Expr::Pow(b, e) => {
                let base = (**b).clone();
                let exponent = (**e).clone();
                if exponent.contains(symbol) {
                    // d(b^e) = b^e * (e' ln b + e b' / b)
                    let log_term = exponent.derivative(symbol) * base.clone().ln();
                    let power_term = exponent.clone() * b.derivative(symbol) / base.clone();
                    base.pow(exponent) * (log_term + power_term)
                } else {
                    exponent.clone() * base.pow(exponent - 1.0) * b.derivative(symbol)
                }
            }
            Expr::Call(func, arg) => func.derivative(arg) * arg.derivative(symbol),
        }
    }

    /// Expanded difference vanishes (up to `1e-12` in every coefficient).
    pub fn equivalent(&self, other: &Expr) -> bool {
        (self.clone() - other.clone()).expand().is_negligible(1e-12)
    }

    fn is_negligible(&self, tolerance: f64) -> bool {
        match self {
            Expr::Num(v) => v.abs() <= tolerance,
            Expr::Mul(items) => matches!(items.first(), Some(Expr::Num(c)) if c.abs() <= tolerance),
            Expr::Add(items) => items.iter().all(|i| i.is_negligible(tolerance)),
            _ => false,
        }
    }

    // --- evaluation ---

    /// Evaluates the tree, resolving symbols through `resolve`.
    pub fn eval<T, F>(&self, resolve: &F) -> Result<T>
    where
        T: Scalar,
        F: Fn(&Symbol) -> Option<T>,
    {
        Ok(match self {
            Expr::Num(v) => constant(*v),
            Expr::Sym(s) => {
                resolve(s).ok_or_else(|| NetworkError::UnboundSymbol(s.name().to_string()))?
            }
            Expr::Add(items) => {
                let mut acc = T::zero();
                for item in items {
                    acc = acc + item.eval(resolve)?;
                }
                acc
            }
            Expr::Mul(items) => {
                let mut acc = T::one();
                for item in items {
                    acc = acc * item.eval(resolve)?;
                }
                acc
            }
            Expr::Pow(b, e) => {
                let base = b.eval(resolve)?;
                match integer_exponent(e) {
                    Some(n) => base.powi(n),
                    None => base.powf(e.eval(resolve)?),
                }
            }
            Expr::Call(func, arg) => func.apply(arg.eval(resolve)?),
        })
    }
}

const MAX_EXPANDED_POWER: f64 = 16.0;

pub(crate) fn constant<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

pub(crate) fn integer_exponent(exponent: &Expr) -> Option<i32> {
    exponent
        .as_num()
        .filter(|n| n.fract() == 0.0 && n.abs() <= i32::MAX as f64)
        .map(|n| n as i32)
}

// --- light-weight builders used by the operators ---

fn sum(a: Expr, b: Expr) -> Expr {
    match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => Expr::Num(x + y),
        (Some(x), None) if x == 0.0 => b,
        (None, Some(y)) if y == 0.0 => a,
        _ => {
            let mut terms = Vec::new();
            for item in [a, b] {
                match item {
                    Expr::Add(inner) => terms.extend(inner),
                    other => terms.push(other),
                }
            }
            Expr::Add(terms)
        }
    }
}

fn product(a: Expr, b: Expr) -> Expr {
    match (a.as_num(), b.as_num()) {
        (Some(x), Some(y)) => Expr::Num(x * y),
        (Some(x), None) if x == 1.0 => b,
        (None, Some(y)) if y == 1.0 => a,
        _ => {
            let mut factors = Vec::new();
            for item in [a, b] {
                match item {
                    Expr::Mul(inner) => factors.extend(inner),
                    other => factors.push(other),
                }
            }
            Expr::Mul(factors)
        }
    }
}

fn difference(a: Expr, b: Expr) -> Expr {
    sum(a, product(Expr::Num(-1.0), b))
}

fn quotient(a: Expr, b: Expr) -> Expr {
    product(a, b.recip())
}

// --- canonicalisation ---

fn simplify_pow(base: Expr, exponent: Expr) -> Expr {
    if base.is_undefined() || exponent.is_undefined() {
        return Expr::undefined();
    }
    match (base.as_num(), exponent.as_num()) {
        (Some(b), Some(e)) => return Expr::Num(b.powf(e) + 0.0),
        (_, Some(e)) if e == 0.0 => return Expr::one(),
        (_, Some(e)) if e == 1.0 => return base,
        (Some(b), _) if b == 1.0 => return Expr::one(),
        _ => {}
    }

    if let Some(n) = integer_exponent(&exponent) {
        match base {
            // (b^e)^n = b^(e n) for integer n
            Expr::Pow(inner, e) => {
                return simplify_pow(*inner, simplify_mul(vec![*e, Expr::Num(n as f64)]));
            }
            Expr::Mul(factors) => {
                return simplify_mul(
                    factors
                        .into_iter()
                        .map(|f| simplify_pow(f, Expr::Num(n as f64)))
                        .collect(),
                );
            }
            other => return Expr::Pow(Box::new(other), Box::new(exponent)),
        }
    }
    Expr::Pow(Box::new(base), Box::new(exponent))
}

fn simplify_mul(factors: Vec<Expr>) -> Expr {
    let mut coefficient = 1.0;
    let mut powers: BTreeMap<Expr, Vec<Expr>> = BTreeMap::new();

    let mut pending = factors;
    while let Some(factor) = pending.pop() {
        match factor {
            Expr::Num(v) => coefficient *= v,
            Expr::Mul(inner) => pending.extend(inner),
            Expr::Pow(b, e) => powers.entry(*b).or_default().push(*e),
            other => powers.entry(other).or_default().push(Expr::one()),
        }
    }
    if coefficient.is_nan() {
        return Expr::undefined();
    }

    let mut out = Vec::new();
    for (base, exponents) in powers {
        let exponent = simplify_add(exponents);
        match simplify_pow(base, exponent) {
            Expr::Num(v) => coefficient *= v,
            Expr::Mul(inner) => {
                for f in inner {
                    match f {
                        Expr::Num(v) => coefficient *= v,
                        other => out.push(other),
                    }
                }
            }
            other => out.push(other),
        }
    }
    if coefficient.is_nan() {
        return Expr::undefined();
    }
    if coefficient == 0.0 {
        return Expr::zero();
    }
    out.sort();

    match out.len() {
        0 => Expr::Num(coefficient + 0.0),
        1 if coefficient == 1.0 => out.remove(0),
        1 => match out.remove(0) {
            // distribute a bare coefficient over a sum
            Expr::Add(terms) => simplify_add(
                terms
                    .into_iter()
                    .map(|t| simplify_mul(vec![Expr::Num(coefficient), t]))
                    .collect(),
            ),
            other => Expr::Mul(vec![Expr::Num(coefficient), other]),
        },
        _ => {
            if coefficient != 1.0 {
                out.insert(0, Expr::Num(coefficient));
            }
            Expr::Mul(out)
        }
    }
}

fn split_coefficient(term: Expr) -> (f64, Expr) {
    match term {
        Expr::Mul(mut factors) => match factors.first() {
            Some(Expr::Num(c)) => {
                let c = *c;
                factors.remove(0);
                let rest = if factors.len() == 1 {
                    factors.remove(0)
                } else {
                    Expr::Mul(factors)
                };
                (c, rest)
            }
            _ => (1.0, Expr::Mul(factors)),
        },
        other => (1.0, other),
    }
}

fn scaled(coefficient: f64, rest: Expr) -> Expr {
    if coefficient == 1.0 {
        return rest;
    }
    match rest {
        Expr::Mul(mut factors) => {
            factors.insert(0, Expr::Num(coefficient));
            Expr::Mul(factors)
        }
        other => Expr::Mul(vec![Expr::Num(coefficient), other]),
    }
}

fn simplify_add(terms: Vec<Expr>) -> Expr {
    let mut constant = 0.0;
    let mut like: BTreeMap<Expr, f64> = BTreeMap::new();

    let mut pending = terms;
    while let Some(term) = pending.pop() {
        match term {
            Expr::Num(v) => constant += v,
            Expr::Add(inner) => pending.extend(inner),
            other => {
                let (c, rest) = split_coefficient(other);
                *like.entry(rest).or_insert(0.0) += c;
            }
        }
    }
    if constant.is_nan() || like.values().any(|c| c.is_nan()) {
        return Expr::undefined();
    }

    let mut out: Vec<Expr> = like
        .into_iter()
        .filter(|(_, c)| *c != 0.0)
        .map(|(rest, c)| scaled(c, rest))
        .collect();
    if constant != 0.0 {
        out.insert(0, Expr::Num(constant));
    }
    match out.len() {
        0 => Expr::zero(),
        1 => out.remove(0),
        _ => Expr::Add(out),
    }
}

// --- ordering ---

impl Ord for Expr {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Expr::Num(a), Expr::Num(b)) => a.total_cmp(b),
            (Expr::Sym(a), Expr::Sym(b)) => a.cmp(b),
            (Expr::Call(f, a), Expr::Call(g, b)) => f.cmp(g).then_with(|| a.cmp(b)),
            (Expr::Pow(b1, e1), Expr::Pow(b2, e2)) => b1.cmp(b2).then_with(|| e1.cmp(e2)),
            (Expr::Mul(a), Expr::Mul(b)) | (Expr::Add(a), Expr::Add(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Structural equality. Use [`Expr::equivalent`] for algebraic equality.
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Expr {}

// --- operators ---

macro_rules! impl_binary_op {
    ($op:ident, $method:ident, $build:ident) => {
        impl $op<Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                $build(self, rhs)
            }
        }

        impl $op<&Expr> for Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                $build(self, rhs.clone())
            }
        }

        impl $op<Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                $build(self.clone(), rhs)
            }
        }

        impl $op<&Expr> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                $build(self.clone(), rhs.clone())
            }
        }

        impl $op<f64> for Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                $build(self, Expr::Num(rhs))
            }
        }

        impl $op<f64> for &Expr {
            type Output = Expr;
            fn $method(self, rhs: f64) -> Expr {
                $build(self.clone(), Expr::Num(rhs))
            }
        }

        impl $op<Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: Expr) -> Expr {
                $build(Expr::Num(self), rhs)
            }
        }

        impl $op<&Expr> for f64 {
            type Output = Expr;
            fn $method(self, rhs: &Expr) -> Expr {
                $build(Expr::Num(self), rhs.clone())
            }
        }
    };
}

impl_binary_op!(Add, add, sum);
impl_binary_op!(Sub, sub, difference);
impl_binary_op!(Mul, mul, product);
impl_binary_op!(Div, div, quotient);

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        product(Expr::Num(-1.0), self)
    }
}

impl Neg for &Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        product(Expr::Num(-1.0), self.clone())
    }
}

impl<R: Into<Expr>> AddAssign<R> for Expr {
    fn add_assign(&mut self, rhs: R) {
        let lhs = std::mem::take(self);
        *self = sum(lhs, rhs.into());
    }
}

impl<R: Into<Expr>> SubAssign<R> for Expr {
    fn sub_assign(&mut self, rhs: R) {
        let lhs = std::mem::take(self);
        *self = difference(lhs, rhs.into());
    }
}

impl<R: Into<Expr>> MulAssign<R> for Expr {
    fn mul_assign(&mut self, rhs: R) {
        let lhs = std::mem::take(self);
        *self = product(lhs, rhs.into());
    }
}

impl Sum for Expr {
    fn sum<I: Iterator<Item = Expr>>(iter: I) -> Expr {
        iter.fold(Expr::zero(), sum)
    }
}

impl<'a> Sum<&'a Expr> for Expr {
    fn sum<I: Iterator<Item = &'a Expr>>(iter: I) -> Expr {
        iter.fold(Expr::zero(), |acc, e| sum(acc, e.clone()))
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::Num(value)
    }
}

impl From<i32> for Expr {
    fn from(value: i32) -> Self {
        Expr::Num(value as f64)
    }
}

impl From<Symbol> for Expr {
    fn from(symbol: Symbol) -> Self {
        Expr::Sym(symbol)
    }
}

impl From<&Expr> for Expr {
    fn from(expr: &Expr) -> Self {
        expr.clone()
    }
}

// --- display ---

/// `Some(-term)` when `term` prints with a leading minus.
fn negated_for_display(term: &Expr) -> Option<Expr> {
    match term {
        Expr::Num(v) if *v < 0.0 => Some(Expr::Num(-v)),
        Expr::Mul(factors) => match factors.first() {
            Some(Expr::Num(c)) if *c < 0.0 => {
                let mut rest = factors[1..].to_vec();
                if *c != -1.0 {
                    rest.insert(0, Expr::Num(-c));
                }
                Some(if rest.len() == 1 {
                    rest.remove(0)
                } else {
                    Expr::Mul(rest)
                })
            }
            _ => None,
        },
        _ => None,
    }
}

fn is_atom(expr: &Expr) -> bool {
    match expr {
        Expr::Num(v) => *v >= 0.0,
        Expr::Sym(_) | Expr::Call(..) => true,
        _ => false,
    }
}

fn write_wrapped(f: &mut fmt::Formatter<'_>, expr: &Expr, wrap: bool) -> fmt::Result {
    if wrap {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Num(v) => write!(f, "{v}"),
            Expr::Sym(s) => write!(f, "{s}"),
            Expr::Call(func, arg) => write!(f, "{}({arg})", func.name()),
            Expr::Pow(b, e) => {
                write_wrapped(f, b, !is_atom(b))?;
                f.write_str("^")?;
                write_wrapped(f, e, !is_atom(e))
            }
            Expr::Mul(factors) => {
                if let Some(positive) = negated_for_display(self) {
                    f.write_str("-")?;
                    return write_wrapped(f, &positive, matches!(positive, Expr::Add(_)));
                }
                for (i, factor) in factors.iter().enumerate() {
                    if i > 0 {
                        f.write_str("*")?;
                    }
                    let wrap = matches!(factor, Expr::Add(_)) || matches!(factor, Expr::Num(v) if *v < 0.0);
                    write_wrapped(f, factor, wrap)?;
                }
                Ok(())
            }
            Expr::Add(terms) => {
                for (i, term) in terms.iter().enumerate() {
                    match (i, negated_for_display(term)) {
                        (0, _) => write!(f, "{term}")?,
                        (_, Some(positive)) => write!(f, " - {positive}")?,
                        (_, None) => write!(f, " + {term}")?,
                    }
                }
                Ok(())
            }
        }
    }
}

// --- parser ---

/// Parses an infix expression such as `"sin(x_1 - x_0) + 2*w^2"`.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(NetworkError::Parse(format!("unexpected token {token:?}"))),
    }
}

impl FromStr for Expr {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // scientific notation: 1e-3, 2.5E+4
            if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse()
                .map_err(|_| NetworkError::Parse(format!("invalid number `{text}`")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Identifier(chars[start..i].iter().collect()));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(NetworkError::Parse(format!("unexpected character `{other}`"))),
            };
            tokens.push(token);
            i += 1;
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err(NetworkError::Parse("expected ')'".to_string())),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.consume();
                    left = left + self.parse_term()?;
                }
                Some(Token::Minus) => {
                    self.consume();
                    left = left - self.parse_term()?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.consume();
                    left = left * self.parse_unary()?;
                }
                Some(Token::Slash) => {
                    self.consume();
                    left = left / self.parse_unary()?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            return Ok(-self.parse_unary()?);
        }
        self.parse_power()
    }

    // right associative: a^b^c = a^(b^c)
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(base.pow(exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Num(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let func = Func::from_name(&name)
                        .ok_or_else(|| NetworkError::Parse(format!("unknown function `{name}`")))?;
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::call(func, arg))
                } else {
                    Ok(Expr::symbol(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => Err(NetworkError::Parse(format!("unexpected token {token:?}"))),
            None => Err(NetworkError::Parse("unexpected end of input".to_string())),
        }
    }
}
