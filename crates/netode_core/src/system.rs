//! The compiled equation system handed to the integrator.

use crate::autodiff::{self, Dual};
use crate::error::{NetworkError, Result};
use crate::symbolic::{Expr, Symbol};
use crate::traits::{DynamicalSystem, Scalar};
use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use std::collections::{HashMap, HashSet};

/// Solver-facing callbacks shared by the reference and native systems.
pub trait OdeCallbacks: DynamicalSystem<f64> + DynamicalSystem<Dual> {
    /// dy/dt at `(t, y)`.
    fn f_cb(&self, t: f64, y: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; y.len()];
        DynamicalSystem::<f64>::apply(self, t, y, &mut out);
        out
    }

    /// Dense Jacobian d f / d y.
    fn j_cb(&self, t: f64, y: &[f64]) -> DMatrix<f64> {
        autodiff::jacobian(self, t, y)
    }

    /// Jacobian-vector product J v.
    fn jtimes_cb(&self, t: f64, y: &[f64], v: &[f64]) -> Vec<f64> {
        autodiff::jacobian_vector_product(self, t, y, v)
    }
}

/// Reference equation system: `(dependency, expression)` pairs evaluated by
/// walking the expression trees.
///
/// Construction checks that the pairs line up, that dependencies are
/// distinct and that every free symbol is a dependency or the time symbol.
#[derive(Debug, Clone)]
pub struct EquationSystem {
    dependencies: Vec<Symbol>,
    expressions: Vec<Expr>,
    time: Symbol,
    slots: HashMap<Symbol, usize>,
}

impl EquationSystem {
    pub fn new(dependencies: Vec<Symbol>, expressions: Vec<Expr>, time: Symbol) -> Result<Self> {
        if dependencies.len() != expressions.len() {
            return Err(NetworkError::DimensionMismatch {
                expected: dependencies.len(),
                got: expressions.len(),
            });
        }

        let mut slots = HashMap::with_capacity(dependencies.len());
        for (i, dep) in dependencies.iter().enumerate() {
            if slots.insert(dep.clone(), i).is_some() {
                return Err(NetworkError::ContractViolation(format!(
                    "dependency {dep} appears more than once"
                )));
            }
        }
        if slots.contains_key(&time) {
            return Err(NetworkError::ContractViolation(format!(
                "time symbol {time} is also a dependency"
            )));
        }

        for expr in &expressions {
            if let Some(unbound) = expr
                .free_symbols()
                .into_iter()
                .find(|s| *s != time && !slots.contains_key(s))
            {
                return Err(NetworkError::UnboundSymbol(unbound.name().to_string()));
            }
        }

        Ok(Self {
            dependencies,
            expressions,
            time,
            slots,
        })
    }

    pub fn dependencies(&self) -> &[Symbol] {
        &self.dependencies
    }

    pub fn expressions(&self) -> &[Expr] {
        &self.expressions
    }

    pub fn time(&self) -> &Symbol {
        &self.time
    }

    /// Position of `dependency` in the state vector.
    pub fn slot(&self, dependency: &Symbol) -> Option<usize> {
        self.slots.get(dependency).copied()
    }

    /// Right-hand side for `dependency`.
    pub fn rhs(&self, dependency: &Symbol) -> Option<&Expr> {
        self.slot(dependency).map(|i| &self.expressions[i])
    }

    /// Symbolic Jacobian, row `i` holding d f_i / d y_j.
    pub fn symbolic_jacobian(&self) -> Vec<Vec<Expr>> {
        self.expressions
            .iter()
            .map(|expr| self.dependencies.iter().map(|dep| expr.diff(dep)).collect())
            .collect()
    }

    /// Structural nonzero pattern of the Jacobian.
    pub fn jacobian_sparsity(&self) -> CsrMatrix<f64> {
        let n = self.dependencies.len();
        let mut coo = CooMatrix::new(n, n);
        for (i, expr) in self.expressions.iter().enumerate() {
            let mut seen = HashSet::new();
            for symbol in expr.free_symbols() {
                if let Some(j) = self.slot(&symbol) {
                    if seen.insert(j) {
                        coo.push(i, j, 1.0);
                    }
                }
            }
        }
        CsrMatrix::from(&coo)
    }

    fn evaluate<T: Scalar>(&self, t: T, x: &[T], out: &mut [T]) {
        let resolve = |s: &Symbol| {
            if *s == self.time {
                Some(t)
            } else {
                self.slots.get(s).map(|&i| x[i])
            }
        };
        for (slot, expr) in out.iter_mut().zip(&self.expressions) {
            // symbols were checked at construction
            *slot = expr.eval(&resolve).unwrap_or_else(|_| T::nan());
        }
    }
}

impl DynamicalSystem<f64> for EquationSystem {
    fn dimension(&self) -> usize {
        self.dependencies.len()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        self.evaluate(t, x, out);
    }
}

impl DynamicalSystem<Dual> for EquationSystem {
    fn dimension(&self) -> usize {
        self.dependencies.len()
    }

    fn apply(&self, t: Dual, x: &[Dual], out: &mut [Dual]) {
        self.evaluate(t, x, out);
    }
}

impl OdeCallbacks for EquationSystem {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolic::parse;

    fn system(exprs: &[&str]) -> Result<EquationSystem> {
        let deps = (0..exprs.len()).map(|i| Symbol::new(format!("y_{i}"))).collect();
        let exprs = exprs.iter().map(|e| parse(e).unwrap()).collect();
        EquationSystem::new(deps, exprs, Symbol::new("t"))
    }

    #[test]
    fn construction_validates_pairs() {
        let deps = vec![Symbol::new("y_0"), Symbol::new("y_0")];
        let exprs = vec![Expr::zero(), Expr::zero()];
        assert!(matches!(
            EquationSystem::new(deps, exprs, Symbol::new("t")),
            Err(NetworkError::ContractViolation(_))
        ));

        let err = EquationSystem::new(vec![Symbol::new("y_0")], vec![], Symbol::new("t"));
        assert_eq!(
            err.unwrap_err(),
            NetworkError::DimensionMismatch { expected: 1, got: 0 }
        );

        assert_eq!(
            system(&["y_0 * k"]).unwrap_err(),
            NetworkError::UnboundSymbol("k".to_string())
        );
    }

    #[test]
    fn callbacks_evaluate_the_vector_field() {
        let sys = system(&["-y_1", "y_0 + t"]).unwrap();
        assert_eq!(sys.f_cb(2.0, &[1.0, 3.0]), vec![-3.0, 3.0]);
        assert_eq!(sys.jtimes_cb(0.0, &[1.0, 3.0], &[1.0, 0.0]), vec![0.0, 1.0]);
    }

    #[test]
    fn dual_jacobian_matches_symbolic_jacobian() {
        let sys = system(&["y_0^2*sin(y_1)", "exp(y_0 - y_1) + t*y_1"]).unwrap();
        let y = [0.8, -0.4];
        let t = 1.5;
        let numeric = sys.j_cb(t, &y);
        let symbolic = sys.symbolic_jacobian();
        for (i, row) in symbolic.iter().enumerate() {
            for (j, entry) in row.iter().enumerate() {
                let value: f64 = entry
                    .eval(&|s: &Symbol| match s.name() {
                        "y_0" => Some(y[0]),
                        "y_1" => Some(y[1]),
                        "t" => Some(t),
                        _ => None,
                    })
                    .unwrap();
                assert!((value - numeric[(i, j)]).abs() < 1e-12, "entry ({i}, {j})");
            }
        }
    }

    #[test]
    fn sparsity_follows_free_symbols() {
        let sys = system(&["y_0", "y_0*y_1 + y_0", "t"]).unwrap();
        let pattern = sys.jacobian_sparsity();
        assert_eq!(pattern.nnz(), 3);
        let rows: Vec<usize> = pattern.row_iter().map(|r| r.nnz()).collect();
        assert_eq!(rows, vec![1, 2, 0]);
    }
}
