use crate::autodiff::Dual;
use crate::error::{NetworkError, Result};
use crate::symbolic::{constant, integer_exponent, Expr, Func, Symbol};
use crate::system::{EquationSystem, OdeCallbacks};
use crate::traits::{DynamicalSystem, Scalar};
use std::collections::HashMap;

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of a dependency (by position in the dependency vector).
    LoadVar(usize),
    /// Pushes the current time.
    LoadTime,
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes a^n for a fixed integer n.
    PowI(i32),
    /// Pops top value (a), pushes f(a).
    Call(Func),
    /// Pops top value (a), pushes -a.
    Neg,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

/// Stack-based Virtual Machine for evaluating equations.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Current state vector (read-only).
/// - `t`: Current time.
/// - `stack`: A mutable buffer for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(bytecode: &Bytecode, vars: &[T], t: T, stack: &mut Vec<T>) -> T {
        stack.clear();

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => stack.push(constant(*val)),
                OpCode::LoadVar(idx) => stack.push(vars[*idx]),
                OpCode::LoadTime => stack.push(t),
                OpCode::Add => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a + b);
                }
                OpCode::Mul => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a * b);
                }
                OpCode::Pow => {
                    let (a, b) = pop_pair(stack);
                    stack.push(a.powf(b));
                }
                OpCode::PowI(n) => {
                    let a = pop(stack);
                    stack.push(a.powi(*n));
                }
                OpCode::Call(func) => {
                    let a = pop(stack);
                    stack.push(func.apply(a));
                }
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
            }
        }

        // The compiler leaves exactly one value; an empty stack means empty bytecode.
        stack.pop().unwrap_or_else(T::zero)
    }
}

fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

fn pop_pair<T: Scalar>(stack: &mut Vec<T>) -> (T, T) {
    let b = pop(stack);
    let a = pop(stack);
    (a, b)
}

/// Compiles symbolic expressions into `Bytecode`.
/// Resolves dependency symbols to slots and the time symbol to `LoadTime`.
pub struct Compiler {
    pub var_map: HashMap<Symbol, usize>,
    pub time: Symbol,
}

impl Compiler {
    pub fn new(dependencies: &[Symbol], time: &Symbol) -> Self {
        let var_map = dependencies
            .iter()
            .enumerate()
            .map(|(i, s)| (s.clone(), i))
            .collect();
        Self {
            var_map,
            time: time.clone(),
        }
    }

    pub fn compile(&self, expr: &Expr) -> Result<Bytecode> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Num(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Sym(s) if *s == self.time => ops.push(OpCode::LoadTime),
            Expr::Sym(s) => {
                let idx = self
                    .var_map
                    .get(s)
                    .ok_or_else(|| NetworkError::UnboundSymbol(s.name().to_string()))?;
                ops.push(OpCode::LoadVar(*idx));
            }
            Expr::Add(terms) => self.compile_chain(terms, OpCode::Add, 0.0, ops)?,
            Expr::Mul(factors) => match factors.split_first() {
                // -1 * rest compiles to a negation
                Some((Expr::Num(c), rest)) if *c == -1.0 && !rest.is_empty() => {
                    self.compile_chain(rest, OpCode::Mul, 1.0, ops)?;
                    ops.push(OpCode::Neg);
                }
                _ => self.compile_chain(factors, OpCode::Mul, 1.0, ops)?,
            },
            Expr::Pow(base, exponent) => {
                self.compile_recursive(base, ops)?;
                match integer_exponent(exponent) {
                    Some(n) => ops.push(OpCode::PowI(n)),
                    None => {
                        self.compile_recursive(exponent, ops)?;
                        ops.push(OpCode::Pow);
                    }
                }
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(OpCode::Call(*func));
            }
        }
        Ok(())
    }

    fn compile_chain(
        &self,
        items: &[Expr],
        op: OpCode,
        identity: f64,
        ops: &mut Vec<OpCode>,
    ) -> Result<()> {
        let Some((first, rest)) = items.split_first() else {
            ops.push(OpCode::LoadConst(identity));
            return Ok(());
        };
        self.compile_recursive(first, ops)?;
        for item in rest {
            self.compile_recursive(item, ops)?;
            ops.push(op);
        }
        Ok(())
    }
}

// --- NativeSystem ---

/// Bytecode-compiled variant of an [`EquationSystem`]: one program per
/// dependency, executed by the [`VM`].
#[derive(Debug, Clone)]
pub struct NativeSystem {
    dependencies: Vec<Symbol>,
    equations: Vec<Bytecode>,
}

impl NativeSystem {
    /// Compiles every right-hand side of `system`.
    pub fn from_reference(system: &EquationSystem) -> Result<Self> {
        let compiler = Compiler::new(system.dependencies(), system.time());
        let equations = system
            .expressions()
            .iter()
            .map(|expr| compiler.compile(expr))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            dependencies: system.dependencies().to_vec(),
            equations,
        })
    }

    pub fn dependencies(&self) -> &[Symbol] {
        &self.dependencies
    }

    pub fn equations(&self) -> &[Bytecode] {
        &self.equations
    }

    fn run<T: Scalar>(&self, t: T, x: &[T], out: &mut [T]) {
        let mut stack = Vec::with_capacity(32);
        for (slot, eq) in out.iter_mut().zip(&self.equations) {
            *slot = VM::execute(eq, x, t, &mut stack);
        }
    }
}

impl DynamicalSystem<f64> for NativeSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        self.run(t, x, out);
    }
}

impl DynamicalSystem<Dual> for NativeSystem {
    fn dimension(&self) -> usize {
        self.equations.len()
    }

    fn apply(&self, t: Dual, x: &[Dual], out: &mut [Dual]) {
        self.run(t, x, out);
    }
}

impl OdeCallbacks for NativeSystem {}
