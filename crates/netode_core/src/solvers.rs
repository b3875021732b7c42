use crate::config::{IntegrateOptions, Integrator};
use crate::error::NetworkError;
use crate::symbolic::constant;
use crate::traits::{DynamicalSystem, Scalar, Steppable};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Explicit Euler Solver
pub struct Euler<T: Scalar> {
    k1: Vec<T>,
}

impl<T: Scalar> Euler<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Euler<T> {
    fn step<S>(&mut self, system: &S, t: &mut T, state: &mut [T], dt: T)
    where
        S: DynamicalSystem<T> + ?Sized,
    {
        system.apply(*t, state, &mut self.k1);
        for i in 0..state.len() {
            state[i] = state[i] + dt * self.k1[i];
        }
        *t = *t + dt;
    }
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    k3: Vec<T>,
    k4: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> RK4<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::zero(); dim],
            k2: vec![T::zero(); dim],
            k3: vec![T::zero(); dim],
            k4: vec![T::zero(); dim],
            tmp: vec![T::zero(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for RK4<T> {
    fn step<S>(&mut self, system: &S, t: &mut T, state: &mut [T], dt: T)
    where
        S: DynamicalSystem<T> + ?Sized,
    {
        let half: T = constant(0.5);
        let sixth: T = constant(1.0 / 6.0);
        let two: T = constant(2.0);

        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1);

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k2);

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * half;
        }
        system.apply(t0 + dt * half, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] = state[i]
                + dt * sixth * (self.k1[i] + two * self.k2[i] + two * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
    }
}

// Tsitouras (2011) tableau; row i of TSIT5_A sums to TSIT5_C[i].
const TSIT5_C: [f64; 6] = [0.0, 0.161, 0.327, 0.9, 0.9800255409045097, 1.0];
const TSIT5_A: [[f64; 5]; 6] = [
    [0.0, 0.0, 0.0, 0.0, 0.0],
    [0.161, 0.0, 0.0, 0.0, 0.0],
    [-0.008480655492356989, 0.335480655492357, 0.0, 0.0, 0.0],
    [2.897153057105493, -6.359448489975075, 4.3622954328695815, 0.0, 0.0],
    [
        5.325864828439257,
        -11.748883564062828,
        7.4955393428898365,
        -0.09249506636175525,
        0.0,
    ],
    [
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.028269050394068383,
    ],
];
// 5th order weights
const TSIT5_B: [f64; 6] = [
    0.09646076681806523,
    0.01,
    0.4798896504144996,
    1.379008574103742,
    -3.290069515436081,
    2.324710524099774,
];

/// Tsitouras 5/4 Solver, used here with a fixed step (5th order update).
pub struct Tsit5<T: Scalar> {
    k: [Vec<T>; 6],
    tmp: Vec<T>,
}

impl<T: Scalar> Tsit5<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::zero();
        Self {
            k: std::array::from_fn(|_| vec![z; dim]),
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Tsit5<T> {
    fn step<S>(&mut self, system: &S, t: &mut T, state: &mut [T], dt: T)
    where
        S: DynamicalSystem<T> + ?Sized,
    {
        let t0 = *t;
        let c = TSIT5_C.map(constant::<T>);
        let a = TSIT5_A.map(|row| row.map(constant::<T>));
        let b = TSIT5_B.map(constant::<T>);

        system.apply(t0, state, &mut self.k[0]);

        for stage in 1..6 {
            for i in 0..state.len() {
                let mut acc = T::zero();
                for (j, k) in self.k[..stage].iter().enumerate() {
                    acc = acc + a[stage][j] * k[i];
                }
                self.tmp[i] = state[i] + dt * acc;
            }
            system.apply(t0 + c[stage] * dt, &self.tmp, &mut self.k[stage]);
        }

        // Update State
        for i in 0..state.len() {
            let mut acc = T::zero();
            for (bj, k) in b.iter().zip(&self.k) {
                acc = acc + *bj * k[i];
            }
            state[i] = state[i] + dt * acc;
        }

        *t = t0 + dt;
    }
}

// --- Integration driver ---

/// Where to report the solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    /// Integrate from 0 to the given time, reporting every step.
    Until(f64),
    /// Report exactly at these non-decreasing times; the first is the start.
    Points(Vec<f64>),
}

impl From<f64> for Horizon {
    fn from(t_end: f64) -> Self {
        Horizon::Until(t_end)
    }
}

impl From<Vec<f64>> for Horizon {
    fn from(points: Vec<f64>) -> Self {
        Horizon::Points(points)
    }
}

impl Horizon {
    /// Output times and the number of fixed steps between consecutive ones.
    ///
    /// The step budget is enforced before anything proportional to the step
    /// count is allocated.
    fn plan(&self, dt: f64, max_steps: usize) -> Result<(Vec<f64>, Vec<usize>)> {
        match self {
            Horizon::Until(t_end) => {
                if !t_end.is_finite() || *t_end < 0.0 {
                    bail!("Integration horizon must be finite and non-negative (got {t_end}).");
                }
                let n = substeps(*t_end, dt, max_steps)?;
                let times = (0..=n)
                    .map(|i| {
                        if i == n {
                            *t_end
                        } else {
                            *t_end * i as f64 / n as f64
                        }
                    })
                    .collect();
                Ok((times, vec![1; n]))
            }
            Horizon::Points(points) => {
                if points.is_empty() {
                    bail!("At least one output time is required.");
                }
                if let Some(bad) = points.iter().find(|t| !t.is_finite()) {
                    bail!("Output times must be finite (got {bad}).");
                }
                if let Some(w) = points.windows(2).find(|w| w[1] < w[0]) {
                    bail!(
                        "Output times must be non-decreasing ({} follows {}).",
                        w[1],
                        w[0]
                    );
                }
                let mut total: usize = 0;
                let mut plan = Vec::with_capacity(points.len().saturating_sub(1));
                for w in points.windows(2) {
                    let steps = substeps(w[1] - w[0], dt, max_steps)?;
                    total = total
                        .checked_add(steps)
                        .filter(|&total| total <= max_steps)
                        .ok_or_else(|| over_budget(max_steps))?;
                    plan.push(steps);
                }
                Ok((points.clone(), plan))
            }
        }
    }
}

fn over_budget(max_steps: usize) -> anyhow::Error {
    anyhow::anyhow!("Integration needs more than max_steps = {max_steps} steps.")
}

/// Number of uniform steps no longer than `dt` covering `span`, at most
/// `max_steps`.
fn substeps(span: f64, dt: f64, max_steps: usize) -> Result<usize> {
    if span <= 0.0 {
        return Ok(0);
    }
    // tolerate round-off so span == k * dt gives exactly k steps
    let n = (span / dt - 1e-9).ceil().max(1.0);
    if n > max_steps as f64 {
        return Err(over_budget(max_steps));
    }
    Ok(n as usize)
}

/// Sampled solution: `yout[i]` is the state at `xout[i]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Trajectory {
    pub xout: Vec<f64>,
    pub yout: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.xout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xout.is_empty()
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.yout.last().map(Vec::as_slice)
    }

    /// Time series of state component `index`, or `None` if out of range.
    pub fn component(&self, index: usize) -> Option<Vec<f64>> {
        self.yout.iter().map(|y| y.get(index).copied()).collect()
    }
}

/// Integrates `system` from `y0` with a fixed-step explicit scheme.
pub fn integrate<S>(
    system: &S,
    integrator: Integrator,
    horizon: &Horizon,
    y0: &[f64],
    options: &IntegrateOptions,
) -> Result<Trajectory>
where
    S: DynamicalSystem<f64> + ?Sized,
{
    let dim = system.dimension();
    if y0.len() != dim {
        bail!(NetworkError::DimensionMismatch {
            expected: dim,
            got: y0.len(),
        });
    }
    if !(options.dt > 0.0 && options.dt.is_finite()) {
        bail!("dt must be positive and finite (got {}).", options.dt);
    }

    let (times, plan) = horizon.plan(options.dt, options.max_steps)?;

    match integrator {
        Integrator::Euler => drive(Euler::new(dim), system, &times, &plan, y0),
        Integrator::Rk4 => drive(RK4::new(dim), system, &times, &plan, y0),
        Integrator::Tsit5 => drive(Tsit5::new(dim), system, &times, &plan, y0),
    }
}

fn drive<St, S>(
    mut stepper: St,
    system: &S,
    times: &[f64],
    plan: &[usize],
    y0: &[f64],
) -> Result<Trajectory>
where
    St: Steppable<f64>,
    S: DynamicalSystem<f64> + ?Sized,
{
    let mut state = y0.to_vec();
    let mut xout = Vec::with_capacity(times.len());
    let mut yout = Vec::with_capacity(times.len());
    xout.push(times[0]);
    yout.push(state.clone());

    for (w, &steps) in times.windows(2).zip(plan) {
        if steps > 0 {
            let h = (w[1] - w[0]) / steps as f64;
            let mut t = w[0];
            for _ in 0..steps {
                stepper.step(system, &mut t, &mut state, h);
            }
            if state.iter().any(|v| !v.is_finite()) {
                bail!("Integration diverged before t = {}.", w[1]);
            }
        }
        xout.push(w[1]);
        yout.push(state.clone());
    }

    Ok(Trajectory { xout, yout })
}
