//! The `netode_core` crate describes ODE dynamics on mutable graphs.
//!
//! A [`Network`] pairs a graph with a [`Protocol`], the user's rule for
//! writing each node's equation. Every mutation of the graph (nodes, edges,
//! attributes at any nesting level) expires the compiled dynamics; the next
//! read reassembles the symbolic right-hand side and recompiles it.
//!
//! Key components:
//! - **Store / Graph**: attribute containers that signal an [`Observer`] on every write.
//! - **Protocol / Assembly**: monolithic or termwise rules turned into `(dependency, expression)` pairs.
//! - **Symbolic**: a small expression algebra with simplification and differentiation.
//! - **System / Equation Engine**: a tree-walking reference system and a bytecode VM.
//! - **Autodiff / Solvers**: dual-number Jacobians and fixed-step integrators.

pub mod assembly;
pub mod autodiff;
pub mod config;
pub mod equation_engine;
pub mod error;
pub mod graph;
pub mod network;
pub mod protocol;
pub mod solvers;
pub mod store;
pub mod symbolic;
pub mod system;
pub mod traits;
pub mod views;

pub use assembly::{Assembled, Layout};
pub use config::{IntegrateOptions, Integrator, NetworkConfig, ParamScope, Schema, TIME};
pub use equation_engine::NativeSystem;
pub use error::{NetworkError, Result};
pub use graph::{Directed, EdgeKind, Graph, NodeId, Undirected};
pub use network::{Network, NetworkSpec};
pub use protocol::{Context, Protocol, ProtocolKind, RhsKey, TermHooks, Terms};
pub use solvers::{integrate, Horizon, Trajectory};
pub use store::{attrs, AttrMap, AttrValue, Observer, TrackedMap};
pub use symbolic::{parse, Expr, Symbol};
pub use system::{EquationSystem, OdeCallbacks};
pub use views::{placeholder, EdgeParamView, NodeParamView, VarView};
