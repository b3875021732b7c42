use thiserror::Error;

use crate::protocol::ProtocolKind;

/// Errors raised while describing, assembling or evaluating a network's dynamics.
///
/// Definition and contract errors surface when a network is built; data errors
/// (`UndefinedExpression`, `UnknownNode`, ...) surface at rebuild or lookup time
/// and leave the dynamics cache dirty.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    /// A monolithic right-hand side produced keys that are neither all nodes
    /// nor all declared variables, or entries of the wrong shape.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// A termwise protocol is missing a hook its edge kind requires.
    #[error("{protocol} dynamics must implement `{hook}`")]
    MissingTermImplementation {
        hook: &'static str,
        protocol: ProtocolKind,
    },

    /// An assembled right-hand side is undefined, usually because a declared
    /// parameter was never set.
    #[error("undefined expression for d{dependency}/dt: {expression}")]
    UndefinedExpression {
        dependency: String,
        expression: String,
    },

    #[error("the node {0} is not in the graph")]
    UnknownNode(String),

    #[error("the edge {0} is not in the graph")]
    UnknownEdge(String),

    /// Invalid variable or parameter declaration.
    #[error("invalid declaration: {0}")]
    Definition(String),

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("unknown variable `{0}`")]
    UnknownVariable(String),

    #[error("missing parameter `{name}` on {owner}")]
    MissingParameter { name: String, owner: String },

    /// A compiled expression references a symbol that is neither a
    /// dependency nor the time symbol.
    #[error("unbound symbol `{0}`")]
    UnboundSymbol(String),

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("unknown integrator `{0}`")]
    UnknownIntegrator(String),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, NetworkError>;
