use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Name of the time placeholder available to every right-hand side.
pub const TIME: &str = "t";

/// Fixed-step integrators available to [`crate::network::Network::integrate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integrator {
    Euler,
    Rk4,
    #[default]
    Tsit5,
}

impl Integrator {
    pub fn name(self) -> &'static str {
        match self {
            Integrator::Euler => "euler",
            Integrator::Rk4 => "rk4",
            Integrator::Tsit5 => "tsit5",
        }
    }
}

impl fmt::Display for Integrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Integrator {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euler" => Ok(Integrator::Euler),
            "rk4" => Ok(Integrator::Rk4),
            "tsit5" => Ok(Integrator::Tsit5),
            _ => Err(NetworkError::UnknownIntegrator(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrateOptions {
    /// Fixed step size.
    pub dt: f64,
    /// Upper bound on the number of steps taken in one call.
    pub max_steps: usize,
}

impl Default for IntegrateOptions {
    fn default() -> Self {
        Self {
            dt: 1e-3,
            max_steps: 1_000_000,
        }
    }
}

/// Construction-time options of a network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub integrator: Integrator,
    /// Also compile the bytecode variant and evaluate through it.
    pub use_native: bool,
    /// State variables in declaration order.
    pub vars: Vec<String>,
    pub node_params: Vec<String>,
    pub edge_params: Vec<String>,
    pub graph_params: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            integrator: Integrator::default(),
            use_native: false,
            vars: vec!["x".to_string()],
            node_params: Vec::new(),
            edge_params: Vec::new(),
            graph_params: Vec::new(),
        }
    }
}

impl NetworkConfig {
    pub fn with_vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vars = vars.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_node_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_edge_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edge_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_graph_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.graph_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_integrator(mut self, integrator: Integrator) -> Self {
        self.integrator = integrator;
        self
    }

    pub fn with_native(mut self, use_native: bool) -> Self {
        self.use_native = use_native;
        self
    }
}

/// Where a declared parameter lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamScope {
    Node,
    Edge,
    Graph,
}

impl fmt::Display for ParamScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParamScope::Node => "node",
            ParamScope::Edge => "edge",
            ParamScope::Graph => "graph",
        })
    }
}

/// Validated variable and parameter declarations.
///
/// Every declared name must be an identifier and unique across variables,
/// parameters and the time symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    vars: Vec<String>,
    node_params: Vec<String>,
    edge_params: Vec<String>,
    graph_params: Vec<String>,
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Schema {
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        if config.vars.is_empty() {
            return Err(NetworkError::Definition(
                "at least one state variable must be declared".to_string(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let declared = config
            .vars
            .iter()
            .map(|n| ("variable", n))
            .chain(config.node_params.iter().map(|n| ("node parameter", n)))
            .chain(config.edge_params.iter().map(|n| ("edge parameter", n)))
            .chain(config.graph_params.iter().map(|n| ("graph parameter", n)));

        for (what, name) in declared {
            if !is_identifier(name) {
                return Err(NetworkError::Definition(format!(
                    "{what} `{name}` is not a valid identifier"
                )));
            }
            if name == TIME {
                return Err(NetworkError::Definition(format!(
                    "{what} `{name}` collides with the time symbol"
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(NetworkError::Definition(format!(
                    "{what} `{name}` is declared more than once"
                )));
            }
        }

        Ok(Self {
            vars: config.vars.clone(),
            node_params: config.node_params.clone(),
            edge_params: config.edge_params.clone(),
            graph_params: config.graph_params.clone(),
        })
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v == name)
    }

    pub fn params(&self, scope: ParamScope) -> &[String] {
        match scope {
            ParamScope::Node => &self.node_params,
            ParamScope::Edge => &self.edge_params,
            ParamScope::Graph => &self.graph_params,
        }
    }

    pub fn is_declared(&self, scope: ParamScope, name: &str) -> bool {
        self.params(scope).iter().any(|p| p == name)
    }
}
