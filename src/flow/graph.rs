// src/flow/graph.rs

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{PgflowError, Result};
use crate::flow::StepDefinition;

/// Immediate deps and dependents of a single step.
#[derive(Debug, Clone, Default)]
struct StepNode {
    deps: Vec<String>,
    dependents: Vec<String>,
}

/// Adjacency view over the steps of a flow, keyed by step slug.
///
/// Construction rejects unknown dependencies, self-dependencies and cycles,
/// so every instance describes a valid DAG. `order()` is a topological order.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    nodes: HashMap<String, StepNode>,
    order: Vec<String>,
}

impl FlowGraph {
    pub fn from_steps(steps: &[StepDefinition]) -> Result<Self> {
        let mut nodes: HashMap<String, StepNode> = HashMap::new();

        for step in steps {
            if nodes.contains_key(&step.slug) {
                return Err(PgflowError::ConfigError(format!(
                    "step '{}' is defined more than once",
                    step.slug
                )));
            }
            nodes.insert(
                step.slug.clone(),
                StepNode {
                    deps: step.depends_on.clone(),
                    dependents: Vec::new(),
                },
            );
        }

        for step in steps {
            for dep in &step.depends_on {
                if dep == &step.slug {
                    return Err(PgflowError::ConfigError(format!(
                        "step '{}' cannot depend on itself",
                        step.slug
                    )));
                }
                match nodes.get_mut(dep) {
                    Some(node) => node.dependents.push(step.slug.clone()),
                    None => {
                        return Err(PgflowError::ConfigError(format!(
                            "step '{}' has unknown dependency '{}'",
                            step.slug, dep
                        )));
                    }
                }
            }
        }

        // Edge direction: dep -> step.
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for step in steps {
            graph.add_node(step.slug.as_str());
        }
        for step in steps {
            for dep in &step.depends_on {
                graph.add_edge(dep.as_str(), step.slug.as_str(), ());
            }
        }

        let order = match toposort(&graph, None) {
            Ok(order) => order.into_iter().map(str::to_string).collect(),
            Err(cycle) => {
                return Err(PgflowError::DagCycle(format!(
                    "cycle detected in flow graph involving step '{}'",
                    cycle.node_id()
                )));
            }
        };

        Ok(Self { nodes, order })
    }

    /// All step slugs, in topological order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.nodes.contains_key(slug)
    }

    /// Immediate dependencies of a step (its `depends_on`).
    pub fn dependencies_of(&self, slug: &str) -> &[String] {
        self.nodes
            .get(slug)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a step (steps listing it in `depends_on`).
    pub fn dependents_of(&self, slug: &str) -> &[String] {
        self.nodes
            .get(slug)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Steps without dependencies; activated together with the run.
    pub fn roots(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter(|slug| self.dependencies_of(slug).is_empty())
            .map(String::as_str)
    }

    /// Steps nothing depends on; their outputs make up the run output.
    pub fn leaves(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter(|slug| self.dependents_of(slug).is_empty())
            .map(String::as_str)
    }
}
