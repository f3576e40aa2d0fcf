use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use entraflow_core::condition::Condition;
use entraflow_core::error::{EntraflowError, Result};
use entraflow_core::workflow::{NodeSpec, WorkflowDefinition};

use crate::registry::AgentRegistry;

/// An inbound edge of a node, as seen from its target.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    /// Index of the source node.
    pub from: usize,
    pub condition: Option<Condition>,
}

/// A validated, executable view of a [`WorkflowDefinition`].
///
/// Nodes are addressed by their declaration index. One graph belongs to one
/// run and is never shared between concurrent runs.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    definition: Arc<WorkflowDefinition>,
    index: HashMap<String, usize>,
    /// node -> dependents
    dependents: Vec<Vec<usize>>,
    /// node -> inbound edges
    dependencies: Vec<Vec<Inbound>>,
    order: Vec<usize>,
    levels: Vec<usize>,
    required: Vec<bool>,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl ExecutionGraph {
    /// Validate a definition against the registry and build its graph.
    pub fn build(definition: Arc<WorkflowDefinition>, registry: &AgentRegistry) -> Result<Self> {
        let index = index_nodes(&definition)?;

        for node in &definition.nodes {
            if !registry.contains(&node.agent) {
                return Err(EntraflowError::InvalidDefinition(format!(
                    "Node '{}' uses unregistered agent '{}'",
                    node.id, node.agent
                )));
            }
        }

        let n = definition.nodes.len();
        let mut dependents = vec![Vec::new(); n];
        let mut dependencies: Vec<Vec<Inbound>> = vec![Vec::new(); n];
        let mut seen_edges = HashSet::new();

        for edge in definition.all_edges() {
            let from = lookup(&index, &edge.from, &edge.to)?;
            let to = lookup(&index, &edge.to, &edge.from)?;
            if from == to {
                return Err(EntraflowError::CycleDetected {
                    path: vec![edge.from.clone(), edge.to.clone()],
                });
            }
            if !seen_edges.insert((from, to)) {
                return Err(EntraflowError::InvalidDefinition(format!(
                    "Duplicate edge '{}' -> '{}'",
                    edge.from, edge.to
                )));
            }
            dependents[from].push(to);
            dependencies[to].push(Inbound {
                from,
                condition: edge.condition,
            });
        }

        detect_cycle(&definition.nodes, &dependents)?;
        let order = topological_order(&dependents, &dependencies);

        let mut levels = vec![0; n];
        for &node in &order {
            levels[node] = dependencies[node]
                .iter()
                .map(|d| levels[d.from] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut required = vec![false; n];
        for &node in order.iter().rev() {
            let spec = &definition.nodes[node];
            required[node] = !spec.optional
                && (dependents[node].is_empty() || dependents[node].iter().any(|&d| required[d]));
        }

        if n > 1 {
            for (i, spec) in definition.nodes.iter().enumerate() {
                if dependents[i].is_empty() && dependencies[i].is_empty() {
                    warn!(workflow = %definition.name, node_id = %spec.id, "Node is not connected to any other node");
                }
            }
        }

        Ok(Self {
            definition,
            index,
            dependents,
            dependencies,
            order,
            levels,
            required,
        })
    }

    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.definition.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.nodes.is_empty()
    }

    /// Declaration index of a node id.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn spec(&self, node: usize) -> &NodeSpec {
        &self.definition.nodes[node]
    }

    pub fn id(&self, node: usize) -> &str {
        &self.definition.nodes[node].id
    }

    /// Topological order, ties broken by declaration order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Node ids in topological order.
    pub fn ordered_ids(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.id(i)).collect()
    }

    pub fn dependencies(&self, node: usize) -> &[Inbound] {
        &self.dependencies[node]
    }

    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    /// Level 0 holds the roots; every other node sits one level below its
    /// deepest dependency.
    pub fn level(&self, node: usize) -> usize {
        self.levels[node]
    }

    /// Node ids grouped by level, each group in topological order.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let depth = self.levels.iter().copied().max().map_or(0, |m| m + 1);
        let mut grouped = vec![Vec::new(); depth];
        for &node in &self.order {
            grouped[self.levels[node]].push(self.id(node));
        }
        grouped
    }

    /// A node is required when it is not optional and it is either a sink or
    /// feeds at least one required node. A required node that fails fails
    /// the run.
    pub fn is_required(&self, node: usize) -> bool {
        self.required[node]
    }
}

fn index_nodes(definition: &WorkflowDefinition) -> Result<HashMap<String, usize>> {
    if definition.name.trim().is_empty() {
        return Err(EntraflowError::InvalidDefinition(
            "Workflow name is empty".into(),
        ));
    }
    if definition.nodes.is_empty() {
        return Err(EntraflowError::InvalidDefinition(format!(
            "Workflow '{}' has no nodes",
            definition.name
        )));
    }

    let mut index = HashMap::with_capacity(definition.nodes.len());
    for (i, node) in definition.nodes.iter().enumerate() {
        if node.id.trim().is_empty() {
            return Err(EntraflowError::InvalidDefinition(format!(
                "Node #{} has an empty id",
                i
            )));
        }
        if index.insert(node.id.clone(), i).is_some() {
            return Err(EntraflowError::InvalidDefinition(format!(
                "Duplicate node id '{}'",
                node.id
            )));
        }
    }
    Ok(index)
}

fn lookup(index: &HashMap<String, usize>, id: &str, other: &str) -> Result<usize> {
    index.get(id).copied().ok_or_else(|| {
        EntraflowError::InvalidDefinition(format!(
            "Edge between '{}' and '{}' references undeclared node '{}'",
            id, other, id
        ))
    })
}

/// Depth-first search with three-color marking. A back-edge to a gray node
/// closes a cycle; the reported path starts and ends at that node.
fn detect_cycle(nodes: &[NodeSpec], dependents: &[Vec<usize>]) -> Result<()> {
    let mut color = vec![Color::White; nodes.len()];

    for root in 0..nodes.len() {
        if color[root] != Color::White {
            continue;
        }
        // (node, next child position)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;

        while let Some(&(node, next)) = stack.last() {
            if let Some(&child) = dependents[node].get(next) {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                match color[child] {
                    Color::White => {
                        color[child] = Color::Gray;
                        stack.push((child, 0));
                    }
                    Color::Gray => {
                        let start = stack.iter().position(|&(n, _)| n == child).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..]
                            .iter()
                            .map(|&(n, _)| nodes[n].id.clone())
                            .collect();
                        path.push(nodes[child].id.clone());
                        return Err(EntraflowError::CycleDetected { path });
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm, always taking the earliest-declared ready node.
fn topological_order(dependents: &[Vec<usize>], dependencies: &[Vec<Inbound>]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(dependents.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &child in &dependents[node] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.push(Reverse(child));
            }
        }
    }
    order
}
