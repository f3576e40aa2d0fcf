use std::collections::HashMap;

use entraflow_core::payload::Payload;
use entraflow_core::types::{NodeState, NodeStatus};

use super::builder::ExecutionGraph;

/// What a pending node should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency has not reached a terminal state yet.
    Wait,
    Ready,
    Skip,
}

/// Decide whether a pending node can run, must wait, or is skipped.
///
/// - A failed dependency, or a succeeded dependency whose edge condition is
///   false, skips the node at once.
/// - Any non-terminal dependency means wait.
/// - Otherwise the node is ready when at least one inbound edge is satisfied.
///   Skipped dependencies are ignored; if every dependency was skipped the
///   node is skipped too.
pub fn evaluate(graph: &ExecutionGraph, node: usize, states: &HashMap<String, NodeState>) -> Readiness {
    let inbound = graph.dependencies(node);
    if inbound.is_empty() {
        return Readiness::Ready;
    }

    let empty = Payload::default();
    let mut satisfied = 0;
    let mut waiting = false;

    for edge in inbound {
        let Some(dep) = states.get(graph.id(edge.from)) else {
            waiting = true;
            continue;
        };
        match dep.status {
            NodeStatus::Failed => return Readiness::Skip,
            NodeStatus::Succeeded => {
                let holds = edge
                    .condition
                    .as_ref()
                    .map_or(true, |c| c.evaluate(dep.result.as_ref().unwrap_or(&empty)));
                if !holds {
                    return Readiness::Skip;
                }
                satisfied += 1;
            }
            NodeStatus::Skipped => {}
            NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Running => waiting = true,
        }
    }

    if waiting {
        Readiness::Wait
    } else if satisfied > 0 {
        Readiness::Ready
    } else {
        Readiness::Skip
    }
}
