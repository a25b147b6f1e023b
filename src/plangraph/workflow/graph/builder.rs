// SPDX-License-Identifier: MIT

//! Graph builder - validates topology and produces a `CompiledGraph`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::executor::CompiledGraph;
use super::types::{Edge, Node, Router, END};
use crate::adk::error::EngineError;
use crate::plangraph::workflow::checkpoint::INPUT_NODE;

/// Default number of node executions allowed per invocation
pub const DEFAULT_RECURSION_LIMIT: u32 = 200;

/// Builder for executable graphs.
///
/// Every structural mistake is reported by `compile`, never at run time.
pub struct GraphBuilder {
    nodes: Vec<(String, Arc<dyn Node>)>,
    edges: Vec<(String, Edge)>,
    entry: Option<String>,
    recursion_limit: u32,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            entry: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    pub fn add_node(mut self, name: &str, node: Arc<dyn Node>) -> Self {
        self.nodes.push((name.to_string(), node));
        self
    }

    pub fn add_edge(mut self, from: &str, to: &str) -> Self {
        self.edges
            .push((from.to_string(), Edge::Direct(to.to_string())));
        self
    }

    /// Route out of `from` with `router`; `branches` maps each label to a target
    pub fn add_conditional_edges(
        mut self,
        from: &str,
        router: Arc<dyn Router>,
        branches: &[(&str, &str)],
    ) -> Self {
        let branches = branches
            .iter()
            .map(|(label, target)| (label.to_string(), target.to_string()))
            .collect();
        self.edges
            .push((from.to_string(), Edge::Conditional { router, branches }));
        self
    }

    pub fn set_entry(mut self, name: &str) -> Self {
        self.entry = Some(name.to_string());
        self
    }

    pub fn recursion_limit(mut self, limit: u32) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Validate the topology and freeze it
    pub fn compile(self) -> Result<CompiledGraph, EngineError> {
        let mut nodes: HashMap<String, Arc<dyn Node>> = HashMap::new();
        for (name, node) in self.nodes {
            if name == END || name == INPUT_NODE {
                return Err(EngineError::config(format!(
                    "Node name '{}' is reserved",
                    name
                )));
            }
            if nodes.insert(name.clone(), node).is_some() {
                return Err(EngineError::config(format!("Duplicate node '{}'", name)));
            }
        }

        let entry = self
            .entry
            .ok_or_else(|| EngineError::config("Graph has no entry node"))?;
        if !nodes.contains_key(&entry) {
            return Err(EngineError::config(format!(
                "Entry node '{}' is not defined",
                entry
            )));
        }

        let mut edges: HashMap<String, Edge> = HashMap::new();
        for (from, edge) in self.edges {
            if !nodes.contains_key(&from) {
                return Err(EngineError::config(format!(
                    "Edge from unknown node '{}'",
                    from
                )));
            }
            validate_edge(&from, &edge, &nodes)?;
            if edges.insert(from.clone(), edge).is_some() {
                return Err(EngineError::config(format!(
                    "Node '{}' has more than one outgoing edge",
                    from
                )));
            }
        }

        let mut names: Vec<&String> = nodes.keys().collect();
        names.sort();
        for name in names {
            if !edges.contains_key(name) {
                return Err(EngineError::config(format!(
                    "Node '{}' has no outgoing edge",
                    name
                )));
            }
        }

        check_reachability(&entry, &nodes, &edges)?;

        log::info!(
            "Compiled graph with {} nodes, entry '{}'",
            nodes.len(),
            entry
        );
        Ok(CompiledGraph::new(
            nodes,
            edges,
            entry,
            self.recursion_limit,
        ))
    }
}

fn validate_edge(
    from: &str,
    edge: &Edge,
    nodes: &HashMap<String, Arc<dyn Node>>,
) -> Result<(), EngineError> {
    for target in edge.targets() {
        if target != END && !nodes.contains_key(target) {
            return Err(EngineError::config(format!(
                "Edge from '{}' targets unknown node '{}'",
                from, target
            )));
        }
    }

    if let Edge::Conditional { router, branches } = edge {
        let labels = router.labels();
        if labels.is_empty() {
            return Err(EngineError::config(format!(
                "Router after '{}' declares no labels",
                from
            )));
        }
        for label in &labels {
            if !branches.contains_key(label) {
                return Err(EngineError::config(format!(
                    "Router after '{}' can return '{}' but no branch maps it",
                    from, label
                )));
            }
        }
        for label in branches.keys() {
            if !labels.contains(label) {
                return Err(EngineError::config(format!(
                    "Branch '{}' after '{}' is never returned by its router",
                    label, from
                )));
            }
        }
    }
    Ok(())
}

/// END must be reachable from the entry; unreachable nodes are only reported
fn check_reachability(
    entry: &str,
    nodes: &HashMap<String, Arc<dyn Node>>,
    edges: &HashMap<String, Edge>,
) -> Result<(), EngineError> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([entry]);
    let mut reaches_end = false;

    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        let Some(edge) = edges.get(name) else {
            continue;
        };
        for target in edge.targets() {
            if target == END {
                reaches_end = true;
            } else {
                queue.push_back(target);
            }
        }
    }

    if !reaches_end {
        return Err(EngineError::config(format!(
            "No path from entry '{}' reaches {}",
            entry, END
        )));
    }

    let mut unreachable: Vec<&String> = nodes
        .keys()
        .filter(|name| !seen.contains(name.as_str()))
        .collect();
    unreachable.sort();
    for name in unreachable {
        log::warn!("Node '{}' is unreachable from entry '{}'", name, entry);
    }
    Ok(())
}
