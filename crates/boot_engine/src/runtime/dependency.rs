//! Dependency graph construction and validation

use crate::config::{ServiceDefinition, ServiceSet};
use std::collections::HashMap;
use tokio::sync::watch;

/// Boot state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not launched yet
    Stopped,
    /// Launch in progress
    Starting,
    /// Up; terminal
    Started,
    /// Launch failed or a prerequisite failed; terminal
    Failed,
}

impl ServiceState {
    /// Check if the state can no longer change
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Started | ServiceState::Failed)
    }

    /// Check if moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        matches!(
            (self, next),
            (ServiceState::Stopped, ServiceState::Starting)
                | (ServiceState::Stopped, ServiceState::Failed)
                | (ServiceState::Starting, ServiceState::Started)
                | (ServiceState::Starting, ServiceState::Failed)
        )
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a service relates to one of its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// `depends-on`: must be started, failure propagates
    Requires,
    /// `waits-for`: must be terminal, failure tolerated
    WaitsFor,
    /// `after`/`before`: must be terminal if both are booted
    After,
}

impl EdgeKind {
    fn strength(&self) -> u8 {
        match self {
            EdgeKind::Requires => 2,
            EdgeKind::WaitsFor => 1,
            EdgeKind::After => 0,
        }
    }

    /// Whether the edge pulls its target into a boot closure
    pub fn pulls_in(&self) -> bool {
        matches!(self, EdgeKind::Requires | EdgeKind::WaitsFor)
    }
}

/// An edge to another node, by index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub node: usize,
    pub kind: EdgeKind,
}

/// A service in the graph together with its boot state
#[derive(Debug)]
pub struct ServiceNode {
    definition: ServiceDefinition,
    dependencies: Vec<Edge>,
    dependents: Vec<Edge>,
    state: watch::Sender<ServiceState>,
}

impl ServiceNode {
    fn new(definition: ServiceDefinition) -> Self {
        let (state, _) = watch::channel(ServiceState::Stopped);
        Self {
            definition,
            dependencies: Vec::new(),
            dependents: Vec::new(),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Edges to the services this one waits for
    pub fn dependencies(&self) -> &[Edge] {
        &self.dependencies
    }

    /// Edges to the services waiting for this one
    pub fn dependents(&self) -> &[Edge] {
        &self.dependents
    }

    /// Current boot state
    pub fn state(&self) -> ServiceState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Move to `next` if the transition is legal; returns whether it happened
    pub(crate) fn transition(&self, next: ServiceState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        match previous {
            Some(from) => log::debug!("[{}] {} -> {}", self.id(), from, next),
            None => log::warn!(
                "[{}] Ignoring illegal transition {} -> {}",
                self.id(),
                self.state(),
                next
            ),
        }
        changed
    }

    fn add_dependency(&mut self, node: usize, kind: EdgeKind) {
        add_edge(&mut self.dependencies, node, kind);
    }
}

/// Insert an edge, keeping only the strongest one per target
fn add_edge(edges: &mut Vec<Edge>, node: usize, kind: EdgeKind) {
    match edges.iter_mut().find(|e| e.node == node) {
        Some(existing) => {
            if kind.strength() > existing.kind.strength() {
                existing.kind = kind;
            }
        }
        None => edges.push(Edge { node, kind }),
    }
}

/// Validated dependency graph of all loaded services
///
/// Nodes keep the load order of the service set. Edges are fixed at
/// construction; only node states change afterwards.
#[derive(Debug)]
pub struct DependencyGraph {
    nodes: Vec<ServiceNode>,
    index_map: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build and validate the graph for a set of services
    pub fn build(services: ServiceSet) -> Result<Self, DependencyError> {
        let index_map: HashMap<String, usize> = services
            .keys()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        let mut nodes: Vec<ServiceNode> = services.into_values().map(ServiceNode::new).collect();

        // Resolve forward edges
        let mut ordering: Vec<(usize, usize)> = Vec::new();
        for (idx, node) in nodes.iter_mut().enumerate() {
            let def = &node.definition;
            let mut edges = Vec::new();

            for dep in &def.depends_on {
                edges.push((lookup(&index_map, &def.id, dep)?, EdgeKind::Requires));
            }
            for dep in &def.waits_for {
                edges.push((lookup(&index_map, &def.id, dep)?, EdgeKind::WaitsFor));
            }
            for dep in &def.after {
                match index_map.get(dep) {
                    Some(&target) => edges.push((target, EdgeKind::After)),
                    None => log::warn!("[{}] Ignoring 'after' unknown service '{}'", def.id, dep),
                }
            }
            for later in &def.before {
                match index_map.get(later) {
                    Some(&target) => ordering.push((target, idx)),
                    None => log::warn!("[{}] Ignoring 'before' unknown service '{}'", def.id, later),
                }
            }

            for (target, kind) in edges {
                node.add_dependency(target, kind);
            }
        }
        for (node, earlier) in ordering {
            nodes[node].add_dependency(earlier, EdgeKind::After);
        }

        // Reverse edges
        for idx in 0..nodes.len() {
            for edge in nodes[idx].dependencies.clone() {
                add_edge(&mut nodes[edge.node].dependents, idx, edge.kind);
            }
        }

        let graph = Self { nodes, index_map };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Depth-first search with an on-stack marker; reports the first cycle found
    fn check_acyclic(&self) -> Result<(), DependencyError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            idx: usize,
            marks: &mut [Mark],
            stack: &mut Vec<usize>,
        ) -> Result<(), Vec<usize>> {
            marks[idx] = Mark::OnStack;
            stack.push(idx);

            for edge in &graph.nodes[idx].dependencies {
                match marks[edge.node] {
                    Mark::Done => {}
                    Mark::Unvisited => visit(graph, edge.node, marks, stack)?,
                    Mark::OnStack => {
                        let start = stack.iter().position(|&n| n == edge.node).unwrap_or(0);
                        return Err(stack[start..].to_vec());
                    }
                }
            }

            stack.pop();
            marks[idx] = Mark::Done;
            Ok(())
        }

        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack = Vec::new();

        for idx in 0..self.nodes.len() {
            if marks[idx] == Mark::Unvisited {
                visit(self, idx, &mut marks, &mut stack).map_err(|cycle| {
                    DependencyError::Cycle(
                        cycle.into_iter().map(|n| self.nodes[n].id().to_string()).collect(),
                    )
                })?;
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in load order
    pub fn nodes(&self) -> &[ServiceNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &ServiceNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index_map.get(id).copied()
    }

    pub fn get(&self, id: &str) -> Option<&ServiceNode> {
        self.index_of(id).map(|idx| &self.nodes[idx])
    }

    /// Indices of `target` and everything it transitively requires or waits
    /// for, in load order
    pub fn closure(&self, target: &str) -> Result<Vec<usize>, DependencyError> {
        let root = self
            .index_of(target)
            .ok_or_else(|| DependencyError::UnknownService(target.to_string()))?;

        let mut seen = vec![false; self.nodes.len()];
        let mut queue = vec![root];
        seen[root] = true;

        while let Some(idx) = queue.pop() {
            for edge in &self.nodes[idx].dependencies {
                if edge.kind.pulls_in() && !seen[edge.node] {
                    seen[edge.node] = true;
                    queue.push(edge.node);
                }
            }
        }

        Ok((0..self.nodes.len()).filter(|&i| seen[i]).collect())
    }

    /// Get nodes that depend on a given node
    pub fn dependents(&self, id: &str) -> Vec<&ServiceNode> {
        self.get(id)
            .map(|node| node.dependents.iter().map(|e| &self.nodes[e.node]).collect())
            .unwrap_or_default()
    }
}

fn lookup(
    index_map: &HashMap<String, usize>,
    service: &str,
    dependency: &str,
) -> Result<usize, DependencyError> {
    index_map
        .get(dependency)
        .copied()
        .ok_or_else(|| DependencyError::UnresolvedDependency {
            service: service.to_string(),
            dependency: dependency.to_string(),
        })
}

fn format_cycle(members: &[String]) -> String {
    let mut path = members.to_vec();
    if let Some(first) = members.first() {
        path.push(first.clone());
    }
    path.join(" -> ")
}

/// Errors that can occur when building or querying the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Service '{service}' depends on unresolved service '{dependency}'")]
    UnresolvedDependency { service: String, dependency: String },

    #[error("Dependency cycle detected: {}", format_cycle(.0))]
    Cycle(Vec<String>),

    #[error("Unknown service '{0}'")]
    UnknownService(String),
}
