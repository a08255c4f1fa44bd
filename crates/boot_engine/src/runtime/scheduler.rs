//! Start ordering for a boot target

use crate::runtime::dependency::{
    DependencyError, DependencyGraph, Edge, EdgeKind, ServiceNode, ServiceState,
};

/// Tracks which services of a target's closure may start next
///
/// Eligibility is derived from the live node states, so it is recomputed on
/// every call. Simultaneously eligible services are returned in load order.
#[derive(Debug)]
pub struct Scheduler<'g> {
    graph: &'g DependencyGraph,
    target: usize,
    /// Closure members in load order
    members: Vec<usize>,
    in_closure: Vec<bool>,
    /// Members already handed out for launch or marked blocked
    dispatched: Vec<bool>,
}

impl<'g> Scheduler<'g> {
    /// Create a scheduler for the closure of `target`
    pub fn new(graph: &'g DependencyGraph, target: &str) -> Result<Self, DependencyError> {
        let members = graph.closure(target)?;
        let target = graph
            .index_of(target)
            .ok_or_else(|| DependencyError::UnknownService(target.to_string()))?;

        let mut in_closure = vec![false; graph.len()];
        for &idx in &members {
            in_closure[idx] = true;
        }

        Ok(Self {
            graph,
            target,
            members,
            in_closure,
            dispatched: vec![false; graph.len()],
        })
    }

    /// Index of the target node
    pub fn target(&self) -> usize {
        self.target
    }

    /// Closure members in load order
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.in_closure[idx]
    }

    /// Edges of a node that constrain this boot
    fn edges(&self, node: &'g ServiceNode) -> impl Iterator<Item = &'g Edge> + '_ {
        node.dependencies()
            .iter()
            .filter(move |edge| self.in_closure[edge.node])
    }

    /// Whether every dependency of `idx` allows it to start
    pub fn is_ready(&self, idx: usize) -> bool {
        self.edges(self.graph.node(idx)).all(|edge| {
            let state = self.graph.node(edge.node).state();
            match edge.kind {
                EdgeKind::Requires => state == ServiceState::Started,
                EdgeKind::WaitsFor | EdgeKind::After => state.is_terminal(),
            }
        })
    }

    /// First hard dependency of `idx` that has failed
    pub fn failed_prerequisite(&self, idx: usize) -> Option<usize> {
        self.edges(self.graph.node(idx))
            .find(|edge| {
                edge.kind == EdgeKind::Requires
                    && self.graph.node(edge.node).state() == ServiceState::Failed
            })
            .map(|edge| edge.node)
    }

    fn is_pending(&self, idx: usize) -> bool {
        !self.dispatched[idx] && self.graph.node(idx).state() == ServiceState::Stopped
    }

    /// Mark every pending service with a failed hard dependency as failed
    ///
    /// Runs to a fixpoint so failures travel the whole dependent chain.
    /// Returns `(service, failed prerequisite)` pairs in the order marked.
    pub fn propagate_failures(&mut self) -> Vec<(usize, usize)> {
        let mut blocked = Vec::new();

        loop {
            let mut progressed = false;
            for i in 0..self.members.len() {
                let idx = self.members[i];
                if !self.is_pending(idx) {
                    continue;
                }
                if let Some(cause) = self.failed_prerequisite(idx) {
                    self.dispatched[idx] = true;
                    self.graph.node(idx).transition(ServiceState::Failed);
                    blocked.push((idx, cause));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        blocked
    }

    /// Take every pending service whose dependencies are satisfied
    pub fn take_eligible(&mut self) -> Vec<usize> {
        let eligible: Vec<usize> = self
            .members
            .iter()
            .copied()
            .filter(|&idx| self.is_pending(idx) && self.is_ready(idx))
            .collect();

        for &idx in &eligible {
            self.dispatched[idx] = true;
        }
        eligible
    }

    /// Whether every member has reached a terminal state
    pub fn is_settled(&self) -> bool {
        self.members
            .iter()
            .all(|&idx| self.graph.node(idx).state().is_terminal())
    }

    /// Members not yet in a terminal state
    pub fn unsettled(&self) -> Vec<usize> {
        self.members
            .iter()
            .copied()
            .filter(|&idx| !self.graph.node(idx).state().is_terminal())
            .collect()
    }
}

/// Start order for a target assuming every launch succeeds
///
/// Services in the same wave have no ordering constraint between them and
/// start concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootPlan {
    pub target: String,
    pub waves: Vec<Vec<PlannedService>>,
}

/// A service in the boot plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedService {
    pub id: String,
    pub kind: String,
    pub command: Option<String>,
    pub dependencies: Vec<String>,
}

impl BootPlan {
    /// Compute waves with Kahn's algorithm over the closure of `target`
    pub fn build(graph: &DependencyGraph, target: &str) -> Result<Self, DependencyError> {
        let members = graph.closure(target)?;
        let mut in_closure = vec![false; graph.len()];
        for &idx in &members {
            in_closure[idx] = true;
        }

        // In-degree counts only edges inside the closure
        let mut in_degree = vec![0usize; graph.len()];
        for &idx in &members {
            in_degree[idx] = graph
                .node(idx)
                .dependencies()
                .iter()
                .filter(|e| in_closure[e.node])
                .count();
        }

        let mut waves = Vec::new();
        let mut current: Vec<usize> = members
            .iter()
            .copied()
            .filter(|&idx| in_degree[idx] == 0)
            .collect();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &idx in &current {
                for edge in graph.node(idx).dependents() {
                    if !in_closure[edge.node] {
                        continue;
                    }
                    in_degree[edge.node] -= 1;
                    if in_degree[edge.node] == 0 {
                        next.push(edge.node);
                    }
                }
            }
            // Load order within a wave
            next.sort_unstable();

            waves.push(current.iter().map(|&idx| planned(graph, idx, &in_closure)).collect());
            current = next;
        }

        Ok(Self {
            target: target.to_string(),
            waves,
        })
    }

    /// Service ids in start order
    pub fn order(&self) -> Vec<&str> {
        self.waves
            .iter()
            .flatten()
            .map(|service| service.id.as_str())
            .collect()
    }
}

fn planned(graph: &DependencyGraph, idx: usize, in_closure: &[bool]) -> PlannedService {
    let node = graph.node(idx);
    let def = node.definition();
    PlannedService {
        id: def.id.clone(),
        kind: def.kind.to_string(),
        command: def.command.as_ref().map(|argv| argv.join(" ")),
        dependencies: node
            .dependencies()
            .iter()
            .filter(|e| in_closure[e.node])
            .map(|e| {
                let id = graph.node(e.node).id();
                match e.kind {
                    EdgeKind::Requires => id.to_string(),
                    EdgeKind::WaitsFor => format!("{} (waits-for)", id),
                    EdgeKind::After => format!("{} (after)", id),
                }
            })
            .collect(),
    }
}

/// Display the boot plan in a human-readable format
impl std::fmt::Display for BootPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Boot Plan: {}", self.target)?;
        writeln!(f, "==========")?;

        for (i, wave) in self.waves.iter().enumerate() {
            writeln!(f)?;
            writeln!(f, "Wave {}:", i + 1)?;
            for service in wave {
                writeln!(f, "  {} [{}]", service.id, service.kind)?;
                if let Some(command) = &service.command {
                    writeln!(f, "     Command: {}", command)?;
                }
                if !service.dependencies.is_empty() {
                    writeln!(f, "     Depends on: {}", service.dependencies.join(", "))?;
                }
            }
        }

        Ok(())
    }
}
