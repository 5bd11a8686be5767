//! The resource graph: desired registrations joined with the prior snapshot.

use std::collections::{BTreeMap, BTreeSet};

use converge_core::{
    resource::{ResourceRegistration, ResourceState},
    snapshot::Snapshot,
    urn::{StackRef, Urn},
};

use crate::{control::task_tracker::Cycle, error::GraphError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeKind {
    Dependency,
    Property,
    Parent,
    Provider,
}

/// `from` must be created after, and deleted before, `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub to: Urn,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub urn: Urn,
    /// The desired state, absent when the resource is no longer registered.
    pub new: Option<ResourceState>,
    pub registration: Option<ResourceRegistration>,
    /// The live entry of the prior snapshot.
    pub old: Option<ResourceState>,
    /// Entries of the prior snapshot that are awaiting deletion.
    pub pending_deletes: Vec<ResourceState>,
    /// Edges of the desired state.
    pub edges: Vec<Edge>,
}

/// Nodes in deterministic order: registered resources topologically sorted,
/// ties broken by registration order, followed by resources that only exist
/// in the prior snapshot, in snapshot order.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<Node>,
    index: BTreeMap<Urn, usize>,
    new_dependents: BTreeMap<Urn, BTreeSet<Urn>>,
    old_dependents: BTreeMap<Urn, BTreeSet<Urn>>,
    pending_dependents: BTreeMap<Urn, BTreeSet<Urn>>,
}

fn edges_of(state: &ResourceState) -> Vec<Edge> {
    let mut edges = BTreeSet::new();
    for urn in &state.dependencies {
        edges.insert(Edge {
            to: urn.clone(),
            kind: EdgeKind::Dependency,
        });
    }
    for urns in state.property_dependencies.values() {
        for urn in urns {
            edges.insert(Edge {
                to: urn.clone(),
                kind: EdgeKind::Property,
            });
        }
    }
    if let Some(parent) = &state.parent {
        edges.insert(Edge {
            to: parent.clone(),
            kind: EdgeKind::Parent,
        });
    }
    if let Some(provider) = state.provider.as_ref().and_then(|p| p.parse::<Urn>().ok()) {
        edges.insert(Edge {
            to: provider,
            kind: EdgeKind::Provider,
        });
    }
    edges.into_iter().collect()
}

impl ResourceGraph {
    pub fn build(
        stack: &StackRef,
        registrations: &[ResourceRegistration],
        snapshot: &Snapshot,
    ) -> Result<Self, GraphError> {
        let mut registered: Vec<Node> = Vec::with_capacity(registrations.len());
        let mut registered_index: BTreeMap<Urn, usize> = BTreeMap::new();
        for registration in registrations {
            let urn = registration
                .try_urn(stack)
                .map_err(|source| GraphError::InvalidUrn {
                    type_: registration.type_.clone(),
                    name: registration.name.clone(),
                    source,
                })?;
            if registered_index.contains_key(&urn) {
                return Err(GraphError::DuplicateUrn(urn));
            }
            let new = ResourceState::from_registration(urn.clone(), registration);
            let edges = edges_of(&new);
            registered_index.insert(urn.clone(), registered.len());
            registered.push(Node {
                old: snapshot.find(&urn).cloned(),
                pending_deletes: snapshot.pending_deletes(&urn).cloned().collect(),
                urn,
                new: Some(new),
                registration: Some(registration.clone()),
                edges,
            });
        }

        for node in &registered {
            for edge in &node.edges {
                if edge.to == node.urn {
                    return Err(GraphError::Cycle(Cycle::new(vec![node.urn.clone()])));
                }
                if !registered_index.contains_key(&edge.to) {
                    return Err(GraphError::UnknownDependency {
                        urn: node.urn.clone(),
                        missing: edge.to.clone(),
                    });
                }
            }
        }

        let order = topological_order(&registered, &registered_index)?;
        let mut nodes: Vec<Node> = Vec::with_capacity(registered.len());
        let mut slots: Vec<Option<Node>> = registered.into_iter().map(Some).collect();
        for i in order {
            if let Some(node) = slots[i].take() {
                nodes.push(node);
            }
        }

        // Resources that are only in the snapshot, live or awaiting deletion
        let mut seen: BTreeSet<Urn> = nodes.iter().map(|n| n.urn.clone()).collect();
        for state in &snapshot.resources {
            if !seen.insert(state.urn.clone()) {
                continue;
            }
            nodes.push(Node {
                urn: state.urn.clone(),
                new: None,
                registration: None,
                old: snapshot.find(&state.urn).cloned(),
                pending_deletes: snapshot.pending_deletes(&state.urn).cloned().collect(),
                edges: Vec::new(),
            });
        }

        let mut graph = ResourceGraph {
            index: nodes
                .iter()
                .enumerate()
                .map(|(i, n)| (n.urn.clone(), i))
                .collect(),
            nodes,
            ..Default::default()
        };
        for node in &graph.nodes {
            for edge in &node.edges {
                graph
                    .new_dependents
                    .entry(edge.to.clone())
                    .or_default()
                    .insert(node.urn.clone());
            }
        }
        for state in &snapshot.resources {
            let dependents = if state.delete {
                &mut graph.pending_dependents
            } else {
                &mut graph.old_dependents
            };
            for referenced in state.referenced_urns() {
                dependents
                    .entry(referenced)
                    .or_default()
                    .insert(state.urn.clone());
            }
        }
        Ok(graph)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn get(&self, urn: &Urn) -> Option<&Node> {
        self.index.get(urn).map(|i| &self.nodes[*i])
    }

    /// Position of each URN in graph order.
    pub fn rank(&self) -> BTreeMap<Urn, usize> {
        self.index.clone()
    }

    pub fn rank_of(&self, urn: &Urn) -> usize {
        self.index.get(urn).copied().unwrap_or(usize::MAX)
    }

    /// What the desired state of `urn` depends on.
    pub fn dependencies(&self, urn: &Urn) -> BTreeSet<Urn> {
        self.get(urn)
            .map(|n| n.edges.iter().map(|e| e.to.clone()).collect())
            .unwrap_or_default()
    }

    /// Registered resources whose desired state depends on `urn`.
    pub fn new_dependents(&self, urn: &Urn) -> BTreeSet<Urn> {
        self.new_dependents.get(urn).cloned().unwrap_or_default()
    }

    /// Live entries of the prior snapshot that depend on `urn`.
    pub fn old_dependents(&self, urn: &Urn) -> BTreeSet<Urn> {
        self.old_dependents.get(urn).cloned().unwrap_or_default()
    }

    /// URNs with pending-delete entries in the prior snapshot that depend on
    /// `urn`.
    pub fn pending_dependents(&self, urn: &Urn) -> BTreeSet<Urn> {
        self.pending_dependents.get(urn).cloned().unwrap_or_default()
    }

    /// `roots` and everything that transitively depends on them, in the
    /// desired state or in the prior snapshot.
    pub fn with_dependents(&self, roots: &BTreeSet<Urn>, include_new: bool) -> BTreeSet<Urn> {
        let mut r = BTreeSet::new();
        let mut todo: Vec<Urn> = roots.iter().cloned().collect();
        while let Some(urn) = todo.pop() {
            if !r.insert(urn.clone()) {
                continue;
            }
            todo.extend(self.old_dependents(&urn));
            if include_new {
                todo.extend(self.new_dependents(&urn));
            }
        }
        r
    }
}

/// Kahn's algorithm; among ready nodes the earliest registration goes first.
fn topological_order(
    nodes: &[Node],
    index: &BTreeMap<Urn, usize>,
) -> Result<Vec<usize>, GraphError> {
    let mut in_degree: Vec<usize> = vec![0; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        let targets: BTreeSet<usize> = node.edges.iter().filter_map(|e| index.get(&e.to).copied()).collect();
        in_degree[i] = targets.len();
        for t in targets {
            dependents[t].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = ready.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            in_degree[d] -= 1;
            if in_degree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < nodes.len() {
        return Err(GraphError::Cycle(find_cycle(nodes, index, &in_degree)));
    }
    Ok(order)
}

/// Walk dependency edges among the nodes Kahn's algorithm could not place.
/// Every such node has an unplaced dependency, so the walk must revisit a
/// node.
fn find_cycle(nodes: &[Node], index: &BTreeMap<Urn, usize>, in_degree: &[usize]) -> Cycle<Urn> {
    let stuck = |i: usize| in_degree[i] > 0;
    let start = (0..nodes.len()).find(|i| stuck(*i)).unwrap_or(0);
    let mut path: Vec<usize> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|p| *p == current) {
            return Cycle::new(path[pos..].iter().map(|i| nodes[*i].urn.clone()).collect());
        }
        path.push(current);
        let next = nodes[current]
            .edges
            .iter()
            .filter_map(|e| index.get(&e.to).copied())
            .find(|i| stuck(*i));
        match next {
            Some(next) => current = next,
            None => return Cycle::new(path.iter().map(|i| nodes[*i].urn.clone()).collect()),
        }
    }
}
