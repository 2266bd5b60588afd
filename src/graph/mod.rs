//! Dependency graph construction for GraphDefinitions
//!
//! Edges are never declared by users. They are discovered by scanning every
//! `${...}` expression in a node's template and predicates: a reference to
//! another node's id (`config.data.host` inside the `app` template) becomes a
//! `config -> app` dependency. Building the graph rejects unknown references,
//! self-references, and cycles, so an Active definition always carries a
//! valid topological order.

mod schedule;

pub use schedule::Schedule;

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::ResourceNode;
use crate::expr::document_references;
use crate::{Error, Result};

/// Root namespace always available to expressions; never a dependency edge
const SCHEMA_ROOT: &str = "schema";

/// One analyzed node in a dependency graph
#[derive(Clone, Debug)]
pub struct GraphNode {
    /// The definition's resource node
    pub resource: ResourceNode,
    /// Node ids this node reads outputs from
    pub references: BTreeSet<String>,
}

/// Immutable dependency graph over a definition's resource nodes
///
/// Nodes live in an arena indexed by declaration order; adjacency lists hold
/// arena indices. Construction computes the topological order once, so a
/// built graph is cycle-free by definition.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: BTreeMap<String, usize>,
    /// dependencies[i] = indices of nodes i reads from
    dependencies: Vec<Vec<usize>>,
    /// dependents[i] = indices of nodes that read from i
    dependents: Vec<Vec<usize>>,
    /// Arena indices in creation order
    topo: Vec<usize>,
}

impl DependencyGraph {
    /// Build a graph from a definition's resource nodes
    ///
    /// The nodes must already have passed structural validation (unique,
    /// well-formed ids). Fails on references to unknown ids, on
    /// self-references outside `readyWhen`, and on cycles.
    pub fn build(resources: &[ResourceNode]) -> Result<Self> {
        let mut nodes = Vec::with_capacity(resources.len());
        let mut index = BTreeMap::new();
        for (i, resource) in resources.iter().enumerate() {
            index.insert(resource.id.clone(), i);
            nodes.push(GraphNode {
                resource: resource.clone(),
                references: BTreeSet::new(),
            });
        }

        let mut dependencies = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];

        for (i, resource) in resources.iter().enumerate() {
            let refs = node_references(resource)?;
            for root in refs {
                if root == SCHEMA_ROOT {
                    continue;
                }
                let Some(&dep) = index.get(&root) else {
                    return Err(Error::graph(format!(
                        "resource '{}' references unknown id '{}'",
                        resource.id, root
                    )));
                };
                if dep == i {
                    // readyWhen legitimately reads the node's own live object
                    continue;
                }
                nodes[i].references.insert(root);
                if !dependencies[i].contains(&dep) {
                    dependencies[i].push(dep);
                    dependents[dep].push(i);
                }
            }
        }

        let topo = topological_order(&nodes, &dependencies, &dependents)?;

        Ok(Self {
            nodes,
            index,
            dependencies,
            dependents,
            topo,
        })
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Node ids in creation order
    pub fn creation_order(&self) -> Vec<String> {
        self.topo
            .iter()
            .map(|&i| self.nodes[i].resource.id.clone())
            .collect()
    }

    /// Node ids in deletion order: the exact reverse of creation order
    pub fn deletion_order(&self) -> Vec<String> {
        let mut order = self.creation_order();
        order.reverse();
        order
    }

    /// Ids of the nodes `id` reads outputs from
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.index
            .get(id)
            .map(|&i| {
                self.dependencies[i]
                    .iter()
                    .map(|&d| self.nodes[d].resource.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of the nodes that read outputs from `id`
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.index
            .get(id)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.nodes[d].resource.id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Group nodes into dependency levels for concurrent dispatch
    ///
    /// Level 0 holds nodes with no dependencies; level n holds nodes whose
    /// dependencies all sit in levels below n. Nodes within a level are
    /// independent of each other.
    pub fn schedule(&self) -> Schedule {
        let mut level_of = vec![0usize; self.nodes.len()];
        for &i in &self.topo {
            level_of[i] = self.dependencies[i]
                .iter()
                .map(|&d| level_of[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let depth = level_of.iter().copied().max().map_or(0, |m| m + 1);
        let mut levels = vec![Vec::new(); depth];
        for &i in &self.topo {
            levels[level_of[i]].push(self.nodes[i].resource.id.clone());
        }
        Schedule::new(levels)
    }
}

/// Collect every root identifier a resource node's expressions reference
fn node_references(resource: &ResourceNode) -> Result<BTreeSet<String>> {
    let mut refs = BTreeSet::new();

    if let Some(template) = &resource.template {
        // self-reference inside a template cannot be satisfied: the object
        // does not exist while its own manifest is being rendered
        let template_refs = document_references(template)
            .map_err(|e| Error::graph(format!("resource '{}': {e}", resource.id)))?;
        if template_refs.contains(&resource.id) {
            return Err(Error::graph(format!(
                "resource '{}' references itself in its template",
                resource.id
            )));
        }
        refs.extend(template_refs);
    }

    for predicate in &resource.include_when {
        let roots = predicate_roots(&resource.id, predicate)?;
        if roots.contains(&resource.id) {
            return Err(Error::graph(format!(
                "resource '{}' references itself in includeWhen",
                resource.id
            )));
        }
        refs.extend(roots);
    }

    for predicate in &resource.ready_when {
        refs.extend(predicate_roots(&resource.id, predicate)?);
    }

    Ok(refs)
}

/// Parse a standalone `${...}` predicate and return its root identifiers
fn predicate_roots(id: &str, predicate: &str) -> Result<BTreeSet<String>> {
    let expr = crate::expr::parse_standalone(predicate)
        .map_err(|e| Error::graph(format!("resource '{id}': {e}")))?;
    Ok(expr.roots())
}

/// Kahn's algorithm; ties broken by declaration order so the result is
/// deterministic. On a cycle, the error names every participating node.
fn topological_order(
    nodes: &[GraphNode],
    dependencies: &[Vec<usize>],
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() < nodes.len() {
        let cycle: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d > 0)
            .map(|(i, _)| nodes[i].resource.id.as_str())
            .collect();
        return Err(Error::graph(format!(
            "dependency cycle between: {}",
            cycle.join(", ")
        )));
    }
    Ok(order)
}
