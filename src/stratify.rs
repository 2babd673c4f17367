//! # Stratifier
//!
//! Builds the predicate dependency graph from compiled rules, condenses it
//! into strongly connected components (Tarjan), and assigns stratum numbers
//! by topological order:
//!
//! - a positive edge keeps the dependency in the same stratum or lower;
//! - a negative or aggregated edge requires a strictly lower stratum;
//! - a negative or aggregated edge inside one SCC is a `StratificationError`.
//!
//! Pure-EDB predicates (no rules) land in stratum 0.

use crate::compile::{CompiledRule, DepKind};
use crate::error::{KernelError, KernelResult};
use crate::schema::{PredId, SchemaRegistry};
use std::collections::HashSet;

/// Predicate dependency graph: `edges[head]` lists body predicates the head
/// depends on; `dependents[body]` lists heads that read it.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub edges: Vec<Vec<(PredId, DepKind)>>,
    pub dependents: Vec<Vec<PredId>>,
}

impl DependencyGraph {
    pub fn build(n_preds: usize, rules: &[CompiledRule]) -> Self {
        let mut edges: Vec<Vec<(PredId, DepKind)>> = vec![Vec::new(); n_preds];
        let mut dependents: Vec<Vec<PredId>> = vec![Vec::new(); n_preds];
        for rule in rules {
            for &(body, kind) in &rule.deps {
                let head = rule.head_pred;
                if !edges[head.index()].contains(&(body, kind)) {
                    edges[head.index()].push((body, kind));
                }
                if !dependents[body.index()].contains(&head) {
                    dependents[body.index()].push(head);
                }
            }
        }
        DependencyGraph { edges, dependents }
    }

    /// All predicates transitively depending on any seed (the seeds
    /// themselves included). Used for cache invalidation.
    pub fn downstream_of(&self, seeds: &[PredId]) -> HashSet<PredId> {
        let mut seen: HashSet<PredId> = seeds.iter().copied().collect();
        let mut work: Vec<PredId> = seeds.to_vec();
        while let Some(pred) = work.pop() {
            for &head in &self.dependents[pred.index()] {
                if seen.insert(head) {
                    work.push(head);
                }
            }
        }
        seen
    }

    /// All predicates a goal transitively depends on (the goal included).
    /// Used to decide which strata a query must saturate.
    pub fn upstream_of(&self, seed: PredId) -> HashSet<PredId> {
        let mut seen: HashSet<PredId> = HashSet::new();
        seen.insert(seed);
        let mut work = vec![seed];
        while let Some(pred) = work.pop() {
            for &(body, _) in &self.edges[pred.index()] {
                if seen.insert(body) {
                    work.push(body);
                }
            }
        }
        seen
    }
}

/// Result of stratification: a stratum number per predicate plus the strata
/// in ascending evaluation order.
#[derive(Debug, Clone, Default)]
pub struct Stratification {
    pub stratum_of: Vec<usize>,
    pub strata: Vec<Vec<PredId>>,
}

impl Stratification {
    pub fn stratum(&self, pred: PredId) -> usize {
        self.stratum_of[pred.index()]
    }

    pub fn n_strata(&self) -> usize {
        self.strata.len()
    }
}

/// Compute strata or reject the rule set.
pub fn stratify(
    registry: &SchemaRegistry,
    graph: &DependencyGraph,
) -> KernelResult<Stratification> {
    let n = registry.len();
    let sccs = tarjan_sccs(n, &graph.edges);

    // Component id per predicate.
    let mut comp_of = vec![usize::MAX; n];
    for (comp, members) in sccs.iter().enumerate() {
        for &pred in members {
            comp_of[pred.index()] = comp;
        }
    }

    // Reject negative or aggregated edges that stay inside one component.
    for (head_idx, deps) in graph.edges.iter().enumerate() {
        for &(body, kind) in deps {
            if kind == DepKind::Positive {
                continue;
            }
            if comp_of[head_idx] == comp_of[body.index()] {
                let head = registry.get(PredId(head_idx as u32));
                let body_decl = registry.get(body);
                let how = match kind {
                    DepKind::Negative => "negation",
                    _ => "aggregation",
                };
                return Err(KernelError::Stratification(format!(
                    "recursive cycle through {}: {} depends on {}",
                    how, head.name, body_decl.name
                )));
            }
        }
    }

    // Tarjan emits components with their dependencies already popped, so a
    // single pass assigns each component the max of its dependency strata,
    // bumped by one across negative/aggregated edges.
    let mut comp_stratum = vec![0usize; sccs.len()];
    for (comp, members) in sccs.iter().enumerate() {
        let mut level = 0usize;
        for &pred in members {
            for &(body, kind) in &graph.edges[pred.index()] {
                let dep_comp = comp_of[body.index()];
                if dep_comp == comp {
                    continue;
                }
                let dep_level = comp_stratum[dep_comp];
                let required = match kind {
                    DepKind::Positive => dep_level,
                    DepKind::Negative | DepKind::Aggregated => dep_level + 1,
                };
                level = level.max(required);
            }
        }
        comp_stratum[comp] = level;
    }

    let mut stratum_of = vec![0usize; n];
    for (comp, members) in sccs.iter().enumerate() {
        for &pred in members {
            stratum_of[pred.index()] = comp_stratum[comp];
        }
    }

    let n_strata = comp_stratum.iter().copied().max().map_or(1, |m| m + 1);
    let mut strata: Vec<Vec<PredId>> = vec![Vec::new(); n_strata];
    // Declaration order within a stratum keeps enumeration deterministic.
    for idx in 0..n {
        strata[stratum_of[idx]].push(PredId(idx as u32));
    }

    Ok(Stratification { stratum_of, strata })
}

/// Iterative Tarjan SCC. Components are returned in pop order: every edge of
/// a returned component leads into an earlier component.
fn tarjan_sccs(n: usize, edges: &[Vec<(PredId, DepKind)>]) -> Vec<Vec<PredId>> {
    #[derive(Clone, Copy)]
    struct NodeState {
        index: u32,
        lowlink: u32,
        on_stack: bool,
        visited: bool,
    }

    let mut state = vec![
        NodeState {
            index: 0,
            lowlink: 0,
            on_stack: false,
            visited: false,
        };
        n
    ];
    let mut counter: u32 = 0;
    let mut stack: Vec<usize> = Vec::new();
    let mut sccs: Vec<Vec<PredId>> = Vec::new();

    // Explicit DFS frames: (node, next-edge-index).
    let mut frames: Vec<(usize, usize)> = Vec::new();

    for root in 0..n {
        if state[root].visited {
            continue;
        }
        frames.push((root, 0));
        state[root].visited = true;
        state[root].index = counter;
        state[root].lowlink = counter;
        counter += 1;
        stack.push(root);
        state[root].on_stack = true;

        while !frames.is_empty() {
            let (node, next_edge) = {
                let frame = frames.last_mut().expect("frames non-empty");
                let node = frame.0;
                if frame.1 < edges[node].len() {
                    let i = frame.1;
                    frame.1 += 1;
                    (node, Some(i))
                } else {
                    (node, None)
                }
            };
            if let Some(edge_idx) = next_edge {
                let (next, _) = edges[node][edge_idx];
                let next = next.index();
                if !state[next].visited {
                    state[next].visited = true;
                    state[next].index = counter;
                    state[next].lowlink = counter;
                    counter += 1;
                    stack.push(next);
                    state[next].on_stack = true;
                    frames.push((next, 0));
                } else if state[next].on_stack {
                    state[node].lowlink = state[node].lowlink.min(state[next].index);
                }
            } else {
                frames.pop();
                if let Some(&(parent, _)) = frames.last() {
                    let low = state[node].lowlink;
                    state[parent].lowlink = state[parent].lowlink.min(low);
                }
                if state[node].lowlink == state[node].index {
                    let mut component = Vec::new();
                    loop {
                        let member = stack.pop().expect("tarjan stack underflow");
                        state[member].on_stack = false;
                        component.push(PredId(member as u32));
                        if member == node {
                            break;
                        }
                    }
                    component.sort();
                    sccs.push(component);
                }
            }
        }
    }

    sccs
}
