//! Stage graph: which stage follows which.
//!
//! Design:
//! - Forward edges: stage -> stages it follows (waits for)
//! - Reverse edges: stage -> stages that follow it (woken after a Done)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! Cycle detection uses Kahn's algorithm (O(V + E)); when it gets stuck the
//! leftover nodes are walked backwards to report one concrete cycle.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::domain::TaskTypeName;

#[derive(Debug, Default, Clone)]
pub struct StageGraph {
    /// Forward edges: stage -> stages it follows
    edges: BTreeMap<TaskTypeName, BTreeSet<TaskTypeName>>,

    /// Reverse edges: stage -> stages that follow it
    reverse_edges: BTreeMap<TaskTypeName, BTreeSet<TaskTypeName>>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `stage` as a node with an edge to every name in `follows`.
    ///
    /// Predecessors need not be added yet; `unknown_predecessors` reports the
    /// ones that never show up as nodes.
    pub fn add_stage(&mut self, stage: TaskTypeName, follows: &[TaskTypeName]) {
        let deps = self.edges.entry(stage.clone()).or_default();
        for predecessor in follows {
            deps.insert(predecessor.clone());
            self.reverse_edges
                .entry(predecessor.clone())
                .or_default()
                .insert(stage.clone());
        }
    }

    pub fn contains(&self, stage: &TaskTypeName) -> bool {
        self.edges.contains_key(stage)
    }

    pub fn predecessors_of(&self, stage: &TaskTypeName) -> Vec<TaskTypeName> {
        self.edges
            .get(stage)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Stages that list `stage` in their `follows`.
    pub fn dependents_of(&self, stage: &TaskTypeName) -> Vec<TaskTypeName> {
        self.reverse_edges
            .get(stage)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_root(&self, stage: &TaskTypeName) -> bool {
        self.edges.get(stage).is_none_or(|deps| deps.is_empty())
    }

    /// `(stage, predecessor)` pairs where the predecessor was never added.
    pub fn unknown_predecessors(&self) -> Vec<(TaskTypeName, TaskTypeName)> {
        let mut unknown = Vec::new();
        for (stage, deps) in &self.edges {
            for predecessor in deps {
                if !self.edges.contains_key(predecessor) {
                    unknown.push((stage.clone(), predecessor.clone()));
                }
            }
        }
        unknown
    }

    /// Stages in an order where every stage comes after all of its
    /// predecessors, or `Err(cycle)` with one cycle in follow order.
    ///
    /// Edges to unknown predecessors are ignored here.
    pub fn topological_order(&self) -> Result<Vec<TaskTypeName>, Vec<TaskTypeName>> {
        let mut in_degree: HashMap<&TaskTypeName, usize> = self
            .edges
            .iter()
            .map(|(stage, deps)| {
                let known = deps.iter().filter(|d| self.edges.contains_key(*d)).count();
                (stage, known)
            })
            .collect();

        // BTreeMap iteration keeps the order deterministic
        let mut ready: VecDeque<&TaskTypeName> = self
            .edges
            .keys()
            .filter(|s| in_degree.get(s) == Some(&0))
            .collect();

        let mut order = Vec::with_capacity(self.edges.len());
        while let Some(stage) = ready.pop_front() {
            order.push(stage.clone());
            if let Some(dependents) = self.reverse_edges.get(stage) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push_back(dependent);
                        }
                    }
                }
            }
        }

        if order.len() == self.edges.len() {
            return Ok(order);
        }

        let stuck: BTreeSet<&TaskTypeName> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(stage, _)| stage)
            .collect();
        Err(self.extract_cycle(&stuck))
    }

    pub fn detect_cycle(&self) -> Option<Vec<TaskTypeName>> {
        self.topological_order().err()
    }

    /// Every stuck node has at least one stuck predecessor, so walking
    /// predecessors from any of them must revisit a node.
    fn extract_cycle<'a>(&'a self, stuck: &BTreeSet<&'a TaskTypeName>) -> Vec<TaskTypeName> {
        let Some(&start) = stuck.iter().next() else {
            return Vec::new();
        };
        let mut path: Vec<&'a TaskTypeName> = Vec::new();
        let mut seen: HashMap<&'a TaskTypeName, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&idx) = seen.get(current) {
                // path was built walking backwards; flip it to follow order
                let mut cycle: Vec<TaskTypeName> = path[idx..].iter().map(|s| (*s).clone()).collect();
                cycle.reverse();
                return cycle;
            }
            seen.insert(current, path.len());
            path.push(current);
            let next = self
                .edges
                .get(current)
                .and_then(|deps| deps.iter().find(|d| stuck.contains(d)));
            match next {
                Some(predecessor) => current = predecessor,
                None => return path.iter().map(|s| (*s).clone()).collect(),
            }
        }
    }
}
