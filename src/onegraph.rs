//! Directed 1-graphs.
//!
//! A 1-graph has at most one arrow out of each node. The planner stores its
//! pending renames in one: an arrow `a -> b` is "rename a to b". Cycle
//! bookkeeping is incremental so validity checks during search are cheap.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Clone, Debug, Default)]
pub struct OneGraph<T: Eq + Hash + Clone> {
    arrows: HashMap<T, T>,
    /// Disjoint node sets, one per live cycle.
    cycles: Vec<HashSet<T>>,
}

impl<T: Eq + Hash + Clone> OneGraph<T> {
    pub fn new() -> Self {
        OneGraph {
            arrows: HashMap::new(),
            cycles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.arrows.is_empty()
    }

    /// If `a -> b` is in the graph, return `b`.
    pub fn follow_arrow(&self, node: &T) -> Option<&T> {
        self.arrows.get(node)
    }

    pub fn has_cycle(&self) -> bool {
        !self.cycles.is_empty()
    }

    pub fn iter_arrows(&self) -> impl Iterator<Item = (&T, &T)> {
        self.arrows.iter()
    }

    pub fn add_arrow(&mut self, from: T, to: T) {
        debug_assert!(
            !self.arrows.contains_key(&from),
            "OneGraph::add_arrow: arrow already present"
        );
        self.arrows.insert(from, to.clone());
        if let Some(cycle) = self.cycle_from(&to) {
            // A new cycle, unless we just re-walked a known one.
            let probe = &cycle[0];
            if !self.cycles.iter().any(|c| c.contains(probe)) {
                self.cycles.push(cycle.into_iter().collect());
            }
        }
    }

    pub fn remove_arrow(&mut self, from: &T, to: &T) {
        let removed = self.arrows.remove(from);
        debug_assert!(
            removed.as_ref() == Some(to),
            "OneGraph::remove_arrow: arrow not present"
        );
        let _ = removed;
        // Breaking one arrow breaks at most one cycle.
        if let Some(pos) = self.cycles.iter().position(|c| c.contains(from)) {
            self.cycles.swap_remove(pos);
        }
    }

    pub fn add_graph(&mut self, other: &OneGraph<T>) {
        for (a, b) in other.iter_arrows() {
            self.add_arrow(a.clone(), b.clone());
        }
    }

    pub fn remove_graph(&mut self, other: &OneGraph<T>) {
        for (a, b) in other.iter_arrows() {
            self.remove_arrow(a, b);
        }
    }

    /// Nodes with an outgoing arrow but no incoming arrow.
    pub fn roots(&self) -> Vec<T> {
        let targets: HashSet<&T> = self.arrows.values().collect();
        self.arrows
            .keys()
            .filter(|n| !targets.contains(n))
            .cloned()
            .collect()
    }

    /// Walk arrows from `start`; if the walk revisits a node on its own
    /// path, return the nodes walked so far.
    fn cycle_from(&self, start: &T) -> Option<Vec<T>> {
        if self.arrows.len() <= 1 {
            return None;
        }
        let mut stack: Vec<T> = vec![start.clone()];
        let mut seen: HashSet<T> = stack.iter().cloned().collect();
        while let Some(next) = self.arrows.get(stack.last().unwrap()) {
            if seen.contains(next) {
                return Some(stack);
            }
            seen.insert(next.clone());
            stack.push(next.clone());
        }
        None
    }
}
