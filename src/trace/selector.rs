//! Exploration priority for traces waiting on symbolic analysis.
//!
//! Every strategy maps a trace to a score and [`Selector::next`] returns the
//! highest one. Ties go to the earliest submitted trace, so a run is
//! reproducible for identical inputs (and a fixed seed under `Random`).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use super::{Block, Trace, TraceGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Insertion order.
    #[default]
    Fifo,
    /// Frontier closest to the root first.
    Bfs,
    /// Traces through rarely seen blocks first.
    Weighted,
    /// Traces through rarely selected blocks first.
    LeastTreaded,
    /// Seeded uniform draw.
    Random,
    /// Frontier with the least explored depth-first subtree first.
    RecursiveDescent,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 6] = [
        Self::Fifo,
        Self::Bfs,
        Self::Weighted,
        Self::LeastTreaded,
        Self::Random,
        Self::RecursiveDescent,
    ];

    /// Whether scores depend on the graph or selection history and must be
    /// recomputed before picking.
    fn is_dynamic(self) -> bool {
        !matches!(self, Self::Fifo | Self::Random)
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    trace: Trace,
    /// Last block this trace discovered, or its last block.
    frontier: Option<Block>,
    score: f64,
}

#[derive(Debug)]
pub struct Selector {
    strategy: SelectionStrategy,
    graph: TraceGraph,
    candidates: Vec<Candidate>,
    ids: HashSet<String>,
    selected: HashMap<Block, u64>,
    rng: StdRng,
}

impl Selector {
    pub fn new(strategy: SelectionStrategy, seed: u64) -> Self {
        Self {
            strategy,
            graph: TraceGraph::new(),
            candidates: Vec::new(),
            ids: HashSet::new(),
            selected: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn graph(&self) -> &TraceGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn contains(&self, trace: &Trace) -> bool {
        self.ids.contains(trace.id())
    }

    /// Register a trace for consideration and fold it into the graph.
    /// Returns false if it is already pending.
    pub fn submit(&mut self, trace: Trace) -> bool {
        if self.ids.contains(trace.id()) {
            return false;
        }
        let discovered = self.graph.insert(&trace);
        let frontier = discovered.last().or(trace.blocks().last()).copied();

        let mut candidate = Candidate {
            trace,
            frontier,
            score: 0.0,
        };
        candidate.score = match self.strategy {
            SelectionStrategy::Random => self.rng.r#gen::<f64>(),
            _ => self.score(&candidate, None),
        };

        self.ids.insert(candidate.trace.id().to_string());
        self.candidates.push(candidate);
        true
    }

    /// Score of `trace` under the active strategy. Higher is better.
    pub fn calculate_score(&self, trace: &Trace) -> f64 {
        match self.candidates.iter().find(|c| c.trace == *trace) {
            Some(c) if self.strategy == SelectionStrategy::Random => c.score,
            Some(c) => self.score(c, None),
            None => {
                let fresh = Candidate {
                    trace: trace.clone(),
                    frontier: trace.blocks().last().copied(),
                    score: 0.0,
                };
                self.score(&fresh, None)
            }
        }
    }

    fn score(&self, c: &Candidate, distances: Option<&HashMap<Block, usize>>) -> f64 {
        let blocks = c.trace.blocks();
        match self.strategy {
            SelectionStrategy::Fifo => 0.0,
            SelectionStrategy::Random => c.score,
            SelectionStrategy::Bfs => {
                let distance = match (c.frontier, distances) {
                    (Some(f), Some(d)) => d.get(&f).copied(),
                    (Some(f), None) => self.graph.distance_from_root(f),
                    (None, _) => None,
                };
                distance.map(|d| -(d as f64)).unwrap_or(f64::MIN)
            }
            SelectionStrategy::Weighted => blocks
                .iter()
                .map(|b| 1.0 / self.graph.weight(*b).max(1) as f64)
                .sum(),
            SelectionStrategy::LeastTreaded => {
                if blocks.is_empty() {
                    return 1.0;
                }
                let total: f64 = blocks
                    .iter()
                    .map(|b| 1.0 / (1 + self.selected.get(b).copied().unwrap_or(0)) as f64)
                    .sum();
                total / blocks.len() as f64
            }
            SelectionStrategy::RecursiveDescent => match c.frontier {
                Some(f) => 1.0 / (1 + self.graph.subtree_size(f)) as f64,
                None => 0.0,
            },
        }
    }

    /// Best pending trace, left in place until [`Selector::remove`].
    pub fn next(&mut self) -> Option<&Trace> {
        if self.strategy.is_dynamic() {
            let distances = (self.strategy == SelectionStrategy::Bfs).then(|| self.graph.distances());
            let scores: Vec<f64> = self
                .candidates
                .iter()
                .map(|c| self.score(c, distances.as_ref()))
                .collect();
            for (c, s) in self.candidates.iter_mut().zip(scores) {
                c.score = s;
            }
        }

        let mut best: Option<usize> = None;
        for (i, c) in self.candidates.iter().enumerate() {
            // Strictly greater keeps the earliest on ties.
            if best.is_none_or(|b| c.score > self.candidates[b].score) {
                best = Some(i);
            }
        }
        best.map(|i| &self.candidates[i].trace)
    }

    /// Evict a consumed trace and count its blocks as selected.
    pub fn remove(&mut self, trace: &Trace) -> bool {
        let Some(pos) = self.candidates.iter().position(|c| c.trace == *trace) else {
            return false;
        };
        let c = self.candidates.remove(pos);
        self.ids.remove(c.trace.id());
        for b in c.trace.blocks() {
            *self.selected.entry(*b).or_insert(0) += 1;
        }
        true
    }

    /// Drop pending traces. The graph and selection history are kept.
    pub fn clear(&mut self) {
        self.candidates.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(blocks: &[Block]) -> Trace {
        Trace::from_blocks(blocks.to_vec())
    }

    fn drain(selector: &mut Selector) -> Vec<Trace> {
        let mut out = Vec::new();
        while let Some(t) = selector.next().cloned() {
            selector.remove(&t);
            out.push(t);
        }
        out
    }

    #[test]
    fn test_fifo_keeps_insertion_order() {
        let mut s = Selector::new(SelectionStrategy::Fifo, 0);
        let ts = [trace(&[1, 2]), trace(&[1, 3]), trace(&[1, 4])];
        for t in &ts {
            assert!(s.submit(t.clone()));
        }
        assert_eq!(drain(&mut s), ts.to_vec());
    }

    #[test]
    fn test_duplicate_submit_is_rejected() {
        let mut s = Selector::new(SelectionStrategy::Fifo, 0);
        assert!(s.submit(trace(&[1, 2])));
        assert!(!s.submit(trace(&[1, 2])));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_next_does_not_remove() {
        let mut s = Selector::new(SelectionStrategy::Fifo, 0);
        s.submit(trace(&[1]));
        let a = s.next().cloned();
        let b = s.next().cloned();
        assert_eq!(a, b);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_bfs_prefers_shallow_frontier() {
        let mut s = Selector::new(SelectionStrategy::Bfs, 0);
        let deep = trace(&[1, 2, 3, 4]);
        let shallow = trace(&[1, 5]);
        s.submit(deep.clone());
        s.submit(shallow.clone());
        assert_eq!(s.next().cloned(), Some(shallow));
        assert_eq!(s.calculate_score(&deep), -3.0);
    }

    #[test]
    fn test_weighted_prefers_rare_blocks() {
        let mut s = Selector::new(SelectionStrategy::Weighted, 0);
        let common = trace(&[1, 2]);
        let rare = trace(&[1, 2, 9]);
        s.submit(common.clone());
        s.submit(trace(&[1, 2, 2]));
        s.submit(rare.clone());
        // rare: 1/3 + 1/4 + 1 beats every other candidate.
        assert_eq!(s.next().cloned(), Some(rare));
        assert!(s.calculate_score(&common) < 1.0);
    }

    #[test]
    fn test_least_treaded_avoids_selected_blocks() {
        let mut s = Selector::new(SelectionStrategy::LeastTreaded, 0);
        let first = trace(&[1, 2]);
        let same_path = trace(&[1, 2, 1]);
        let other = trace(&[7, 8]);
        s.submit(first.clone());
        s.submit(same_path.clone());
        s.submit(other.clone());

        assert_eq!(s.next().cloned(), Some(first.clone()));
        s.remove(&first);
        // Blocks 1 and 2 are now treaded; the untouched path wins.
        assert_eq!(s.next().cloned(), Some(other));
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let run = |seed| {
            let mut s = Selector::new(SelectionStrategy::Random, seed);
            for i in 0..10u64 {
                s.submit(trace(&[1, 100 + i]));
            }
            drain(&mut s)
        };
        assert_eq!(run(7), run(7));
        assert_eq!(run(7).len(), 10);
    }

    #[test]
    fn test_recursive_descent_prefers_unexplored_frontier() {
        let mut s = Selector::new(SelectionStrategy::RecursiveDescent, 0);
        let explored = trace(&[1, 2]);
        s.submit(explored.clone());
        s.submit(trace(&[1, 2, 3, 4]));
        let leaf = trace(&[1, 5]);
        s.submit(leaf.clone());
        // Block 2 has {3, 4} below it; block 4 and 5 have nothing.
        assert!(s.calculate_score(&explored) < s.calculate_score(&leaf));
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        for strategy in SelectionStrategy::ALL {
            if strategy == SelectionStrategy::Random {
                continue;
            }
            let mut s = Selector::new(strategy, 0);
            let a = Trace::new("a", vec![]);
            let b = Trace::new("b", vec![]);
            s.submit(a.clone());
            s.submit(b.clone());
            assert_eq!(s.next().cloned(), Some(a), "{:?}", strategy);
        }
    }

    #[test]
    fn test_clear_keeps_graph() {
        let mut s = Selector::new(SelectionStrategy::Fifo, 0);
        s.submit(trace(&[1, 2]));
        s.clear();
        assert!(s.is_empty());
        assert!(s.graph().is_discovered(2));
    }
}
