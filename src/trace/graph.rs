use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::io::Write;

use super::{Block, Trace};

/// Blocks and block-to-block transitions seen across every submitted trace.
///
/// The graph only grows. Successor sets are ordered so traversals are
/// reproducible.
#[derive(Debug, Clone, Default)]
pub struct TraceGraph {
    root: Option<Block>,
    edges: HashMap<Block, BTreeSet<Block>>,
    discovered: HashSet<Block>,
    weights: HashMap<Block, u64>,
}

impl TraceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the trace's transitions. Returns the blocks it discovered, in
    /// trace order.
    pub fn insert(&mut self, trace: &Trace) -> Vec<Block> {
        let blocks = trace.blocks();
        let mut new_blocks = Vec::new();

        let Some(&first) = blocks.first() else {
            return new_blocks;
        };
        if self.root.is_none() {
            self.root = Some(first);
        }
        if self.discovered.insert(first) {
            new_blocks.push(first);
        }

        for pair in blocks.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            if self.edges.entry(from).or_default().insert(to) && self.discovered.insert(to) {
                new_blocks.push(to);
            }
        }

        for b in blocks {
            *self.weights.entry(*b).or_insert(0) += 1;
        }

        new_blocks
    }

    pub fn root(&self) -> Option<Block> {
        self.root
    }

    pub fn contains_edge(&self, from: Block, to: Block) -> bool {
        self.edges.get(&from).is_some_and(|s| s.contains(&to))
    }

    pub fn is_discovered(&self, block: Block) -> bool {
        self.discovered.contains(&block)
    }

    pub fn block_count(&self) -> usize {
        self.discovered.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|s| s.len()).sum()
    }

    /// Number of appearances of `block` across all submitted traces.
    pub fn weight(&self, block: Block) -> u64 {
        self.weights.get(&block).copied().unwrap_or(0)
    }

    pub fn successors(&self, block: Block) -> impl Iterator<Item = Block> + '_ {
        self.edges.get(&block).into_iter().flatten().copied()
    }

    /// BFS distance of every reachable block from the root.
    pub fn distances(&self) -> HashMap<Block, usize> {
        let mut dist = HashMap::new();
        let Some(root) = self.root else {
            return dist;
        };
        let mut queue = VecDeque::from([(root, 0usize)]);
        dist.insert(root, 0);
        while let Some((current, d)) = queue.pop_front() {
            for next in self.successors(current) {
                if !dist.contains_key(&next) {
                    dist.insert(next, d + 1);
                    queue.push_back((next, d + 1));
                }
            }
        }
        dist
    }

    pub fn distance_from_root(&self, block: Block) -> Option<usize> {
        self.distances().get(&block).copied()
    }

    /// Shortest path from `from` to `to`, both ends included.
    pub fn find_path(&self, from: Block, to: Block) -> Option<Vec<Block>> {
        let mut visited: HashSet<Block> = HashSet::new();
        let mut queue: VecDeque<(Block, Vec<Block>)> = VecDeque::from([(from, vec![from])]);

        while let Some((current, path)) = queue.pop_front() {
            if current == to {
                return Some(path);
            }
            if !visited.insert(current) {
                continue;
            }
            for next in self.successors(current) {
                if !visited.contains(&next) {
                    let mut next_path = path.clone();
                    next_path.push(next);
                    queue.push_back((next, next_path));
                }
            }
        }
        None
    }

    /// Blocks reachable from `block` by a depth-first walk, `block` excluded.
    pub fn subtree_size(&self, block: Block) -> usize {
        let mut visited: HashSet<Block> = HashSet::from([block]);
        let mut stack: Vec<Block> = self.successors(block).collect();
        let mut count = 0;
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            count += 1;
            stack.extend(self.successors(current).filter(|n| !visited.contains(n)));
        }
        count
    }

    /// Graphviz rendering. With `only_branches` only edges leaving blocks with
    /// more than one successor are drawn.
    pub fn write_dot<W: Write>(&self, mut out: W, only_branches: bool) -> std::io::Result<()> {
        let mut sources: Vec<&Block> = self.edges.keys().collect();
        sources.sort();

        writeln!(out, "digraph trace_graph {{")?;
        for from in sources {
            let succ = &self.edges[from];
            if only_branches && succ.len() < 2 {
                continue;
            }
            for to in succ {
                writeln!(out, "    \"{:#x}\" -> \"{:#x}\";", from, to)?;
            }
        }
        writeln!(out, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(blocks: &[Block]) -> Trace {
        Trace::from_blocks(blocks.to_vec())
    }

    #[test]
    fn test_insert_reports_new_blocks() {
        let mut g = TraceGraph::new();
        assert_eq!(g.insert(&trace(&[1, 2, 3])), vec![1, 2, 3]);
        assert_eq!(g.insert(&trace(&[1, 2, 4])), vec![4]);
        // A new edge into a known block discovers nothing.
        assert_eq!(g.insert(&trace(&[1, 3])), Vec::<Block>::new());
        assert!(g.contains_edge(1, 3));
        assert_eq!(g.block_count(), 4);
        assert_eq!(g.edge_count(), 4);
        assert_eq!(g.root(), Some(1));
    }

    #[test]
    fn test_weights_count_every_appearance() {
        let mut g = TraceGraph::new();
        g.insert(&trace(&[1, 2, 2, 3]));
        g.insert(&trace(&[1, 3]));
        assert_eq!(g.weight(1), 2);
        assert_eq!(g.weight(2), 2);
        assert_eq!(g.weight(3), 2);
        assert_eq!(g.weight(9), 0);
    }

    #[test]
    fn test_distances_and_paths() {
        let mut g = TraceGraph::new();
        g.insert(&trace(&[1, 2, 3, 4]));
        g.insert(&trace(&[1, 4]));
        assert_eq!(g.distance_from_root(4), Some(1));
        assert_eq!(g.distance_from_root(3), Some(2));
        assert_eq!(g.distance_from_root(99), None);
        assert_eq!(g.find_path(1, 4), Some(vec![1, 4]));
        assert_eq!(g.find_path(2, 4), Some(vec![2, 3, 4]));
        assert_eq!(g.find_path(4, 1), None);
    }

    #[test]
    fn test_subtree_size() {
        let mut g = TraceGraph::new();
        g.insert(&trace(&[1, 2, 3]));
        g.insert(&trace(&[1, 2, 4, 2]));
        assert_eq!(g.subtree_size(1), 3);
        assert_eq!(g.subtree_size(3), 0);
    }

    #[test]
    fn test_write_dot_only_branches() {
        let mut g = TraceGraph::new();
        g.insert(&trace(&[1, 2, 3]));
        g.insert(&trace(&[1, 2, 4]));
        let mut out = Vec::new();
        g.write_dot(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"0x2\" -> \"0x3\""));
        assert!(text.contains("\"0x2\" -> \"0x4\""));
        assert!(!text.contains("\"0x1\" -> \"0x2\""));
    }
}
