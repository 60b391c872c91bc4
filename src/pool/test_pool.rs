use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};
use crate::test_case::{TestCase, TestCaseHash};

/// Order in which pending test cases leave the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestSchedStrat {
    /// Insertion order.
    #[default]
    Fifo,
    /// Shallowest derivation depth first, insertion order within a depth.
    Bfs,
}

/// Deduplicating store of test cases waiting to be executed by VM nodes.
///
/// Every accepted test case gets an index, is cached in complete form so
/// later patches can be expanded against it, and is recorded in the
/// derivation tree under its parent.
#[derive(Debug, Default)]
pub struct TestPool {
    strategy: TestSchedStrat,
    /// Dedup index: complete hash to pool index.
    known: HashMap<TestCaseHash, u64>,
    /// Base-test-case cache used to expand patches.
    cache: HashMap<TestCaseHash, TestCase>,
    depths: HashMap<u64, u32>,
    children: BTreeMap<u64, Vec<u64>>,
    /// Keyed by (depth, index) for BFS, (0, index) for FIFO.
    queue: BTreeMap<(u32, u64), TestCase>,
    next_index: u64,
    duplicates: u64,
    seeded: bool,
    output_dir: Option<PathBuf>,
}

impl TestPool {
    pub fn new(strategy: TestSchedStrat) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Persist every accepted test case as `<dir>/<index>`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn strategy(&self) -> TestSchedStrat {
        self.strategy
    }

    /// Pop the highest-priority pending test case.
    pub fn next(&mut self) -> Option<TestCase> {
        self.queue.pop_first().map(|(_, tc)| tc)
    }

    /// Insert test cases with no known parent. Patches are parented to
    /// their base. Returns how many were accepted.
    pub fn insert(&mut self, tcs: Vec<TestCase>) -> usize {
        tcs.into_iter().filter(|tc| self.insert_one(tc, None)).count()
    }

    /// Insert test cases derived from `parent`.
    pub fn insert_with_parent(&mut self, tcs: Vec<TestCase>, parent: &TestCase) -> usize {
        let parent_index = self.known.get(&parent.hash()).copied();
        if parent_index.is_none() {
            warn!("Parent test case {} is not in the pool; treating children as seeds", parent.hash());
        }
        tcs.into_iter()
            .filter(|tc| self.insert_one(tc, parent_index))
            .count()
    }

    /// Seed the pool with the run's initial test case. Only allowed once.
    pub fn insert_initial_tc_from_config(&mut self, tc: TestCase) -> DispatchResult<()> {
        if self.seeded {
            return Err(DispatchError::Internal("test pool is already seeded".into()));
        }
        if tc.is_patch() {
            return Err(DispatchError::content("initial test case must be complete"));
        }
        self.seeded = true;
        self.insert_one(&tc, None);
        Ok(())
    }

    fn insert_one(&mut self, tc: &TestCase, parent: Option<u64>) -> bool {
        let (complete, parent) = match tc.patch() {
            Some(patch) => {
                let Some(base) = self.cache.get(&patch.base) else {
                    debug!("Dropping patch against unknown base {}", patch.base);
                    self.duplicates += 1;
                    return false;
                };
                match tc.reconstruct(base) {
                    Ok(complete) => (complete, parent.or_else(|| self.known.get(&patch.base).copied())),
                    Err(e) => {
                        debug!("Dropping patch: {}", e);
                        self.duplicates += 1;
                        return false;
                    }
                }
            }
            None => (tc.clone(), parent),
        };

        let hash = complete.hash();
        if self.known.contains_key(&hash) {
            self.duplicates += 1;
            return false;
        }

        let index = self.next_index;
        self.next_index += 1;
        let depth = parent
            .and_then(|p| self.depths.get(&p))
            .map(|d| d + 1)
            .unwrap_or(0);

        if let Some(p) = parent {
            self.children.entry(p).or_default().push(index);
        }
        self.children.entry(index).or_default();
        self.depths.insert(index, depth);
        self.known.insert(hash, index);

        if let Some(dir) = &self.output_dir
            && let Err(e) = Self::persist(dir, index, &complete)
        {
            warn!("Failed to persist test case {}: {}", index, e);
        }

        let key = match self.strategy {
            TestSchedStrat::Fifo => (0, index),
            TestSchedStrat::Bfs => (depth, index),
        };
        self.cache.insert(hash, complete.clone());
        self.queue.insert(key, complete);
        true
    }

    fn persist(dir: &std::path::Path, index: u64, tc: &TestCase) -> DispatchResult<()> {
        let mut out = BufWriter::new(File::create(dir.join(index.to_string()))?);
        tc.write_to(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    /// Unique test cases ever accepted.
    pub fn count_all(&self) -> usize {
        self.known.len()
    }

    /// Test cases waiting to be handed out.
    pub fn count_next(&self) -> usize {
        self.queue.len()
    }

    /// Duplicates and unreconstructable patches dropped so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn contains(&self, tc: &TestCase) -> bool {
        self.known.contains_key(&tc.hash())
    }

    /// Derivation depth of a known test case.
    pub fn depth_of(&self, tc: &TestCase) -> Option<u32> {
        self.known
            .get(&tc.hash())
            .and_then(|i| self.depths.get(i))
            .copied()
    }

    /// Write the derivation tree, one `Node tc-<index>: [<children> ]` line
    /// per accepted test case.
    pub fn write_tc_tree<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        for (index, children) in &self.children {
            write!(out, "Node tc-{}: [", index)?;
            for child in children {
                write!(out, "{} ", child)?;
            }
            writeln!(out, "]")?;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        let strategy = self.strategy;
        let output_dir = self.output_dir.take();
        *self = Self {
            strategy,
            output_dir,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::{TestCaseElement, TestCasePatch};

    fn tc(data: &str) -> TestCase {
        TestCase::new(vec![TestCaseElement::new("argv_1", data.as_bytes())])
    }

    #[test]
    fn test_identical_content_is_deduplicated() {
        let mut pool = TestPool::new(TestSchedStrat::Fifo);
        assert_eq!(pool.insert(vec![tc("a")]), 1);
        assert_eq!(pool.insert(vec![tc("a")]), 0);
        assert_eq!(pool.count_all(), 1);
        assert_eq!(pool.count_next(), 1);
        assert_eq!(pool.duplicates(), 1);
    }

    #[test]
    fn test_fifo_order() {
        let mut pool = TestPool::new(TestSchedStrat::Fifo);
        pool.insert(vec![tc("t1"), tc("t2"), tc("t3")]);
        assert_eq!(pool.next(), Some(tc("t1")));
        assert_eq!(pool.next(), Some(tc("t2")));
        assert_eq!(pool.next(), Some(tc("t3")));
        assert_eq!(pool.next(), None);
    }

    #[test]
    fn test_bfs_returns_shallow_first() {
        let mut pool = TestPool::new(TestSchedStrat::Bfs);
        let root = tc("root");
        pool.insert_initial_tc_from_config(root.clone()).unwrap();
        assert_eq!(pool.next(), Some(root.clone()));

        pool.insert_with_parent(vec![tc("d1-a")], &root);
        let d1a = tc("d1-a");
        pool.insert_with_parent(vec![tc("d2-a"), tc("d2-b")], &d1a);
        pool.insert_with_parent(vec![tc("d1-b")], &root);

        assert_eq!(pool.depth_of(&tc("d2-b")), Some(2));
        let order: Vec<TestCase> = std::iter::from_fn(|| pool.next()).collect();
        assert_eq!(order, vec![tc("d1-a"), tc("d1-b"), tc("d2-a"), tc("d2-b")]);
    }

    #[test]
    fn test_patch_is_reconstructed() {
        let mut pool = TestPool::new(TestSchedStrat::Bfs);
        let base = TestCase::new(vec![
            TestCaseElement::new("argv_1", "aaaa"),
            TestCaseElement::new("argv_2", "bbbb"),
        ]);
        pool.insert_initial_tc_from_config(base.clone()).unwrap();

        let target = TestCase::new(vec![
            TestCaseElement::new("argv_1", "aaaa"),
            TestCaseElement::new("argv_2", "zzzz"),
        ]);
        assert_eq!(pool.insert(vec![TestCase::diff(&base, &target)]), 1);
        assert!(pool.contains(&target));
        assert_eq!(pool.depth_of(&target), Some(1));

        pool.next();
        assert_eq!(pool.next(), Some(target));
    }

    #[test]
    fn test_patch_with_unknown_base_is_dropped() {
        let mut pool = TestPool::new(TestSchedStrat::Fifo);
        pool.insert(vec![tc("known")]);
        let before = pool.count_all();

        let orphan = TestCase::from_patch(TestCasePatch {
            base: tc("never inserted").hash(),
            elements: vec![(0, TestCaseElement::new("argv_1", "x"))],
        });
        assert_eq!(pool.insert(vec![orphan, tc("other")]), 1);
        assert_eq!(pool.count_all(), before + 1);
        assert_eq!(pool.duplicates(), 1);
    }

    #[test]
    fn test_seed_only_once() {
        let mut pool = TestPool::new(TestSchedStrat::Fifo);
        pool.insert_initial_tc_from_config(tc("seed")).unwrap();
        assert!(pool.is_seeded());
        assert!(pool.insert_initial_tc_from_config(tc("again")).is_err());
    }

    #[test]
    fn test_tc_tree_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = TestPool::new(TestSchedStrat::Fifo).with_output_dir(dir.path());
        let root = tc("root");
        pool.insert_initial_tc_from_config(root.clone()).unwrap();
        pool.insert_with_parent(vec![tc("a"), tc("b")], &root);

        let mut out = Vec::new();
        pool.write_tc_tree(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Node tc-0: [1 2 ]\nNode tc-1: []\nNode tc-2: []\n"
        );

        let stored = std::fs::read(dir.path().join("2")).unwrap();
        assert_eq!(TestCase::read_from(stored.as_slice()).unwrap(), tc("b"));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut pool = TestPool::new(TestSchedStrat::Bfs);
        pool.insert_initial_tc_from_config(tc("seed")).unwrap();
        pool.clear();
        assert_eq!(pool.count_all(), 0);
        assert_eq!(pool.count_next(), 0);
        assert!(!pool.is_seeded());
        assert_eq!(pool.strategy(), TestSchedStrat::Bfs);
    }
}
