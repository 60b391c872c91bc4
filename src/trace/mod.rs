//! Execution traces and their compression.
//!
//! On disk a trace is a directory holding `tb-seq.bin`, a packed little-endian
//! array of u64 basic-block addresses. In memory a [`Trace`] is the block
//! sequence plus an identifier derived from it.

pub mod graph;
pub mod selector;

pub use graph::TraceGraph;
pub use selector::{SelectionStrategy, Selector};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::hash::{Hash, Hasher};
use std::path::Path;

use crate::error::{DispatchError, DispatchResult};

pub type Block = u64;

/// File inside a trace directory holding the block sequence.
pub const BLOCK_SEQUENCE_FILE: &str = "tb-seq.bin";

/// Longest cycle period considered by [`compress`].
pub const MAX_CYCLE_PERIOD: usize = 64;

/// Identifier plus block sequence. Equality and hashing use the identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    id: String,
    blocks: Vec<Block>,
}

impl PartialEq for Trace {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Trace {}

impl Hash for Trace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Trace {
    pub fn new(id: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            id: id.into(),
            blocks,
        }
    }

    /// Trace whose identifier is the SHA-256 of its blocks.
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        let mut hasher = Sha256::new();
        for b in &blocks {
            hasher.update(b.to_le_bytes());
        }
        Self {
            id: format!("{:x}", hasher.finalize()),
            blocks,
        }
    }

    /// Read a trace directory. With `compress` the identifier is taken over
    /// the compressed sequence.
    ///
    /// A directory without a block sequence gets an identifier hashed from
    /// its regular files and no blocks.
    pub fn load(dir: &Path, compress_cycles: bool) -> DispatchResult<Trace> {
        let seq = dir.join(BLOCK_SEQUENCE_FILE);
        if seq.is_file() {
            let bytes = std::fs::read(&seq)?;
            if bytes.len() % 8 != 0 {
                return Err(DispatchError::content(format!(
                    "{} is not a whole number of blocks",
                    seq.display()
                )));
            }
            let blocks: Vec<Block> = bytes
                .chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    u64::from_le_bytes(b)
                })
                .collect();
            let blocks = if compress_cycles { compress(&blocks) } else { blocks };
            return Ok(Trace::from_blocks(blocks));
        }

        if !dir.is_dir() {
            return Err(DispatchError::content(format!(
                "{} is not a trace directory",
                dir.display()
            )));
        }
        let mut files: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        files.sort();

        let mut hasher = Sha256::new();
        for f in files {
            hasher.update(f.file_name().map(|n| n.as_encoded_bytes()).unwrap_or_default());
            hasher.update(std::fs::read(&f)?);
        }
        Ok(Trace::new(format!("{:x}", hasher.finalize()), Vec::new()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Combined value standing in for one period of a collapsed cycle.
pub fn cycle_hash(period: &[Block]) -> Block {
    let mut hasher = Sha256::new();
    for b in period {
        hasher.update(b.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(out)
}

/// Collapse repeated runs into a single [`cycle_hash`] value.
///
/// At each position the period whose back-to-back repetitions cover the most
/// blocks wins (shortest period on ties). The first block is never part of a
/// cycle.
pub fn compress(blocks: &[Block]) -> Vec<Block> {
    let Some((&first, rest)) = blocks.split_first() else {
        return Vec::new();
    };

    let mut out = vec![first];
    let mut i = 0;
    while i < rest.len() {
        let remaining = rest.len() - i;
        let mut best: Option<(usize, usize)> = None; // (period, covered)

        for p in 1..=(remaining / 2).min(MAX_CYCLE_PERIOD) {
            let period = &rest[i..i + p];
            let mut reps = 1;
            while i + (reps + 1) * p <= rest.len() && &rest[i + reps * p..i + (reps + 1) * p] == period {
                reps += 1;
            }
            if reps >= 2 && best.is_none_or(|(_, covered)| reps * p > covered) {
                best = Some((p, reps * p));
            }
        }

        match best {
            Some((p, covered)) => {
                out.push(cycle_hash(&rest[i..i + p]));
                i += covered;
            }
            None => {
                out.push(rest[i]);
                i += 1;
            }
        }
    }
    out
}
