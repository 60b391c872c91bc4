use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{DispatchError, DispatchResult};
use crate::trace::{SelectionStrategy, Selector, Trace, TraceGraph};

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u64,
    pub end: u64,
}

impl AddressRange {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// ELF symbol covering an address range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElfEntry {
    pub addr: u64,
    pub name: String,
}

/// Validated, non-overlapping ELF symbol map.
#[derive(Debug, Default)]
pub struct ElfSymbols {
    entries: BTreeMap<AddressRange, ElfEntry>,
}

impl ElfSymbols {
    /// Overlapping ranges and repeated entries are rejected.
    pub fn new(entries: BTreeMap<AddressRange, ElfEntry>) -> DispatchResult<Self> {
        let mut unique = HashSet::new();
        let mut prev: Option<&AddressRange> = None;
        for (range, entry) in &entries {
            if !unique.insert(entry) {
                return Err(DispatchError::content(format!(
                    "found duplicate elf entry: {}",
                    entry.name
                )));
            }
            if let Some(p) = prev
                && p.end > range.start
            {
                return Err(DispatchError::content(format!(
                    "elf range {:#x}..{:#x} overlaps {:#x}..{:#x}",
                    range.start, range.end, p.start, p.end
                )));
            }
            prev = Some(range);
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry whose range covers `addr`.
    pub fn describe(&self, addr: u64) -> Option<&ElfEntry> {
        let key = AddressRange {
            start: addr,
            end: u64::MAX,
        };
        self.entries
            .range(..=key)
            .next_back()
            .filter(|(range, _)| range.contains(addr))
            .map(|(_, entry)| entry)
    }

    /// Write `tb-seq-elf.txt` next to the trace's block sequence: one line
    /// per block with its symbol, when known.
    pub fn write_info(&self, trace_path: &Path) -> DispatchResult<()> {
        let trace = Trace::load(trace_path, false)?;
        let mut out = BufWriter::new(File::create(trace_path.join("tb-seq-elf.txt"))?);
        for block in trace.blocks() {
            match self.describe(*block) {
                Some(entry) => writeln!(out, "{:#x} {} {:#x}", block, entry.name, entry.addr)?,
                None => writeln!(out, "{:#x}", block)?,
            }
        }
        out.flush()?;
        Ok(())
    }
}

/// Deduplicating store of traces waiting for SVM nodes.
///
/// Identity is the content-derived trace id; pending traces are ordered by
/// the embedded [`Selector`].
#[derive(Debug)]
pub struct TracePool {
    selector: Selector,
    pending: HashMap<String, PathBuf>,
    seen: HashSet<String>,
    total: u64,
    compress: bool,
    elf_symbols: Arc<ElfSymbols>,
}

impl TracePool {
    pub fn new(strategy: SelectionStrategy, seed: u64, compress: bool) -> Self {
        Self {
            selector: Selector::new(strategy, seed),
            pending: HashMap::new(),
            seen: HashSet::new(),
            total: 0,
            compress,
            elf_symbols: Arc::default(),
        }
    }

    /// Register the trace directory at `trace_path`. Returns whether it was
    /// novel; only novel traces are queued.
    ///
    /// Reads the trace from disk; async callers holding the pool guard load
    /// it first and use [`TracePool::insert_trace`].
    pub fn insert(&mut self, trace_path: &Path) -> DispatchResult<bool> {
        let trace = Trace::load(trace_path, self.compress)?;
        Ok(self.insert_trace(trace, trace_path.to_path_buf()))
    }

    /// Whether trace identity is computed on the compressed block sequence.
    pub fn compresses(&self) -> bool {
        self.compress
    }

    /// Register an already loaded trace stored at `path`.
    pub fn insert_trace(&mut self, trace: Trace, path: PathBuf) -> bool {
        self.total += 1;
        if !self.seen.insert(trace.id().to_string()) {
            debug!("Redundant trace {}", path.display());
            return false;
        }
        self.pending.insert(trace.id().to_string(), path);
        self.selector.submit(trace);
        true
    }

    /// Pop the best pending trace.
    pub fn next(&mut self) -> Option<PathBuf> {
        let trace = self.selector.next()?.clone();
        self.selector.remove(&trace);
        self.pending.remove(trace.id())
    }

    /// Unique traces ever observed.
    pub fn count_all_unique(&self) -> usize {
        self.seen.len()
    }

    /// Traces waiting to be handed out.
    pub fn count_next(&self) -> usize {
        self.selector.len()
    }

    /// Every trace ever observed, redundant ones included.
    pub fn count_all(&self) -> u64 {
        self.total
    }

    pub fn graph(&self) -> &TraceGraph {
        self.selector.graph()
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.selector.strategy()
    }

    /// Install the ELF symbol map. Overlapping ranges and repeated entries
    /// are rejected.
    pub fn set_elf_entries(&mut self, entries: BTreeMap<AddressRange, ElfEntry>) -> DispatchResult<()> {
        self.elf_symbols = Arc::new(ElfSymbols::new(entries)?);
        Ok(())
    }

    /// ELF entry whose range covers `addr`.
    pub fn describe_block(&self, addr: u64) -> Option<&ElfEntry> {
        self.elf_symbols.describe(addr)
    }

    /// Shared handle to the symbol map, usable once the pool guard is gone.
    pub fn elf_symbols(&self) -> Arc<ElfSymbols> {
        self.elf_symbols.clone()
    }

    /// Drop pending traces and counters. ELF entries are kept.
    pub fn clear(&mut self) {
        self.selector.clear();
        self.pending.clear();
        self.seen.clear();
        self.total = 0;
    }
}
