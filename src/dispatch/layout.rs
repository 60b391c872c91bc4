// On-disk layout of one dispatch run

use anyhow::{Context, Result};
use chrono::Local;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::guest::GuestData;
use crate::node::{NodeError, NodeType};
use crate::pool::TestPool;
use crate::trace::TraceGraph;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H.%M.%S%.6f";
pub const GUEST_CONFIG_FILE: &str = "guest-config.serialized";
pub const STAT_FILE: &str = "stat.dat";

/// One row of the statistics file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub elapsed_secs: u64,
    pub tc_left: usize,
    pub tc_total: usize,
    pub trace_left: usize,
    pub trace_total: usize,
}

impl Stats {
    pub fn line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.elapsed_secs, self.tc_left, self.tc_total, self.trace_left, self.trace_total
        )
    }
}

/// Final per-node row of `finish.log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    pub id: u64,
    pub node_type: NodeType,
    pub state: String,
    pub traces: u64,
    pub tests: u64,
    pub errors: u64,
}

/// `<root_dir>/<timestamp>/` and everything below it.
#[derive(Debug, Clone)]
pub struct DispatchRoot {
    path: PathBuf,
}

impl DispatchRoot {
    /// Create a fresh timestamped run directory under `root_dir` and point
    /// `<root_dir>/last` at it.
    pub fn create(root_dir: &Path) -> Result<Self> {
        let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let root = Self {
            path: root_dir.join(&stamp),
        };

        for dir in [
            root.trace_dir(),
            root.test_case_dir(),
            root.profile_dir(),
            root.guest_data_dir(),
            root.node_log_dir(NodeType::Vm),
            root.node_log_dir(NodeType::Svm),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        root.link_last(root_dir, &stamp);
        debug!("Dispatch root at {}", root.path.display());
        Ok(root)
    }

    #[cfg(unix)]
    fn link_last(&self, root_dir: &Path, stamp: &str) {
        let link = root_dir.join("last");
        if link.symlink_metadata().is_ok()
            && let Err(e) = fs::remove_file(&link)
        {
            warn!("Failed to remove {}: {}", link.display(), e);
            return;
        }
        if let Err(e) = std::os::unix::fs::symlink(stamp, &link) {
            warn!("Failed to link {}: {}", link.display(), e);
        }
    }

    #[cfg(not(unix))]
    fn link_last(&self, _root_dir: &Path, _stamp: &str) {}

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.path.join("trace")
    }

    pub fn test_case_dir(&self) -> PathBuf {
        self.path.join("test-case")
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.path.join("profile")
    }

    pub fn guest_data_dir(&self) -> PathBuf {
        self.path.join("guest-data")
    }

    pub fn node_log_dir(&self, node_type: NodeType) -> PathBuf {
        self.path.join("log").join(node_type.log_dir_name())
    }

    pub fn finish_log(&self) -> PathBuf {
        self.path.join("finish.log")
    }

    pub fn tc_tree_log(&self) -> PathBuf {
        self.path.join("test_case_tree.log")
    }

    pub fn node_error_log(&self) -> PathBuf {
        self.path.join("log").join("node_error.log")
    }

    pub fn graph_file(&self) -> PathBuf {
        self.path.join("trace_graph.dot")
    }

    pub fn write_guest_config(&self, guest: &GuestData) -> Result<PathBuf> {
        let path = self.guest_data_dir().join(GUEST_CONFIG_FILE);
        let bytes = bincode::serialize(guest)?;
        fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Append worker-reported errors to the shared error log and to the
    /// node's own log.
    pub fn append_node_errors(&self, id: u64, node_type: NodeType, errors: &[NodeError]) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let mut text = String::new();
        for error in errors {
            writeln!(text, "[{} {}] {}", node_type, id, error.log)?;
        }
        append(&self.node_error_log(), &text)?;
        append(&self.node_log_dir(node_type).join(format!("{}.log", id)), &text)
    }

    pub fn append_stats(&self, stats: &Stats) -> Result<()> {
        append(&self.profile_dir().join(STAT_FILE), &format!("{}\n", stats.line()))
    }

    pub fn write_finish_log(&self, nodes: &[NodeSummary], stats: &Stats) -> Result<()> {
        let mut out = BufWriter::new(File::create(self.finish_log())?);
        writeln!(out, "{:<20} {:<5} {:<18} {:>8} {:>8} {:>8}", "node", "type", "state", "traces", "tests", "errors")?;
        let (mut traces, mut tests, mut errors) = (0, 0, 0);
        for n in nodes {
            writeln!(
                out,
                "{:<20} {:<5} {:<18} {:>8} {:>8} {:>8}",
                n.id,
                n.node_type.to_string(),
                n.state,
                n.traces,
                n.tests,
                n.errors
            )?;
            traces += n.traces;
            tests += n.tests;
            errors += n.errors;
        }
        writeln!(out, "{:<20} {:<5} {:<18} {:>8} {:>8} {:>8}", "total", "", "", traces, tests, errors)?;
        writeln!(out)?;
        writeln!(out, "elapsed: {} s", stats.elapsed_secs)?;
        writeln!(out, "test cases: {} left of {}", stats.tc_left, stats.tc_total)?;
        writeln!(out, "traces: {} left of {}", stats.trace_left, stats.trace_total)?;
        out.flush()?;
        Ok(())
    }

    pub fn write_tc_tree(&self, pool: &TestPool) -> Result<()> {
        let mut out = BufWriter::new(File::create(self.tc_tree_log())?);
        pool.write_tc_tree(&mut out)?;
        out.flush()?;
        Ok(())
    }

    pub fn write_graph(&self, graph: &TraceGraph, only_branches: bool) -> Result<()> {
        let mut out = BufWriter::new(File::create(self.graph_file())?);
        graph.write_dot(&mut out, only_branches)?;
        out.flush()?;
        Ok(())
    }
}

fn append(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(text.as_bytes())?;
    Ok(())
}
