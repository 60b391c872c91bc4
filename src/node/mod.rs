//! Per-worker state shared by the dispatcher and the worker-side driver.

pub mod driver;
pub mod registrar;

pub use driver::{Inbound, NodeDriver, NodeDriverConfig};
pub use registrar::{
    NodeHandle, NodeRegistrar, NodeRegistrarDriver, RegistrarNode, RegistrationCallback, disconnect,
    poll,
};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::DispatchOptions;
use crate::protocol::PacketType;
use crate::test_case::TestCase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Vm,
    Svm,
}

impl NodeType {
    /// Registration request a worker of this type opens with.
    pub fn request_packet(self) -> PacketType {
        match self {
            NodeType::Vm => PacketType::RequestVmNode,
            NodeType::Svm => PacketType::RequestSvmNode,
        }
    }

    /// Name of the per-class log directory.
    pub fn log_dir_name(self) -> &'static str {
        match self {
            NodeType::Vm => "vm",
            NodeType::Svm => "svm",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Vm => write!(f, "VM"),
            NodeType::Svm => write!(f, "SVM"),
        }
    }
}

/// The only state a node reports on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: u64,
    pub test_case_count: u32,
    pub trace_count: u32,
    pub error_count: u32,
    pub active: bool,
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self {
            id: 0,
            test_case_count: 0,
            trace_count: 0,
            error_count: 0,
            active: true,
        }
    }
}

impl NodeStatus {
    /// Nothing waiting to be harvested.
    pub fn is_drained(&self) -> bool {
        self.test_case_count == 0 && self.trace_count == 0 && self.error_count == 0
    }
}

/// A worker-reported error entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub log: String,
}

static ID_BASE: OnceLock<u64> = OnceLock::new();
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique node id: the process start time in microseconds plus a
/// monotonic counter, so ids never collide within one process.
pub fn generate_identifier() -> u64 {
    let base = *ID_BASE.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    });
    base.wrapping_add(ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Pending outbound work of one worker.
///
/// Each queue is FIFO. Popping an empty queue is a caller bug and panics;
/// check [`Node::traces`], [`Node::tests`] or [`Node::errors`] first.
#[derive(Debug, Clone)]
pub struct Node {
    id: u64,
    node_type: NodeType,
    traces: VecDeque<PathBuf>,
    tests: VecDeque<TestCase>,
    errors: VecDeque<NodeError>,
    commenced: bool,
    active: bool,
    options: DispatchOptions,
}

impl Node {
    pub fn new(node_type: NodeType) -> Self {
        Self {
            id: generate_identifier(),
            node_type,
            traces: VecDeque::new(),
            tests: VecDeque::new(),
            errors: VecDeque::new(),
            commenced: false,
            active: true,
            options: DispatchOptions::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn push_trace(&mut self, trace: PathBuf) {
        self.traces.push_back(trace);
    }

    pub fn pop_trace(&mut self) -> PathBuf {
        match self.traces.pop_front() {
            Some(t) => t,
            None => panic!("node {} has no pending traces", self.id),
        }
    }

    pub fn push_test(&mut self, tc: TestCase) {
        self.tests.push_back(tc);
    }

    pub fn pop_test(&mut self) -> TestCase {
        match self.tests.pop_front() {
            Some(t) => t,
            None => panic!("node {} has no pending test cases", self.id),
        }
    }

    pub fn push_error(&mut self, error: NodeError) {
        self.errors.push_back(error);
    }

    pub fn pop_error(&mut self) -> NodeError {
        match self.errors.pop_front() {
            Some(e) => e,
            None => panic!("node {} has no pending errors", self.id),
        }
    }

    pub fn traces(&self) -> &VecDeque<PathBuf> {
        &self.traces
    }

    pub fn tests(&self) -> &VecDeque<TestCase> {
        &self.tests
    }

    pub fn errors(&self) -> &VecDeque<NodeError> {
        &self.errors
    }

    pub fn commence(&mut self) {
        self.commenced = true;
    }

    pub fn is_commenced(&self) -> bool {
        self.commenced
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    pub fn update(&mut self, options: DispatchOptions) {
        self.options = options;
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            test_case_count: self.tests.len() as u32,
            trace_count: self.traces.len() as u32,
            error_count: self.errors.len() as u32,
            active: self.active,
        }
    }

    /// Forget pending work; identity and type survive.
    pub fn reset(&mut self) {
        self.traces.clear();
        self.tests.clear();
        self.errors.clear();
        self.commenced = false;
        self.active = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::TestCaseElement;

    #[test]
    fn test_queues_are_fifo() {
        let mut node = Node::new(NodeType::Vm);
        node.push_trace(PathBuf::from("t1"));
        node.push_trace(PathBuf::from("t2"));
        node.push_test(TestCase::new(vec![TestCaseElement::new("a", "1")]));
        node.push_test(TestCase::new(vec![TestCaseElement::new("a", "2")]));
        node.push_error(NodeError { log: "e1".into() });
        node.push_error(NodeError { log: "e2".into() });

        assert_eq!(node.pop_trace(), PathBuf::from("t1"));
        assert_eq!(node.pop_trace(), PathBuf::from("t2"));
        assert_eq!(node.pop_test().elements()[0].data, b"1");
        assert_eq!(node.pop_error().log, "e1");
        assert_eq!(node.pop_error().log, "e2");
    }

    #[test]
    #[should_panic(expected = "no pending traces")]
    fn test_pop_empty_fails_fast() {
        Node::new(NodeType::Svm).pop_trace();
    }

    #[test]
    fn test_status_reflects_queues() {
        let mut node = Node::new(NodeType::Svm);
        node.push_test(TestCase::default());
        node.push_error(NodeError { log: "x".into() });
        node.set_active(false);
        let status = node.status();
        assert_eq!(status.id, node.id());
        assert_eq!(status.test_case_count, 1);
        assert_eq!(status.trace_count, 0);
        assert_eq!(status.error_count, 1);
        assert!(!status.active);
        assert!(!status.is_drained());
    }

    #[test]
    fn test_reset_preserves_identity() {
        let mut node = Node::new(NodeType::Svm);
        let id = node.id();
        node.push_trace(PathBuf::from("t"));
        node.commence();
        node.set_active(false);
        node.reset();
        assert_eq!(node.id(), id);
        assert_eq!(node.node_type(), NodeType::Svm);
        assert!(node.traces().is_empty());
        assert!(!node.is_commenced());
        assert!(node.is_active());
    }

    #[test]
    fn test_identifiers_are_unique() {
        let ids: std::collections::HashSet<u64> = (0..1000).map(|_| generate_identifier()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
