// Core modules
pub mod config;
pub mod core;
pub mod error;

// Data carried between the dispatcher and its nodes
pub mod guest;
pub mod test_case;
pub mod trace;

// Coordination
pub mod dispatch;
pub mod node;
pub mod pool;
pub mod protocol;

// Re-export key types
pub use config::DispatchOptions;
pub use crate::core::{AsyncTask, AtomicGuard};
pub use error::{DispatchError, DispatchResult};
pub use guest::{GuestData, ImageInfo};
pub use test_case::{TestCase, TestCaseElement, TestCaseHash, TestCasePatch};
pub use trace::{SelectionStrategy, Selector, Trace, TraceGraph};

pub use dispatch::{Dispatch, DispatchContext, DispatchRoot, DispatchState};
pub use node::{
    Node, NodeDriver, NodeDriverConfig, NodeError, NodeHandle, NodeRegistrar, NodeRegistrarDriver,
    NodeStatus, NodeType, RegistrarNode,
};
pub use pool::{TestPool, TestSchedStrat, TracePool};
pub use protocol::{Connection, PacketInfo, PacketType, Server};
