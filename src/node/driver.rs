//! Worker side of the protocol.
//!
//! A [`NodeDriver`] registers with the dispatcher's master port and answers
//! its requests from a shared [`Node`]. Work arriving from the dispatcher
//! (test cases for VM nodes, traces for SVM nodes) is forwarded to the
//! worker through an [`Inbound`] channel; results flow back by pushing into
//! the node's queues.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Node, NodeError, NodeStatus, NodeType};
use crate::config::DispatchOptions;
use crate::core::AtomicGuard;
use crate::error::{DispatchError, DispatchResult};
use crate::guest::{GuestData, ImageInfo};
use crate::pool::{AddressRange, ElfEntry};
use crate::protocol::{
    BANDWIDTH_IN_BYTES, Connection, PacketInfo, PacketType, receive_announced_directory,
    send_directory,
};
use crate::test_case::TestCase;

#[derive(Debug, Clone)]
pub struct NodeDriverConfig {
    pub master_host: String,
    pub master_port: u16,
    pub node_type: NodeType,
    /// Incoming traces are restored below `<work_dir>/trace`.
    pub work_dir: PathBuf,
    /// Reported on `RequestGuestData`.
    pub guest_data: Option<GuestData>,
    pub image_info: ImageInfo,
    /// Symbol map of the guest executable, reported on `ElfEntries`.
    pub elf_entries: BTreeMap<AddressRange, ElfEntry>,
    /// Where a pushed VM image is written.
    pub image_path: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl NodeDriverConfig {
    pub fn new(master_host: impl Into<String>, master_port: u16, node_type: NodeType) -> Self {
        Self {
            master_host: master_host.into(),
            master_port,
            node_type,
            work_dir: PathBuf::from("."),
            guest_data: None,
            image_info: ImageInfo::default(),
            elf_entries: BTreeMap::new(),
            image_path: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Work and control signals delivered to the worker.
#[derive(Debug)]
pub enum Inbound {
    Config(Box<DispatchOptions>),
    Commence,
    Reset,
    TestCases(Vec<TestCase>),
    Trace(PathBuf),
    Image(PathBuf),
}

pub struct NodeDriver {
    config: NodeDriverConfig,
    node: AtomicGuard<Node>,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl NodeDriver {
    pub fn new(config: NodeDriverConfig, node: AtomicGuard<Node>) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (inbox, receiver) = mpsc::unbounded_channel();
        (
            Self {
                config,
                node,
                inbox,
            },
            receiver,
        )
    }

    pub fn node(&self) -> &AtomicGuard<Node> {
        &self.node
    }

    /// Ask the master port for a node port and connect to it.
    pub async fn connect(&self) -> DispatchResult<Connection> {
        let host = &self.config.master_host;
        let timeout = self.config.connect_timeout;

        let mut master = Connection::connect_timeout(host, self.config.master_port, timeout).await?;
        master
            .write_header(0, self.config.node_type.request_packet())
            .await?;
        let info = master.read().await?;
        if info.kind()? == PacketType::Shutdown {
            return Err(DispatchError::Transport("dispatcher is no longer accepting nodes".into()));
        }
        info.expect(PacketType::Port)?;

        let port = u16::try_from(info.id)
            .map_err(|_| DispatchError::protocol(format!("invalid node port {}", info.id)))?;
        debug!("Assigned node port {}", port);
        Connection::connect_timeout(host, port, timeout).await
    }

    /// Register and serve until the dispatcher says `Shutdown`.
    pub async fn run(self) -> DispatchResult<()> {
        let mut conn = self.connect().await?;
        let id = self.node.with(|n| n.id()).await;
        info!("{} node {} connected to {}", self.config.node_type, id, conn.peer());
        self.serve(&mut conn).await
    }

    pub async fn serve(&self, conn: &mut Connection) -> DispatchResult<()> {
        loop {
            let (info, payload) = conn.read_with_payload().await?;
            if !self.process(conn, info, payload).await? {
                info!("Shutdown received");
                return Ok(());
            }
        }
    }

    fn forward(&self, msg: Inbound) {
        if self.inbox.send(msg).is_err() {
            warn!("Worker inbox is closed; dropping inbound message");
        }
    }

    /// Handle one request. Returns false on shutdown.
    async fn process(&self, conn: &mut Connection, info: PacketInfo, payload: Vec<u8>) -> DispatchResult<bool> {
        match info.kind()? {
            PacketType::StatusRequest => {
                let status: NodeStatus = self.node.with(|n| n.status()).await;
                conn.write_serialized(status.id, PacketType::Status, &status).await?;
            }
            PacketType::Config => {
                let options: DispatchOptions = bincode::deserialize(&payload)?;
                self.node.with(|n| n.update(options.clone())).await;
                self.forward(Inbound::Config(Box::new(options)));
            }
            PacketType::Commence => {
                self.node.with(|n| n.commence()).await;
                self.forward(Inbound::Commence);
            }
            PacketType::Reset => {
                self.node.with(|n| n.reset()).await;
                self.forward(Inbound::Reset);
            }
            PacketType::TraceRequest => {
                let trace = self
                    .node
                    .with(|n| (!n.traces().is_empty()).then(|| n.pop_trace()))
                    .await;
                send_directory(conn, info.id, PacketType::Trace, trace.as_deref()).await?;
            }
            PacketType::TestCaseRequest => {
                let tests = self.node.with(take_within_bandwidth).await;
                conn.write_serialized(info.id, PacketType::TestCase, &tests).await?;
            }
            PacketType::ErrorLogRequest => {
                let errors: Vec<NodeError> = self
                    .node
                    .with(|n| std::iter::from_fn(|| (!n.errors().is_empty()).then(|| n.pop_error())).collect())
                    .await;
                conn.write_serialized(info.id, PacketType::ErrorLog, &errors).await?;
            }
            PacketType::RequestGuestData => {
                let guest = self.config.guest_data.clone().unwrap_or_default();
                conn.write_serialized(info.id, PacketType::TxGuestData, &guest).await?;
            }
            PacketType::ImageInfoRequest => {
                conn.write_serialized(info.id, PacketType::ImageInfo, &self.config.image_info)
                    .await?;
            }
            PacketType::ElfEntries => {
                conn.write_serialized(info.id, PacketType::ElfEntries, &self.config.elf_entries)
                    .await?;
            }
            PacketType::TestCase => {
                let tests: Vec<TestCase> = bincode::deserialize(&payload)?;
                self.node.with(|n| n.set_active(true)).await;
                self.forward(Inbound::TestCases(tests));
            }
            PacketType::Trace => {
                let name: Option<String> = bincode::deserialize(&payload)?;
                if name.is_some() {
                    let dest_dir = self.config.work_dir.join("trace");
                    tokio::fs::create_dir_all(&dest_dir).await?;
                    let dest = receive_announced_directory(conn, &dest_dir).await?;
                    self.node.with(|n| n.set_active(true)).await;
                    self.forward(Inbound::Trace(dest));
                }
            }
            PacketType::Image => {
                let path = self
                    .config
                    .image_path
                    .clone()
                    .ok_or_else(|| DispatchError::protocol("image pushed to a node without an image path"))?;
                conn.read_file(&path).await?;
                self.forward(Inbound::Image(path));
            }
            PacketType::Shutdown => return Ok(false),
            other => {
                return Err(DispatchError::protocol(format!(
                    "unexpected request {:?} on node connection",
                    other
                )));
            }
        }
        Ok(true)
    }
}

/// Pop pending test cases while they fit the bandwidth budget. At least one
/// is taken when any is pending.
fn take_within_bandwidth(node: &mut Node) -> Vec<TestCase> {
    let mut tests = Vec::new();
    let mut bytes = 0u64;
    while let Some(next) = node.tests().front() {
        let size = next.byte_size();
        if !tests.is_empty() && bytes + size > BANDWIDTH_IN_BYTES {
            break;
        }
        bytes += size;
        tests.push(node.pop_test());
    }
    tests
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_case::TestCaseElement;

    #[test]
    fn test_take_within_bandwidth_takes_all_small() {
        let mut node = Node::new(NodeType::Svm);
        for i in 0..3 {
            node.push_test(TestCase::new(vec![TestCaseElement::new("a", vec![i])]));
        }
        let tests = take_within_bandwidth(&mut node);
        assert_eq!(tests.len(), 3);
        assert!(node.tests().is_empty());
        assert_eq!(tests[0].elements()[0].data, vec![0]);
    }

    #[test]
    fn test_take_within_bandwidth_on_empty_node() {
        let mut node = Node::new(NodeType::Svm);
        assert!(take_within_bandwidth(&mut node).is_empty());
    }
}
