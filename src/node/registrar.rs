//! Node registration on the master port.
//!
//! A worker opens the master port with `RequestVmNode`/`RequestSvmNode`, is
//! told a fresh port, reconnects there and reports its [`NodeStatus`]. That
//! second connection carries all further traffic with the node.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::{NodeStatus, NodeType};
use crate::core::AtomicGuard;
use crate::error::{DispatchError, DispatchResult};
use crate::protocol::{Connection, PacketType, Server};

/// Dispatcher-side view of one registered worker.
pub struct RegistrarNode {
    connection: Connection,
    status: NodeStatus,
    node_type: NodeType,
    port: u16,
}

impl RegistrarNode {
    pub fn new(connection: Connection, status: NodeStatus, node_type: NodeType, port: u16) -> Self {
        Self {
            connection,
            status,
            node_type,
            port,
        }
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.connection
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Ask the node for a fresh status snapshot and remember it.
    pub async fn poll(&mut self) -> DispatchResult<NodeStatus> {
        self.connection
            .write_header(self.status.id, PacketType::StatusRequest)
            .await?;
        let (_, status): (_, NodeStatus) = self.connection.read_serialized(PacketType::Status).await?;
        self.status = status;
        Ok(status)
    }
}

/// A published node: its immutable identity plus the guarded state.
#[derive(Clone)]
pub struct NodeHandle {
    pub id: u64,
    pub node_type: NodeType,
    pub node: AtomicGuard<RegistrarNode>,
}

/// Invoked for every node after it is fully built and before it becomes
/// visible in the registrar.
pub type RegistrationCallback = Box<dyn Fn(&NodeHandle) + Send + Sync>;

/// Open flag plus the live node set.
pub struct NodeRegistrar {
    open: bool,
    nodes: Vec<NodeHandle>,
}

impl Default for NodeRegistrar {
    fn default() -> Self {
        Self {
            open: true,
            nodes: Vec::new(),
        }
    }
}

impl NodeRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn push(&mut self, node: NodeHandle) {
        self.nodes.push(node);
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn count(&self, node_type: NodeType) -> usize {
        self.nodes.iter().filter(|n| n.node_type == node_type).count()
    }

    pub fn remove(&mut self, id: u64) -> Option<NodeHandle> {
        let pos = self.nodes.iter().position(|n| n.id == id)?;
        Some(self.nodes.remove(pos))
    }

    /// Empty the registry, handing the nodes to the caller.
    pub fn take_all(&mut self) -> Vec<NodeHandle> {
        std::mem::take(&mut self.nodes)
    }
}

/// Refresh one node's status.
pub async fn poll(node: &NodeHandle) -> DispatchResult<NodeStatus> {
    let mut guard = node.node.acquire().await;
    guard.poll().await
}

/// Close the registrar, empty it and send `Shutdown` to every node that was
/// in it. Returns how many nodes were told.
pub async fn disconnect(registrar: &AtomicGuard<NodeRegistrar>) -> usize {
    let nodes = registrar
        .with(|r| {
            r.close();
            r.take_all()
        })
        .await;

    let mut told = 0;
    for handle in &nodes {
        let mut node = handle.node.acquire().await;
        match node.connection().write_header(handle.id, PacketType::Shutdown).await {
            Ok(()) => told += 1,
            Err(e) => warn!("Failed to send shutdown to node {}: {}", handle.id, e),
        }
    }
    info!("Disconnected {} of {} nodes", told, nodes.len());
    told
}

enum Flow {
    Continue,
    Shutdown,
}

/// Accept loop on the master port.
pub struct NodeRegistrarDriver {
    server: Server,
    registrar: AtomicGuard<NodeRegistrar>,
    callbacks: Vec<RegistrationCallback>,
    connect_timeout: Duration,
}

impl NodeRegistrarDriver {
    pub async fn bind(
        port: Option<u16>,
        registrar: AtomicGuard<NodeRegistrar>,
        connect_timeout: Duration,
    ) -> DispatchResult<Self> {
        Ok(Self {
            server: Server::bind(port).await?,
            registrar,
            callbacks: Vec::new(),
            connect_timeout,
        })
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    pub fn add_callback(&mut self, callback: RegistrationCallback) {
        self.callbacks.push(callback);
    }

    /// Serve registrations until a `Shutdown` request arrives.
    ///
    /// Node-level failures (a worker that never reconnects, a broken
    /// connection) are logged and skipped. An unknown request type on the
    /// master port ends the run with a protocol violation.
    pub async fn run(self) -> DispatchResult<()> {
        info!("Registrar listening on port {}", self.port());
        loop {
            let conn = self.server.accept().await?;
            match self.handle(conn).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => return Ok(()),
                Err(e @ DispatchError::ProtocolViolation(_)) => return Err(e),
                Err(e) => warn!("Registration failed: {}", e),
            }
        }
    }

    async fn handle(&self, mut conn: Connection) -> DispatchResult<Flow> {
        let info = match tokio::time::timeout(self.connect_timeout, conn.read()).await {
            Ok(info) => info?,
            Err(_) => {
                return Err(DispatchError::ConnectTimeout {
                    addr: conn.peer().to_string(),
                    millis: self.connect_timeout.as_millis() as u64,
                });
            }
        };

        let node_type = match info.kind() {
            Ok(PacketType::RequestVmNode) => NodeType::Vm,
            Ok(PacketType::RequestSvmNode) => NodeType::Svm,
            Ok(PacketType::Shutdown) => {
                info!("Shutdown requested by {}", conn.peer());
                disconnect(&self.registrar).await;
                return Ok(Flow::Shutdown);
            }
            _ => {
                return Err(DispatchError::protocol(format!(
                    "unknown request from node: type {}",
                    info.packet_type
                )));
            }
        };

        // Failures past the first message only concern this node.
        if let Err(e) = self.register(conn, node_type).await {
            warn!("Failed to register {} node: {}", node_type, e);
        }
        Ok(Flow::Continue)
    }

    async fn register(&self, mut conn: Connection, node_type: NodeType) -> DispatchResult<()> {
        if !self.registrar.with(|r| r.is_open()).await {
            debug!("Registrar closed; turning away {} node {}", node_type, conn.peer());
            conn.write_header(0, PacketType::Shutdown).await?;
            return Ok(());
        }

        let server = Server::bind(None).await?;
        let port = server.port();
        conn.write_header(port as u64, PacketType::Port).await?;

        let mut node_conn = server.accept_timeout(self.connect_timeout).await?;
        node_conn.write_header(0, PacketType::StatusRequest).await?;
        let (_, status): (_, NodeStatus) = node_conn.read_serialized(PacketType::Status).await?;

        let handle = NodeHandle {
            id: status.id,
            node_type,
            node: AtomicGuard::new(RegistrarNode::new(node_conn, status, node_type, port)),
        };
        for callback in &self.callbacks {
            callback(&handle);
        }
        self.registrar.with(|r| r.push(handle)).await;

        info!("Registered {} node {} on port {}", node_type, status.id, port);
        Ok(())
    }

    /// Ask a running registrar at `host:port` to shut down.
    pub async fn request_shutdown(host: &str, port: u16, timeout: Duration) -> DispatchResult<()> {
        let mut conn = Connection::connect_timeout(host, port, timeout).await?;
        conn.write_header(0, PacketType::Shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registrar_bookkeeping() {
        let registrar = NodeRegistrar::new();
        assert!(registrar.is_open());
        assert!(registrar.is_empty());
        assert_eq!(registrar.count(NodeType::Vm), 0);
    }

    #[tokio::test]
    async fn test_unknown_request_fails_driver() {
        let registrar = AtomicGuard::new(NodeRegistrar::new());
        let driver = NodeRegistrarDriver::bind(None, registrar, Duration::from_secs(2))
            .await
            .unwrap();
        let port = driver.port();
        let run = tokio::spawn(driver.run());

        let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
        conn.write_header(0, PacketType::TestCase).await.unwrap();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(DispatchError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_node_that_never_reconnects_is_skipped() {
        let registrar = AtomicGuard::new(NodeRegistrar::new());
        let driver = NodeRegistrarDriver::bind(None, registrar.clone(), Duration::from_millis(50))
            .await
            .unwrap();
        let port = driver.port();
        let run = tokio::spawn(driver.run());

        let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
        conn.write_header(0, PacketType::RequestVmNode).await.unwrap();
        let assigned = conn.expect(PacketType::Port).await.unwrap().0;
        assert_ne!(assigned.id, 0);

        // Never connect to the assigned port; the driver must keep serving.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registrar.with(|r| r.is_empty()).await);

        NodeRegistrarDriver::request_shutdown("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(run.await.unwrap().is_ok());
        assert!(!registrar.with(|r| r.is_open()).await);
    }
}
