// Framed request/response messaging over TCP

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use super::packet::{DEFAULT_CHUNK_SIZE, HEADER_LEN, IMAGE_MAX_FILE_SIZE, PacketInfo, PacketType};
use crate::error::{DispatchError, DispatchResult};

/// Listening side of a point-to-point channel.
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind on all interfaces. `None` picks an ephemeral port, see [`Server::port`].
    pub async fn bind(port: Option<u16>) -> DispatchResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port.unwrap_or(0))).await?;
        let port = listener.local_addr()?.port();
        debug!("Listening on port {}", port);
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accept(&self) -> DispatchResult<Connection> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Connection {
            stream,
            peer: peer.to_string(),
        })
    }

    pub async fn accept_timeout(&self, timeout: Duration) -> DispatchResult<Connection> {
        match tokio::time::timeout(timeout, self.accept()).await {
            Ok(conn) => conn,
            Err(_) => Err(DispatchError::ConnectTimeout {
                addr: format!("0.0.0.0:{}", self.port),
                millis: timeout.as_millis() as u64,
            }),
        }
    }
}

/// One end of an established channel. Both roles use the same framing.
pub struct Connection {
    stream: TcpStream,
    peer: String,
}

impl Connection {
    pub async fn connect(host: &str, port: u16) -> DispatchResult<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            peer: format!("{}:{}", host, port),
        })
    }

    /// Connect, failing with [`DispatchError::ConnectTimeout`] once `timeout`
    /// elapses. Refusals are reported as transport failures.
    pub async fn connect_timeout(host: &str, port: u16, timeout: Duration) -> DispatchResult<Self> {
        match tokio::time::timeout(timeout, Self::connect(host, port)).await {
            Ok(conn) => conn,
            Err(_) => Err(DispatchError::ConnectTimeout {
                addr: format!("{}:{}", host, port),
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Header-only control message.
    pub async fn write_header(&mut self, id: u64, packet_type: PacketType) -> DispatchResult<()> {
        self.write(&[], PacketInfo::new(id, packet_type)).await
    }

    /// Header plus body. The size field of `info` is overwritten.
    pub async fn write(&mut self, payload: &[u8], mut info: PacketInfo) -> DispatchResult<()> {
        let size = payload.len() as u64;
        if size > IMAGE_MAX_FILE_SIZE {
            return Err(DispatchError::ResourceExhausted(format!(
                "payload of {} bytes exceeds limit",
                size
            )));
        }
        info.size = size;
        self.stream.write_all(&info.encode()).await?;
        if !payload.is_empty() {
            self.stream.write_all(payload).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn write_serialized<T: Serialize>(
        &mut self,
        id: u64,
        packet_type: PacketType,
        value: &T,
    ) -> DispatchResult<()> {
        let payload = bincode::serialize(value)?;
        self.write(&payload, PacketInfo::new(id, packet_type)).await
    }

    /// Read one message and discard its payload.
    pub async fn read(&mut self) -> DispatchResult<PacketInfo> {
        let (info, _) = self.read_with_payload().await?;
        Ok(info)
    }

    pub async fn read_with_payload(&mut self) -> DispatchResult<(PacketInfo, Vec<u8>)> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                DispatchError::Transport(format!("connection to {} closed", self.peer))
            } else {
                DispatchError::from(e)
            }
        })?;
        let info = PacketInfo::decode(&header);
        if info.size > IMAGE_MAX_FILE_SIZE {
            return Err(DispatchError::ResourceExhausted(format!(
                "incoming payload of {} bytes exceeds limit",
                info.size
            )));
        }

        // Grow with the bytes that actually arrive, not the announced size.
        let mut payload = Vec::new();
        (&mut self.stream).take(info.size).read_to_end(&mut payload).await?;
        if payload.len() as u64 != info.size {
            return Err(DispatchError::Transport(format!(
                "connection to {} closed after {} of {} payload bytes",
                self.peer,
                payload.len(),
                info.size
            )));
        }
        Ok((info, payload))
    }

    /// Read one message, failing unless it has type `expected`.
    pub async fn expect(&mut self, expected: PacketType) -> DispatchResult<(PacketInfo, Vec<u8>)> {
        let (info, payload) = self.read_with_payload().await?;
        info.expect(expected)?;
        Ok((info, payload))
    }

    pub async fn read_serialized<T: DeserializeOwned>(
        &mut self,
        expected: PacketType,
    ) -> DispatchResult<(PacketInfo, T)> {
        let (info, payload) = self.expect(expected).await?;
        let value = bincode::deserialize(&payload)?;
        Ok((info, value))
    }

    /// Stream a file: a `FileStream` header carrying the size, then chunks.
    pub async fn write_file(&mut self, path: &Path) -> DispatchResult<u64> {
        let mut file = File::open(path).await?;
        let size = file.metadata().await?.len();
        if size > IMAGE_MAX_FILE_SIZE {
            return Err(DispatchError::ResourceExhausted(format!(
                "{} is {} bytes, limit is {}",
                path.display(),
                size,
                IMAGE_MAX_FILE_SIZE
            )));
        }

        self.write(&size.to_le_bytes(), PacketInfo::new(0, PacketType::FileStream))
            .await?;

        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
        let mut sent = 0u64;
        while sent < size {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Err(DispatchError::Transport(format!(
                    "{} shrank while streaming",
                    path.display()
                )));
            }
            self.write(&buf[..n], PacketInfo::new(sent, PacketType::Chunk))
                .await?;
            sent += n as u64;
        }
        Ok(sent)
    }

    /// Receive a file sent with [`Connection::write_file`] into `path`.
    pub async fn read_file(&mut self, path: &Path) -> DispatchResult<u64> {
        let (_, payload) = self.expect(PacketType::FileStream).await?;
        let size_bytes: [u8; 8] = payload
            .as_slice()
            .try_into()
            .map_err(|_| DispatchError::content("file stream header must carry a u64 size"))?;
        let size = u64::from_le_bytes(size_bytes);
        if size > IMAGE_MAX_FILE_SIZE {
            return Err(DispatchError::ResourceExhausted(format!(
                "announced file of {} bytes exceeds limit",
                size
            )));
        }

        let mut file = File::create(path).await?;
        let mut received = 0u64;
        while received < size {
            let (_, chunk) = self.expect(PacketType::Chunk).await?;
            if received + chunk.len() as u64 > size {
                return Err(DispatchError::content("chunk overruns announced file size"));
            }
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        values: Vec<u32>,
    }

    async fn pair() -> (Connection, Connection) {
        let server = Server::bind(None).await.unwrap();
        let port = server.port();
        let client = tokio::spawn(async move { Connection::connect("127.0.0.1", port).await });
        let accepted = server.accept().await.unwrap();
        (accepted, client.await.unwrap().unwrap())
    }

    #[tokio::test]
    async fn test_ephemeral_port() {
        let server = Server::bind(None).await.unwrap();
        assert_ne!(server.port(), 0);
    }

    #[tokio::test]
    async fn test_header_and_payload() {
        let (mut a, mut b) = pair().await;
        a.write_header(7, PacketType::Commence).await.unwrap();
        a.write(b"abc", PacketInfo::new(8, PacketType::Trace)).await.unwrap();

        let info = b.read().await.unwrap();
        assert_eq!(info.id, 7);
        assert_eq!(info.kind().unwrap(), PacketType::Commence);

        let (info, payload) = b.read_with_payload().await.unwrap();
        assert_eq!(info.id, 8);
        assert_eq!(payload, b"abc");
    }

    #[tokio::test]
    async fn test_serialized_payload() {
        let (mut a, mut b) = pair().await;
        let sample = Sample {
            name: "x".into(),
            values: vec![1, 2, 3],
        };
        a.write_serialized(3, PacketType::Status, &sample).await.unwrap();
        let (info, back): (_, Sample) = b.read_serialized(PacketType::Status).await.unwrap();
        assert_eq!(info.id, 3);
        assert_eq!(back, sample);
    }

    #[tokio::test]
    async fn test_unexpected_type_is_rejected() {
        let (mut a, mut b) = pair().await;
        a.write_header(0, PacketType::Shutdown).await.unwrap();
        let err = b.expect(PacketType::Status).await.unwrap_err();
        assert!(matches!(err, DispatchError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_closed_peer_is_transport_failure() {
        let (a, mut b) = pair().await;
        drop(a);
        let err = b.read().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_truncated_payload_is_transport_failure() {
        let (mut a, mut b) = pair().await;
        let mut info = PacketInfo::new(1, PacketType::TestCase);
        info.size = 4_000_000_000;
        a.stream.write_all(&info.encode()).await.unwrap();
        a.stream.write_all(b"short").await.unwrap();
        drop(a);

        let err = b.read_with_payload().await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("5 of 4000000000"));
    }

    #[tokio::test]
    async fn test_file_stream_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let (mut a, mut b) = pair().await;
        let sent = a.write_file(&src).await.unwrap();
        let received = b.read_file(&dst).await.unwrap();
        assert_eq!(sent, 3000);
        assert_eq!(received, 3000);
        assert_eq!(std::fs::read(&dst).unwrap(), data);
    }

    #[tokio::test]
    async fn test_connect_timeout_is_distinct() {
        // Non-routable address; the attempt hangs until the timeout fires.
        let result =
            Connection::connect_timeout("10.255.255.1", 9, Duration::from_millis(50)).await;
        match result {
            Err(DispatchError::ConnectTimeout { millis, .. }) => assert_eq!(millis, 50),
            // Some sandboxes reject unroutable addresses immediately.
            Err(DispatchError::Transport(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let server = Server::bind(None).await.unwrap();
        let err = server
            .accept_timeout(Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::ConnectTimeout { .. }));
    }
}
