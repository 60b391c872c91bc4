// Directory transfer: announce, archive, stream, restore

use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::archive::{archive_directory, restore_directory};
use super::connection::Connection;
use super::packet::{IMAGE_MAX_FILE_SIZE, PacketType};
use crate::error::{DispatchError, DispatchResult};

async fn blocking<F>(f: F) -> DispatchResult<()>
where
    F: FnOnce() -> DispatchResult<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DispatchError::Internal(format!("blocking task failed: {}", e)))?
}

/// Send `dir` (or the absence of one) as a `packet_type` message.
///
/// The header payload is the directory name, or `None` when there is nothing
/// to send. A present directory is archived in place, streamed, and the
/// archive deleted: the directory is consumed.
pub async fn send_directory(
    conn: &mut Connection,
    id: u64,
    packet_type: PacketType,
    dir: Option<&Path>,
) -> DispatchResult<()> {
    let Some(dir) = dir else {
        return conn.write_serialized(id, packet_type, &None::<String>).await;
    };

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| DispatchError::content(format!("{} has no name", dir.display())))?;

    let owned = dir.to_path_buf();
    blocking(move || archive_directory(&owned, IMAGE_MAX_FILE_SIZE)).await?;

    conn.write_serialized(id, packet_type, &Some(name)).await?;
    conn.write_file(dir).await?;
    tokio::fs::remove_file(dir).await?;
    debug!("Sent {} to {}", dir.display(), conn.peer());
    Ok(())
}

/// Receive a directory sent with [`send_directory`] into a fresh,
/// uniquely named directory below `dest_dir`.
pub async fn receive_directory(
    conn: &mut Connection,
    packet_type: PacketType,
    dest_dir: &Path,
) -> DispatchResult<Option<PathBuf>> {
    let (_, name): (_, Option<String>) = conn.read_serialized(packet_type).await?;
    let Some(name) = name else {
        return Ok(None);
    };
    let dest = receive_announced_directory(conn, dest_dir).await?;
    debug!("Received {} from {} as {}", name, conn.peer(), dest.display());
    Ok(Some(dest))
}

/// The streamed part of [`receive_directory`], for callers that already
/// consumed a header announcing a directory.
pub async fn receive_announced_directory(conn: &mut Connection, dest_dir: &Path) -> DispatchResult<PathBuf> {
    let dest = dest_dir.join(Uuid::new_v4().to_string());
    conn.read_file(&dest).await?;

    let owned = dest.clone();
    blocking(move || restore_directory(&owned)).await?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Server;

    #[tokio::test]
    async fn test_directory_roundtrip_consumes_source() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("trace-7");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("tb-seq.bin"), 42u64.to_le_bytes()).unwrap();
        let inbox = root.path().join("inbox");
        std::fs::create_dir_all(&inbox).unwrap();

        let server = Server::bind(None).await.unwrap();
        let port = server.port();
        let sender = tokio::spawn(async move {
            let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
            send_directory(&mut conn, 1, PacketType::Trace, Some(src.as_path())).await.unwrap();
            src
        });
        let mut conn = server.accept().await.unwrap();
        let received = receive_directory(&mut conn, PacketType::Trace, &inbox)
            .await
            .unwrap()
            .unwrap();

        let src = sender.await.unwrap();
        assert!(!src.exists());
        assert!(received.starts_with(&inbox));
        assert_eq!(
            std::fs::read(received.join("tb-seq.bin")).unwrap(),
            42u64.to_le_bytes()
        );
    }

    #[tokio::test]
    async fn test_nothing_to_send() {
        let root = tempfile::tempdir().unwrap();
        let server = Server::bind(None).await.unwrap();
        let port = server.port();
        let sender = tokio::spawn(async move {
            let mut conn = Connection::connect("127.0.0.1", port).await.unwrap();
            send_directory(&mut conn, 1, PacketType::Trace, None).await.unwrap();
        });
        let mut conn = server.accept().await.unwrap();
        let received = receive_directory(&mut conn, PacketType::Trace, root.path())
            .await
            .unwrap();
        sender.await.unwrap();
        assert!(received.is_none());
    }
}
