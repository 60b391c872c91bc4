// Request/response exchanges shared by the VM and SVM node machines

use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use super::DispatchContext;
use crate::config::DispatchOptions;
use crate::error::{DispatchError, DispatchResult};
use crate::guest::ImageInfo;
use crate::node::{NodeError, NodeHandle};
use crate::protocol::{Connection, PacketType};
use crate::test_case::TestCase;

/// Send the run options to a node.
pub async fn send_config(conn: &mut Connection, id: u64, options: &DispatchOptions) -> DispatchResult<()> {
    conn.write_serialized(id, PacketType::Config, options).await
}

/// Describe the local image the way nodes report theirs.
pub fn local_image_info(path: &Path) -> DispatchResult<ImageInfo> {
    let meta = std::fs::metadata(path)?;
    let last_write_time = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(ImageInfo {
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        last_write_time,
    })
}

/// Bring a node's VM image up to date. Returns whether the image was sent.
pub async fn sync_image(conn: &mut Connection, id: u64, image: &Path) -> DispatchResult<bool> {
    let local = local_image_info(image)?;
    conn.write_header(id, PacketType::ImageInfoRequest).await?;
    let (_, remote): (_, ImageInfo) = conn.read_serialized(PacketType::ImageInfo).await?;
    if remote == local {
        debug!("Image on node {} is current", id);
        return Ok(false);
    }

    info!("Sending image {} to node {}", image.display(), id);
    conn.write_header(id, PacketType::Image).await?;
    conn.write_file(image).await?;
    Ok(true)
}

/// Pull every pending error entry off a node and log it. Returns how many
/// were harvested.
pub async fn harvest_errors(ctx: &DispatchContext, handle: &NodeHandle) -> DispatchResult<usize> {
    let errors: Vec<NodeError> = {
        let mut node = handle.node.acquire().await;
        let conn = node.connection();
        conn.write_header(handle.id, PacketType::ErrorLogRequest).await?;
        conn.read_serialized(PacketType::ErrorLog).await?.1
    };

    for error in &errors {
        warn!("{} node {}: {}", handle.node_type, handle.id, DispatchError::Worker(error.log.clone()));
    }
    if let Err(e) = ctx.root.append_node_errors(handle.id, handle.node_type, &errors) {
        warn!("Failed to record errors of node {}: {:#}", handle.id, e);
    }
    Ok(errors.len())
}

/// Pull pending test cases off a node until `expected` arrived or the node
/// has nothing left.
pub async fn request_tests(handle: &NodeHandle, expected: usize) -> DispatchResult<Vec<TestCase>> {
    let mut node = handle.node.acquire().await;
    let conn = node.connection();

    let mut tests = Vec::new();
    while tests.len() < expected {
        conn.write_header(handle.id, PacketType::TestCaseRequest).await?;
        let (_, batch): (_, Vec<TestCase>) = conn.read_serialized(PacketType::TestCase).await?;
        if batch.is_empty() {
            break;
        }
        tests.extend(batch);
    }
    debug!("Harvested {} test cases from node {}", tests.len(), handle.id);
    Ok(tests)
}

/// Record a node as no longer serving.
pub async fn mark_inactive(handle: &NodeHandle) {
    handle
        .node
        .with(|n| {
            let mut status = n.status();
            status.active = false;
            n.set_status(status);
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_image_info() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("guest.img");
        std::fs::write(&image, b"qcow").unwrap();

        let info = local_image_info(&image).unwrap();
        assert_eq!(info.file_name, "guest.img");
        assert!(info.last_write_time > 0);
        assert!(local_image_info(&tmp.path().join("missing.img")).is_err());
    }
}
