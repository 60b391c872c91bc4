// Wire protocol shared by the dispatcher and its nodes

pub mod archive;
pub mod connection;
pub mod packet;
pub mod transfer;

pub use archive::{archive_directory, directory_size, restore_directory};
pub use connection::{Connection, Server};
pub use packet::{
    BANDWIDTH_IN_BYTES, DEFAULT_CHUNK_SIZE, IMAGE_MAX_FILE_SIZE, PacketInfo, PacketType,
};
pub use transfer::{receive_announced_directory, receive_directory, send_directory};
