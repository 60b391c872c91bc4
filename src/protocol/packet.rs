use crate::error::{DispatchError, DispatchResult};

/// Size of a single `chunk` packet when streaming files.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Upper bound for a test-case batch sent in one response.
pub const BANDWIDTH_IN_BYTES: u64 = 125_000_000;

/// Largest file (and largest single payload) accepted on the wire.
pub const IMAGE_MAX_FILE_SIZE: u64 = 8_000_000_000;

/// Encoded header: id (u64) + type (u32) + payload length (u64).
pub const HEADER_LEN: usize = 8 + 4 + 8;

/// Message types. The numeric values are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    Properties = 0,
    UpdateQuery = 1,
    ElfEntries = 2,
    GuestConfiguration = 3,
    ProcMaps = 4,
    RequestVmNode = 5,
    RequestSvmNode = 6,
    Port = 7,
    StatusRequest = 8,
    Status = 9,
    Shutdown = 10,
    Trace = 11,
    PortRequest = 12,
    NextTest = 13,
    TestCase = 14,
    TraceRequest = 15,
    TestCaseRequest = 16,
    TraceRequestAck = 17,
    Config = 18,
    ImageInfoRequest = 19,
    ImageInfo = 20,
    Image = 21,
    Commence = 22,
    Reset = 23,
    NextTarget = 24,
    ErrorLogRequest = 25,
    ErrorLog = 26,
    Chunk = 27,
    FileStream = 28,
    RequestGuestData = 29,
    TxGuestData = 30,
    RequestGuestDataPostExec = 31,
    TxGuestDataPostExec = 32,
}

impl PacketType {
    const ALL: [PacketType; 33] = [
        Self::Properties,
        Self::UpdateQuery,
        Self::ElfEntries,
        Self::GuestConfiguration,
        Self::ProcMaps,
        Self::RequestVmNode,
        Self::RequestSvmNode,
        Self::Port,
        Self::StatusRequest,
        Self::Status,
        Self::Shutdown,
        Self::Trace,
        Self::PortRequest,
        Self::NextTest,
        Self::TestCase,
        Self::TraceRequest,
        Self::TestCaseRequest,
        Self::TraceRequestAck,
        Self::Config,
        Self::ImageInfoRequest,
        Self::ImageInfo,
        Self::Image,
        Self::Commence,
        Self::Reset,
        Self::NextTarget,
        Self::ErrorLogRequest,
        Self::ErrorLog,
        Self::Chunk,
        Self::FileStream,
        Self::RequestGuestData,
        Self::TxGuestData,
        Self::RequestGuestDataPostExec,
        Self::TxGuestDataPostExec,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for PacketType {
    type Error = DispatchError;

    fn try_from(value: u32) -> DispatchResult<Self> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| DispatchError::protocol(format!("unknown packet type {}", value)))
    }
}

/// Header of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub id: u64,
    /// Raw type value; unknown values survive decoding so they can be reported.
    pub packet_type: u32,
    /// Length of the payload following the header.
    pub size: u64,
}

impl PacketInfo {
    pub fn new(id: u64, packet_type: PacketType) -> Self {
        Self {
            id,
            packet_type: packet_type.as_u32(),
            size: 0,
        }
    }

    pub fn kind(&self) -> DispatchResult<PacketType> {
        PacketType::try_from(self.packet_type)
    }

    /// Fails with a protocol violation unless the header has type `expected`.
    pub fn expect(&self, expected: PacketType) -> DispatchResult<()> {
        match self.kind() {
            Ok(kind) if kind == expected => Ok(()),
            Ok(kind) => Err(DispatchError::protocol(format!(
                "expected {:?}, received {:?}",
                expected, kind
            ))),
            Err(e) => Err(e),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.packet_type.to_le_bytes());
        buf[12..20].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Self {
        let mut id = [0u8; 8];
        let mut ty = [0u8; 4];
        let mut size = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        ty.copy_from_slice(&buf[8..12]);
        size.copy_from_slice(&buf[12..20]);
        Self {
            id: u64::from_le_bytes(id),
            packet_type: u32::from_le_bytes(ty),
            size: u64::from_le_bytes(size),
        }
    }
}
