//! Sensor Wire Protocol
//!
//! Byte values and frame layouts for the two exchanges the host drives over
//! the sensor's stream socket: the dock-status query and the multi-file
//! chunked transfer. These values are fixed by the device firmware.

use std::time::Duration;

/// Sent by the device ahead of a real response; always discarded
pub const FILLER: u8 = 0xFF;

/// Upper bound on consecutive filler bytes before giving up on a frame
pub const MAX_FILLER_RUN: usize = 4096;

/// Time the device needs between a dock query and its answer
pub const DOCK_QUERY_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Frame types sent by the device
pub mod frame {
    pub const DOCK_STATUS: u8 = 0xD6;
    pub const FILE_LIST: u8 = 0xD3;
    pub const TRANSFER_START: u8 = 0xFD;
    pub const CHUNK: u8 = 0xFC;
    pub const TRANSFER_END: u8 = 0xFE;
}

/// Dock status byte values
pub mod dock_status {
    pub const UNDOCKED: u8 = 0x00;
    pub const DOCKED: u8 = 0x01;
}

/// Fixed payload length of every chunk frame, including the last one
pub const CHUNK_PAYLOAD_LEN: usize = 240;

/// framing (1) + sequence (2) + total (2) + payload (240)
pub const CHUNK_FRAME_LEN: usize = 5 + CHUNK_PAYLOAD_LEN;

/// Chunks acknowledged together
pub const CHUNK_GROUP_SIZE: usize = 8;

const CHUNK_ACK: u8 = 0xD4;

/// Commands sent by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Ask the device whether it sits in its dock
    DockQuery,
    /// Ask for the number of stored files
    ListFiles,
    /// Request the next file
    TransferFile,
    /// Header received, start sending chunks
    ReadyForChunks,
}

impl HostCommand {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::DockQuery => &[0xD5],
            Self::ListFiles => &[0xD0],
            Self::TransferFile => &[0xD1],
            Self::ReadyForChunks => &[0xD2],
        }
    }
}

/// One chunk frame exactly as received.
///
/// ```text
/// [0]       : framing byte (0xFC when well formed)
/// [1-2]     : sequence number, kept in wire byte order
/// [3-4]     : "total" field, passed through uninterpreted
/// [5-244]   : payload
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    bytes: [u8; CHUNK_FRAME_LEN],
}

impl ChunkFrame {
    pub fn new(bytes: [u8; CHUNK_FRAME_LEN]) -> Self {
        Self { bytes }
    }

    pub fn is_well_formed(&self) -> bool {
        self.bytes[0] == frame::CHUNK
    }

    /// Sequence number bytes in the order they arrived
    pub fn sequence_bytes(&self) -> [u8; 2] {
        [self.bytes[1], self.bytes[2]]
    }

    pub fn sequence(&self) -> u16 {
        u16::from_le_bytes(self.sequence_bytes())
    }

    #[cfg(test)]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[5..]
    }

    pub fn as_bytes(&self) -> &[u8; CHUNK_FRAME_LEN] {
        &self.bytes
    }

    /// Capture line for this frame
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.bytes)
    }
}

impl std::fmt::Debug for ChunkFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkFrame")
            .field("framing", &format_args!("{:#04X}", self.bytes[0]))
            .field("sequence", &self.sequence())
            .finish()
    }
}

/// Group acknowledgment: `D4 <seq lo> <seq hi> <status>`
pub fn chunk_ack(first_sequence: [u8; 2], group_valid: bool) -> [u8; 4] {
    [
        CHUNK_ACK,
        first_sequence[0],
        first_sequence[1],
        u8::from(group_valid),
    ]
}

/// Build a well-formed chunk frame; used to script device traffic in tests
#[cfg(test)]
pub fn encode_chunk(sequence: u16, total: u16, fill: u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CHUNK_FRAME_LEN);
    bytes.push(frame::CHUNK);
    bytes.extend_from_slice(&sequence.to_le_bytes());
    bytes.extend_from_slice(&total.to_le_bytes());
    bytes.extend(std::iter::repeat(fill).take(CHUNK_PAYLOAD_LEN));
    bytes
}
