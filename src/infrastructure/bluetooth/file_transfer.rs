//! File Transfer Module
//!
//! Pulls every stored file off the sensor in one session. Chunks arrive in
//! groups of up to eight; each group is acknowledged once. The output is a
//! raw capture of the chunk frames, not a decoded file.
//!
//! ```text
//! host: D0                      device: FF* D3 <count>
//! per file:
//!   host: D1                    device: FF* FD <ver> <n> <name[n]> <size:u32> <chunk:u16> <chunks:u16>
//!   host: D2
//!   per group of <= 8 chunks:   device: FF* FC <seq:2> <total:2> <payload:240>
//!   host: D4 <first seq:2> <01 if all framed, else 00>
//!                               device: FF* FE <status>
//! ```

use crate::domain::models::DeviceAddress;
use crate::infrastructure::bluetooth::connection::{Connection, ConnectionManager};
use crate::infrastructure::bluetooth::error::BluetoothError;
use crate::infrastructure::bluetooth::protocol::{
    chunk_ack, frame, ChunkFrame, HostCommand, CHUNK_FRAME_LEN, CHUNK_GROUP_SIZE,
    CHUNK_PAYLOAD_LEN,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Header announced by `TRANSFER_START`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferHeader {
    pub version: u8,
    /// Raw filename bytes as sent by the device
    pub filename: Vec<u8>,
    pub total_size: u32,
    /// Nominal chunk size; frames always carry a full payload regardless
    pub chunk_size: u16,
    pub total_chunks: u16,
}

impl TransferHeader {
    /// Filename for logs, with invalid UTF-8 replaced
    pub fn display_name(&self) -> String {
        String::from_utf8_lossy(&self.filename).into_owned()
    }

    /// Chunks needed to carry `total_size` bytes in full payloads
    pub fn expected_chunks(&self) -> u64 {
        u64::from(self.total_size).div_ceil(CHUNK_PAYLOAD_LEN as u64)
    }

    /// Whether the declared chunk count fits the declared size
    pub fn is_consistent(&self) -> bool {
        u64::from(self.total_chunks) == self.expected_chunks()
    }
}

/// Progress through one file's chunk stream
#[derive(Debug)]
pub struct TransferSession {
    header: TransferHeader,
    chunks_processed: u16,
    group_first_sequence: [u8; 2],
    group_valid: bool,
    bad_groups: usize,
}

impl TransferSession {
    /// Start tracking a file announced by `header`
    pub fn new(header: TransferHeader) -> Self {
        Self {
            header,
            chunks_processed: 0,
            group_first_sequence: [0, 0],
            group_valid: true,
            bad_groups: 0,
        }
    }

    /// All announced chunks have been read
    pub fn is_complete(&self) -> bool {
        self.chunks_processed >= self.header.total_chunks
    }

    /// Reset the group state and return how many chunks the next group holds
    pub fn begin_group(&mut self) -> usize {
        self.group_valid = true;
        let remaining = usize::from(self.header.total_chunks - self.chunks_processed);
        remaining.min(CHUNK_GROUP_SIZE)
    }

    /// Fold one received chunk into the current group
    pub fn record_chunk(&mut self, chunk: &ChunkFrame, first_in_group: bool) {
        if first_in_group {
            self.group_first_sequence = chunk.sequence_bytes();
        }
        if !chunk.is_well_formed() {
            warn!(
                "Chunk {} of {} has framing byte {:#04X}",
                self.chunks_processed + 1,
                self.header.total_chunks,
                chunk.as_bytes()[0]
            );
            self.group_valid = false;
        }
        self.chunks_processed += 1;
    }

    /// Acknowledgment for the group just received
    pub fn finish_group(&mut self) -> [u8; 4] {
        if !self.group_valid {
            self.bad_groups += 1;
        }
        chunk_ack(self.group_first_sequence, self.group_valid)
    }

    pub fn chunks_processed(&self) -> u16 {
        self.chunks_processed
    }

    pub fn header(&self) -> &TransferHeader {
        &self.header
    }
}

/// Raw capture of one transferred file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCapture {
    /// Position of the file in the device's list
    pub index: u8,
    pub header: TransferHeader,
    /// One uppercase hex line per chunk frame, in receipt order
    pub frames: Vec<String>,
    pub end_status: u8,
    pub bad_groups: usize,
}

impl FileCapture {
    /// The device closed the file with status `0x00`
    pub fn succeeded(&self) -> bool {
        self.end_status == 0x00
    }
}

/// Destination for completed file captures
pub trait CaptureSink: Send + Sync {
    fn store(&self, capture: &FileCapture) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub files_listed: u8,
    pub files_completed: usize,
    pub files_failed: usize,
    pub bad_groups: usize,
}

#[derive(Clone)]
pub struct FileTransferProtocol {
    connections: Arc<ConnectionManager>,
}

impl FileTransferProtocol {
    /// Create a transfer protocol on top of `connections`
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Transfer every file from `address` into `sink`.
    ///
    /// The connection is released on every path. Stream loss or an
    /// unexpected frame aborts the remaining files.
    pub async fn run(
        &self,
        address: &DeviceAddress,
        sink: &dyn CaptureSink,
    ) -> Result<TransferReport, BluetoothError> {
        let mut connection = self.connections.connect(address).await?;
        let outcome = run_session(&mut connection, sink).await;
        connection.close().await;
        outcome
    }
}

/// Run the list and transfer exchanges over an open connection
pub async fn run_session(
    connection: &mut Connection,
    sink: &dyn CaptureSink,
) -> Result<TransferReport, BluetoothError> {
    connection.send(HostCommand::ListFiles.as_bytes()).await?;
    connection.expect_frame(frame::FILE_LIST).await?;
    let file_count = connection.read_u8().await?;
    info!("{} reports {} file(s)", connection.address(), file_count);

    let mut report = TransferReport {
        files_listed: file_count,
        ..Default::default()
    };

    for index in 0..file_count {
        let capture = transfer_file(connection, index).await?;
        let name = capture.header.display_name();

        if capture.succeeded() {
            info!(
                "File {}/{} '{}' transferred ({} chunks)",
                index + 1,
                file_count,
                name,
                capture.frames.len()
            );
            report.files_completed += 1;
        } else {
            warn!(
                "File {}/{} '{}' ended with status {:#04X}",
                index + 1,
                file_count,
                name,
                capture.end_status
            );
            report.files_failed += 1;
        }
        report.bad_groups += capture.bad_groups;

        if let Err(e) = sink.store(&capture) {
            error!("Failed to store capture of '{}': {:#}", name, e);
        }
    }

    Ok(report)
}

async fn transfer_file(connection: &mut Connection, index: u8) -> Result<FileCapture, BluetoothError> {
    connection.send(HostCommand::TransferFile.as_bytes()).await?;
    connection.expect_frame(frame::TRANSFER_START).await?;
    let header = read_header(connection).await?;
    debug!("Transfer header: {:?}", header);

    if !header.is_consistent() {
        debug!(
            "Declared size {} needs {} chunk(s) of {} bytes, device announced {}",
            header.total_size,
            header.expected_chunks(),
            CHUNK_PAYLOAD_LEN,
            header.total_chunks
        );
    }

    connection.send(HostCommand::ReadyForChunks.as_bytes()).await?;

    let mut session = TransferSession::new(header);
    let mut frames = Vec::with_capacity(usize::from(session.header().total_chunks));

    while !session.is_complete() {
        let group_len = session.begin_group();
        for position in 0..group_len {
            let chunk = read_chunk(connection).await?;
            session.record_chunk(&chunk, position == 0);
            frames.push(chunk.to_hex());
        }
        connection.send(&session.finish_group()).await?;
    }

    debug!("Received {} chunk(s)", session.chunks_processed());
    connection.expect_frame(frame::TRANSFER_END).await?;
    let end_status = connection.read_u8().await?;

    let bad_groups = session.bad_groups;
    Ok(FileCapture {
        index,
        header: session.header,
        frames,
        end_status,
        bad_groups,
    })
}

async fn read_header(connection: &mut Connection) -> Result<TransferHeader, BluetoothError> {
    let version = connection.read_u8().await?;
    let name_len = connection.read_u8().await?;
    let mut filename = vec![0u8; usize::from(name_len)];
    connection.read_exact(&mut filename).await?;
    let total_size = connection.read_u32_le().await?;
    let chunk_size = connection.read_u16_le().await?;
    let total_chunks = connection.read_u16_le().await?;

    Ok(TransferHeader {
        version,
        filename,
        total_size,
        chunk_size,
        total_chunks,
    })
}

/// A chunk whose framing byte is wrong is still read in full
async fn read_chunk(connection: &mut Connection) -> Result<ChunkFrame, BluetoothError> {
    let mut bytes = [0u8; CHUNK_FRAME_LEN];
    bytes[0] = connection.read_frame_byte().await?;
    connection.read_exact(&mut bytes[1..]).await?;
    Ok(ChunkFrame::new(bytes))
}
