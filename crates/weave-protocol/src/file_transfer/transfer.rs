use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use super::messages::{ChunkMessage, FileMetadata};
use crate::error::ProtocolError;

pub const DEFAULT_CHUNK_SIZE: u32 = 65_536;
/// Largest chunk a receiver accepts in metadata.
pub const MAX_CHUNK_SIZE: u32 = 1 << 20;
/// Largest chunk count a receiver accepts in metadata.
pub const MAX_TOTAL_CHUNKS: u32 = 1 << 20;

/// SHA-256 as lowercase hex.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Number of chunks for a file. An empty file is one empty chunk.
pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    let chunk_size = u64::from(chunk_size.max(1));
    let chunks = size.div_ceil(chunk_size).max(1);
    u32::try_from(chunks).unwrap_or(u32::MAX)
}

/// Build the wire form of chunk `index` from its bytes.
pub fn encode_chunk(transfer_id: &str, index: u32, total_chunks: u32, bytes: &[u8]) -> ChunkMessage {
    ChunkMessage {
        transfer_id: transfer_id.to_string(),
        chunk_index: index,
        total_chunks,
        data: STANDARD.encode(bytes),
        checksum: checksum(bytes),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Active,
    Paused,
    Completed,
    Failed(String),
    Cancelled,
}

/// What happened to an incoming chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored,
    /// Already had it; nothing changed.
    Duplicate,
    /// Bytes did not match the chunk checksum; request this index again.
    ChecksumMismatch,
    Rejected(String),
}

/// Receive-side state of one transfer.
///
/// Chunks land in an index-addressed map, so arrival order does not matter
/// and duplicates are harmless. Memory grows only with what actually arrived.
pub struct IncomingTransfer {
    transfer_id: String,
    metadata: FileMetadata,
    chunks: BTreeMap<u32, Vec<u8>>,
    status: TransferStatus,
}

impl IncomingTransfer {
    pub fn new(transfer_id: &str, metadata: FileMetadata) -> Result<Self, ProtocolError> {
        let expected = chunk_count(metadata.size, metadata.chunk_size);
        if metadata.chunk_size == 0 || metadata.total_chunks != expected {
            return Err(ProtocolError::InvalidState(format!(
                "metadata for {} declares {} chunks of {} bytes, expected {expected}",
                metadata.file_id, metadata.total_chunks, metadata.chunk_size
            )));
        }
        if metadata.chunk_size > MAX_CHUNK_SIZE || expected > MAX_TOTAL_CHUNKS {
            return Err(ProtocolError::InvalidState(format!(
                "{} is too large: {expected} chunks of {} bytes",
                metadata.file_id, metadata.chunk_size
            )));
        }
        Ok(Self {
            transfer_id: transfer_id.to_string(),
            metadata,
            chunks: BTreeMap::new(),
            status: TransferStatus::Active,
        })
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn total_chunks(&self) -> u32 {
        self.metadata.total_chunks
    }

    pub fn status(&self) -> &TransferStatus {
        &self.status
    }

    pub fn received_count(&self) -> usize {
        self.chunks.len()
    }

    /// Fraction of chunks received, `0.0..=1.0`.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        self.chunks.len() as f64 / f64::from(self.total_chunks())
    }

    pub fn accept_chunk(&mut self, chunk: &ChunkMessage) -> ChunkOutcome {
        if matches!(self.status, TransferStatus::Cancelled | TransferStatus::Failed(_)) {
            return ChunkOutcome::Rejected(format!("transfer is {:?}", self.status));
        }
        if chunk.total_chunks != self.total_chunks() {
            return ChunkOutcome::Rejected(format!(
                "chunk claims {} chunks, transfer has {}",
                chunk.total_chunks,
                self.total_chunks()
            ));
        }
        if chunk.chunk_index >= self.total_chunks() {
            return ChunkOutcome::Rejected(format!("chunk index {} out of range", chunk.chunk_index));
        }
        if self.chunks.contains_key(&chunk.chunk_index) {
            return ChunkOutcome::Duplicate;
        }

        let Ok(bytes) = STANDARD.decode(&chunk.data) else {
            return ChunkOutcome::ChecksumMismatch;
        };
        if checksum(&bytes) != chunk.checksum {
            return ChunkOutcome::ChecksumMismatch;
        }
        if !self.chunk_len_ok(chunk.chunk_index, bytes.len()) {
            return ChunkOutcome::Rejected(format!(
                "chunk {} has unexpected length {}",
                chunk.chunk_index,
                bytes.len()
            ));
        }

        self.chunks.insert(chunk.chunk_index, bytes);
        ChunkOutcome::Stored
    }

    /// Indices not yet received, ascending.
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.total_chunks()).filter(|i| !self.chunks.contains_key(i))
    }

    pub fn is_complete(&self) -> bool {
        u32::try_from(self.chunks.len()).is_ok_and(|n| n == self.total_chunks())
    }

    /// Concatenate all chunks and check the whole-file checksum.
    pub fn assemble(&mut self) -> Result<Vec<u8>, ProtocolError> {
        if !self.is_complete() {
            return Err(ProtocolError::InvalidState(format!(
                "{} of {} chunks received",
                self.chunks.len(),
                self.total_chunks()
            )));
        }
        let capacity = usize::try_from(self.metadata.size).unwrap_or(0);
        let mut data = Vec::with_capacity(capacity);
        for chunk in self.chunks.values() {
            data.extend_from_slice(chunk);
        }

        let actual = checksum(&data);
        if actual != self.metadata.checksum {
            self.status = TransferStatus::Failed("file checksum mismatch".into());
            return Err(ProtocolError::ChecksumMismatch(format!(
                "file {} expected {} got {actual}",
                self.metadata.file_id, self.metadata.checksum
            )));
        }
        self.status = TransferStatus::Completed;
        Ok(data)
    }

    /// Stop requesting chunks. Everything received so far is kept.
    pub fn pause(&mut self) -> Result<(), ProtocolError> {
        match self.status {
            TransferStatus::Active => {
                self.status = TransferStatus::Paused;
                Ok(())
            }
            TransferStatus::Paused => Ok(()),
            _ => Err(ProtocolError::InvalidState(format!(
                "cannot pause a {:?} transfer",
                self.status
            ))),
        }
    }

    pub fn resume(&mut self) -> Result<(), ProtocolError> {
        match self.status {
            TransferStatus::Paused => {
                self.status = TransferStatus::Active;
                Ok(())
            }
            TransferStatus::Active => Ok(()),
            _ => Err(ProtocolError::InvalidState(format!(
                "cannot resume a {:?} transfer",
                self.status
            ))),
        }
    }

    /// Drop every buffered chunk.
    pub fn cancel(&mut self) {
        self.chunks.clear();
        self.status = TransferStatus::Cancelled;
    }

    pub fn fail(&mut self, reason: &str) {
        self.chunks.clear();
        self.status = TransferStatus::Failed(reason.to_string());
    }

    pub fn is_paused(&self) -> bool {
        self.status == TransferStatus::Paused
    }

    /// All chunks but the last are full-size; the last carries the remainder.
    fn chunk_len_ok(&self, index: u32, len: usize) -> bool {
        let chunk_size = u64::from(self.metadata.chunk_size);
        let start = u64::from(index) * chunk_size;
        let expected = self.metadata.size.saturating_sub(start).min(chunk_size);
        u64::try_from(len).is_ok_and(|len| len == expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_for(data: &[u8], chunk_size: u32) -> FileMetadata {
        FileMetadata {
            file_id: "f1".into(),
            name: "blob.bin".into(),
            size: data.len() as u64,
            mime_type: "application/octet-stream".into(),
            category: "documents".into(),
            modified_at: 0,
            checksum: checksum(data),
            chunk_size,
            total_chunks: chunk_count(data.len() as u64, chunk_size),
        }
    }

    fn chunks_of(data: &[u8], chunk_size: u32) -> Vec<ChunkMessage> {
        let total = chunk_count(data.len() as u64, chunk_size);
        if data.is_empty() {
            return vec![encode_chunk("t", 0, total, &[])];
        }
        data.chunks(chunk_size as usize)
            .enumerate()
            .map(|(i, bytes)| encode_chunk("t", u32::try_from(i).unwrap(), total, bytes))
            .collect()
    }

    fn deliver_reversed_twice(data: &[u8], chunk_size: u32) -> Vec<u8> {
        let mut transfer = IncomingTransfer::new("t", metadata_for(data, chunk_size)).unwrap();
        let chunks = chunks_of(data, chunk_size);
        for chunk in chunks.iter().rev() {
            assert_eq!(transfer.accept_chunk(chunk), ChunkOutcome::Stored);
        }
        for chunk in &chunks {
            assert_eq!(transfer.accept_chunk(chunk), ChunkOutcome::Duplicate);
        }
        assert_eq!(transfer.received_count(), chunks.len());
        transfer.assemble().unwrap()
    }

    #[test]
    fn chunk_counts() {
        assert_eq!(chunk_count(0, DEFAULT_CHUNK_SIZE), 1);
        assert_eq!(chunk_count(1, DEFAULT_CHUNK_SIZE), 1);
        assert_eq!(chunk_count(65_536, DEFAULT_CHUNK_SIZE), 1);
        assert_eq!(chunk_count(65_537, DEFAULT_CHUNK_SIZE), 2);
        assert_eq!(chunk_count(131_072, DEFAULT_CHUNK_SIZE), 2);
    }

    #[test]
    fn reassembles_out_of_order_with_duplicates() {
        let one = vec![7u8; 10];
        assert_eq!(deliver_reversed_twice(&one, DEFAULT_CHUNK_SIZE), one);

        let boundary = vec![1u8; 65_536];
        assert_eq!(deliver_reversed_twice(&boundary, DEFAULT_CHUNK_SIZE), boundary);

        let two: Vec<u8> = (0..65_537u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(deliver_reversed_twice(&two, DEFAULT_CHUNK_SIZE), two);

        let thousand: Vec<u8> = (0..1000u32 * 64).map(|i| (i % 13) as u8).collect();
        assert_eq!(deliver_reversed_twice(&thousand, 64).len(), 64_000);

        assert!(deliver_reversed_twice(&[], DEFAULT_CHUNK_SIZE).is_empty());
    }

    #[test]
    fn corrupt_chunk_is_flagged_and_not_stored() {
        let data = vec![9u8; 200];
        let mut transfer = IncomingTransfer::new("t", metadata_for(&data, 100)).unwrap();
        let mut chunks = chunks_of(&data, 100);
        chunks[1].data = STANDARD.encode([0u8; 100]);

        assert_eq!(transfer.accept_chunk(&chunks[0]), ChunkOutcome::Stored);
        assert_eq!(transfer.accept_chunk(&chunks[1]), ChunkOutcome::ChecksumMismatch);
        assert_eq!(transfer.missing().collect::<Vec<_>>(), vec![1]);

        let good = encode_chunk("t", 1, 2, &data[100..]);
        assert_eq!(transfer.accept_chunk(&good), ChunkOutcome::Stored);
        assert_eq!(transfer.assemble().unwrap(), data);
    }

    #[test]
    fn whole_file_checksum_is_enforced() {
        let data = vec![3u8; 50];
        let mut metadata = metadata_for(&data, 100);
        metadata.checksum = checksum(b"something else");
        let mut transfer = IncomingTransfer::new("t", metadata).unwrap();
        transfer.accept_chunk(&encode_chunk("t", 0, 1, &data));
        assert!(matches!(transfer.assemble(), Err(ProtocolError::ChecksumMismatch(_))));
    }

    #[test]
    fn out_of_range_and_wrong_length() {
        let data = vec![0u8; 150];
        let mut transfer = IncomingTransfer::new("t", metadata_for(&data, 100)).unwrap();
        assert!(matches!(
            transfer.accept_chunk(&encode_chunk("t", 5, 2, b"x")),
            ChunkOutcome::Rejected(_)
        ));
        assert!(matches!(
            transfer.accept_chunk(&encode_chunk("t", 1, 2, &[0u8; 100])),
            ChunkOutcome::Rejected(_)
        ));
        assert!(matches!(
            transfer.accept_chunk(&encode_chunk("t", 0, 3, &[0u8; 100])),
            ChunkOutcome::Rejected(_)
        ));
    }

    #[test]
    fn pause_keeps_progress_and_cancel_drops_it() {
        let data = vec![5u8; 300];
        let mut transfer = IncomingTransfer::new("t", metadata_for(&data, 100)).unwrap();
        let chunks = chunks_of(&data, 100);
        transfer.accept_chunk(&chunks[0]);

        transfer.pause().unwrap();
        assert!(transfer.is_paused());
        assert_eq!(transfer.missing().collect::<Vec<_>>(), vec![1, 2]);
        transfer.resume().unwrap();
        assert_eq!(transfer.missing().collect::<Vec<_>>(), vec![1, 2]);

        transfer.cancel();
        assert_eq!(transfer.received_count(), 0);
        assert!(transfer.resume().is_err());
        assert!(matches!(transfer.accept_chunk(&chunks[1]), ChunkOutcome::Rejected(_)));
    }

    #[test]
    fn inconsistent_metadata_is_refused() {
        let mut metadata = metadata_for(&[0u8; 10], 4);
        metadata.total_chunks = 2;
        assert!(IncomingTransfer::new("t", metadata).is_err());
    }

    #[test]
    fn oversized_metadata_is_refused_without_allocating() {
        // One-byte chunks of a 4 GiB file would need u32::MAX slots.
        let mut metadata = metadata_for(&[], 1);
        metadata.size = u64::from(u32::MAX);
        metadata.total_chunks = u32::MAX;
        assert!(matches!(
            IncomingTransfer::new("t", metadata),
            Err(ProtocolError::InvalidState(_))
        ));

        let mut metadata = metadata_for(&[0u8; 10], 4);
        metadata.chunk_size = MAX_CHUNK_SIZE + 1;
        metadata.total_chunks = 1;
        assert!(IncomingTransfer::new("t", metadata).is_err());

        let data = vec![1u8; 1000];
        let transfer = IncomingTransfer::new("t", metadata_for(&data, 1)).unwrap();
        assert_eq!(transfer.received_count(), 0);
        assert_eq!(transfer.missing().take(3).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
