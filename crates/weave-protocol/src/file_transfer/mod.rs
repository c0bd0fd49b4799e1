//! Chunked, resumable file transfer over the P2P message channel.
//!
//! Every protocol message rides as a [`FileMessage`] inside a `FILE_TRANSFER`
//! wrapper. A transfer is pulled by the receiver: it asks for an index, pulls
//! one file, then requests chunk indices until its buffer is full and the
//! whole-file checksum matches.

mod engine;
pub mod messages;
mod source;
pub mod transfer;

pub use engine::{
    FileTransferConfig, FileTransferEngine, ReceivedFile, TransferHandle, TransferProgress,
};
pub use messages::{FileMessage, FileMetadata, IndexRequest, IndexResponse};
pub use source::{page_index, FileSource, MemoryFileSource, MAX_INDEX_PAGE};
pub use transfer::{
    checksum, chunk_count, IncomingTransfer, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MAX_TOTAL_CHUNKS,
};
