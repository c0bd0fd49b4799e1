use serde::{Deserialize, Serialize};

/// Description of a shareable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub category: String,
    /// Unix milliseconds.
    pub modified_at: u64,
    /// SHA-256 of the whole file, lowercase hex.
    pub checksum: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexRequest {
    pub request_id: String,
    pub category: Option<String>,
    /// Only files modified at or after this Unix-millisecond time.
    pub modified_since: Option<u64>,
    pub limit: Option<u32>,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponse {
    pub request_id: String,
    pub files: Vec<FileMetadata>,
    /// Matches before paging.
    pub total: u32,
    pub offset: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub transfer_id: String,
    pub file_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub transfer_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receiver asks for specific chunk indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub transfer_id: String,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Chunk bytes, standard base64.
    pub data: String,
    /// SHA-256 of the chunk bytes, lowercase hex.
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferComplete {
    pub transfer_id: String,
    pub success: bool,
    pub total_bytes: u64,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTransfer {
    pub transfer_id: String,
    pub reason: String,
}

/// Body of a `FILE_TRANSFER` wrapper message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FileMessage {
    #[serde(rename = "file:index-request")]
    IndexRequest(IndexRequest),
    #[serde(rename = "file:index-response")]
    IndexResponse(IndexResponse),
    #[serde(rename = "file:pull-request")]
    PullRequest(PullRequest),
    #[serde(rename = "file:pull-response")]
    PullResponse(PullResponse),
    #[serde(rename = "file:chunk-request")]
    ChunkRequest(ChunkRequest),
    #[serde(rename = "file:chunk")]
    Chunk(ChunkMessage),
    #[serde(rename = "file:transfer-complete")]
    TransferComplete(TransferComplete),
    #[serde(rename = "file:cancel")]
    Cancel(CancelTransfer),
}

impl FileMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IndexRequest(_) => "file:index-request",
            Self::IndexResponse(_) => "file:index-response",
            Self::PullRequest(_) => "file:pull-request",
            Self::PullResponse(_) => "file:pull-response",
            Self::ChunkRequest(_) => "file:chunk-request",
            Self::Chunk(_) => "file:chunk",
            Self::TransferComplete(_) => "file:transfer-complete",
            Self::Cancel(_) => "file:cancel",
        }
    }
}
