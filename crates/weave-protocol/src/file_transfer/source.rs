use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::messages::{FileMetadata, IndexRequest, IndexResponse};
use super::transfer::{checksum, chunk_count, DEFAULT_CHUNK_SIZE};
use crate::error::ProtocolError;

/// Upper bound on one index page.
pub const MAX_INDEX_PAGE: u32 = 200;

/// Files this device is willing to share.
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Every shareable file.
    async fn files(&self) -> Result<Vec<FileMetadata>, ProtocolError>;

    async fn metadata(&self, file_id: &str) -> Result<Option<FileMetadata>, ProtocolError>;

    /// Bytes of chunk `index` using the file's own `chunk_size`.
    async fn read_chunk(&self, file_id: &str, index: u32) -> Result<Vec<u8>, ProtocolError>;
}

/// Apply an index request's filters and paging to a file list.
///
/// Results are ordered by most recently modified first.
pub fn page_index(mut files: Vec<FileMetadata>, request: &IndexRequest) -> IndexResponse {
    files.retain(|f| {
        request.category.as_deref().is_none_or(|c| f.category == c)
            && request.modified_since.is_none_or(|since| f.modified_at >= since)
    });
    files.sort_by(|a, b| b.modified_at.cmp(&a.modified_at).then_with(|| a.file_id.cmp(&b.file_id)));

    let total = u32::try_from(files.len()).unwrap_or(u32::MAX);
    let limit = request.limit.unwrap_or(MAX_INDEX_PAGE).min(MAX_INDEX_PAGE);
    let page: Vec<FileMetadata> = files
        .into_iter()
        .skip(request.offset as usize)
        .take(limit as usize)
        .collect();
    let returned = u32::try_from(page.len()).unwrap_or(u32::MAX);

    IndexResponse {
        request_id: request.request_id.clone(),
        files: page,
        total,
        offset: request.offset,
        has_more: request.offset.saturating_add(returned) < total,
    }
}

struct StoredFile {
    metadata: FileMetadata,
    data: Vec<u8>,
}

/// Files held in memory. Used by tests and the demo node.
pub struct MemoryFileSource {
    chunk_size: u32,
    files: RwLock<BTreeMap<String, StoredFile>>,
}

impl Default for MemoryFileSource {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl MemoryFileSource {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add or replace a file, returning its metadata.
    pub fn insert(
        &self,
        file_id: &str,
        name: &str,
        mime_type: &str,
        category: &str,
        modified_at: u64,
        data: Vec<u8>,
    ) -> FileMetadata {
        let size = data.len() as u64;
        let metadata = FileMetadata {
            file_id: file_id.to_string(),
            name: name.to_string(),
            size,
            mime_type: mime_type.to_string(),
            category: category.to_string(),
            modified_at,
            checksum: checksum(&data),
            chunk_size: self.chunk_size,
            total_chunks: chunk_count(size, self.chunk_size),
        };
        self.files.write().insert(
            file_id.to_string(),
            StoredFile {
                metadata: metadata.clone(),
                data,
            },
        );
        metadata
    }

    pub fn remove(&self, file_id: &str) -> bool {
        self.files.write().remove(file_id).is_some()
    }
}

#[async_trait]
impl FileSource for MemoryFileSource {
    async fn files(&self) -> Result<Vec<FileMetadata>, ProtocolError> {
        Ok(self.files.read().values().map(|f| f.metadata.clone()).collect())
    }

    async fn metadata(&self, file_id: &str) -> Result<Option<FileMetadata>, ProtocolError> {
        Ok(self.files.read().get(file_id).map(|f| f.metadata.clone()))
    }

    async fn read_chunk(&self, file_id: &str, index: u32) -> Result<Vec<u8>, ProtocolError> {
        let files = self.files.read();
        let file = files
            .get(file_id)
            .ok_or_else(|| ProtocolError::InvalidState(format!("unknown file {file_id}")))?;
        if index >= file.metadata.total_chunks {
            return Err(ProtocolError::InvalidState(format!(
                "chunk {index} out of range for {file_id}"
            )));
        }
        let chunk_size = file.metadata.chunk_size as usize;
        let start = (index as usize).saturating_mul(chunk_size).min(file.data.len());
        let end = start.saturating_add(chunk_size).min(file.data.len());
        Ok(file.data[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MemoryFileSource {
        let source = MemoryFileSource::new(4);
        source.insert("a", "a.txt", "text/plain", "documents", 100, b"0123456789".to_vec());
        source.insert("b", "b.png", "image/png", "images", 300, vec![1; 3]);
        source.insert("c", "c.txt", "text/plain", "documents", 200, Vec::new());
        source
    }

    #[tokio::test]
    async fn chunks_cover_the_file() {
        let source = source();
        let meta = source.metadata("a").await.unwrap().unwrap();
        assert_eq!(meta.total_chunks, 3);
        assert_eq!(source.read_chunk("a", 0).await.unwrap(), b"0123");
        assert_eq!(source.read_chunk("a", 2).await.unwrap(), b"89");
        assert!(source.read_chunk("a", 3).await.is_err());

        let empty = source.metadata("c").await.unwrap().unwrap();
        assert_eq!(empty.total_chunks, 1);
        assert!(source.read_chunk("c", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_filters_and_pages() {
        let files = source().files().await.unwrap();

        let all = page_index(files.clone(), &IndexRequest::default());
        let order: Vec<_> = all.files.iter().map(|f| f.file_id.as_str()).collect();
        assert_eq!(order, ["b", "c", "a"]);
        assert!(!all.has_more);

        let docs = page_index(
            files.clone(),
            &IndexRequest {
                category: Some("documents".into()),
                ..IndexRequest::default()
            },
        );
        assert_eq!(docs.total, 2);

        let recent = page_index(
            files.clone(),
            &IndexRequest {
                modified_since: Some(200),
                ..IndexRequest::default()
            },
        );
        assert_eq!(recent.total, 2);

        let first = page_index(
            files,
            &IndexRequest {
                limit: Some(1),
                offset: 1,
                ..IndexRequest::default()
            },
        );
        assert_eq!(first.files[0].file_id, "c");
        assert_eq!(first.total, 3);
        assert!(first.has_more);
    }
}
