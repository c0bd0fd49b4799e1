use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use weave_crypto::Identity;

use super::messages::{
    CancelTransfer, ChunkMessage, ChunkRequest, FileMessage, FileMetadata, IndexRequest,
    IndexResponse, PullRequest, PullResponse, TransferComplete,
};
use super::source::{page_index, FileSource};
use super::transfer::{encode_chunk, ChunkOutcome, IncomingTransfer, DEFAULT_CHUNK_SIZE};
use crate::error::ProtocolError;
use crate::messaging::{build_message, send_message, MessageType, P2pMessage};
use crate::transport::Transport;

/// Indices served per `file:chunk-request`; extras are ignored.
const MAX_INDICES_PER_REQUEST: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileTransferConfig {
    /// Chunk size for files this device shares.
    pub chunk_size: u32,
    /// Chunks requested ahead of what has arrived.
    pub window: usize,
    /// A transfer with no progress for this long is retried, then failed.
    pub idle_timeout_secs: u64,
    /// Retries per idle period and per corrupt chunk.
    pub max_retries: u32,
    pub index_timeout_secs: u64,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window: 8,
            idle_timeout_secs: 10,
            max_retries: 1,
            index_timeout_secs: 30,
        }
    }
}

impl FileTransferConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_secs(self.index_timeout_secs)
    }
}

/// A fully received and verified file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: FileMetadata,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub received: u32,
    pub total: u32,
    pub paused: bool,
}

/// Returned by [`FileTransferEngine::request_file`].
pub struct TransferHandle {
    pub transfer_id: String,
    result: oneshot::Receiver<Result<ReceivedFile, ProtocolError>>,
}

impl TransferHandle {
    /// Wait for the transfer to complete, fail, or be cancelled.
    pub async fn finished(self) -> Result<ReceivedFile, ProtocolError> {
        self.result
            .await
            .map_err(|_| ProtocolError::Cancelled("file transfer engine stopped".into()))?
    }
}

type Completion = oneshot::Sender<Result<ReceivedFile, ProtocolError>>;

/// A file we are pulling from `peer`.
struct Incoming {
    peer: String,
    file_id: String,
    /// `None` until the pull is accepted.
    transfer: Option<IncomingTransfer>,
    in_flight: BTreeSet<u32>,
    chunk_failures: HashMap<u32, u32>,
    retries: u32,
    last_activity: Instant,
    done: Option<Completion>,
    watchdog: Option<JoinHandle<()>>,
}

impl Incoming {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.retries = 0;
    }

    fn is_paused(&self) -> bool {
        self.transfer.as_ref().is_some_and(IncomingTransfer::is_paused)
    }

    /// Pick missing indices to request so that at most `window` are in flight.
    fn next_window(&mut self, window: usize) -> Vec<u32> {
        let Some(transfer) = self.transfer.as_ref().filter(|t| !t.is_paused()) else {
            return Vec::new();
        };
        let room = window.saturating_sub(self.in_flight.len());
        let next: Vec<u32> = transfer
            .missing()
            .filter(|i| !self.in_flight.contains(i))
            .take(room)
            .collect();
        self.in_flight.extend(next.iter().copied());
        next
    }

    fn finish(mut self, result: Result<ReceivedFile, ProtocolError>) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

/// A file we are serving. Keyed by `(peer, transfer_id)`.
struct Outgoing {
    file_id: String,
    total_chunks: u32,
    last_activity: Instant,
}

#[derive(Default)]
struct EngineState {
    incoming: HashMap<String, Incoming>,
    outgoing: HashMap<(String, String), Outgoing>,
    listings: HashMap<String, (String, oneshot::Sender<IndexResponse>)>,
}

/// What a handler still has to send once the state lock is released.
enum Followup {
    Nothing,
    Request(Vec<u32>),
    Cancel(String),
    Complete(Box<TransferComplete>),
}

enum IdleCheck {
    Gone,
    Wait(Instant),
    Retry { peer: String, message: Box<FileMessage> },
    Expired { peer: String },
}

/// Both halves of the file protocol: serving local files from a
/// [`FileSource`] and pulling remote files chunk by chunk.
///
/// The receiver drives the transfer. It keeps up to `window` chunk indices
/// in flight, re-requests a single index when its checksum fails, and gives
/// an idle transfer one retry before failing it with `Timeout`.
pub struct FileTransferEngine {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    source: Arc<dyn FileSource>,
    config: FileTransferConfig,
    idle_timeout: Duration,
    state: Mutex<EngineState>,
}

impl FileTransferEngine {
    pub fn new(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        source: Arc<dyn FileSource>,
        config: &FileTransferConfig,
    ) -> Arc<Self> {
        Self::with_idle_timeout(identity, transport, source, config, config.idle_timeout())
    }

    /// Like [`new`](Self::new) with an explicit idle timeout.
    pub fn with_idle_timeout(
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        source: Arc<dyn FileSource>,
        config: &FileTransferConfig,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            transport,
            source,
            config: config.clone(),
            idle_timeout,
            state: Mutex::new(EngineState::default()),
        })
    }

    pub fn source(&self) -> &Arc<dyn FileSource> {
        &self.source
    }

    /// Ask `peer` for a page of its shareable files.
    pub async fn list_remote(
        &self,
        peer: &str,
        mut request: IndexRequest,
    ) -> Result<IndexResponse, ProtocolError> {
        request.request_id = new_id();
        let request_id = request.request_id.clone();
        let (tx, rx) = oneshot::channel();
        self.state
            .lock()
            .listings
            .insert(request_id.clone(), (peer.to_string(), tx));

        if let Err(e) = self.send(peer, &FileMessage::IndexRequest(request)).await {
            self.state.lock().listings.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.index_timeout(), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ProtocolError::Cancelled("file transfer engine stopped".into())),
            Err(_) => {
                self.state.lock().listings.remove(&request_id);
                Err(ProtocolError::Timeout(format!("file index from {peer}")))
            }
        }
    }

    /// Start pulling `file_id` from `peer`.
    pub async fn request_file(
        self: &Arc<Self>,
        peer: &str,
        file_id: &str,
    ) -> Result<TransferHandle, ProtocolError> {
        let transfer_id = new_id();
        let (done, result) = oneshot::channel();
        {
            let mut state = self.state.lock();
            let watchdog = self.spawn_watchdog(transfer_id.clone());
            state.incoming.insert(
                transfer_id.clone(),
                Incoming {
                    peer: peer.to_string(),
                    file_id: file_id.to_string(),
                    transfer: None,
                    in_flight: BTreeSet::new(),
                    chunk_failures: HashMap::new(),
                    retries: 0,
                    last_activity: Instant::now(),
                    done: Some(done),
                    watchdog: Some(watchdog),
                },
            );
        }

        let pull = FileMessage::PullRequest(PullRequest {
            transfer_id: transfer_id.clone(),
            file_id: file_id.to_string(),
        });
        if let Err(e) = self.send(peer, &pull).await {
            if let Some(incoming) = self.state.lock().incoming.remove(&transfer_id) {
                incoming.finish(Err(ProtocolError::SendFailed(e.to_string())));
            }
            return Err(e);
        }

        tracing::info!(peer, file_id, transfer_id = %transfer_id, "file transfer requested");
        Ok(TransferHandle {
            transfer_id,
            result,
        })
    }

    /// Stop requesting chunks. Received chunks are kept for [`resume`](Self::resume).
    pub fn pause(&self, transfer_id: &str) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        let incoming = state
            .incoming
            .get_mut(transfer_id)
            .ok_or_else(|| ProtocolError::UnknownTransfer(transfer_id.to_string()))?;
        let transfer = incoming
            .transfer
            .as_mut()
            .ok_or_else(|| ProtocolError::InvalidState(format!("transfer {transfer_id} has not started")))?;
        transfer.pause()?;
        incoming.in_flight.clear();
        tracing::info!(transfer_id, received = transfer.received_count(), "file transfer paused");
        Ok(())
    }

    /// Continue a paused transfer, requesting only the chunks still missing.
    pub async fn resume(&self, transfer_id: &str) -> Result<(), ProtocolError> {
        let (peer, indices) = {
            let mut state = self.state.lock();
            let incoming = state
                .incoming
                .get_mut(transfer_id)
                .ok_or_else(|| ProtocolError::UnknownTransfer(transfer_id.to_string()))?;
            incoming
                .transfer
                .as_mut()
                .ok_or_else(|| ProtocolError::InvalidState(format!("transfer {transfer_id} has not started")))?
                .resume()?;
            incoming.touch();
            (incoming.peer.clone(), incoming.next_window(self.config.window))
        };
        tracing::info!(transfer_id, "file transfer resumed");
        self.request_chunks(&peer, transfer_id, indices).await
    }

    /// Abandon a transfer in either direction and tell the peer.
    pub async fn cancel(&self, transfer_id: &str) -> Result<(), ProtocolError> {
        let peer = {
            let mut state = self.state.lock();
            if let Some(mut incoming) = state.incoming.remove(transfer_id) {
                if let Some(transfer) = incoming.transfer.as_mut() {
                    transfer.cancel();
                }
                let peer = incoming.peer.clone();
                incoming.finish(Err(ProtocolError::Cancelled("cancelled locally".into())));
                peer
            } else {
                let key = state
                    .outgoing
                    .keys()
                    .find(|(_, id)| id == transfer_id)
                    .cloned()
                    .ok_or_else(|| ProtocolError::UnknownTransfer(transfer_id.to_string()))?;
                state.outgoing.remove(&key);
                key.0
            }
        };
        tracing::info!(transfer_id, peer = %peer, "file transfer cancelled");
        let cancel = FileMessage::Cancel(CancelTransfer {
            transfer_id: transfer_id.to_string(),
            reason: "cancelled by peer".into(),
        });
        self.send(&peer, &cancel).await
    }

    pub fn progress(&self, transfer_id: &str) -> Option<TransferProgress> {
        let state = self.state.lock();
        let transfer = state.incoming.get(transfer_id)?.transfer.as_ref()?;
        Some(TransferProgress {
            received: u32::try_from(transfer.received_count()).unwrap_or(u32::MAX),
            total: transfer.total_chunks(),
            paused: transfer.is_paused(),
        })
    }

    /// Fail every pending transfer and listing, and stop all watchdogs.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for (_, incoming) in state.incoming.drain() {
            incoming.finish(Err(ProtocolError::Cancelled("file transfer engine stopped".into())));
        }
        state.outgoing.clear();
        state.listings.clear();
        tracing::debug!("file transfer engine stopped");
    }

    /// Handle a `FILE_TRANSFER` message. Malformed input is logged and dropped.
    pub async fn handle_message(&self, from: &str, message: &P2pMessage) {
        match message.body::<FileMessage>() {
            Ok(body) => self.handle(from, body).await,
            Err(e) => tracing::warn!(peer = from, error = %e, "malformed file message dropped"),
        }
    }

    pub async fn handle(&self, from: &str, message: FileMessage) {
        let kind = message.kind();
        let result = match message {
            FileMessage::IndexRequest(request) => self.serve_index(from, request).await,
            FileMessage::IndexResponse(response) => {
                self.on_index_response(from, response);
                Ok(())
            }
            FileMessage::PullRequest(request) => self.serve_pull(from, request).await,
            FileMessage::PullResponse(response) => self.on_pull_response(from, response).await,
            FileMessage::ChunkRequest(request) => self.serve_chunks(from, request).await,
            FileMessage::Chunk(chunk) => self.on_chunk(from, &chunk).await,
            FileMessage::TransferComplete(complete) => {
                self.on_transfer_complete(from, &complete);
                Ok(())
            }
            FileMessage::Cancel(cancel) => {
                self.on_cancel(from, &cancel);
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(peer = from, kind, error = %e, "file message not handled");
        }
    }

    async fn serve_index(&self, from: &str, request: IndexRequest) -> Result<(), ProtocolError> {
        let files = self.source.files().await?;
        let response = page_index(files, &request);
        tracing::debug!(peer = from, returned = response.files.len(), total = response.total, "serving file index");
        self.send(from, &FileMessage::IndexResponse(response)).await
    }

    fn on_index_response(&self, from: &str, response: IndexResponse) {
        let mut state = self.state.lock();
        match state.listings.remove(&response.request_id) {
            Some((peer, tx)) if peer == from => {
                let _ = tx.send(response);
            }
            Some(pending) => {
                tracing::warn!(peer = from, "index response from the wrong peer dropped");
                state.listings.insert(response.request_id, pending);
            }
            None => tracing::debug!(peer = from, "unsolicited index response dropped"),
        }
    }

    async fn serve_pull(&self, from: &str, request: PullRequest) -> Result<(), ProtocolError> {
        self.expire_idle_outgoing();
        let response = match self.source.metadata(&request.file_id).await? {
            Some(metadata) => {
                self.state.lock().outgoing.insert(
                    (from.to_string(), request.transfer_id.clone()),
                    Outgoing {
                        file_id: metadata.file_id.clone(),
                        total_chunks: metadata.total_chunks,
                        last_activity: Instant::now(),
                    },
                );
                tracing::info!(peer = from, file_id = %request.file_id, transfer_id = %request.transfer_id, "serving file");
                PullResponse {
                    transfer_id: request.transfer_id,
                    accepted: true,
                    metadata: Some(metadata),
                    error: None,
                }
            }
            None => PullResponse {
                transfer_id: request.transfer_id,
                accepted: false,
                metadata: None,
                error: Some(format!("file {} not found", request.file_id)),
            },
        };
        self.send(from, &FileMessage::PullResponse(response)).await
    }

    /// Forget served transfers the receiver has stopped asking about.
    ///
    /// A receiver gives up after one idle period per retry, so anything
    /// quiet for longer than that is abandoned. Returns how many were dropped.
    pub fn expire_idle_outgoing(&self) -> usize {
        let max_idle = self.idle_timeout * (self.config.max_retries + 1);
        let mut state = self.state.lock();
        let before = state.outgoing.len();
        state.outgoing.retain(|(peer, transfer_id), outgoing| {
            let keep = outgoing.last_activity.elapsed() <= max_idle;
            if !keep {
                tracing::debug!(peer = %peer, transfer_id = %transfer_id, "abandoned upload dropped");
            }
            keep
        });
        before - state.outgoing.len()
    }

    async fn serve_chunks(&self, from: &str, request: ChunkRequest) -> Result<(), ProtocolError> {
        let served = self
            .state
            .lock()
            .outgoing
            .get_mut(&(from.to_string(), request.transfer_id.clone()))
            .map(|o| {
                o.last_activity = Instant::now();
                (o.file_id.clone(), o.total_chunks)
            });
        let Some((file_id, total_chunks)) = served else {
            tracing::debug!(peer = from, transfer_id = %request.transfer_id, "chunk request for unknown upload");
            return self.send_cancel(from, &request.transfer_id, "unknown transfer").await;
        };

        for index in request.indices.into_iter().take(MAX_INDICES_PER_REQUEST) {
            if index >= total_chunks {
                tracing::warn!(peer = from, index, total_chunks, "chunk request out of range");
                continue;
            }
            let bytes = self.source.read_chunk(&file_id, index).await?;
            let chunk = encode_chunk(&request.transfer_id, index, total_chunks, &bytes);
            self.send(from, &FileMessage::Chunk(chunk)).await?;
        }
        Ok(())
    }

    async fn on_pull_response(&self, from: &str, response: PullResponse) -> Result<(), ProtocolError> {
        let transfer_id = response.transfer_id.clone();
        let followup = self.record_pull_response(from, response)?;
        self.follow_up(from, &transfer_id, followup).await
    }

    async fn on_chunk(&self, from: &str, chunk: &ChunkMessage) -> Result<(), ProtocolError> {
        let followup = self.record_chunk(from, chunk)?;
        self.follow_up(from, &chunk.transfer_id, followup).await
    }

    async fn follow_up(&self, peer: &str, transfer_id: &str, followup: Followup) -> Result<(), ProtocolError> {
        match followup {
            Followup::Nothing => Ok(()),
            Followup::Request(indices) => self.request_chunks(peer, transfer_id, indices).await,
            Followup::Cancel(reason) => self.send_cancel(peer, transfer_id, &reason).await,
            Followup::Complete(complete) => self.send(peer, &FileMessage::TransferComplete(*complete)).await,
        }
    }

    fn record_pull_response(&self, from: &str, response: PullResponse) -> Result<Followup, ProtocolError> {
        let transfer_id = response.transfer_id;
        let mut state = self.state.lock();
        let Some(mut incoming) = state.incoming.remove(&transfer_id) else {
            return Err(ProtocolError::UnknownTransfer(transfer_id));
        };
        if incoming.peer != from || incoming.transfer.is_some() {
            tracing::debug!(peer = from, transfer_id = %transfer_id, "stale pull response ignored");
            state.incoming.insert(transfer_id, incoming);
            return Ok(Followup::Nothing);
        }

        if !response.accepted {
            let reason = response.error.unwrap_or_else(|| "no reason given".into());
            tracing::warn!(peer = from, transfer_id = %transfer_id, reason = %reason, "pull refused");
            let error = format!("{from} refused {}: {reason}", incoming.file_id);
            incoming.finish(Err(ProtocolError::InvalidState(error)));
            return Ok(Followup::Nothing);
        }

        let file_id = incoming.file_id.clone();
        let transfer = response
            .metadata
            .filter(|m| m.file_id == file_id)
            .ok_or_else(|| ProtocolError::InvalidState("pull accepted without matching metadata".into()))
            .and_then(|metadata| IncomingTransfer::new(&transfer_id, metadata));
        match transfer {
            Ok(transfer) => {
                tracing::debug!(
                    transfer_id = %transfer_id,
                    total_chunks = transfer.total_chunks(),
                    size = transfer.metadata().size,
                    "pull accepted"
                );
                incoming.transfer = Some(transfer);
                incoming.touch();
                let indices = incoming.next_window(self.config.window);
                state.incoming.insert(transfer_id, incoming);
                Ok(Followup::Request(indices))
            }
            Err(e) => {
                let reason = e.to_string();
                incoming.finish(Err(e));
                Ok(Followup::Cancel(reason))
            }
        }
    }

    fn record_chunk(&self, from: &str, chunk: &ChunkMessage) -> Result<Followup, ProtocolError> {
        let transfer_id = chunk.transfer_id.as_str();
        let index = chunk.chunk_index;
        let mut state = self.state.lock();
        let incoming = state
            .incoming
            .get_mut(transfer_id)
            .filter(|i| i.peer == from)
            .ok_or_else(|| ProtocolError::UnknownTransfer(transfer_id.to_string()))?;
        let transfer = incoming
            .transfer
            .as_mut()
            .ok_or_else(|| ProtocolError::InvalidState(format!("chunk for {transfer_id} before acceptance")))?;

        match transfer.accept_chunk(chunk) {
            ChunkOutcome::Stored => {
                incoming.in_flight.remove(&index);
                incoming.last_activity = Instant::now();
                incoming.retries = 0;
            }
            ChunkOutcome::Duplicate => {
                incoming.in_flight.remove(&index);
                tracing::trace!(transfer_id, index, "duplicate chunk ignored");
            }
            ChunkOutcome::ChecksumMismatch => {
                let failures = incoming.chunk_failures.entry(index).or_insert(0);
                *failures += 1;
                let failures = *failures;
                if failures <= self.config.max_retries {
                    tracing::warn!(peer = from, transfer_id, index, "chunk checksum mismatch, re-requesting");
                    incoming.in_flight.insert(index);
                    incoming.last_activity = Instant::now();
                    return Ok(Followup::Request(vec![index]));
                }
                let Some(mut incoming) = state.incoming.remove(transfer_id) else {
                    return Ok(Followup::Nothing);
                };
                if let Some(transfer) = incoming.transfer.as_mut() {
                    transfer.fail("chunk checksum mismatch");
                }
                let error = format!("chunk {index} failed verification {failures} times");
                tracing::warn!(peer = from, transfer_id, index, "file transfer failed: {error}");
                incoming.finish(Err(ProtocolError::ChecksumMismatch(error.clone())));
                return Ok(Followup::Cancel(error));
            }
            ChunkOutcome::Rejected(reason) => {
                tracing::warn!(peer = from, transfer_id, index, reason = %reason, "chunk rejected");
                return Ok(Followup::Nothing);
            }
        }

        if !transfer.is_complete() {
            return Ok(Followup::Request(incoming.next_window(self.config.window)));
        }

        let Some(mut incoming) = state.incoming.remove(transfer_id) else {
            return Ok(Followup::Nothing);
        };
        drop(state);
        let Some(mut transfer) = incoming.transfer.take() else {
            return Ok(Followup::Nothing);
        };
        let metadata = transfer.metadata().clone();
        let (complete, result) = match transfer.assemble() {
            Ok(data) => (
                TransferComplete {
                    transfer_id: transfer_id.to_string(),
                    success: true,
                    total_bytes: data.len() as u64,
                    checksum: metadata.checksum.clone(),
                    error: None,
                },
                Ok(ReceivedFile {
                    metadata,
                    data,
                }),
            ),
            Err(e) => (
                TransferComplete {
                    transfer_id: transfer_id.to_string(),
                    success: false,
                    total_bytes: 0,
                    checksum: metadata.checksum.clone(),
                    error: Some(e.to_string()),
                },
                Err(e),
            ),
        };
        if complete.success {
            tracing::info!(peer = from, transfer_id, bytes = complete.total_bytes, "file transfer complete");
        } else {
            tracing::warn!(peer = from, transfer_id, error = ?complete.error, "file transfer failed verification");
        }
        incoming.finish(result);
        Ok(Followup::Complete(Box::new(complete)))
    }

    fn on_transfer_complete(&self, from: &str, complete: &TransferComplete) {
        let mut state = self.state.lock();
        if state
            .outgoing
            .remove(&(from.to_string(), complete.transfer_id.clone()))
            .is_some()
        {
            tracing::info!(
                peer = from,
                transfer_id = %complete.transfer_id,
                success = complete.success,
                bytes = complete.total_bytes,
                "file served"
            );
            return;
        }
        let aborted = state
            .incoming
            .get(&complete.transfer_id)
            .is_some_and(|i| i.peer == from && !complete.success);
        if aborted {
            if let Some(incoming) = state.incoming.remove(&complete.transfer_id) {
                let reason = complete.error.clone().unwrap_or_else(|| "sender aborted".into());
                incoming.finish(Err(ProtocolError::Cancelled(reason)));
            }
        }
    }

    fn on_cancel(&self, from: &str, cancel: &CancelTransfer) {
        let mut state = self.state.lock();
        if state
            .outgoing
            .remove(&(from.to_string(), cancel.transfer_id.clone()))
            .is_some()
        {
            tracing::info!(peer = from, transfer_id = %cancel.transfer_id, reason = %cancel.reason, "peer cancelled download");
            return;
        }
        let ours = state
            .incoming
            .get(&cancel.transfer_id)
            .is_some_and(|i| i.peer == from);
        if ours {
            if let Some(mut incoming) = state.incoming.remove(&cancel.transfer_id) {
                if let Some(transfer) = incoming.transfer.as_mut() {
                    transfer.cancel();
                }
                tracing::info!(peer = from, transfer_id = %cancel.transfer_id, reason = %cancel.reason, "peer cancelled upload");
                incoming.finish(Err(ProtocolError::Cancelled(format!(
                    "cancelled by {from}: {}",
                    cancel.reason
                ))));
            }
        }
    }

    /// Watch one incoming transfer for stalls until it leaves the table.
    fn spawn_watchdog(self: &Arc<Self>, transfer_id: String) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let idle = self.idle_timeout;
        tokio::spawn(async move {
            let mut wake = Instant::now() + idle;
            loop {
                tokio::time::sleep_until(wake).await;
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                match engine.check_idle(&transfer_id) {
                    IdleCheck::Gone => return,
                    IdleCheck::Wait(next) => wake = next,
                    IdleCheck::Retry { peer, message } => {
                        if let Err(e) = engine.send(&peer, &message).await {
                            tracing::warn!(transfer_id = %transfer_id, error = %e, "idle retry send failed");
                        }
                        wake = Instant::now() + idle;
                    }
                    IdleCheck::Expired { peer } => {
                        let _ = engine.send_cancel(&peer, &transfer_id, "timeout").await;
                        return;
                    }
                }
            }
        })
    }

    fn check_idle(&self, transfer_id: &str) -> IdleCheck {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(incoming) = state.incoming.get_mut(transfer_id) else {
            return IdleCheck::Gone;
        };
        if incoming.is_paused() {
            return IdleCheck::Wait(now + self.idle_timeout);
        }
        let deadline = incoming.last_activity + self.idle_timeout;
        if deadline > now {
            return IdleCheck::Wait(deadline);
        }

        if incoming.retries < self.config.max_retries {
            incoming.retries += 1;
            incoming.last_activity = now;
            let message = if incoming.transfer.is_none() {
                FileMessage::PullRequest(PullRequest {
                    transfer_id: transfer_id.to_string(),
                    file_id: incoming.file_id.clone(),
                })
            } else {
                let mut indices: Vec<u32> = incoming.in_flight.iter().copied().collect();
                if indices.is_empty() {
                    indices = incoming.next_window(self.config.window);
                }
                FileMessage::ChunkRequest(ChunkRequest {
                    transfer_id: transfer_id.to_string(),
                    indices,
                })
            };
            tracing::warn!(peer = %incoming.peer, transfer_id, attempt = incoming.retries, "file transfer idle, retrying");
            return IdleCheck::Retry {
                peer: incoming.peer.clone(),
                message: Box::new(message),
            };
        }

        let Some(mut incoming) = state.incoming.remove(transfer_id) else {
            return IdleCheck::Gone;
        };
        // Running inside the watchdog itself; detach instead of aborting.
        incoming.watchdog = None;
        if let Some(transfer) = incoming.transfer.as_mut() {
            transfer.fail("timeout");
        }
        let peer = incoming.peer.clone();
        tracing::warn!(peer = %peer, transfer_id, "file transfer timed out");
        incoming.finish(Err(ProtocolError::Timeout(format!(
            "transfer {transfer_id} idle for {:?}",
            self.idle_timeout
        ))));
        IdleCheck::Expired { peer }
    }

    async fn request_chunks(
        &self,
        peer: &str,
        transfer_id: &str,
        indices: Vec<u32>,
    ) -> Result<(), ProtocolError> {
        if indices.is_empty() {
            return Ok(());
        }
        let request = FileMessage::ChunkRequest(ChunkRequest {
            transfer_id: transfer_id.to_string(),
            indices,
        });
        self.send(peer, &request).await
    }

    async fn send_cancel(&self, peer: &str, transfer_id: &str, reason: &str) -> Result<(), ProtocolError> {
        let cancel = FileMessage::Cancel(CancelTransfer {
            transfer_id: transfer_id.to_string(),
            reason: reason.to_string(),
        });
        self.send(peer, &cancel).await
    }

    async fn send(&self, to: &str, message: &FileMessage) -> Result<(), ProtocolError> {
        let wrapped = build_message(&self.identity, to, MessageType::FileTransfer, message, true)?;
        send_message(self.transport.as_ref(), &wrapped).await
    }
}

fn new_id() -> String {
    let mut id = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut id);
    hex::encode(id)
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use tokio::sync::mpsc;

    use super::*;
    use crate::file_transfer::source::MemoryFileSource;
    use crate::messaging::process_incoming;
    use crate::transport::{InboundMessage, LoopbackNetwork};

    struct Peer {
        did: String,
        engine: Arc<FileTransferEngine>,
        source: Arc<MemoryFileSource>,
    }

    /// Register a peer whose inbox feeds its engine.
    fn live_peer(network: &Arc<LoopbackNetwork>, chunk_size: u32) -> Peer {
        let (peer, mut inbox) = idle_peer(network, chunk_size, Duration::from_secs(10));
        let engine = Arc::clone(&peer.engine);
        tokio::spawn(async move {
            while let Some(inbound) = inbox.recv().await {
                let message = process_incoming(&inbound.from_did, &inbound.bytes, true).unwrap();
                engine.handle_message(&inbound.from_did, &message).await;
            }
        });
        peer
    }

    /// Register a peer and hand back its inbox for manual driving.
    fn idle_peer(
        network: &Arc<LoopbackNetwork>,
        chunk_size: u32,
        idle: Duration,
    ) -> (Peer, mpsc::Receiver<InboundMessage>) {
        let identity = Arc::new(Identity::generate().unwrap());
        let did = identity.did();
        let (transport, inbox) = network.register(&did);
        let source = Arc::new(MemoryFileSource::new(chunk_size));
        let engine = FileTransferEngine::with_idle_timeout(
            identity,
            transport,
            source.clone(),
            &FileTransferConfig::default(),
            idle,
        );
        (Peer { did, engine, source }, inbox)
    }

    async fn next_file_message(inbox: &mut mpsc::Receiver<InboundMessage>) -> FileMessage {
        let inbound = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        P2pMessage::from_bytes(&inbound.bytes).unwrap().body().unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[tokio::test]
    async fn pulls_files_of_many_shapes() {
        let network = LoopbackNetwork::new();
        let alice = live_peer(&network, 64);
        let bob = live_peer(&network, 64);

        let cases = [("one", 10), ("exact", 64), ("two", 65), ("thousand", 64_000), ("empty", 0)];
        for (id, len) in cases {
            bob.source.insert(id, id, "application/octet-stream", "misc", 1, pattern(len));
        }

        for (id, len) in cases {
            let handle = alice.engine.request_file(&bob.did, id).await.unwrap();
            let file = handle.finished().await.unwrap();
            assert_eq!(file.data, pattern(len), "file {id}");
            assert_eq!(file.metadata.file_id, id);
        }
    }

    #[tokio::test]
    async fn default_chunk_size_boundaries() {
        let network = LoopbackNetwork::new();
        let alice = live_peer(&network, DEFAULT_CHUNK_SIZE);
        let bob = live_peer(&network, DEFAULT_CHUNK_SIZE);
        for len in [65_535, 65_536, 65_537, 131_072] {
            let id = format!("f{len}");
            bob.source.insert(&id, &id, "application/octet-stream", "misc", 1, pattern(len));
            let file = alice
                .engine
                .request_file(&bob.did, &id)
                .await
                .unwrap()
                .finished()
                .await
                .unwrap();
            assert_eq!(file.data.len(), len);
            assert_eq!(file.metadata.total_chunks as usize, len.div_ceil(65_536));
        }
    }

    #[tokio::test]
    async fn lists_and_refuses() {
        let network = LoopbackNetwork::new();
        let alice = live_peer(&network, 64);
        let bob = live_peer(&network, 64);
        bob.source.insert("a", "a.txt", "text/plain", "documents", 10, b"a".to_vec());
        bob.source.insert("b", "b.jpg", "image/jpeg", "images", 20, b"b".to_vec());

        let page = alice
            .engine
            .list_remote(
                &bob.did,
                IndexRequest {
                    category: Some("images".into()),
                    ..IndexRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.files[0].file_id, "b");

        let missing = alice.engine.request_file(&bob.did, "nope").await.unwrap();
        assert!(matches!(missing.finished().await, Err(ProtocolError::InvalidState(_))));
    }

    /// Accept a pull on behalf of a scripted peer and return the first chunk request.
    async fn accept_pull(
        alice: &Peer,
        bob_did: &str,
        bob_inbox: &mut mpsc::Receiver<InboundMessage>,
        metadata: FileMetadata,
    ) -> (String, Vec<u32>) {
        let FileMessage::PullRequest(pull) = next_file_message(bob_inbox).await else {
            panic!("expected pull request");
        };
        alice
            .engine
            .handle(
                bob_did,
                FileMessage::PullResponse(PullResponse {
                    transfer_id: pull.transfer_id.clone(),
                    accepted: true,
                    metadata: Some(metadata),
                    error: None,
                }),
            )
            .await;
        let FileMessage::ChunkRequest(request) = next_file_message(bob_inbox).await else {
            panic!("expected chunk request");
        };
        (pull.transfer_id, request.indices)
    }

    #[tokio::test]
    async fn corrupt_chunk_is_re_requested_alone() {
        let network = LoopbackNetwork::new();
        let alice = live_peer(&network, 4);
        let (bob, mut bob_inbox) = idle_peer(&network, 4, Duration::from_secs(10));
        let metadata = bob.source.insert("f", "f", "text/plain", "misc", 1, b"abcdefgh".to_vec());

        let handle = alice.engine.request_file(&bob.did, "f").await.unwrap();
        let (transfer_id, first) = accept_pull(&alice, &bob.did, &mut bob_inbox, metadata).await;
        assert_eq!(first, vec![0, 1]);

        let mut bad = encode_chunk(&transfer_id, 1, 2, b"efgh");
        bad.data = STANDARD.encode(b"XXXX");
        alice.engine.handle(&bob.did, FileMessage::Chunk(bad)).await;
        let FileMessage::ChunkRequest(retry) = next_file_message(&mut bob_inbox).await else {
            panic!("expected re-request");
        };
        assert_eq!(retry.indices, vec![1]);

        for (index, bytes) in [(0, b"abcd"), (1, b"efgh")] {
            let chunk = encode_chunk(&transfer_id, index, 2, bytes);
            alice.engine.handle(&bob.did, FileMessage::Chunk(chunk)).await;
        }
        assert_eq!(handle.finished().await.unwrap().data, b"abcdefgh");
        assert!(matches!(
            next_file_message(&mut bob_inbox).await,
            FileMessage::TransferComplete(TransferComplete { success: true, .. })
        ));
    }

    #[tokio::test]
    async fn pause_resume_requests_only_missing() {
        let network = LoopbackNetwork::new();
        let alice = live_peer(&network, 4);
        let (bob, mut bob_inbox) = idle_peer(&network, 4, Duration::from_secs(10));
        let data = pattern(40);
        let metadata = bob.source.insert("f", "f", "text/plain", "misc", 1, data.clone());

        let handle = alice.engine.request_file(&bob.did, "f").await.unwrap();
        let (transfer_id, first) = accept_pull(&alice, &bob.did, &mut bob_inbox, metadata).await;
        assert_eq!(first.len(), 8);

        alice.engine.pause(&transfer_id).unwrap();
        for index in 0..3u32 {
            let start = index as usize * 4;
            let chunk = encode_chunk(&transfer_id, index, 10, &data[start..start + 4]);
            alice.engine.handle(&bob.did, FileMessage::Chunk(chunk)).await;
        }
        let progress = alice.engine.progress(&transfer_id).unwrap();
        assert_eq!((progress.received, progress.paused), (3, true));

        alice.engine.resume(&transfer_id).await.unwrap();
        let FileMessage::ChunkRequest(resumed) = next_file_message(&mut bob_inbox).await else {
            panic!("expected chunk request");
        };
        assert!(resumed.indices.iter().all(|i| *i >= 3));

        alice.engine.cancel(&transfer_id).await.unwrap();
        assert!(matches!(handle.finished().await, Err(ProtocolError::Cancelled(_))));
        assert!(alice.engine.progress(&transfer_id).is_none());
        loop {
            if let FileMessage::Cancel(cancel) = next_file_message(&mut bob_inbox).await {
                assert_eq!(cancel.transfer_id, transfer_id);
                break;
            }
        }
    }

    #[tokio::test]
    async fn idle_transfer_retries_once_then_times_out() {
        let network = LoopbackNetwork::new();
        let (alice, _alice_inbox) = idle_peer(&network, 4, Duration::from_millis(50));
        let (bob, mut bob_inbox) = idle_peer(&network, 4, Duration::from_secs(10));

        let handle = alice.engine.request_file(&bob.did, "f").await.unwrap();
        assert!(matches!(next_file_message(&mut bob_inbox).await, FileMessage::PullRequest(_)));
        assert!(matches!(next_file_message(&mut bob_inbox).await, FileMessage::PullRequest(_)));
        assert!(matches!(next_file_message(&mut bob_inbox).await, FileMessage::Cancel(_)));
        assert!(matches!(handle.finished().await, Err(ProtocolError::Timeout(_))));
    }

    fn assert_send<T: Send>(_: T) {}

    #[tokio::test]
    async fn message_handling_can_run_on_a_spawned_task() {
        let network = LoopbackNetwork::new();
        let (alice, _alice_inbox) = idle_peer(&network, 4, Duration::from_secs(10));
        let chunk = encode_chunk("t", 0, 1, b"abcd");
        assert_send(alice.engine.handle("did:key:zBob", FileMessage::Chunk(chunk)));
        let response = PullResponse {
            transfer_id: "t".into(),
            accepted: false,
            metadata: None,
            error: None,
        };
        assert_send(alice.engine.handle("did:key:zBob", FileMessage::PullResponse(response)));
    }

    #[tokio::test]
    async fn abandoned_upload_is_forgotten() {
        let network = LoopbackNetwork::new();
        let (alice, mut alice_inbox) = idle_peer(&network, 4, Duration::from_secs(10));
        let (bob, _bob_inbox) = idle_peer(&network, 4, Duration::from_millis(20));
        bob.source.insert("f", "f", "text/plain", "misc", 1, b"abcdefgh".to_vec());

        let pull = PullRequest {
            transfer_id: "t1".into(),
            file_id: "f".into(),
        };
        bob.engine.handle(&alice.did, FileMessage::PullRequest(pull)).await;
        assert!(matches!(next_file_message(&mut alice_inbox).await, FileMessage::PullResponse(_)));
        assert_eq!(bob.engine.state.lock().outgoing.len(), 1);

        // Receiver gives up after idle * (retries + 1); wait past that.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bob.engine.expire_idle_outgoing(), 1);
        assert!(bob.engine.state.lock().outgoing.is_empty());

        let late = ChunkRequest {
            transfer_id: "t1".into(),
            indices: vec![0],
        };
        bob.engine.handle(&alice.did, FileMessage::ChunkRequest(late)).await;
        let FileMessage::Cancel(cancel) = next_file_message(&mut alice_inbox).await else {
            panic!("expected cancel for the forgotten upload");
        };
        assert_eq!(cancel.transfer_id, "t1");
    }

    #[tokio::test]
    async fn new_pull_sweeps_stale_uploads() {
        let network = LoopbackNetwork::new();
        let (alice, mut alice_inbox) = idle_peer(&network, 4, Duration::from_secs(10));
        let (bob, _bob_inbox) = idle_peer(&network, 4, Duration::from_millis(20));
        bob.source.insert("f", "f", "text/plain", "misc", 1, b"abcd".to_vec());

        for transfer_id in ["t1", "t2"] {
            let pull = PullRequest {
                transfer_id: transfer_id.into(),
                file_id: "f".into(),
            };
            bob.engine.handle(&alice.did, FileMessage::PullRequest(pull)).await;
            assert!(matches!(next_file_message(&mut alice_inbox).await, FileMessage::PullResponse(_)));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let outgoing = bob.engine.state.lock().outgoing.keys().map(|(_, id)| id.clone()).collect::<Vec<_>>();
        assert_eq!(outgoing, vec!["t2".to_string()]);
    }
}
