use thiserror::Error;
use weave_crypto::CryptoError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("message send failed: {0}")]
    SendFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The operation is not allowed in the current state (e.g. ICE candidates
    /// before an offer, resuming a cancelled transfer).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
