pub mod config;
pub mod error;
pub mod file_transfer;
pub mod messaging;
pub mod node;
pub mod services;
pub mod signaling;
pub mod transport;

pub use config::CoreConfig;
pub use error::ProtocolError;
pub use file_transfer::{FileTransferConfig, FileTransferEngine, MemoryFileSource};
pub use messaging::{MessageType, P2pMessage};
pub use node::{NodeEvent, NodeEvents, NodeStorage, PeerNode};
pub use signaling::{SignalingConfig, SignalingEvent, SignalingService};
pub use transport::{InboundMessage, LoopbackNetwork, Transport};
