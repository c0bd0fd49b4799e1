pub mod envelope;
pub mod receiver;
pub mod sender;

pub use envelope::{MessageType, P2pMessage, PreKeyBundleRequest};
pub use receiver::process_incoming;
pub use sender::{build_message, send_message};
