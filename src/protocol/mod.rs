//! Wire format and session logic for peer-to-peer synchronization.

pub mod session;
pub mod wire;

pub use session::{PeerSession, Session, SessionState};
pub use wire::{Message, PROTOCOL_VERSION};
