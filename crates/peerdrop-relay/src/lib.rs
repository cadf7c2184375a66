//! Signaling relay for peerdrop
//!
//! Pairs exactly one sender and one receiver per room and forwards their
//! connection-setup messages. File bytes never pass through the relay.

pub mod local;
pub mod registry;
pub mod server;
pub mod session;

pub use local::LocalRelay;
pub use registry::{ClientId, JoinError, RoomRegistry};
pub use server::{RelayServer, RelayState, RelayStats};
pub use session::ClientSession;
