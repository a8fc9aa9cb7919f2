//! Tunnel Protocol Definitions
//!
//! Shared vocabulary for the tunnel relay: the descriptor of the remote
//! resource a session is bound to, and the constants the tunnel wire
//! format imposes on every component that feeds it.

pub mod target;

pub use target::{ProxySettings, TargetDescriptor, TargetError};

/// Maximum payload carried by a single data frame (16 KiB).
///
/// Local reads are chunked to this size so that no buffer handed to a
/// tunnel session ever exceeds what one frame can carry.
pub const MAX_DATA_FRAME_SIZE: usize = 16 * 1024;

/// Network interface used when none is given
pub const DEFAULT_NETWORK_INTERFACE: &str = "nic0";
