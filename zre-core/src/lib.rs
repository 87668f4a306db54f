//! ZRE protocol (RFC 36) reference core.
//! Host-driven: no I/O; the host passes beacons, frames and ticks, and
//! receives actions.
//!
//! ## Host responsibilities
//!
//! - **Sockets**: the host owns the UDP beacon socket, the TCP router
//!   inbox and the per-peer outbound links. The core is pure protocol
//!   logic; it never opens a socket.
//! - **Time**: the host passes a monotonic `Instant` into every call
//!   that touches liveness, and drives `NodeCore::tick` at 1 Hz.
//! - **Actions**: after every core call the host performs the returned
//!   actions in order: connect/disconnect peer links, push encoded
//!   frames onto them, and forward events to the owner.

pub mod core;
pub mod event;
pub mod group;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod wire;

pub use crate::core::{Action, NodeCore};
pub use event::Event;
pub use identity::NodeUuid;
pub use peer::{ZrePeer, EVASIVE_TIMEOUT, EXPIRED_TIMEOUT};
pub use protocol::{ZreMsg, BEACON_PORT, BEACON_SIZE, BEACON_VERSION, SIGNATURE, VERSION};
pub use wire::{
    decode_beacon, decode_frame, encode_beacon, encode_frame, Beacon, BeaconDecodeError,
    FrameDecodeError, FrameEncodeError, MAX_FRAME_LEN,
};
