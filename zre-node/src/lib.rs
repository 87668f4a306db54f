//! ZRE node host: tokio runtime around the `zre-core` state machine.
//!
//! One task owns the core and all sockets (UDP beacon, TCP inbox,
//! per-peer outbound links). Owners hold a [`Zre`] handle and read a
//! stream of [`zre_core::Event`]s.

pub mod beacon;
pub mod config;
pub mod inbox;
pub mod node;

pub use config::Config;
pub use node::{Command, NodeGone, StartError, Zre};
pub use zre_core::{Event, NodeUuid};
