//! On-demand mesh routing (AODV-style) for resource-constrained nodes.
//! Host-driven: no I/O; host passes radio/timer events and performs the returned actions.

pub mod address;
pub mod config;
pub mod engine;
pub mod protocol;
pub mod table;
pub mod timer;
pub mod wire;

pub use address::{AddressParseError, BroadcastId, NodeAddress, SequenceNumber};
pub use config::Config;
pub use engine::{Action, Event, MessageError, RouteEngine};
pub use protocol::{Message, ACK, INFINITE_DISTANCE};
pub use table::{EvictionPolicy, RoutingEntry, RoutingTable, TableError};
pub use timer::{Pending, TimerId};
pub use wire::{decode_frame, decode_payload, encode_frame, FrameDecodeError, FrameEncodeError, Payload};

pub mod ffi;

/// In-process multi-node harness. Enable the `sim` feature to use it outside this crate's tests.
#[cfg(any(test, feature = "sim"))]
pub mod sim;
