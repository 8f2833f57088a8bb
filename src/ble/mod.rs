//! BLE communication layer.
//!
//! This module contains the link transport, connection state machine
//! types, the single-flight read queue, and UUID constants.

pub mod connection;
pub mod link;
pub mod queue;
pub mod uuids;

pub use connection::ConnectionState;
pub use link::{BtleplugLink, GattLink, LinkEvent};
pub use queue::{ReadEvent, ReadOutcome, ReadQueue, ReadRequest};
