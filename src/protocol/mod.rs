//! Wire protocol for the cylinder scale sensor.
//!
//! All three characteristics carry UTF-8 JSON payloads; this module owns
//! the strict decoding of those payloads.

pub mod payload;

pub use payload::{
    parse_history, parse_inclination, parse_weight, HistoryEntry, HistoryPayload,
};
