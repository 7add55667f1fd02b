//! Event-sourced aggregates (C1, C2): one `Store` instance per stock line
//! and one per conversation, each replaying its own event stream.

pub mod reservation;
pub mod session;
